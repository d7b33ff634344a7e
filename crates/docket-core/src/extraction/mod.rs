mod client;
mod fanout;

pub use client::{Endpoint, ExtractionClient};
pub use fanout::FanOut;

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("{endpoint} timed out after {}s", .after.as_secs())]
    Timeout { endpoint: String, after: Duration },

    #[error("{endpoint} is unreachable: {reason}")]
    Unreachable { endpoint: String, reason: String },

    /// The response started but its body was cut off.
    #[error("{endpoint} request aborted: {reason}")]
    Aborted { endpoint: String, reason: String },

    #[error("{endpoint} returned status {status}")]
    Status { endpoint: String, status: u16 },

    #[error("{endpoint} returned an undecodable body: {reason}")]
    Decode { endpoint: String, reason: String },

    #[error("{} of the stage calls failed ({}): {first}", .failed.len(), .failed.join(", "))]
    Stage {
        failed: Vec<String>,
        first: Box<ExtractionError>,
    },
}

impl ExtractionError {
    /// The first underlying call failure, looking through stage aggregation.
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::Stage { first, .. } => first.root(),
            other => other,
        }
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), Self::Timeout { .. })
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        matches!(self.root(), Self::Aborted { .. })
    }

    #[must_use]
    pub fn is_unreachable(&self) -> bool {
        matches!(self.root(), Self::Unreachable { .. })
    }
}

pub type ExtractionResult<T> = Result<T, ExtractionError>;
