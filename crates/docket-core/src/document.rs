use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Lifecycle of a document through the processing pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingStatus {
    Pending,
    ProcessingAnalysis,
    ProcessingServiceInfo,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub const ACTIVE: [Self; 3] = [
        Self::Pending,
        Self::ProcessingAnalysis,
        Self::ProcessingServiceInfo,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::ProcessingAnalysis => "PROCESSING_ANALYSIS",
            Self::ProcessingServiceInfo => "PROCESSING_SERVICE_INFO",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// A stage sequence is currently running for the document.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self, Self::ProcessingAnalysis | Self::ProcessingServiceInfo)
    }

    /// Transitions the orchestrator is allowed to make. Re-submission
    /// (terminal -> PENDING) is the only way out of a terminal state.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::ProcessingAnalysis)
                | (Self::ProcessingAnalysis, Self::ProcessingServiceInfo | Self::Failed)
                | (Self::ProcessingServiceInfo, Self::Completed | Self::Failed)
                | (Self::Completed | Self::Failed, Self::Pending)
        )
    }
}

impl std::fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProcessingStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "PROCESSING_ANALYSIS" => Ok(Self::ProcessingAnalysis),
            "PROCESSING_SERVICE_INFO" => Ok(Self::ProcessingServiceInfo),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            _ => Err(crate::Error::InvalidStatus(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: Uuid,
    pub content_hash: String,
    pub file_name: String,
    pub mime_type: String,
    pub file_size: i64,
    pub content: Option<String>,
    pub processing_status: ProcessingStatus,
    pub processing_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// Text usable for extraction, if any.
    #[must_use]
    pub fn extractable_content(&self) -> Option<&str> {
        self.content
            .as_deref()
            .filter(|text| !text.trim().is_empty())
    }
}

/// Metadata and text of an upload, keyed by the hash of its raw bytes.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub content_hash: String,
    pub file_name: String,
    pub mime_type: String,
    pub file_size: i64,
    pub content: String,
}

impl NewDocument {
    #[must_use]
    pub fn from_bytes(bytes: &[u8], file_name: &str, mime_type: &str, content: String) -> Self {
        Self {
            content_hash: content_hash(bytes),
            file_name: file_name.to_string(),
            mime_type: mime_type.to_string(),
            file_size: i64::try_from(bytes.len()).unwrap_or(i64::MAX),
            content,
        }
    }
}

/// Hex SHA-256 fingerprint of the raw document bytes.
#[must_use]
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
