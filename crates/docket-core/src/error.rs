use thiserror::Error;

use crate::extraction::ExtractionError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Document not found: {0}")]
    DocumentNotFound(uuid::Uuid),

    #[error("Documents not found: {}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "))]
    DocumentsNotFound(Vec<uuid::Uuid>),

    #[error("Notification batch not found: {0}")]
    BatchNotFound(uuid::Uuid),

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Document has no extractable content")]
    MissingContent,

    #[error("No configuration selected")]
    EmptySelection,

    #[error("Template {0} has no reference clauses")]
    EmptyClauseSet(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error("Notification dispatch failed: {0}")]
    Dispatch(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Input problems the caller can fix; these never touch the network.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::MissingContent
                | Self::EmptySelection
                | Self::EmptyClauseSet(_)
                | Self::InvalidInput(_)
                | Self::TemplateNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
