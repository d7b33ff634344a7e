use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::document::Document;

static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl BatchStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BatchStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            _ => Err(crate::Error::InvalidStatus(s.to_string())),
        }
    }
}

/// A set of documents whose results are delivered together once every
/// member has reached a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationBatch {
    pub id: Uuid,
    pub email: String,
    pub document_ids: Vec<Uuid>,
    pub status: BatchStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl NotificationBatch {
    #[must_use]
    pub fn new(email: impl Into<String>, document_ids: Vec<Uuid>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            email: email.into(),
            document_ids,
            status: BatchStatus::Pending,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// Result of trying to claim a batch for delivery.
#[derive(Debug)]
pub enum ClaimOutcome {
    /// This caller flipped the batch to IN_PROGRESS and owns delivery.
    Claimed {
        batch: NotificationBatch,
        members: Vec<Document>,
    },
    /// Another observer already moved the batch out of PENDING.
    AlreadyClaimed,
    /// At least one member is still being processed.
    NotReady,
    /// Members vanished; the batch was marked FAILED.
    MissingMembers(Vec<Uuid>),
}

#[must_use]
pub fn is_valid_email(email: &str) -> bool {
    EMAIL_RE.is_match(email.trim())
}

/// Trim, drop blanks and duplicates, keeping first-seen order.
pub fn normalize_document_ids<I, S>(raw: I) -> crate::Result<Vec<Uuid>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut ids = Vec::new();
    for value in raw {
        let trimmed = value.as_ref().trim();
        if trimmed.is_empty() {
            continue;
        }
        let id: Uuid = trimmed
            .parse()
            .map_err(|_| crate::Error::InvalidInput(format!("invalid document id: {trimmed}")))?;
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_validation() {
        assert!(is_valid_email("ops@example.com"));
        assert!(is_valid_email("  ops@example.com "));
        assert!(!is_valid_email("ops@example"));
        assert!(!is_valid_email("ops example@x.com"));
        assert!(!is_valid_email(""));
    }

    #[test]
    fn document_ids_are_deduplicated() {
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        let ids = normalize_document_ids([
            a.to_string(),
            format!(" {b} "),
            String::new(),
            a.to_string(),
        ])
        .unwrap();
        assert_eq!(ids, vec![a, b]);
    }

    #[test]
    fn malformed_document_id_is_rejected() {
        let err = normalize_document_ids(["not-a-uuid"]).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn batch_status_parses() {
        assert_eq!(
            "IN_PROGRESS".parse::<BatchStatus>().unwrap(),
            BatchStatus::InProgress
        );
        assert!(BatchStatus::Failed.is_terminal());
        assert!(!BatchStatus::InProgress.is_terminal());
    }
}
