use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::Storage;

/// Stored metadata is cut to this many characters.
pub const METADATA_LIMIT: usize = 65_535;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    DocumentUpload,
    StatusTransition,
    DocumentAnalysis,
    ServiceInfoExtraction,
    ServicePlanRecommendation,
    BatchNotification,
    Recovery,
}

impl AuditAction {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::DocumentUpload => "DOCUMENT_UPLOAD",
            Self::StatusTransition => "STATUS_TRANSITION",
            Self::DocumentAnalysis => "DOCUMENT_ANALYSIS",
            Self::ServiceInfoExtraction => "SERVICE_INFO_EXTRACTION",
            Self::ServicePlanRecommendation => "SERVICE_PLAN_RECOMMENDATION",
            Self::BatchNotification => "BATCH_NOTIFICATION",
            Self::Recovery => "RECOVERY",
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditSource {
    Background,
    Remote,
    Database,
    Api,
    Notifier,
}

impl AuditSource {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Background => "BACKGROUND",
            Self::Remote => "REMOTE",
            Self::Database => "DATABASE",
            Self::Api => "API",
            Self::Notifier => "NOTIFIER",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditStatus {
    Success,
    Error,
    Skipped,
}

impl AuditStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Error => "ERROR",
            Self::Skipped => "SKIPPED",
        }
    }
}

/// An entry about to be appended.
#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub document_id: Option<Uuid>,
    pub action: AuditAction,
    pub source: AuditSource,
    pub status: AuditStatus,
    pub description: Option<String>,
    pub duration: Option<Duration>,
    pub metadata: Option<serde_json::Value>,
}

impl NewAuditEntry {
    #[must_use]
    pub const fn new(action: AuditAction, source: AuditSource) -> Self {
        Self {
            document_id: None,
            action,
            source,
            status: AuditStatus::Success,
            description: None,
            duration: None,
            metadata: None,
        }
    }

    #[must_use]
    pub const fn document(mut self, id: Uuid) -> Self {
        self.document_id = Some(id);
        self
    }

    #[must_use]
    pub const fn status(mut self, status: AuditStatus) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub const fn duration(mut self, elapsed: Duration) -> Self {
        self.duration = Some(elapsed);
        self
    }

    #[must_use]
    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Shorthand for an ERROR entry carrying the error text in its metadata.
    #[must_use]
    pub fn failed(self, error: &impl std::fmt::Display) -> Self {
        self.status(AuditStatus::Error)
            .metadata(serde_json::json!({ "error": error.to_string() }))
    }

    pub(crate) fn metadata_string(&self) -> Option<String> {
        let value = self.metadata.as_ref()?;
        if value.is_null() {
            return None;
        }
        let serialized = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Some(truncate_chars(&serialized, METADATA_LIMIT))
    }

    pub(crate) fn duration_ms(&self) -> Option<i64> {
        self.duration
            .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
    }
}

/// A persisted audit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub document_id: Option<Uuid>,
    pub action: String,
    pub source: String,
    pub status: String,
    pub description: Option<String>,
    pub duration_ms: Option<i64>,
    pub metadata: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Append-only sink for stage attempts.
///
/// Writes never fail the caller: a storage error while recording is logged
/// and dropped.
#[derive(Clone)]
pub struct AuditLog {
    storage: Storage,
}

impl AuditLog {
    #[must_use]
    pub const fn new(storage: Storage) -> Self {
        Self { storage }
    }

    pub async fn record(&self, entry: NewAuditEntry) {
        if let Err(e) = self.storage.insert_audit_entry(&entry).await {
            tracing::error!(
                action = %entry.action,
                document_id = ?entry.document_id,
                error = %e,
                "Failed to write audit entry"
            );
        }
    }
}

fn truncate_chars(value: &str, limit: usize) -> String {
    match value.char_indices().nth(limit) {
        Some((idx, _)) => value[..idx].to_string(),
        None => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_is_truncated() {
        let long = "x".repeat(METADATA_LIMIT + 10);
        let entry = NewAuditEntry::new(AuditAction::DocumentAnalysis, AuditSource::Remote)
            .metadata(serde_json::Value::String(long));
        assert_eq!(entry.metadata_string().unwrap().len(), METADATA_LIMIT);
    }

    #[test]
    fn object_metadata_is_serialized() {
        let entry = NewAuditEntry::new(AuditAction::DocumentAnalysis, AuditSource::Remote)
            .failed(&"boom");
        assert_eq!(entry.status, AuditStatus::Error);
        assert_eq!(entry.metadata_string().unwrap(), r#"{"error":"boom"}"#);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("合同分析", 2), "合同");
        assert_eq!(truncate_chars("ab", 5), "ab");
    }

    #[tokio::test]
    async fn record_appends_entries() {
        let storage = Storage::open_memory().await.unwrap();
        let log = AuditLog::new(storage.clone());

        log.record(
            NewAuditEntry::new(AuditAction::Recovery, AuditSource::Api)
                .description("nothing to recover")
                .duration(Duration::from_millis(12)),
        )
        .await;

        let entries = storage.list_audit_entries(None, 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, "RECOVERY");
        assert_eq!(entries[0].status, "SUCCESS");
        assert_eq!(entries[0].duration_ms, Some(12));
        assert!(entries[0].document_id.is_none());
    }
}
