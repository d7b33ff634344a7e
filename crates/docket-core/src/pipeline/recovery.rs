use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::orchestrator::{Orchestrator, StartOutcome};
use crate::audit::{AuditAction, AuditSource, NewAuditEntry};
use crate::document::Document;
use crate::Result;

/// Minutes a non-terminal document may go untouched before it counts as lost.
pub const STALE_AFTER_MINUTES: i64 = 5;
pub const RECOVERY_LIMIT: i64 = 10;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryFailure {
    pub document_id: Uuid,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    pub restarted: Vec<Uuid>,
    /// Stale by timestamp but still running in this process; left alone.
    pub skipped: Vec<Uuid>,
    pub failed: Vec<RecoveryFailure>,
}

impl Orchestrator {
    /// Every document still PENDING or processing.
    pub async fn list_incomplete(&self) -> Result<Vec<Document>> {
        self.storage().list_active_documents().await
    }

    /// Restart runs lost to a crash or restart: stale non-terminal documents
    /// are reset to PENDING and started again with their last selection.
    pub async fn recover_incomplete(&self) -> Result<RecoveryReport> {
        self.recover_stale_since(Utc::now() - TimeDelta::minutes(STALE_AFTER_MINUTES))
            .await
    }

    /// Recover non-terminal documents last updated before `cutoff`, oldest
    /// first, at most [`RECOVERY_LIMIT`] per call.
    pub async fn recover_stale_since(&self, cutoff: DateTime<Utc>) -> Result<RecoveryReport> {
        let stale = self
            .storage()
            .list_stale_documents(cutoff, RECOVERY_LIMIT)
            .await?;

        let mut report = RecoveryReport::default();

        for document in stale {
            if self.is_in_flight(document.id) {
                tracing::debug!(document_id = %document.id, "Stale document still running, skipped");
                report.skipped.push(document.id);
                continue;
            }

            match self.recover(&document).await {
                Ok(()) => report.restarted.push(document.id),
                Err(e) => {
                    tracing::warn!(document_id = %document.id, error = %e, "Recovery failed");
                    report.failed.push(RecoveryFailure {
                        document_id: document.id,
                        error: e.to_string(),
                    });
                }
            }
        }

        if !report.restarted.is_empty() || !report.failed.is_empty() {
            tracing::info!(
                restarted = report.restarted.len(),
                failed = report.failed.len(),
                "Recovered incomplete documents"
            );
        }

        Ok(report)
    }

    async fn recover(&self, document: &Document) -> Result<()> {
        let selection = self
            .storage()
            .get_analysis(document.id)
            .await?
            .map(|a| a.selected_template_ids)
            .unwrap_or_default();

        self.storage().reset_to_pending(document.id).await?;

        self.audit_recovery(document).await;

        match self.start(document.id, &selection).await? {
            StartOutcome::Started => Ok(()),
            StartOutcome::AlreadyRunning(status) => {
                tracing::debug!(document_id = %document.id, %status, "Recovered document already restarted");
                Ok(())
            }
        }
    }

    async fn audit_recovery(&self, document: &Document) {
        self.audit()
            .record(
                NewAuditEntry::new(AuditAction::Recovery, AuditSource::Background)
                    .document(document.id)
                    .description(format!(
                        "Reset stale {} document to PENDING",
                        document.processing_status
                    ))
                    .metadata(serde_json::json!({
                        "previousStatus": document.processing_status,
                        "lastUpdated": document.updated_at,
                    })),
            )
            .await;
    }
}
