use std::sync::Arc;
use std::time::Instant;

use uuid::Uuid;

use super::{Attachment, ExportArtifact, Mailer, Notification};
use crate::audit::{AuditAction, AuditLog, AuditSource, NewAuditEntry};
use crate::batch::{is_valid_email, normalize_document_ids, ClaimOutcome, NotificationBatch};
use crate::document::{Document, ProcessingStatus};
use crate::storage::Storage;
use crate::{Error, Result};

/// Delivers a batch exactly once after all of its documents are terminal.
///
/// Claiming is transactional (see [`Storage::claim_batch`]); everything after
/// the claim runs outside the transaction. A batch that fails export or
/// dispatch is marked FAILED and never retried.
#[derive(Clone)]
pub struct BatchNotifier {
    storage: Storage,
    audit: AuditLog,
    mailer: Option<Arc<dyn Mailer>>,
    from: String,
}

impl BatchNotifier {
    pub fn new(
        storage: Storage,
        audit: AuditLog,
        mailer: Option<Arc<dyn Mailer>>,
        from: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            audit,
            mailer,
            from: from.into(),
        }
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.mailer.is_some()
    }

    /// Validate and store a new batch, then try delivering it in the
    /// background. The claim re-checks readiness, so a batch whose members
    /// are still running stays PENDING until the last one finishes.
    pub async fn create_batch<I, S>(&self, email: &str, document_ids: I) -> Result<NotificationBatch>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if !self.is_enabled() {
            return Err(Error::Config("notifications are not configured".into()));
        }

        let email = email.trim();
        if !is_valid_email(email) {
            return Err(Error::InvalidInput(format!("invalid email address: {email}")));
        }

        let ids = normalize_document_ids(document_ids)?;
        if ids.is_empty() {
            return Err(Error::InvalidInput("no documents selected".into()));
        }

        self.check_members(&ids).await?;
        self.register(NotificationBatch::new(email, ids)).await
    }

    async fn check_members(&self, ids: &[Uuid]) -> Result<()> {
        let mut missing = Vec::new();
        for id in ids {
            match self.storage.get_document(*id).await {
                Ok(_) => {}
                Err(Error::DocumentNotFound(_)) => missing.push(*id),
                Err(e) => return Err(e),
            }
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::DocumentsNotFound(missing))
        }
    }

    /// Members may turn terminal between validation and insert, with their
    /// trigger finding no batch yet, so delivery is always attempted here.
    async fn register(&self, batch: NotificationBatch) -> Result<NotificationBatch> {
        self.storage.insert_batch(&batch).await?;

        tracing::info!(
            batch_id = %batch.id,
            documents = batch.document_ids.len(),
            "Notification batch created"
        );

        let notifier = self.clone();
        let batch_id = batch.id;
        tokio::spawn(async move { notifier.try_deliver(batch_id).await });

        Ok(batch)
    }

    /// Called whenever a document enters COMPLETED or FAILED.
    pub async fn on_document_terminal(&self, document_id: Uuid) {
        if self.mailer.is_none() {
            return;
        }

        let batch_ids = match self.storage.pending_batches_for_document(document_id).await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::error!(%document_id, error = %e, "Failed to look up notification batches");
                return;
            }
        };

        for batch_id in batch_ids {
            self.try_deliver(batch_id).await;
        }
    }

    /// Claim and deliver one batch. Errors stay inside this batch.
    pub async fn try_deliver(&self, batch_id: Uuid) {
        let Some(mailer) = self.mailer.as_deref() else {
            return;
        };

        match self.storage.claim_batch(batch_id).await {
            Ok(ClaimOutcome::Claimed { batch, members }) => {
                self.deliver(&batch, &members, mailer).await;
            }
            Ok(ClaimOutcome::AlreadyClaimed) => {
                tracing::debug!(%batch_id, "Batch already claimed");
            }
            Ok(ClaimOutcome::NotReady) => {
                tracing::debug!(%batch_id, "Batch still has documents in progress");
            }
            Ok(ClaimOutcome::MissingMembers(missing)) => {
                tracing::warn!(%batch_id, missing = missing.len(), "Batch members no longer exist");
                self.audit
                    .record(
                        NewAuditEntry::new(AuditAction::BatchNotification, AuditSource::Notifier)
                            .description(format!("Batch {batch_id} failed: member documents missing"))
                            .failed(&Error::DocumentsNotFound(missing)),
                    )
                    .await;
            }
            Err(e) => {
                tracing::error!(%batch_id, error = %e, "Failed to claim notification batch");
            }
        }
    }

    async fn deliver(&self, batch: &NotificationBatch, members: &[Document], mailer: &dyn Mailer) {
        let started = Instant::now();
        let entry = NewAuditEntry::new(AuditAction::BatchNotification, AuditSource::Notifier);
        let metadata = serde_json::json!({
            "batchId": batch.id,
            "documentIds": batch.document_ids,
            "mailer": mailer.name(),
        });

        match self.dispatch(batch, members, mailer).await {
            Ok(()) => {
                if let Err(e) = self.storage.complete_batch(batch.id).await {
                    tracing::error!(batch_id = %batch.id, error = %e, "Failed to complete batch");
                }
                tracing::info!(batch_id = %batch.id, "Batch notification sent");
                self.audit
                    .record(
                        entry
                            .description(format!("Notified {}", batch.email))
                            .duration(started.elapsed())
                            .metadata(metadata),
                    )
                    .await;
            }
            Err(e) => {
                tracing::error!(batch_id = %batch.id, error = %e, "Batch notification failed");
                if let Err(store_err) = self.storage.fail_batch(batch.id, &e.to_string()).await {
                    tracing::error!(batch_id = %batch.id, error = %store_err, "Failed to mark batch failed");
                }
                self.audit
                    .record(
                        entry
                            .description(format!("Notification to {} failed", batch.email))
                            .duration(started.elapsed())
                            .failed(&e),
                    )
                    .await;
            }
        }
    }

    async fn dispatch(
        &self,
        batch: &NotificationBatch,
        members: &[Document],
        mailer: &dyn Mailer,
    ) -> Result<()> {
        let artifact = ExportArtifact::build(&self.storage, members).await?;
        let notification = compose(&self.from, batch, &artifact)?;
        mailer.send(&notification).await
    }
}

fn compose(from: &str, batch: &NotificationBatch, artifact: &ExportArtifact) -> Result<Notification> {
    let completed = artifact.count(ProcessingStatus::Completed);
    let failed = artifact.count(ProcessingStatus::Failed);

    let mut body = format!(
        "{} document(s) processed: {completed} completed, {failed} failed.\n\n",
        artifact.documents.len()
    );
    for entry in &artifact.documents {
        let line = match &entry.error {
            Some(error) => format!("- {}: {} ({error})\n", entry.file_name, entry.status),
            None => format!("- {}: {}\n", entry.file_name, entry.status),
        };
        body.push_str(&line);
    }

    Ok(Notification {
        from: from.to_string(),
        to: batch.email.clone(),
        subject: format!("Document results: {completed} completed, {failed} failed"),
        body,
        attachments: vec![Attachment {
            file_name: artifact.file_name.clone(),
            content_type: "application/json".to_string(),
            content: artifact.to_json()?,
        }],
    })
}
