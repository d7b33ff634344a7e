use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde::Serialize;
use uuid::Uuid;

use crate::analysis::TemplateSet;
use crate::audit::{AuditAction, AuditLog, AuditSource, NewAuditEntry};
use crate::cache::AnalysisCache;
use crate::document::ProcessingStatus;
use crate::notify::BatchNotifier;
use crate::service_info::ServiceInfoStage;
use crate::storage::Storage;
use crate::{Error, Result};

/// What `start` did with the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "status", rename_all = "camelCase")]
pub enum StartOutcome {
    /// The stage sequence was launched in the background.
    Started,
    /// A run is already in flight; nothing was launched.
    AlreadyRunning(ProcessingStatus),
}

/// Document ids with a run task alive in this process.
#[derive(Debug, Clone, Default)]
struct InFlight(Arc<Mutex<HashSet<Uuid>>>);

impl InFlight {
    fn lock(&self) -> MutexGuard<'_, HashSet<Uuid>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `id`; the returned guard deregisters it on drop.
    fn enter(&self, id: Uuid) -> InFlightGuard {
        self.lock().insert(id);
        InFlightGuard {
            set: self.clone(),
            id,
        }
    }

    fn contains(&self, id: Uuid) -> bool {
        self.lock().contains(&id)
    }
}

struct InFlightGuard {
    set: InFlight,
    id: Uuid,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.lock().remove(&self.id);
    }
}

/// Drives documents through analysis and service-info extraction.
///
/// The only writer of `processing_status`. Every transition is a
/// compare-and-set in storage, is audited, and a run always ends in
/// COMPLETED or FAILED. Analysis failures are fatal, service-info failures
/// are not.
#[derive(Clone)]
pub struct Orchestrator {
    storage: Storage,
    audit: AuditLog,
    cache: AnalysisCache,
    service_info: ServiceInfoStage,
    notifier: BatchNotifier,
    in_flight: InFlight,
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        storage: Storage,
        audit: AuditLog,
        cache: AnalysisCache,
        service_info: ServiceInfoStage,
        notifier: BatchNotifier,
    ) -> Self {
        Self {
            storage,
            audit,
            cache,
            service_info,
            notifier,
            in_flight: InFlight::default(),
        }
    }

    #[must_use]
    pub const fn storage(&self) -> &Storage {
        &self.storage
    }

    #[must_use]
    pub const fn audit(&self) -> &AuditLog {
        &self.audit
    }

    #[must_use]
    pub const fn cache(&self) -> &AnalysisCache {
        &self.cache
    }

    #[must_use]
    pub const fn service_info(&self) -> &ServiceInfoStage {
        &self.service_info
    }

    #[must_use]
    pub const fn notifier(&self) -> &BatchNotifier {
        &self.notifier
    }

    /// Whether this process is currently running the stages for `document_id`.
    #[must_use]
    pub fn is_in_flight(&self, document_id: Uuid) -> bool {
        self.in_flight.contains(document_id)
    }

    /// Launch processing without waiting for it.
    ///
    /// Input is validated and the document moved to PROCESSING_ANALYSIS
    /// before returning, so a caller polling the status never sees a stale
    /// PENDING for an accepted run. A terminal document is re-submitted.
    pub async fn start(&self, document_id: Uuid, requested: &TemplateSet) -> Result<StartOutcome> {
        let document = self.storage.get_document(document_id).await?;
        let status = document.processing_status;

        if status.is_running() {
            tracing::debug!(%document_id, %status, "Processing already running");
            return Ok(StartOutcome::AlreadyRunning(status));
        }

        let content = document
            .extractable_content()
            .ok_or(Error::MissingContent)?
            .to_string();
        let selection = self.cache.resolve_selection(requested).await?;

        if status.is_terminal() {
            self.transition(document_id, status, ProcessingStatus::Pending, None)
                .await?;
        }

        if !self
            .transition(
                document_id,
                ProcessingStatus::Pending,
                ProcessingStatus::ProcessingAnalysis,
                None,
            )
            .await?
        {
            let current = self.storage.get_document(document_id).await?.processing_status;
            return Ok(StartOutcome::AlreadyRunning(current));
        }

        tracing::info!(%document_id, templates = selection.len(), "Processing started");

        let guard = self.in_flight.enter(document_id);
        let this = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            this.run(document_id, content, selection).await;
        });

        Ok(StartOutcome::Started)
    }

    async fn run(&self, document_id: Uuid, content: String, selection: TemplateSet) {
        let started = Instant::now();

        match self.run_stages(document_id, &content, &selection).await {
            Ok(status) => {
                tracing::info!(
                    %document_id,
                    %status,
                    elapsed_ms = started.elapsed().as_millis(),
                    "Processing finished"
                );
                self.notifier.on_document_terminal(document_id).await;
            }
            Err(e) => {
                tracing::error!(%document_id, error = %e, "Processing aborted");
            }
        }
    }

    /// Analysis, then service info. Returns the terminal status reached.
    async fn run_stages(
        &self,
        document_id: Uuid,
        content: &str,
        selection: &TemplateSet,
    ) -> Result<ProcessingStatus> {
        if let Err(e) = self.cache.resolve(document_id, content, selection, false).await {
            tracing::warn!(%document_id, error = %e, "Analysis stage failed");
            let message = e.to_string();
            self.advance(
                document_id,
                ProcessingStatus::ProcessingAnalysis,
                ProcessingStatus::Failed,
                Some(&message),
            )
            .await?;
            return Ok(ProcessingStatus::Failed);
        }

        self.advance(
            document_id,
            ProcessingStatus::ProcessingAnalysis,
            ProcessingStatus::ProcessingServiceInfo,
            None,
        )
        .await?;

        if let Err(e) = self.service_info.run(document_id, content).await {
            tracing::warn!(%document_id, error = %e, "Service info stage failed, continuing");
        }

        self.advance(
            document_id,
            ProcessingStatus::ProcessingServiceInfo,
            ProcessingStatus::Completed,
            None,
        )
        .await?;

        Ok(ProcessingStatus::Completed)
    }

    /// A transition inside a run; losing the compare-and-set means someone
    /// else changed the document and this run must stop.
    async fn advance(
        &self,
        document_id: Uuid,
        from: ProcessingStatus,
        to: ProcessingStatus,
        error: Option<&str>,
    ) -> Result<()> {
        if self.transition(document_id, from, to, error).await? {
            Ok(())
        } else {
            Err(Error::InvalidStatus(format!(
                "document {document_id} left {from} before reaching {to}"
            )))
        }
    }

    pub(crate) async fn transition(
        &self,
        document_id: Uuid,
        from: ProcessingStatus,
        to: ProcessingStatus,
        error: Option<&str>,
    ) -> Result<bool> {
        if !from.can_transition_to(to) {
            return Err(Error::InvalidStatus(format!("{from} -> {to}")));
        }

        let moved = self
            .storage
            .transition_status(document_id, from, to, error)
            .await?;

        if moved {
            tracing::debug!(%document_id, %from, %to, "Status transition");
            let entry = NewAuditEntry::new(AuditAction::StatusTransition, AuditSource::Background)
                .document(document_id)
                .description(format!("{from} -> {to}"));
            let entry = match error {
                Some(message) => entry.failed(&message),
                None => entry.metadata(serde_json::json!({ "from": from, "to": to })),
            };
            self.audit.record(entry).await;
        }

        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use url::Url;

    use super::*;
    use crate::document::NewDocument;
    use crate::extraction::{ExtractionClient, FanOut};

    fn orchestrator(storage: &Storage) -> Orchestrator {
        let audit = AuditLog::new(storage.clone());
        let fanout = FanOut::new(ExtractionClient::new().unwrap());
        let url = Url::parse("http://127.0.0.1:1").unwrap();
        Orchestrator::new(
            storage.clone(),
            audit.clone(),
            AnalysisCache::new(
                storage.clone(),
                audit.clone(),
                fanout.clone(),
                url.clone(),
                Duration::from_secs(1),
            ),
            ServiceInfoStage::new(
                storage.clone(),
                audit.clone(),
                fanout,
                url,
                Duration::from_secs(1),
                None,
            ),
            BatchNotifier::new(storage.clone(), audit, None, "docket@test"),
        )
    }

    #[tokio::test]
    async fn unknown_document_is_not_found() {
        let storage = Storage::open_memory().await.unwrap();
        let result = orchestrator(&storage)
            .start(Uuid::now_v7(), &TemplateSet::default())
            .await;
        assert!(matches!(result, Err(Error::DocumentNotFound(_))));
    }

    #[tokio::test]
    async fn running_document_is_left_alone() {
        let storage = Storage::open_memory().await.unwrap();
        let (doc, _) = storage
            .upsert_document(&NewDocument::from_bytes(b"a", "a.txt", "text/plain", "a".into()))
            .await
            .unwrap();
        storage
            .transition_status(
                doc.id,
                ProcessingStatus::Pending,
                ProcessingStatus::ProcessingServiceInfo,
                None,
            )
            .await
            .unwrap();

        let outcome = orchestrator(&storage)
            .start(doc.id, &TemplateSet::default())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            StartOutcome::AlreadyRunning(ProcessingStatus::ProcessingServiceInfo)
        );
    }

    #[tokio::test]
    async fn invalid_selection_changes_nothing() {
        let storage = Storage::open_memory().await.unwrap();
        let (doc, _) = storage
            .upsert_document(&NewDocument::from_bytes(b"a", "a.txt", "text/plain", "a".into()))
            .await
            .unwrap();

        let result = orchestrator(&storage)
            .start(doc.id, &TemplateSet::new(["missing"]))
            .await;
        assert!(matches!(result, Err(Error::TemplateNotFound(_))));
        assert_eq!(
            storage.get_document(doc.id).await.unwrap().processing_status,
            ProcessingStatus::Pending
        );
        assert!(storage.list_audit_entries(Some(doc.id), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected() {
        let storage = Storage::open_memory().await.unwrap();
        let (doc, _) = storage
            .upsert_document(&NewDocument::from_bytes(b"a", "a.txt", "text/plain", "a".into()))
            .await
            .unwrap();

        let result = orchestrator(&storage)
            .transition(doc.id, ProcessingStatus::Pending, ProcessingStatus::Completed, None)
            .await;
        assert!(matches!(result, Err(Error::InvalidStatus(_))));
    }
}
