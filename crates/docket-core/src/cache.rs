use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::analysis::{
    default_reference_clauses, AnalysisResult, ClauseSnapshot, Template, TemplateSet,
    DEFAULT_TEMPLATE_SLUG,
};
use crate::audit::{AuditAction, AuditLog, AuditSource, AuditStatus, NewAuditEntry};
use crate::extraction::{Endpoint, FanOut};
use crate::storage::Storage;
use crate::{Error, Result};

pub const ANALYSIS_PATH: &str = "/api/v1/non_standard_detection";

const DEFAULT_TEMPLATE_NAME: &str = "Default standard clauses";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheSource {
    Cache,
    Fresh,
}

impl CacheSource {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Fresh => "fresh",
        }
    }
}

/// Reuses a stored analysis when it was produced for exactly the requested
/// template set, and otherwise recomputes and replaces it.
///
/// Only the set of template ids is compared. Editing a template's clauses
/// without changing the selection keeps serving the stored result until a
/// forced refresh.
#[derive(Clone)]
pub struct AnalysisCache {
    storage: Storage,
    audit: AuditLog,
    fanout: FanOut,
    base_url: Url,
    timeout: Duration,
}

impl AnalysisCache {
    #[must_use]
    pub const fn new(
        storage: Storage,
        audit: AuditLog,
        fanout: FanOut,
        base_url: Url,
        timeout: Duration,
    ) -> Self {
        Self {
            storage,
            audit,
            fanout,
            base_url,
            timeout,
        }
    }

    /// Canonical template ids for a selection. An empty selection is the
    /// default template, created on first use.
    pub async fn resolve_selection(&self, requested: &TemplateSet) -> Result<TemplateSet> {
        if requested.is_empty() {
            let template = self.default_template().await?;
            return Ok(TemplateSet::new([template.id]));
        }

        let mut ids = Vec::with_capacity(requested.len());
        for key in requested.iter() {
            let template = match self.storage.find_template(key).await? {
                Some(template) => template,
                None if key == DEFAULT_TEMPLATE_SLUG => self.default_template().await?,
                None => return Err(Error::TemplateNotFound(key.to_string())),
            };
            ids.push(template.id);
        }
        Ok(TemplateSet::new(ids))
    }

    pub async fn resolve(
        &self,
        document_id: Uuid,
        content: &str,
        requested: &TemplateSet,
        force_refresh: bool,
    ) -> Result<(CacheSource, AnalysisResult)> {
        if content.trim().is_empty() {
            return Err(Error::MissingContent);
        }
        if requested.is_empty() {
            return Err(Error::EmptySelection);
        }

        let started = Instant::now();
        let selection = self.resolve_selection(requested).await?;
        let entry = NewAuditEntry::new(AuditAction::DocumentAnalysis, AuditSource::Remote)
            .document(document_id);

        if !force_refresh {
            if let Some(stored) = self.storage.get_analysis(document_id).await? {
                if stored.matches_selection(&selection) {
                    tracing::debug!(%document_id, "Analysis cache hit");
                    self.audit
                        .record(
                            entry
                                .status(AuditStatus::Skipped)
                                .description("Reused stored analysis")
                                .duration(started.elapsed())
                                .metadata(serde_json::json!({
                                    "source": CacheSource::Cache.as_str(),
                                    "templates": selection.to_vec(),
                                })),
                        )
                        .await;
                    return Ok((CacheSource::Cache, stored));
                }
            }
        }

        let clauses = self.load_clauses(&selection).await?;

        match self.compute(document_id, content, &selection, clauses).await {
            Ok(result) => {
                self.audit
                    .record(
                        entry
                            .description("Analysis computed")
                            .duration(started.elapsed())
                            .metadata(serde_json::json!({
                                "source": CacheSource::Fresh.as_str(),
                                "templates": selection.to_vec(),
                            })),
                    )
                    .await;
                Ok((CacheSource::Fresh, result))
            }
            Err(e) => {
                self.audit
                    .record(
                        entry
                            .description("Analysis failed")
                            .duration(started.elapsed())
                            .failed(&e),
                    )
                    .await;
                Err(e)
            }
        }
    }

    /// Clause snapshot for every selected template. Fails before any network
    /// call when a template has no clauses.
    async fn load_clauses(&self, selection: &TemplateSet) -> Result<ClauseSnapshot> {
        let mut snapshot = ClauseSnapshot::new();

        for template_id in selection.iter() {
            let mut clauses = self.storage.reference_clauses(template_id).await?;

            if clauses.is_empty() {
                let is_default = self
                    .storage
                    .find_template(template_id)
                    .await?
                    .is_some_and(|t| t.slug == DEFAULT_TEMPLATE_SLUG);
                if is_default {
                    self.storage
                        .seed_reference_clauses(template_id, &default_reference_clauses())
                        .await?;
                    clauses = self.storage.reference_clauses(template_id).await?;
                }
            }

            if clauses.is_empty() {
                return Err(Error::EmptyClauseSet(template_id.to_string()));
            }

            snapshot.insert(template_id.to_string(), clauses);
        }

        Ok(snapshot)
    }

    async fn compute(
        &self,
        document_id: Uuid,
        content: &str,
        selection: &TemplateSet,
        clauses: ClauseSnapshot,
    ) -> Result<AnalysisResult> {
        let endpoints = clauses
            .iter()
            .map(|(template_id, standard_clauses)| {
                Endpoint::new(
                    template_id.clone(),
                    &self.base_url,
                    ANALYSIS_PATH,
                    serde_json::json!({
                        "content": content,
                        "standard_clauses": standard_clauses,
                    }),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let results_by_template: BTreeMap<String, serde_json::Value> =
            self.fanout.run(&endpoints, self.timeout).await?;

        let now = Utc::now();
        let result = AnalysisResult {
            id: Uuid::now_v7(),
            document_id,
            results_by_template,
            selected_template_ids: selection.clone(),
            reference_clauses: clauses,
            created_at: now,
            updated_at: now,
        };

        self.storage.upsert_analysis(&result).await?;

        Ok(self
            .storage
            .get_analysis(document_id)
            .await?
            .unwrap_or(result))
    }

    async fn default_template(&self) -> Result<Template> {
        self.storage
            .ensure_template(DEFAULT_TEMPLATE_SLUG, DEFAULT_TEMPLATE_NAME)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::NewDocument;
    use crate::extraction::ExtractionClient;

    async fn cache() -> (Storage, AnalysisCache) {
        let storage = Storage::open_memory().await.unwrap();
        let cache = AnalysisCache::new(
            storage.clone(),
            AuditLog::new(storage.clone()),
            FanOut::new(ExtractionClient::new().unwrap()),
            Url::parse("http://127.0.0.1:1").unwrap(),
            Duration::from_secs(1),
        );
        (storage, cache)
    }

    #[tokio::test]
    async fn empty_selection_resolves_to_default_template() {
        let (storage, cache) = cache().await;
        let selection = cache.resolve_selection(&TemplateSet::default()).await.unwrap();
        let default = storage.find_template(DEFAULT_TEMPLATE_SLUG).await.unwrap().unwrap();
        assert_eq!(selection, TemplateSet::new([default.id.clone()]));

        let by_slug = cache
            .resolve_selection(&TemplateSet::new([DEFAULT_TEMPLATE_SLUG]))
            .await
            .unwrap();
        assert_eq!(by_slug, selection);
    }

    #[tokio::test]
    async fn unknown_template_is_rejected() {
        let (_, cache) = cache().await;
        let err = cache
            .resolve_selection(&TemplateSet::new(["nope"]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TemplateNotFound(ref id) if id == "nope"));
    }

    #[tokio::test]
    async fn template_without_clauses_fails_before_fan_out() {
        let (storage, cache) = cache().await;
        let (doc, _) = storage
            .upsert_document(&NewDocument::from_bytes(b"x", "a.txt", "text/plain", "x".into()))
            .await
            .unwrap();
        let template = storage.ensure_template("custom", "Custom").await.unwrap();

        let err = cache
            .resolve(doc.id, "text", &TemplateSet::new([template.id.clone()]), false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmptyClauseSet(ref id) if *id == template.id));
        assert!(storage.get_analysis(doc.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn input_errors_come_first() {
        let (_, cache) = cache().await;
        let id = Uuid::now_v7();
        assert!(matches!(
            cache.resolve(id, "  ", &TemplateSet::new(["a"]), false).await,
            Err(Error::MissingContent)
        ));
        assert!(matches!(
            cache.resolve(id, "text", &TemplateSet::default(), false).await,
            Err(Error::EmptySelection)
        ));
    }
}
