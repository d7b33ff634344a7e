use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::document::{Document, ProcessingStatus};
use crate::service_info::ServiceInfoSnapshot;
use crate::storage::Storage;
use crate::Result;

/// Per-document section of an export.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportEntry {
    pub document_id: Uuid,
    pub file_name: String,
    pub status: ProcessingStatus,
    pub error: Option<String>,
    pub selected_template_ids: Vec<String>,
    pub results: BTreeMap<String, Value>,
    pub service_info: Option<ServiceInfoSnapshot>,
    pub recommendation_summary: Option<String>,
}

/// Everything known about a batch's documents, serialized as one JSON file.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportArtifact {
    pub file_name: String,
    pub generated_at: DateTime<Utc>,
    pub documents: Vec<ExportEntry>,
}

impl ExportArtifact {
    pub async fn build(storage: &Storage, members: &[Document]) -> Result<Self> {
        let generated_at = Utc::now();
        let mut documents = Vec::with_capacity(members.len());

        for doc in members {
            let analysis = storage.get_analysis(doc.id).await?;
            let service_info = storage.get_service_info(doc.id).await?;

            let (selected_template_ids, results) = analysis
                .map(|a| (a.selected_template_ids.to_vec(), a.results_by_template))
                .unwrap_or_default();

            let recommendation_summary = service_info
                .as_ref()
                .and_then(|s| s.service_plan_recommendation.as_ref())
                .map(|r| r.summary.clone());

            documents.push(ExportEntry {
                document_id: doc.id,
                file_name: doc.file_name.clone(),
                status: doc.processing_status,
                error: doc.processing_error.clone(),
                selected_template_ids,
                results,
                service_info,
                recommendation_summary,
            });
        }

        Ok(Self {
            file_name: format!(
                "docket-export-{}.json",
                generated_at.format("%Y%m%dT%H%M%SZ")
            ),
            generated_at,
            documents,
        })
    }

    #[must_use]
    pub fn count(&self, status: ProcessingStatus) -> usize {
        self.documents.iter().filter(|d| d.status == status).count()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{AnalysisResult, TemplateSet};
    use crate::document::NewDocument;

    #[tokio::test]
    async fn export_includes_results_and_missing_analysis() {
        let storage = Storage::open_memory().await.unwrap();
        let (done, _) = storage
            .upsert_document(&NewDocument::from_bytes(b"a", "a.pdf", "application/pdf", "a".into()))
            .await
            .unwrap();
        let (bare, _) = storage
            .upsert_document(&NewDocument::from_bytes(b"b", "b.pdf", "application/pdf", "b".into()))
            .await
            .unwrap();

        let now = Utc::now();
        storage
            .upsert_analysis(&AnalysisResult {
                id: Uuid::now_v7(),
                document_id: done.id,
                results_by_template: BTreeMap::from([(
                    "t1".to_string(),
                    serde_json::json!({"flags": 2}),
                )]),
                selected_template_ids: TemplateSet::new(["t1"]),
                reference_clauses: BTreeMap::new(),
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        let artifact = ExportArtifact::build(&storage, &[done.clone(), bare.clone()])
            .await
            .unwrap();

        assert!(artifact.file_name.starts_with("docket-export-"));
        assert!(artifact.file_name.ends_with(".json"));
        assert_eq!(artifact.documents.len(), 2);
        assert_eq!(artifact.documents[0].selected_template_ids, vec!["t1"]);
        assert_eq!(artifact.documents[0].results["t1"]["flags"], 2);
        assert!(artifact.documents[1].results.is_empty());
        assert!(artifact.documents[1].service_info.is_none());
        assert_eq!(artifact.count(ProcessingStatus::Pending), 2);

        let json: Value = serde_json::from_str(&artifact.to_json().unwrap()).unwrap();
        assert_eq!(json["documents"][1]["fileName"], "b.pdf");
    }
}
