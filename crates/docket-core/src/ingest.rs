//! Content-addressed document intake.

use std::time::Instant;

use crate::audit::{AuditAction, AuditLog, AuditSource, NewAuditEntry};
use crate::document::{Document, NewDocument, ProcessingStatus};
use crate::storage::Storage;
use crate::{Error, Result};

/// Store an uploaded document keyed by the hash of its raw bytes.
///
/// Identical bytes always resolve to the same record; its metadata and text
/// are refreshed. A terminal document is put back to PENDING so it can be
/// processed again. Returns the document and whether it already existed.
pub async fn ingest_document(
    storage: &Storage,
    audit: &AuditLog,
    bytes: &[u8],
    file_name: &str,
    mime_type: &str,
    text: &str,
) -> Result<(Document, bool)> {
    if text.trim().is_empty() {
        return Err(Error::MissingContent);
    }
    if file_name.trim().is_empty() {
        return Err(Error::InvalidInput("file name is required".into()));
    }

    let started = Instant::now();
    let new = NewDocument::from_bytes(bytes, file_name.trim(), mime_type, text.to_string());
    let (mut document, reused) = storage.upsert_document(&new).await?;

    if reused && document.processing_status.is_terminal() {
        let from = document.processing_status;
        if storage
            .transition_status(document.id, from, ProcessingStatus::Pending, None)
            .await?
        {
            tracing::info!(document_id = %document.id, %from, "Re-submitted document reset to PENDING");
            document = storage.get_document(document.id).await?;
        }
    }

    tracing::info!(
        document_id = %document.id,
        hash = %document.content_hash,
        reused,
        "Document ingested"
    );

    audit
        .record(
            NewAuditEntry::new(AuditAction::DocumentUpload, AuditSource::Api)
                .document(document.id)
                .description(if reused {
                    "Existing document refreshed"
                } else {
                    "Document created"
                })
                .duration(started.elapsed())
                .metadata(serde_json::json!({
                    "fileName": document.file_name,
                    "mimeType": document.mime_type,
                    "fileSize": document.file_size,
                    "reused": reused,
                })),
        )
        .await;

    Ok((document, reused))
}
