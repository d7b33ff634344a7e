use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use docket_core::{
    ingest_document, AnalysisResult, CacheSource, Document, Error, ProcessingStatus,
    RecoveryReport, ServiceInfoSnapshot, StartOutcome, TemplateSet,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_documents).post(upload_document))
        .route(
            "/recover-incomplete",
            get(list_incomplete).post(recover_incomplete),
        )
        .route("/{id}", get(get_document))
        .route("/{id}/process", post(process_document))
        .route("/{id}/analysis", get(get_analysis).post(run_analysis))
        .route(
            "/{id}/service-info",
            get(get_service_info).post(run_service_info),
        )
}

/// Document metadata without its extracted text.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSummary {
    pub id: Uuid,
    pub content_hash: String,
    pub file_name: String,
    pub mime_type: String,
    pub file_size: i64,
    pub has_content: bool,
    pub processing_status: ProcessingStatus,
    pub processing_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Document> for DocumentSummary {
    fn from(d: Document) -> Self {
        Self {
            has_content: d.extractable_content().is_some(),
            id: d.id,
            content_hash: d.content_hash,
            file_name: d.file_name,
            mime_type: d.mime_type,
            file_size: d.file_size,
            processing_status: d.processing_status,
            processing_error: d.processing_error,
            created_at: d.created_at,
            updated_at: d.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    pub file_name: String,
    #[serde(default = "default_mime_type")]
    pub mime_type: String,
    /// Text already extracted from the file.
    pub content: String,
    /// Raw file contents the identity is derived from; the text when absent.
    pub raw: Option<String>,
}

fn default_mime_type() -> String {
    "text/plain".to_string()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub document: DocumentSummary,
    pub reused: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRequest {
    #[serde(default)]
    pub configuration_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessResponse {
    pub document_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ProcessingStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRequest {
    pub content: Option<String>,
    #[serde(default)]
    pub configuration_ids: Vec<String>,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Serialize)]
pub struct AnalysisResponse {
    pub source: CacheSource,
    pub analysis: AnalysisResult,
}

#[derive(Debug, Default, Deserialize)]
pub struct ServiceInfoRequest {
    pub content: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfoResponse {
    pub source: &'static str,
    pub service_info: ServiceInfoSnapshot,
}

async fn list_documents(State(state): State<AppState>) -> ApiResult<Json<Vec<DocumentSummary>>> {
    let documents = state.storage().list_documents().await?;
    Ok(Json(documents.into_iter().map(DocumentSummary::from).collect()))
}

async fn upload_document(
    State(state): State<AppState>,
    Json(req): Json<UploadRequest>,
) -> ApiResult<(StatusCode, Json<UploadResponse>)> {
    let raw = req.raw.as_deref().unwrap_or(&req.content);
    let (document, reused) = ingest_document(
        state.storage(),
        &state.pipeline.audit,
        raw.as_bytes(),
        &req.file_name,
        &req.mime_type,
        &req.content,
    )
    .await?;

    let status = if reused {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((
        status,
        Json(UploadResponse {
            document: document.into(),
            reused,
        }),
    ))
}

async fn get_document(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Document>> {
    Ok(Json(state.storage().get_document(id).await?))
}

/// Acknowledges the launch; callers poll the document for the outcome.
async fn process_document(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<ProcessRequest>>,
) -> ApiResult<Response> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let selection = TemplateSet::new(req.configuration_ids);

    let response = match state.orchestrator().start(id, &selection).await? {
        StartOutcome::Started => (
            StatusCode::ACCEPTED,
            Json(ProcessResponse {
                document_id: id,
                status: None,
            }),
        ),
        StartOutcome::AlreadyRunning(status) => (
            StatusCode::OK,
            Json(ProcessResponse {
                document_id: id,
                status: Some(status),
            }),
        ),
    };
    Ok(response.into_response())
}

async fn get_analysis(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<AnalysisResult>> {
    state.storage().get_document(id).await?;
    state
        .storage()
        .get_analysis(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "No analysis for this document"))
}

async fn run_analysis(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<AnalysisRequest>,
) -> ApiResult<Json<AnalysisResponse>> {
    let document = state.storage().get_document(id).await?;
    let content = request_content(req.content.as_deref(), &document)?;
    let selection = TemplateSet::new(req.configuration_ids);

    let (source, analysis) = state
        .cache()
        .resolve(id, content, &selection, req.force)
        .await?;

    Ok(Json(AnalysisResponse { source, analysis }))
}

async fn get_service_info(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ServiceInfoResponse>> {
    state.storage().get_document(id).await?;
    let response = match state.storage().get_service_info(id).await? {
        Some(service_info) => ServiceInfoResponse {
            source: "cached",
            service_info,
        },
        None => ServiceInfoResponse {
            source: "empty",
            service_info: ServiceInfoSnapshot::default(),
        },
    };
    Ok(Json(response))
}

/// Every remote failure is a 500 here, even though the pipeline itself
/// treats this stage as non-fatal.
async fn run_service_info(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<ServiceInfoRequest>>,
) -> ApiResult<Json<ServiceInfoSnapshot>> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let document = state.storage().get_document(id).await?;
    let content = request_content(req.content.as_deref(), &document)?;

    let snapshot = state
        .service_info()
        .run(id, content)
        .await
        .map_err(|e| match e {
            Error::Extraction(_) | Error::Database(_) | Error::Serialization(_) => {
                ApiError::internal(e.to_string())
            }
            other => other.into(),
        })?;

    Ok(Json(snapshot))
}

async fn list_incomplete(State(state): State<AppState>) -> ApiResult<Json<Vec<DocumentSummary>>> {
    let documents = state.orchestrator().list_incomplete().await?;
    Ok(Json(documents.into_iter().map(DocumentSummary::from).collect()))
}

async fn recover_incomplete(State(state): State<AppState>) -> ApiResult<Json<RecoveryReport>> {
    Ok(Json(state.orchestrator().recover_incomplete().await?))
}

/// Text from the request if given, otherwise the stored document text.
fn request_content<'a>(requested: Option<&'a str>, document: &'a Document) -> ApiResult<&'a str> {
    requested
        .filter(|c| !c.trim().is_empty())
        .or_else(|| document.extractable_content())
        .ok_or_else(|| Error::MissingContent.into())
}
