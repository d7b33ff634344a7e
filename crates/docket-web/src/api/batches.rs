use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use docket_core::NotificationBatch;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(create_batch))
        .route("/{id}", get(get_batch))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBatchRequest {
    pub email: String,
    #[serde(default)]
    pub document_ids: Vec<String>,
}

async fn create_batch(
    State(state): State<AppState>,
    Json(req): Json<CreateBatchRequest>,
) -> ApiResult<(StatusCode, Json<NotificationBatch>)> {
    let batch = state
        .notifier()
        .create_batch(&req.email, &req.document_ids)
        .await?;
    Ok((StatusCode::CREATED, Json(batch)))
}

async fn get_batch(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<NotificationBatch>> {
    Ok(Json(state.storage().get_batch(id).await?))
}
