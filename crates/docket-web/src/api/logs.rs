use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use docket_core::AuditLogEntry;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::state::AppState;

const DEFAULT_LIMIT: i64 = 100;
const MAX_LIMIT: i64 = 500;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(list_logs))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogQuery {
    document_id: Option<Uuid>,
    limit: Option<i64>,
}

async fn list_logs(
    State(state): State<AppState>,
    Query(query): Query<LogQuery>,
) -> ApiResult<Json<Vec<AuditLogEntry>>> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let entries = state
        .storage()
        .list_audit_entries(query.document_id, limit)
        .await?;
    Ok(Json(entries))
}
