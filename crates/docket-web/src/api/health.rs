use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::error::ApiResult;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(health))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub incomplete_documents: usize,
    pub notifications_enabled: bool,
}

async fn health(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    let incomplete = state.orchestrator().list_incomplete().await?;

    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        incomplete_documents: incomplete.len(),
        notifications_enabled: state.notifier().is_enabled(),
    }))
}
