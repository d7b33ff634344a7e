use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use docket_core::{Error, ReferenceClause, Template};
use serde::Serialize;

use crate::error::ApiResult;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_templates))
        .route("/{key}/clauses", get(list_clauses))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateClauses {
    #[serde(flatten)]
    pub template: Template,
    pub clauses: Vec<ReferenceClause>,
}

async fn list_templates(State(state): State<AppState>) -> ApiResult<Json<Vec<Template>>> {
    Ok(Json(state.storage().list_templates().await?))
}

/// Accepts a template id or slug.
async fn list_clauses(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<Json<TemplateClauses>> {
    let template = state
        .storage()
        .find_template(&key)
        .await?
        .ok_or(Error::TemplateNotFound(key))?;
    let clauses = state.storage().reference_clauses(&template.id).await?;
    Ok(Json(TemplateClauses { template, clauses }))
}
