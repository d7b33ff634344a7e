use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use docket_core::{Error, ServicePlan, ServicePlanClause};
use serde::Deserialize;

use crate::error::ApiResult;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(list_plans).post(create_plan))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePlanRequest {
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub clauses: Vec<ServicePlanClause>,
}

async fn list_plans(State(state): State<AppState>) -> ApiResult<Json<Vec<ServicePlan>>> {
    Ok(Json(state.storage().list_service_plans().await?))
}

async fn create_plan(
    State(state): State<AppState>,
    Json(req): Json<CreatePlanRequest>,
) -> ApiResult<(StatusCode, Json<ServicePlan>)> {
    let name = req.name.trim();
    if name.is_empty() {
        return Err(Error::InvalidInput("plan name is required".into()).into());
    }

    let plan = req
        .clauses
        .into_iter()
        .fold(ServicePlan::new(name, req.description), ServicePlan::with_clause);
    state.storage().insert_service_plan(&plan).await?;

    Ok((StatusCode::CREATED, Json(plan)))
}
