mod batches;
mod documents;
mod health;
mod logs;
mod service_plans;
mod templates;

use axum::Router;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .nest("/batch-notifications", batches::router())
        .nest("/documents", documents::router())
        .nest("/health", health::router())
        .nest("/processing-logs", logs::router())
        .nest("/service-plans", service_plans::router())
        .nest("/templates", templates::router())
}
