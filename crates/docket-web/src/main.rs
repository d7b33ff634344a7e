mod api;
mod config;
mod error;
mod state;

use axum::Router;
use docket_core::{Pipeline, Storage};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::ServerConfig;
use crate::state::AppState;

fn app(state: AppState) -> Router {
    Router::new()
        .nest("/api", api::router())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "docket_web=debug,docket_core=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env()?;
    config.pipeline.validate()?;

    let storage = Storage::open(&config.pipeline.database_path).await?;
    let pipeline = Pipeline::from_config(storage, &config.pipeline)?;

    if !pipeline.notifier().is_enabled() {
        tracing::warn!("NOTIFY_WEBHOOK_URL not set, batch notifications are disabled");
    }

    let report = pipeline.orchestrator.recover_incomplete().await?;
    if !report.restarted.is_empty() {
        tracing::info!(restarted = report.restarted.len(), "Restarted interrupted documents");
    }

    let app = app(AppState::new(pipeline));

    tracing::info!("Starting docketd on http://{}", config.bind);

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
