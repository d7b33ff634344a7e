#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use docket_core::{
    ingest_document, Document, Notification, Mailer, Pipeline, PipelineConfig, Storage,
};
use serde_json::{json, Value};
use url::Url;

/// Behaviour knobs for the stub remote services.
#[derive(Clone, Default)]
pub struct StubBehavior {
    pub analysis_delay: Option<Duration>,
    pub failing_aspect: Option<&'static str>,
    pub unclassified_items: bool,
}

#[derive(Clone, Default)]
pub struct StubCalls {
    pub analysis: Arc<AtomicUsize>,
    pub service_info: Arc<AtomicUsize>,
    pub recommendation: Arc<AtomicUsize>,
    pub analysis_bodies: Arc<Mutex<Vec<Value>>>,
}

impl StubCalls {
    pub fn analysis(&self) -> usize {
        self.analysis.load(Ordering::SeqCst)
    }

    pub fn service_info(&self) -> usize {
        self.service_info.load(Ordering::SeqCst)
    }

    pub fn recommendation(&self) -> usize {
        self.recommendation.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
struct StubState {
    behavior: StubBehavior,
    calls: StubCalls,
}

pub struct Stub {
    pub url: Url,
    pub calls: StubCalls,
}

/// Serve the analysis, service-info and recommendation endpoints on an
/// ephemeral local port.
pub async fn spawn_stub(behavior: StubBehavior) -> Stub {
    let calls = StubCalls::default();
    let state = StubState {
        behavior,
        calls: calls.clone(),
    };

    let app = Router::new()
        .route("/api/v1/non_standard_detection", post(analysis))
        .route("/api/v1/service_plan_recommendation", post(recommendation))
        .route("/api/v1/{endpoint}", post(service_info))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Stub {
        url: Url::parse(&format!("http://{addr}")).unwrap(),
        calls,
    }
}

async fn analysis(State(state): State<StubState>, Json(body): Json<Value>) -> Json<Value> {
    state.calls.analysis.fetch_add(1, Ordering::SeqCst);
    if let Some(delay) = state.behavior.analysis_delay {
        tokio::time::sleep(delay).await;
    }
    let clauses = body["standard_clauses"].as_array().map_or(0, Vec::len);
    state.calls.analysis_bodies.lock().unwrap().push(body);
    Json(json!({ "checkedClauses": clauses, "nonStandard": [] }))
}

async fn service_info(
    State(state): State<StubState>,
    Path(endpoint): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    state.calls.service_info.fetch_add(1, Ordering::SeqCst);
    let aspect = endpoint.trim_end_matches("_extraction");

    if state.behavior.failing_aspect == Some(aspect) {
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }

    let service_type = if state.behavior.unclassified_items {
        Value::Null
    } else {
        json!("智保 Gold")
    };

    let body = match aspect {
        "onsite_sla" => json!([{
            "service_type": service_type,
            "response_time_hours": 4,
            "on_site_time_hours": "24",
            "original_contract_snippet": "Engineer on site within 24 hours."
        }]),
        "contract_compliance" => json!({ "information_confidentiality_requirements": true }),
        "after_sales_support" => json!({ "hotline_support": "24/7" }),
        _ => json!({ "items": [] }),
    };
    Ok(Json(body))
}

async fn recommendation(State(state): State<StubState>, Json(body): Json<Value>) -> Json<Value> {
    state.calls.recommendation.fetch_add(1, Ordering::SeqCst);
    let plan_id = body["candidates"][0]["planId"].clone();
    Json(json!({
        "summary": "  Gold plan fits  ",
        "overallPlanId": plan_id,
        "overallPlanName": "Gold",
        "matches": []
    }))
}

pub fn config(base: &Url) -> PipelineConfig {
    PipelineConfig {
        analysis_base_url: Some(base.clone()),
        service_info_base_url: Some(base.clone()),
        recommendation_base_url: Some(base.clone()),
        analysis_timeout: Duration::from_secs(5),
        service_info_timeout: Duration::from_secs(5),
        ..PipelineConfig::default()
    }
}

pub async fn pipeline(base: &Url) -> Pipeline {
    let storage = Storage::open_memory().await.unwrap();
    Pipeline::from_config(storage, &config(base)).unwrap()
}

pub async fn ingest(pipeline: &Pipeline, bytes: &[u8]) -> Document {
    let (doc, _) = ingest_document(
        &pipeline.storage,
        &pipeline.audit,
        bytes,
        "contract.pdf",
        "application/pdf",
        "The vendor provides on-site support within 24 hours.",
    )
    .await
    .unwrap();
    doc
}

/// Poll until the document reaches COMPLETED or FAILED.
pub async fn wait_for_terminal(storage: &Storage, id: uuid::Uuid) -> Document {
    for _ in 0..500 {
        let doc = storage.get_document(id).await.unwrap();
        if doc.processing_status.is_terminal() {
            return doc;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("document {id} never reached a terminal state");
}

/// Counts dispatches; optionally slow to widen race windows.
#[derive(Default)]
pub struct CountingMailer {
    pub sent: AtomicUsize,
    pub delay: Option<Duration>,
    pub last: Mutex<Option<Notification>>,
}

impl CountingMailer {
    pub fn count(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Mailer for CountingMailer {
    fn name(&self) -> &'static str {
        "counting"
    }

    async fn send(&self, notification: &Notification) -> docket_core::Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.sent.fetch_add(1, Ordering::SeqCst);
        *self.last.lock().unwrap() = Some(notification.clone());
        Ok(())
    }
}
