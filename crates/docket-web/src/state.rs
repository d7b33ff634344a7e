use docket_core::{AnalysisCache, BatchNotifier, Orchestrator, Pipeline, ServiceInfoStage, Storage};

/// Application state shared across all requests
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Pipeline,
}

impl AppState {
    pub const fn new(pipeline: Pipeline) -> Self {
        Self { pipeline }
    }

    pub const fn storage(&self) -> &Storage {
        &self.pipeline.storage
    }

    pub const fn orchestrator(&self) -> &Orchestrator {
        &self.pipeline.orchestrator
    }

    pub const fn cache(&self) -> &AnalysisCache {
        self.pipeline.cache()
    }

    pub const fn service_info(&self) -> &ServiceInfoStage {
        self.pipeline.service_info()
    }

    pub const fn notifier(&self) -> &BatchNotifier {
        self.pipeline.notifier()
    }
}
