//! Document lifecycle orchestration and the wiring that assembles it.

mod orchestrator;
mod recovery;

pub use orchestrator::{Orchestrator, StartOutcome};
pub use recovery::{RecoveryFailure, RecoveryReport, RECOVERY_LIMIT, STALE_AFTER_MINUTES};

use std::sync::Arc;

use crate::audit::AuditLog;
use crate::cache::AnalysisCache;
use crate::config::PipelineConfig;
use crate::extraction::{ExtractionClient, FanOut};
use crate::notify::{BatchNotifier, Mailer, WebhookMailer};
use crate::recommendation::Recommender;
use crate::service_info::ServiceInfoStage;
use crate::storage::Storage;
use crate::Result;

/// Every pipeline component, built from one configuration and sharing one
/// storage handle and HTTP client.
#[derive(Clone)]
pub struct Pipeline {
    pub storage: Storage,
    pub audit: AuditLog,
    pub orchestrator: Orchestrator,
}

impl Pipeline {
    /// Wire the pipeline, delivering notifications through the configured
    /// webhook if any.
    pub fn from_config(storage: Storage, config: &PipelineConfig) -> Result<Self> {
        let mailer = config
            .notify_webhook_url
            .clone()
            .map(|url| Arc::new(WebhookMailer::new(url)) as Arc<dyn Mailer>);
        Self::with_mailer(storage, config, mailer)
    }

    pub fn with_mailer(
        storage: Storage,
        config: &PipelineConfig,
        mailer: Option<Arc<dyn Mailer>>,
    ) -> Result<Self> {
        config.validate()?;

        let audit = AuditLog::new(storage.clone());
        let client = ExtractionClient::new()?;
        let fanout = FanOut::new(client.clone());

        let cache = AnalysisCache::new(
            storage.clone(),
            audit.clone(),
            fanout.clone(),
            config.analysis_base_url()?.clone(),
            config.analysis_timeout,
        );

        let recommender = Recommender::new(
            storage.clone(),
            audit.clone(),
            client,
            config.recommendation_base_url.clone(),
            config.service_info_timeout,
        );

        let service_info = ServiceInfoStage::new(
            storage.clone(),
            audit.clone(),
            fanout,
            config.service_info_base_url()?.clone(),
            config.service_info_timeout,
            Some(recommender),
        );

        let notifier = BatchNotifier::new(
            storage.clone(),
            audit.clone(),
            mailer,
            config.notify_from.clone(),
        );

        let orchestrator =
            Orchestrator::new(storage.clone(), audit.clone(), cache, service_info, notifier);

        Ok(Self {
            storage,
            audit,
            orchestrator,
        })
    }

    #[must_use]
    pub const fn cache(&self) -> &AnalysisCache {
        self.orchestrator.cache()
    }

    #[must_use]
    pub const fn service_info(&self) -> &ServiceInfoStage {
        self.orchestrator.service_info()
    }

    #[must_use]
    pub const fn notifier(&self) -> &BatchNotifier {
        self.orchestrator.notifier()
    }
}
