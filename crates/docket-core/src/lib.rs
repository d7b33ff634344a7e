pub mod analysis;
pub mod audit;
pub mod batch;
pub mod cache;
pub mod config;
pub mod document;
pub mod error;
pub mod extraction;
pub mod ingest;
pub mod notify;
pub mod pipeline;
pub mod recommendation;
pub mod service_info;
pub mod storage;

pub use analysis::{AnalysisResult, ReferenceClause, Template, TemplateSet, DEFAULT_TEMPLATE_SLUG};
pub use audit::{AuditAction, AuditLog, AuditLogEntry, AuditSource, AuditStatus, NewAuditEntry};
pub use batch::{BatchStatus, ClaimOutcome, NotificationBatch};
pub use cache::{AnalysisCache, CacheSource};
pub use config::PipelineConfig;
pub use document::{Document, NewDocument, ProcessingStatus};
pub use error::{Error, Result};
pub use extraction::{Endpoint, ExtractionClient, ExtractionError, FanOut};
pub use ingest::ingest_document;
pub use notify::{BatchNotifier, LogMailer, Mailer, Notification, WebhookMailer};
pub use pipeline::{Orchestrator, Pipeline, RecoveryReport, StartOutcome};
pub use recommendation::{ServicePlan, ServicePlanClause, ServicePlanRecommendation};
pub use service_info::{Aspect, ServiceInfoSnapshot, ServiceInfoStage};
pub use storage::Storage;
