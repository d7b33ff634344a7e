use std::time::Duration;

use url::Url;

use crate::{Error, Result};

pub const DEFAULT_DATABASE_PATH: &str = "docket.db";
pub const DEFAULT_ANALYSIS_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_SERVICE_INFO_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_NOTIFY_FROM: &str = "docket@localhost";

const BACKEND_FALLBACK_VARS: [&str; 2] = ["INTERNAL_BACKEND_URL", "BACKEND_SERVICE_BASE_URL"];

/// Remote endpoints, timeouts and notification settings for the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_path: String,
    pub analysis_base_url: Option<Url>,
    pub service_info_base_url: Option<Url>,
    pub recommendation_base_url: Option<Url>,
    pub analysis_timeout: Duration,
    pub service_info_timeout: Duration,
    pub notify_webhook_url: Option<Url>,
    pub notify_from: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_path: DEFAULT_DATABASE_PATH.to_string(),
            analysis_base_url: None,
            service_info_base_url: None,
            recommendation_base_url: None,
            analysis_timeout: DEFAULT_ANALYSIS_TIMEOUT,
            service_info_timeout: DEFAULT_SERVICE_INFO_TIMEOUT,
            notify_webhook_url: None,
            notify_from: DEFAULT_NOTIFY_FROM.to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any variable source; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let backend = BACKEND_FALLBACK_VARS.iter().find_map(|&key| get(key));
        let base_url = |key: &str| -> Result<Option<Url>> {
            get(key)
                .or_else(|| backend.clone())
                .map(|raw| parse_base_url(key, &raw))
                .transpose()
        };

        let defaults = Self::default();

        Ok(Self {
            database_path: get("DOCKET_DB").unwrap_or(defaults.database_path),
            analysis_base_url: base_url("ANALYSIS_API_BASE_URL")?,
            service_info_base_url: base_url("SERVICE_INFO_API_BASE_URL")?,
            recommendation_base_url: base_url("RECOMMENDATION_API_BASE_URL")?,
            analysis_timeout: secs(get("ANALYSIS_TIMEOUT_SECS"), "ANALYSIS_TIMEOUT_SECS")?
                .unwrap_or(defaults.analysis_timeout),
            service_info_timeout: secs(
                get("SERVICE_INFO_TIMEOUT_SECS"),
                "SERVICE_INFO_TIMEOUT_SECS",
            )?
            .unwrap_or(defaults.service_info_timeout),
            notify_webhook_url: get("NOTIFY_WEBHOOK_URL")
                .map(|raw| parse_base_url("NOTIFY_WEBHOOK_URL", &raw))
                .transpose()?,
            notify_from: get("NOTIFY_FROM").unwrap_or(defaults.notify_from),
        })
    }

    /// Report every missing required endpoint at once.
    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.analysis_base_url.is_none() {
            missing.push("ANALYSIS_API_BASE_URL");
        }
        if self.service_info_base_url.is_none() {
            missing.push("SERVICE_INFO_API_BASE_URL");
        }

        if missing.is_empty() {
            return Ok(());
        }

        Err(Error::Config(format!(
            "missing base URL for {} (or set {})",
            missing.join(", "),
            BACKEND_FALLBACK_VARS.join(" / ")
        )))
    }

    pub fn analysis_base_url(&self) -> Result<&Url> {
        self.analysis_base_url
            .as_ref()
            .ok_or_else(|| Error::Config("ANALYSIS_API_BASE_URL is not configured".into()))
    }

    pub fn service_info_base_url(&self) -> Result<&Url> {
        self.service_info_base_url
            .as_ref()
            .ok_or_else(|| Error::Config("SERVICE_INFO_API_BASE_URL is not configured".into()))
    }
}

fn parse_base_url(key: &str, raw: &str) -> Result<Url> {
    let trimmed = raw.trim().trim_end_matches('/');
    Url::parse(trimmed).map_err(|e| Error::Config(format!("{key} is not a valid URL: {e}")))
}

fn secs(raw: Option<String>, key: &str) -> Result<Option<Duration>> {
    raw.map(|v| {
        v.trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| Error::Config(format!("{key} must be a whole number of seconds")))
    })
    .transpose()
}
