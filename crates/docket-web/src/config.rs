use std::net::SocketAddr;

use docket_core::PipelineConfig;

pub const DEFAULT_BIND: &str = "0.0.0.0:3080";

/// Server settings on top of the pipeline configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub pipeline: PipelineConfig,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let bind = std::env::var("DOCKET_BIND")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BIND.to_string());

        Ok(Self {
            bind: bind
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("DOCKET_BIND {bind:?} is not a socket address: {e}"))?,
            pipeline: PipelineConfig::from_env()?,
        })
    }
}
