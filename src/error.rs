use thiserror::Error;

use crate::gateway::GatewayError;
use crate::gateway::config::ConfigError;
use crate::gateway::store::StoreError;

/// Top-level error for embedders and the admin CLI.
#[derive(Debug, Error)]
pub enum AiproxyError {
    #[error("failed to encode json: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("failed to initialize tracing: {0}")]
    Telemetry(String),
}

pub type Result<T> = std::result::Result<T, AiproxyError>;
