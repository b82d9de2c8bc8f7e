use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Node API error: {0}")]
    NodeApiError(String),

    #[error("Failed to spawn node process: {0}")]
    SpawnError(String),

    #[error("Node did not report readiness within {0}s")]
    ReadinessTimeout(u64),

    #[error(
        "An external IPFS node is running without pubsub and did not stop after a shutdown request. \
         Stop it manually (e.g. `ipfs shutdown`) and try again."
    )]
    ExternalNodeRefusesToStop,

    #[error("Publish to '{topic}' failed: {reason}")]
    PublishFailed { topic: String, reason: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Swarm key error: {0}")]
    SwarmKeyError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl BridgeError {
    /// Transient failures that a bounded retry may recover from.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BridgeError::NetworkError(_) | BridgeError::NodeApiError(_)
        )
    }
}

impl From<reqwest::Error> for BridgeError {
    fn from(err: reqwest::Error) -> Self {
        BridgeError::NetworkError(err.to_string())
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::StorageError(err.to_string())
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::StorageError(format!("invalid JSON: {}", err))
    }
}

impl From<anyhow::Error> for BridgeError {
    fn from(err: anyhow::Error) -> Self {
        BridgeError::InternalError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
