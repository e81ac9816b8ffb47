use thiserror::Error;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration loading failed: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Validation failed: {0}")]
    ValidationFailed(#[from] ValidationError),
}

/// Semantic problems with loaded values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Transport URL must use ws:// or wss://")]
    InvalidTransportUrl,

    #[error("API base URL must use http:// or https://")]
    InvalidApiUrl,

    #[error("Invalid interval: {0} must be greater than zero")]
    ZeroInterval(&'static str),

    #[error("Reconnect attempts must be greater than zero")]
    NoReconnectAttempts,

    #[error("Heartbeat liveness window must cover at least one interval")]
    InvalidLivenessWindow,

    #[error("Correlator max_pending must be greater than zero")]
    InvalidPendingLimit,
}
