use std::time::Duration;

use serde::Deserialize;

use super::error::ValidationError;
use crate::client::TransportConfig;
use crate::core::WsTlsConfig;
use crate::correlator::CorrelatorConfig;
use crate::live::{HttpSourceConfig, LiveServiceConfig};

fn require_nonzero(value: u64, name: &'static str) -> Result<(), ValidationError> {
    if value == 0 {
        return Err(ValidationError::ZeroInterval(name));
    }
    Ok(())
}

/// Websocket connection to the agent backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportSection {
    pub url: String,
    pub label: Option<String>,
    pub reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_missed_intervals: u32,
    pub validate_certs: bool,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8081".to_string(),
            label: None,
            reconnect_attempts: 5,
            reconnect_delay_ms: 3000,
            heartbeat_interval_ms: 30_000,
            heartbeat_missed_intervals: 3,
            validate_certs: true,
        }
    }
}

impl TransportSection {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(ValidationError::InvalidTransportUrl);
        }
        if self.reconnect_attempts == 0 {
            return Err(ValidationError::NoReconnectAttempts);
        }
        require_nonzero(self.reconnect_delay_ms, "transport.reconnect_delay_ms")?;
        require_nonzero(self.heartbeat_interval_ms, "transport.heartbeat_interval_ms")?;
        if self.heartbeat_missed_intervals == 0 {
            return Err(ValidationError::InvalidLivenessWindow);
        }
        Ok(())
    }

    pub fn to_transport_config(&self) -> TransportConfig {
        TransportConfig {
            url: self.url.clone(),
            label: self.label.clone(),
            reconnect_attempts: self.reconnect_attempts,
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            heartbeat_missed_intervals: self.heartbeat_missed_intervals,
            tls: WsTlsConfig {
                validate_certs: self.validate_certs,
            },
            ..TransportConfig::default()
        }
    }
}

/// REST backend used for polling and actions.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiSection {
    pub base_url: String,
    pub timeout_ms: u64,
    pub auth_token: Option<String>,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            timeout_ms: 30_000,
            auth_token: None,
        }
    }
}

impl ApiSection {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(ValidationError::InvalidApiUrl);
        }
        require_nonzero(self.timeout_ms, "api.timeout_ms")
    }

    pub fn to_source_config(&self) -> HttpSourceConfig {
        HttpSourceConfig {
            base_url: self.base_url.clone(),
            timeout: Duration::from_millis(self.timeout_ms),
            auth_token: self.auth_token.clone().filter(|token| !token.is_empty()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CorrelatorSection {
    pub request_timeout_ms: u64,
    pub max_pending: usize,
}

impl Default for CorrelatorSection {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            max_pending: 1024,
        }
    }
}

impl CorrelatorSection {
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_nonzero(self.request_timeout_ms, "correlator.request_timeout_ms")?;
        if self.max_pending == 0 {
            return Err(ValidationError::InvalidPendingLimit);
        }
        Ok(())
    }

    pub fn to_correlator_config(&self) -> CorrelatorConfig {
        CorrelatorConfig {
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            max_pending: self.max_pending,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LiveSection {
    pub heartbeat_interval_ms: u64,
    pub default_poll_interval_ms: u64,
}

impl Default for LiveSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            default_poll_interval_ms: 5000,
        }
    }
}

impl LiveSection {
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_nonzero(self.heartbeat_interval_ms, "live.heartbeat_interval_ms")?;
        require_nonzero(self.default_poll_interval_ms, "live.default_poll_interval_ms")
    }

    pub fn to_service_config(&self) -> LiveServiceConfig {
        LiveServiceConfig {
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            default_poll_interval: Duration::from_millis(self.default_poll_interval_ms),
        }
    }
}
