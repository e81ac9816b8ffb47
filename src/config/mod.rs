//! Environment-driven configuration.
//!
//! Values come from the process environment (after loading `.env` when present) with the
//! `AGENT_LIVE` prefix and `__` between nested keys:
//!
//! - `AGENT_LIVE__TRANSPORT__URL=wss://agents.example/ws` -> `transport.url`
//! - `AGENT_LIVE__API__AUTH_TOKEN=...` -> `api.auth_token`
//!
//! Every key has a default, so an empty environment yields a local development setup.

mod error;
mod sections;

pub use error::{ConfigError, ValidationError};
pub use sections::{ApiSection, CorrelatorSection, LiveSection, TransportSection};

use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LiveConfig {
    #[serde(default)]
    pub transport: TransportSection,
    #[serde(default)]
    pub api: ApiSection,
    #[serde(default)]
    pub correlator: CorrelatorSection,
    #[serde(default)]
    pub live: LiveSection,
}

impl LiveConfig {
    pub const ENV_PREFIX: &'static str = "AGENT_LIVE";

    /// Load `.env` if present, then read `AGENT_LIVE__*` variables.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(
                config::Environment::default()
                    .prefix(Self::ENV_PREFIX)
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        Ok(config)
    }

    /// [`load`](Self::load) followed by [`validate`](Self::validate).
    pub fn load_validated() -> Result<Self, ConfigError> {
        let config = Self::load()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.transport.validate()?;
        self.api.validate()?;
        self.correlator.validate()?;
        self.live.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;
    use std::time::Duration;

    // env vars are process-global
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: [&str; 5] = [
        "AGENT_LIVE__TRANSPORT__URL",
        "AGENT_LIVE__TRANSPORT__RECONNECT_ATTEMPTS",
        "AGENT_LIVE__API__AUTH_TOKEN",
        "AGENT_LIVE__CORRELATOR__REQUEST_TIMEOUT_MS",
        "AGENT_LIVE__LIVE__DEFAULT_POLL_INTERVAL_MS",
    ];

    fn clear_env() {
        for var in VARS {
            // SAFETY: guarded by ENV_MUTEX; no other test thread touches these variables.
            unsafe { env::remove_var(var) };
        }
    }

    #[test]
    fn empty_environment_uses_defaults() {
        let _guard = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();

        let config = LiveConfig::load().unwrap();
        assert_eq!(config.transport.url, "ws://localhost:8081");
        assert_eq!(config.transport.reconnect_attempts, 5);
        assert_eq!(config.api.base_url, "http://localhost:8080");
        assert_eq!(config.correlator.max_pending, 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn nested_variables_override_sections() {
        let _guard = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();
        // SAFETY: guarded by ENV_MUTEX.
        unsafe {
            env::set_var("AGENT_LIVE__TRANSPORT__URL", "wss://agents.example/ws");
            env::set_var("AGENT_LIVE__TRANSPORT__RECONNECT_ATTEMPTS", "2");
            env::set_var("AGENT_LIVE__API__AUTH_TOKEN", "token-123");
            env::set_var("AGENT_LIVE__CORRELATOR__REQUEST_TIMEOUT_MS", "1500");
            env::set_var("AGENT_LIVE__LIVE__DEFAULT_POLL_INTERVAL_MS", "250");
        }
        let result = LiveConfig::load();
        clear_env();

        let config = result.unwrap();
        assert_eq!(config.transport.url, "wss://agents.example/ws");
        assert_eq!(config.transport.to_transport_config().reconnect_attempts, 2);
        assert_eq!(
            config.api.to_source_config().auth_token.as_deref(),
            Some("token-123")
        );
        assert_eq!(
            config.correlator.to_correlator_config().request_timeout,
            Duration::from_millis(1500)
        );
        assert_eq!(
            config.live.to_service_config().default_poll_interval,
            Duration::from_millis(250)
        );
    }

    #[test]
    fn validation_rejects_bad_schemes_and_zero_values() {
        let mut config = LiveConfig::default();
        config.transport.url = "http://localhost:8081".to_string();
        assert_eq!(config.validate(), Err(ValidationError::InvalidTransportUrl));

        let mut config = LiveConfig::default();
        config.api.base_url = "ftp://backend".to_string();
        assert_eq!(config.validate(), Err(ValidationError::InvalidApiUrl));

        let mut config = LiveConfig::default();
        config.transport.heartbeat_missed_intervals = 0;
        assert_eq!(config.validate(), Err(ValidationError::InvalidLivenessWindow));

        let mut config = LiveConfig::default();
        config.live.default_poll_interval_ms = 0;
        assert_eq!(
            config.validate(),
            Err(ValidationError::ZeroInterval("live.default_poll_interval_ms"))
        );
    }
}
