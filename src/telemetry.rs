//! Tracing setup for binaries and tests embedding the client.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::core::{LiveError, LiveResult};

/// Crates that are chatty at `debug`.
const QUIET_TARGETS: &[(&str, &str)] = &[
    ("tungstenite", "warn"),
    ("tokio_tungstenite", "warn"),
    ("rustls", "warn"),
    ("hyper", "warn"),
    ("reqwest", "warn"),
];

/// `RUST_LOG` when set, otherwise `default_level` with noisy dependencies held at `warn`.
pub fn build_env_filter(default_level: &str) -> LiveResult<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let mut directives = vec![default_level.to_string()];
    directives.extend(
        QUIET_TARGETS
            .iter()
            .map(|(target, level)| format!("{target}={level}")),
    );
    let filter = directives.join(",");
    EnvFilter::try_new(&filter)
        .map_err(|e| LiveError::Config(format!("invalid tracing filter '{filter}': {e}")))
}

/// Install a compact fmt subscriber. Returns `Ok(false)` when a global subscriber was
/// already installed.
pub fn init_tracing(default_level: &str) -> LiveResult<bool> {
    let filter = build_env_filter(default_level)?;
    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact().with_target(true))
        .try_init()
        .is_ok();
    Ok(installed)
}
