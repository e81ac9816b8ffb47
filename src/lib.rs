//! Real-time client for an agent backend: a reconnecting websocket transport, request/response
//! correlation over it, and live data subscriptions that fall back to REST polling.

pub mod client;
pub mod config;
pub mod core;
pub mod correlator;
pub mod feeds;
pub mod live;
pub mod supervision;
pub mod telemetry;
pub mod testing;
pub mod tls;
pub mod transport;

pub use client::{EventKind, TransportClient, TransportConfig, TransportEvent};
pub use config::LiveConfig;
pub use core::{LiveError, LiveResult};
pub use correlator::{CorrelatorConfig, RequestCorrelator};
pub use live::{LiveDataService, LiveServiceConfig, SubscriptionOptions};
