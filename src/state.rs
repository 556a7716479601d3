//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::relay::Relay;

/// Shared application state for the deskrelay server.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Session registry, record store and asset catalog.
    pub relay: Relay,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let relay = Relay::from_config(&config);
        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            relay,
        }
    }
}
