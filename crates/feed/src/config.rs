//! Client configuration.

use rand::Rng;
use std::time::Duration;

/// Client configuration shared by every feed opened against one backend.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// HTTP base URL for snapshot fetches and CRUD calls.
    pub api_url: String,
    /// Base URL of the Socket.IO endpoint (ws:// or wss://).
    pub socket_url: String,
    /// Push channel reconnection policy.
    pub reconnection: ReconnectionConfig,
    /// Roll back optimistic items that stay unconfirmed this long. `None` waits forever.
    pub pending_timeout: Option<Duration>,
    /// Per-request timeout for HTTP calls.
    pub request_timeout: Duration,
}

impl ClientConfig {
    /// Config for one backend; the socket URL is the API URL with its scheme swapped.
    pub fn new(api_url: impl Into<String>) -> Self {
        let api_url = api_url.into();
        let socket_url = api_url
            .replace("http://", "ws://")
            .replace("https://", "wss://");
        Self {
            api_url,
            socket_url,
            reconnection: ReconnectionConfig::default(),
            pending_timeout: None,
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_socket_url(mut self, url: impl Into<String>) -> Self {
        self.socket_url = url.into();
        self
    }

    pub fn with_reconnection(mut self, reconnection: ReconnectionConfig) -> Self {
        self.reconnection = reconnection;
        self
    }

    pub fn with_pending_timeout(mut self, timeout: Duration) -> Self {
        self.pending_timeout = Some(timeout);
        self
    }
}

/// Reconnection policy for the push channel.
///
/// After the initial connection attempt fails (or an established connection drops),
/// up to `max_attempts` reconnection attempts are made before the channel gives up.
#[derive(Debug, Clone)]
pub struct ReconnectionConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Handshake deadline for a single attempt.
    pub attempt_timeout: Duration,
    /// Upper bound of random jitter added to each delay, in milliseconds.
    pub jitter_ms: u64,
}

impl ReconnectionConfig {
    /// Delay before reconnection attempt `attempt` (1-based): doubles from
    /// `initial_delay`, capped at `max_delay`, plus jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let base = std::cmp::min(
            self.initial_delay.saturating_mul(1u32 << shift),
            std::cmp::max(self.max_delay, self.initial_delay),
        );
        if self.jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..self.jitter_ms))
    }
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(1),
            attempt_timeout: Duration::from_secs(20),
            jitter_ms: 0,
        }
    }
}
