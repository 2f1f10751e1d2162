use std::time::Duration;

/// Engine-wide configuration.
///
/// Every knob has a default so a `Session` can be built without any
/// environment; `from_env` overrides the defaults from `BOARD_SYNC_*`
/// variables for deployments that need different endpoints or timing.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base URL of the authority's HTTP API, e.g. `http://localhost:3000/api`.
    pub api_base_url: String,
    /// URL of the authority's live channel, e.g. `ws://localhost:3000/ws`.
    pub channel_url: String,
    /// First reconnect delay; doubles on every failed attempt.
    pub reconnect_base_delay: Duration,
    /// Upper bound on the reconnect delay.
    pub reconnect_max_delay: Duration,
    /// Consecutive failed attempts before the channel gives up for good.
    pub reconnect_max_attempts: u32,
    /// Minimum spacing between two connect attempts; an attempt requested
    /// sooner is deferred rather than run concurrently.
    pub connect_min_interval: Duration,
    /// Bound on a single connect + handshake round trip.
    pub connect_timeout: Duration,
    /// Bound on a single authority HTTP request.
    pub request_timeout: Duration,
    /// How many times a server-class failure is retried before surfacing.
    pub server_retry_limit: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:3000/api".to_string(),
            channel_url: "ws://localhost:3000/ws".to_string(),
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            reconnect_max_attempts: 8,
            connect_min_interval: Duration::from_millis(250),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(15),
            server_retry_limit: 2,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_base_url: std::env::var("BOARD_SYNC_API_URL")
                .unwrap_or(defaults.api_base_url),
            channel_url: std::env::var("BOARD_SYNC_CHANNEL_URL")
                .unwrap_or(defaults.channel_url),
            reconnect_base_delay: env_millis("BOARD_SYNC_RECONNECT_BASE_MS")
                .unwrap_or(defaults.reconnect_base_delay),
            reconnect_max_delay: env_millis("BOARD_SYNC_RECONNECT_MAX_MS")
                .unwrap_or(defaults.reconnect_max_delay),
            reconnect_max_attempts: env_u32("BOARD_SYNC_RECONNECT_ATTEMPTS")
                .unwrap_or(defaults.reconnect_max_attempts),
            connect_min_interval: env_millis("BOARD_SYNC_CONNECT_MIN_INTERVAL_MS")
                .unwrap_or(defaults.connect_min_interval),
            connect_timeout: env_millis("BOARD_SYNC_CONNECT_TIMEOUT_MS")
                .unwrap_or(defaults.connect_timeout),
            request_timeout: env_millis("BOARD_SYNC_REQUEST_TIMEOUT_MS")
                .unwrap_or(defaults.request_timeout),
            server_retry_limit: env_u32("BOARD_SYNC_SERVER_RETRIES")
                .unwrap_or(defaults.server_retry_limit),
        }
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
}

fn env_u32(key: &str) -> Option<u32> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
