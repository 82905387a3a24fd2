use crate::error::DeliveryError;
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// Durations are carried as integer milliseconds when embedded in
/// JSON/TOML documents
mod duration_ms {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// WebSocket endpoint; `userId` and `token` are appended as query parameters
    pub url: String,
    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub reconnect_base_delay: Duration,
    #[serde(with = "duration_ms")]
    pub reconnect_max_delay: Duration,
    pub max_reconnect_attempts: u32,
    /// Upper bound of the random extra delay, as a fraction of the backoff delay
    pub jitter_ratio: f64,
    /// Frames held while disconnected; the oldest is dropped beyond this
    pub max_queue_len: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8080/ws".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            max_reconnect_attempts: 5,
            jitter_ratio: 0.1,
            max_queue_len: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub enabled: bool,
    pub batch_size: usize,
    #[serde(with = "duration_ms")]
    pub batch_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            batch_size: 10,
            batch_timeout: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Capacity in conversations, not messages
    pub max_conversations: usize,
    #[serde(with = "duration_ms")]
    pub max_age: Duration,
    pub max_messages_per_conversation: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_conversations: 50,
            max_age: Duration::from_secs(30 * 60),
            max_messages_per_conversation: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub limit: usize,
    #[serde(with = "duration_ms")]
    pub window: Duration,
    pub burst_limit: usize,
    #[serde(with = "duration_ms")]
    pub burst_window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: 30,
            window: Duration::from_secs(60),
            burst_limit: 5,
            burst_window: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub max_text_length: usize,
    pub max_voice_bytes: u64,
    pub max_voice_duration_secs: u32,
    pub max_image_bytes: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_text_length: 2000,
            max_voice_bytes: 10 * 1024 * 1024,
            max_voice_duration_secs: 300,
            max_image_bytes: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// REST backend; no REST fallback when unset
    pub base_url: Option<String>,
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            request_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub connection: ConnectionConfig,
    pub batching: BatchConfig,
    pub cache: CacheConfig,
    pub rate_limit: RateLimitConfig,
    pub security: SecurityConfig,
    pub api: ApiConfig,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_ms_or(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

impl DeliveryConfig {
    /// Load from `DELIVERY_*` environment variables (and `.env`), falling
    /// back to defaults for anything unset or unparsable.
    pub fn from_env() -> Result<Self, DeliveryError> {
        dotenv().ok();
        let defaults = Self::default();

        let connection = ConnectionConfig {
            url: env::var("DELIVERY_WS_URL").unwrap_or(defaults.connection.url),
            heartbeat_interval: env_ms_or(
                "DELIVERY_HEARTBEAT_INTERVAL_MS",
                defaults.connection.heartbeat_interval,
            ),
            connect_timeout: env_ms_or(
                "DELIVERY_CONNECT_TIMEOUT_MS",
                defaults.connection.connect_timeout,
            ),
            reconnect_base_delay: env_ms_or(
                "DELIVERY_RECONNECT_BASE_DELAY_MS",
                defaults.connection.reconnect_base_delay,
            ),
            reconnect_max_delay: env_ms_or(
                "DELIVERY_RECONNECT_MAX_DELAY_MS",
                defaults.connection.reconnect_max_delay,
            ),
            max_reconnect_attempts: env_or(
                "DELIVERY_MAX_RECONNECT_ATTEMPTS",
                defaults.connection.max_reconnect_attempts,
            ),
            jitter_ratio: env_or("DELIVERY_JITTER_RATIO", defaults.connection.jitter_ratio),
            max_queue_len: env_or("DELIVERY_MAX_QUEUE_LEN", defaults.connection.max_queue_len),
        };

        let batching = BatchConfig {
            enabled: env_or("DELIVERY_BATCH_ENABLED", defaults.batching.enabled),
            batch_size: env_or("DELIVERY_BATCH_SIZE", defaults.batching.batch_size),
            batch_timeout: env_ms_or("DELIVERY_BATCH_TIMEOUT_MS", defaults.batching.batch_timeout),
        };

        let cache = CacheConfig {
            max_conversations: env_or(
                "DELIVERY_CACHE_MAX_CONVERSATIONS",
                defaults.cache.max_conversations,
            ),
            max_age: env_ms_or("DELIVERY_CACHE_MAX_AGE_MS", defaults.cache.max_age),
            max_messages_per_conversation: env_or(
                "DELIVERY_CACHE_MAX_MESSAGES",
                defaults.cache.max_messages_per_conversation,
            ),
        };

        let rate_limit = RateLimitConfig {
            limit: env_or("DELIVERY_RATE_LIMIT", defaults.rate_limit.limit),
            window: env_ms_or("DELIVERY_RATE_WINDOW_MS", defaults.rate_limit.window),
            burst_limit: env_or("DELIVERY_BURST_LIMIT", defaults.rate_limit.burst_limit),
            burst_window: env_ms_or("DELIVERY_BURST_WINDOW_MS", defaults.rate_limit.burst_window),
        };

        let security = SecurityConfig {
            max_text_length: env_or(
                "DELIVERY_MAX_TEXT_LENGTH",
                defaults.security.max_text_length,
            ),
            ..defaults.security
        };

        let api = ApiConfig {
            base_url: env::var("DELIVERY_API_BASE_URL")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            request_timeout: env_ms_or("DELIVERY_API_TIMEOUT_MS", defaults.api.request_timeout),
        };

        let config = Self {
            connection,
            batching,
            cache,
            rate_limit,
            security,
            api,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), DeliveryError> {
        let url = Url::parse(&self.connection.url)
            .map_err(|e| DeliveryError::Config(format!("invalid websocket url: {e}")))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(DeliveryError::Config(format!(
                "websocket url must use ws or wss, got {}",
                url.scheme()
            )));
        }

        if let Some(base_url) = &self.api.base_url {
            Url::parse(base_url)
                .map_err(|e| DeliveryError::Config(format!("invalid api base url: {e}")))?;
        }

        if self.connection.heartbeat_interval.is_zero() {
            return Err(DeliveryError::Config(
                "heartbeat interval must be positive".into(),
            ));
        }
        if self.connection.reconnect_base_delay > self.connection.reconnect_max_delay {
            return Err(DeliveryError::Config(
                "reconnect base delay exceeds max delay".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.connection.jitter_ratio) {
            return Err(DeliveryError::Config(
                "jitter ratio must be within 0.0..=1.0".into(),
            ));
        }
        if self.batching.enabled && self.batching.batch_size == 0 {
            return Err(DeliveryError::Config("batch size must be positive".into()));
        }
        if self.cache.max_conversations == 0 {
            return Err(DeliveryError::Config(
                "cache must hold at least one conversation".into(),
            ));
        }
        if self.rate_limit.limit == 0 || self.rate_limit.burst_limit == 0 {
            return Err(DeliveryError::Config("rate limits must be positive".into()));
        }

        Ok(())
    }
}
