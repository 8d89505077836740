use std::time::Duration;
use url::Url;

/// Production pubsub edge endpoint.
pub const DEFAULT_ENDPOINT: &str = "wss://pubsub-edge.twitch.tv";

/// Default maximum topics per shard.
pub const DEFAULT_TOPIC_LIMIT: usize = 50;

/// Credentials used when subscribing topics.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// OAuth token sent as `auth_token` in every `LISTEN` request.
    pub token: String,
    /// The moderator's user id, baked into every topic.
    pub moderator_id: String,
}

/// Configuration for the shard manager
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Subscription credentials
    pub credentials: Credentials,
    /// WebSocket endpoint (ws:// or wss://)
    pub endpoint: String,
    /// Channel ids to subscribe on start
    pub channels: Vec<String>,
    /// Maximum topics per shard
    pub topic_limit: usize,
    /// Delay between consecutive shard creations during initial spawn
    pub spawn_interval: Duration,
    /// Interval between heartbeat `PING` requests
    pub heartbeat_interval: Duration,
    /// Timeout for establishing a connection (TCP + TLS + handshake)
    pub connect_timeout: Duration,
    /// How long an add-topic request waits for its `RESPONSE`
    pub response_timeout: Duration,
    /// Reconnection settings
    pub retry: RetryConfig,
}

/// Reconnection settings for a shard
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay between a connection loss and the reconnect attempt
    pub delay: Duration,
    /// Closes within this window of the previous one count as rapid
    pub rapid_window: Duration,
    /// Rapid closes tolerated before the shard is considered failed
    pub max_rapid_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(5),
            rapid_window: Duration::from_secs(60),
            max_rapid_retries: 4,
        }
    }
}

impl ManagerConfig {
    /// Create a new builder for configuration
    pub fn builder(
        token: impl Into<String>,
        moderator_id: impl Into<String>,
    ) -> ManagerConfigBuilder {
        ManagerConfigBuilder {
            config: ManagerConfig {
                credentials: Credentials {
                    token: token.into(),
                    moderator_id: moderator_id.into(),
                },
                endpoint: DEFAULT_ENDPOINT.to_string(),
                channels: Vec::new(),
                topic_limit: DEFAULT_TOPIC_LIMIT,
                spawn_interval: Duration::from_millis(2500),
                heartbeat_interval: Duration::from_secs(250),
                connect_timeout: Duration::from_secs(10),
                response_timeout: Duration::from_millis(1500),
                retry: RetryConfig::default(),
            },
        }
    }
}

/// Builder for ManagerConfig
#[derive(Debug, Clone)]
pub struct ManagerConfigBuilder {
    config: ManagerConfig,
}

impl ManagerConfigBuilder {
    /// Set the WebSocket endpoint
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.endpoint = endpoint.into();
        self
    }

    /// Set the channel ids to subscribe on start
    pub fn channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.channels = channels.into_iter().map(Into::into).collect();
        self
    }

    /// Set the maximum topics per shard
    pub fn topic_limit(mut self, limit: usize) -> Self {
        self.config.topic_limit = limit;
        self
    }

    /// Set the delay between consecutive shard creations
    pub fn spawn_interval(mut self, interval: Duration) -> Self {
        self.config.spawn_interval = interval;
        self
    }

    /// Set the heartbeat interval
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    /// Set the connection timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the add-topic response timeout
    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.config.response_timeout = timeout;
        self
    }

    /// Set the reconnection settings
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    /// Build the configuration with validation.
    ///
    /// Returns an error for invalid configurations (e.g., topic_limit = 0).
    pub fn build(self) -> Result<ManagerConfig, ConfigError> {
        let config = self.config;

        match Url::parse(&config.endpoint) {
            Ok(url) if matches!(url.scheme(), "ws" | "wss") => {}
            Ok(url) => {
                return Err(ConfigError::InvalidEndpoint(format!(
                    "unsupported scheme '{}'",
                    url.scheme()
                )))
            }
            Err(e) => return Err(ConfigError::InvalidEndpoint(e.to_string())),
        }

        if config.topic_limit == 0 {
            return Err(ConfigError::InvalidTopicLimit(
                "topic_limit cannot be 0".to_string(),
            ));
        }

        if config.response_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "response_timeout cannot be 0".to_string(),
            ));
        }

        if config.heartbeat_interval.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "heartbeat_interval cannot be 0".to_string(),
            ));
        }

        if config.retry.max_rapid_retries == 0 {
            return Err(ConfigError::InvalidRetry(
                "max_rapid_retries cannot be 0".to_string(),
            ));
        }

        Ok(config)
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// Invalid endpoint URL
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
    /// Invalid topic limit
    #[error("Invalid topic limit: {0}")]
    InvalidTopicLimit(String),
    /// Invalid timeout or interval
    #[error("Invalid timeout: {0}")]
    InvalidTimeout(String),
    /// Invalid retry configuration
    #[error("Invalid retry configuration: {0}")]
    InvalidRetry(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder_defaults() {
        let config = ManagerConfig::builder("oauth:abc", "1000")
            .build()
            .expect("valid config");

        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.topic_limit, DEFAULT_TOPIC_LIMIT);
        assert_eq!(config.spawn_interval, Duration::from_millis(2500));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(250));
        assert_eq!(config.response_timeout, Duration::from_millis(1500));
        assert_eq!(config.retry.delay, Duration::from_secs(5));
        assert_eq!(config.retry.rapid_window, Duration::from_secs(60));
        assert_eq!(config.retry.max_rapid_retries, 4);
        assert!(config.channels.is_empty());
    }

    #[test]
    fn test_config_builder_overrides() {
        let config = ManagerConfig::builder("oauth:abc", "1000")
            .endpoint("ws://127.0.0.1:9000")
            .channels(["111", "222"])
            .topic_limit(2)
            .spawn_interval(Duration::from_millis(10))
            .build()
            .expect("valid config");

        assert_eq!(config.endpoint, "ws://127.0.0.1:9000");
        assert_eq!(config.channels, vec!["111", "222"]);
        assert_eq!(config.topic_limit, 2);
    }

    #[test]
    fn test_config_builder_rejects_zero_limit() {
        let result = ManagerConfig::builder("t", "m").topic_limit(0).build();
        assert!(matches!(result, Err(ConfigError::InvalidTopicLimit(_))));
    }

    #[test]
    fn test_config_builder_rejects_bad_endpoint() {
        let result = ManagerConfig::builder("t", "m")
            .endpoint("https://example.com")
            .build();
        assert!(matches!(result, Err(ConfigError::InvalidEndpoint(_))));

        let result = ManagerConfig::builder("t", "m").endpoint("not a url").build();
        assert!(matches!(result, Err(ConfigError::InvalidEndpoint(_))));
    }

    #[test]
    fn test_config_builder_rejects_zero_retries() {
        let result = ManagerConfig::builder("t", "m")
            .retry(RetryConfig {
                max_rapid_retries: 0,
                ..RetryConfig::default()
            })
            .build();
        assert!(matches!(result, Err(ConfigError::InvalidRetry(_))));
    }
}
