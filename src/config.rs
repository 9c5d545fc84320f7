use std::time::Duration;

use url::Url;

use crate::error::Error;

/// Environment variable for the API base URL.
pub const ENV_API_URL: &str = "GAMELINK_API_URL";
/// Environment variable for the per-attempt request timeout in milliseconds.
pub const ENV_API_TIMEOUT_MS: &str = "GAMELINK_API_TIMEOUT_MS";
/// Environment variable for the total attempts per request.
pub const ENV_API_RETRY_ATTEMPTS: &str = "GAMELINK_API_RETRY_ATTEMPTS";
/// Environment variable for the base retry delay in milliseconds.
pub const ENV_API_RETRY_DELAY_MS: &str = "GAMELINK_API_RETRY_DELAY_MS";
/// Environment variable for the on-chain contract address (validated, not used here).
pub const ENV_CONTRACT_ADDRESS: &str = "GAMELINK_CONTRACT_ADDRESS";
/// Environment variable for the chain RPC endpoint (validated, not used here).
pub const ENV_CHAIN_RPC_URL: &str = "GAMELINK_CHAIN_RPC_URL";

/// Configuration for the realtime link
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Connection-related settings
    pub connection: ConnectionConfig,
    /// Backoff settings for reconnection
    pub backoff: BackoffConfig,
    /// Heartbeat monitoring settings
    pub heartbeat: HeartbeatConfig,
    /// Maximum number of outbound messages held while the link is down
    pub send_queue_capacity: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            backoff: BackoffConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            send_queue_capacity: 128,
        }
    }
}

impl LinkConfig {
    /// Create a new builder for configuration
    pub fn builder() -> LinkConfigBuilder {
        LinkConfigBuilder::default()
    }
}

/// Builder for LinkConfig
#[derive(Debug, Clone, Default)]
pub struct LinkConfigBuilder {
    config: LinkConfig,
}

impl LinkConfigBuilder {
    /// Set connection configuration
    pub fn connection(mut self, config: ConnectionConfig) -> Self {
        self.config.connection = config;
        self
    }

    /// Set backoff configuration
    pub fn backoff(mut self, config: BackoffConfig) -> Self {
        self.config.backoff = config;
        self
    }

    /// Set heartbeat configuration
    pub fn heartbeat(mut self, config: HeartbeatConfig) -> Self {
        self.config.heartbeat = config;
        self
    }

    /// Set the outbound queue capacity used while the link is down
    pub fn send_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.send_queue_capacity = capacity;
        self
    }

    /// Build the configuration with validation.
    ///
    /// Returns an error for invalid configurations (e.g., a notice threshold
    /// above the reconnect attempt cap).
    pub fn build(self) -> Result<LinkConfig, ConfigError> {
        // Validate backoff config
        if self.config.backoff.max_delay < self.config.backoff.initial_delay {
            return Err(ConfigError::InvalidBackoff(
                "max_delay must be >= initial_delay".to_string(),
            ));
        }

        if self.config.backoff.multiplier <= 0.0 {
            return Err(ConfigError::InvalidBackoff(
                "multiplier must be > 0".to_string(),
            ));
        }

        // Validate connection config
        if self.config.connection.max_reconnect_attempts == 0 {
            return Err(ConfigError::InvalidConnection(
                "max_reconnect_attempts cannot be 0".to_string(),
            ));
        }

        if self.config.connection.notice_after_attempts == 0
            || self.config.connection.notice_after_attempts
                > self.config.connection.max_reconnect_attempts
        {
            return Err(ConfigError::InvalidConnection(
                "notice_after_attempts must be between 1 and max_reconnect_attempts".to_string(),
            ));
        }

        // Validate heartbeat config
        if self.config.heartbeat.pong_timeout > self.config.heartbeat.ping_interval {
            return Err(ConfigError::InvalidHeartbeat(
                "pong_timeout should be <= ping_interval".to_string(),
            ));
        }

        if self.config.send_queue_capacity == 0 {
            return Err(ConfigError::InvalidConnection(
                "send_queue_capacity cannot be 0".to_string(),
            ));
        }

        Ok(self.config)
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// Invalid backoff configuration
    #[error("Invalid backoff configuration: {0}")]
    InvalidBackoff(String),
    /// Invalid connection configuration
    #[error("Invalid connection configuration: {0}")]
    InvalidConnection(String),
    /// Invalid heartbeat configuration
    #[error("Invalid heartbeat configuration: {0}")]
    InvalidHeartbeat(String),
    /// Invalid API configuration
    #[error("Invalid API configuration: {0}")]
    InvalidApi(String),
    /// An environment variable holds a value that cannot be parsed
    #[error("{var} is invalid: {reason}")]
    InvalidVar { var: &'static str, reason: String },
}

/// Connection-related configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Timeout for establishing a connection
    pub connect_timeout: Duration,
    /// Automatic reconnect attempts before the link enters the terminal
    /// failed state and waits for a manual retry
    pub max_reconnect_attempts: u32,
    /// Failed attempt count at which a non-blocking user notice is raised
    /// while retries continue in the background
    pub notice_after_attempts: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            max_reconnect_attempts: 5,
            notice_after_attempts: 3,
        }
    }
}

/// Backoff configuration for reconnection
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Initial delay before the first reconnection attempt
    pub initial_delay: Duration,
    /// Maximum delay between reconnection attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (typically 2.0)
    pub multiplier: f64,
    /// Whether to add random jitter to delays.
    ///
    /// Off by default so delays follow the exact 1s, 2s, 4s, 8s, 16s
    /// sequence; enable when many clients may reconnect at once.
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(16),
            multiplier: 2.0,
            jitter: false,
        }
    }
}

impl BackoffConfig {
    /// Calculate the delay for a given attempt number (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay =
            self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        if self.jitter {
            // Full jitter: random value between 0 and capped_delay
            let jittered = rand::random::<f64>() * capped_delay;
            Duration::from_millis(jittered as u64)
        } else {
            Duration::from_millis(capped_delay as u64)
        }
    }
}

/// Heartbeat monitoring configuration
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Whether ping/pong liveness monitoring runs at all
    pub enabled: bool,
    /// Interval for sending WebSocket pings
    pub ping_interval: Duration,
    /// Timeout for receiving a pong response
    pub pong_timeout: Duration,
    /// Number of consecutive missed pongs before the connection is torn down
    pub failure_threshold: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ping_interval: Duration::from_secs(20),
            pong_timeout: Duration::from_secs(10),
            failure_threshold: 3,
        }
    }
}

/// Configuration for the API service
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Base URL all request paths are resolved against.
    ///
    /// Requests short-circuit with a configuration error when this is unset.
    pub base_url: Option<String>,
    /// Per-attempt request deadline
    pub request_timeout: Duration,
    /// Total attempts per request (first try included)
    pub max_attempts: u32,
    /// Base delay before the first retry; doubles per attempt
    pub retry_delay: Duration,
    /// On-chain contract address, owned by the wallet layer.
    ///
    /// Only validated here (0x-prefixed, 42 characters); never dereferenced.
    pub contract_address: Option<String>,
    /// Chain RPC endpoint, owned by the wallet layer. Only validated here.
    pub chain_rpc_url: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            request_timeout: Duration::from_secs(15),
            max_attempts: 3,
            retry_delay: Duration::from_secs(1),
            contract_address: None,
            chain_rpc_url: None,
        }
    }
}

impl ApiConfig {
    /// Create a new builder for configuration
    pub fn builder() -> ApiConfigBuilder {
        ApiConfigBuilder::default()
    }

    /// Read configuration from `GAMELINK_*` environment variables.
    ///
    /// Unset variables fall back to defaults; a missing base URL is reported
    /// per request rather than here, so startup succeeds without one.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Like [`ApiConfig::from_env`], with the variable lookup injected.
    ///
    /// Tests pass a map-backed closure instead of mutating process state.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut builder = Self::builder();

        if let Some(value) = lookup(ENV_API_URL) {
            builder = builder.base_url(value);
        }
        if let Some(value) = lookup(ENV_API_TIMEOUT_MS) {
            let ms = parse_var::<u64>(ENV_API_TIMEOUT_MS, &value)?;
            builder = builder.request_timeout(Duration::from_millis(ms));
        }
        if let Some(value) = lookup(ENV_API_RETRY_ATTEMPTS) {
            builder = builder.max_attempts(parse_var::<u32>(ENV_API_RETRY_ATTEMPTS, &value)?);
        }
        if let Some(value) = lookup(ENV_API_RETRY_DELAY_MS) {
            let ms = parse_var::<u64>(ENV_API_RETRY_DELAY_MS, &value)?;
            builder = builder.retry_delay(Duration::from_millis(ms));
        }
        if let Some(value) = lookup(ENV_CONTRACT_ADDRESS) {
            builder = builder.contract_address(value);
        }
        if let Some(value) = lookup(ENV_CHAIN_RPC_URL) {
            builder = builder.chain_rpc_url(value);
        }

        builder.build()
    }

    /// Check that the environment this service depends on is usable.
    ///
    /// Runs before every request: a failure short-circuits the call with a
    /// configuration error and no network traffic. Returns the parsed base
    /// URL on success.
    pub fn validate_environment(&self) -> Result<Url, Error> {
        let raw = self.base_url.as_deref().ok_or_else(|| {
            Error::Config(ConfigError::InvalidApi(
                "API base URL is not configured".to_string(),
            ))
        })?;

        let url = Url::parse(raw)?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::Config(ConfigError::InvalidApi(format!(
                "API base URL must use http or https, got {}",
                url.scheme()
            ))));
        }

        if let Some(address) = self.contract_address.as_deref() {
            if !is_contract_address(address) {
                return Err(Error::Config(ConfigError::InvalidApi(
                    "contract address must be a 0x-prefixed 40-hex-digit string".to_string(),
                )));
            }
        }

        if let Some(rpc) = self.chain_rpc_url.as_deref() {
            Url::parse(rpc)?;
        }

        Ok(url)
    }
}

/// Builder for ApiConfig
#[derive(Debug, Clone, Default)]
pub struct ApiConfigBuilder {
    config: ApiConfig,
}

impl ApiConfigBuilder {
    /// Set the base URL requests are resolved against
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config.base_url = Some(url.into());
        self
    }

    /// Set the per-attempt request deadline
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Set the total attempts per request (first try included)
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    /// Set the base delay before the first retry
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = delay;
        self
    }

    /// Set the on-chain contract address consumed read-only for validation
    pub fn contract_address(mut self, address: impl Into<String>) -> Self {
        self.config.contract_address = Some(address.into());
        self
    }

    /// Set the chain RPC endpoint consumed read-only for validation
    pub fn chain_rpc_url(mut self, url: impl Into<String>) -> Self {
        self.config.chain_rpc_url = Some(url.into());
        self
    }

    /// Build the configuration with validation
    pub fn build(self) -> Result<ApiConfig, ConfigError> {
        if self.config.max_attempts == 0 {
            return Err(ConfigError::InvalidApi(
                "max_attempts cannot be 0".to_string(),
            ));
        }

        if self.config.request_timeout.is_zero() {
            return Err(ConfigError::InvalidApi(
                "request_timeout cannot be 0".to_string(),
            ));
        }

        if self.config.retry_delay.is_zero() {
            return Err(ConfigError::InvalidApi(
                "retry_delay cannot be 0".to_string(),
            ));
        }

        Ok(self.config)
    }
}

fn parse_var<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidVar {
            var,
            reason: e.to_string(),
        })
}

fn is_contract_address(address: &str) -> bool {
    address.len() == 42
        && address.starts_with("0x")
        && address[2..].chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_backoff_delay_sequence() {
        let config = BackoffConfig::default();

        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(config.delay_for_attempt(4), Duration::from_secs(16));

        // Should cap at max_delay
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(16));
    }

    #[test]
    fn test_backoff_with_jitter() {
        let config = BackoffConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        };

        // With jitter, delay should be between 0 and the calculated delay
        for attempt in 0..5 {
            let delay = config.delay_for_attempt(attempt);
            let max_expected =
                Duration::from_millis((100.0 * 2.0_f64.powi(attempt as i32)) as u64);
            assert!(delay <= max_expected);
        }
    }

    #[test]
    fn test_link_config_builder() {
        let config = LinkConfig::builder()
            .send_queue_capacity(16)
            .connection(ConnectionConfig {
                max_reconnect_attempts: 4,
                notice_after_attempts: 2,
                ..Default::default()
            })
            .build()
            .expect("valid config");

        assert_eq!(config.send_queue_capacity, 16);
        assert_eq!(config.connection.max_reconnect_attempts, 4);
        assert!(config.heartbeat.enabled); // default
    }

    #[test]
    fn test_link_config_rejects_zero_attempts() {
        let result = LinkConfig::builder()
            .connection(ConnectionConfig {
                max_reconnect_attempts: 0,
                ..Default::default()
            })
            .build();

        assert!(result.is_err());
    }

    #[test]
    fn test_link_config_rejects_notice_above_cap() {
        let result = LinkConfig::builder()
            .connection(ConnectionConfig {
                max_reconnect_attempts: 3,
                notice_after_attempts: 4,
                ..Default::default()
            })
            .build();

        assert!(result.is_err());
    }

    #[test]
    fn test_link_config_rejects_bad_heartbeat() {
        let result = LinkConfig::builder()
            .heartbeat(HeartbeatConfig {
                ping_interval: Duration::from_secs(5),
                pong_timeout: Duration::from_secs(10),
                ..Default::default()
            })
            .build();

        assert!(result.is_err());
    }

    #[test]
    fn test_api_config_defaults() {
        let config = ApiConfig::builder().build().expect("valid config");

        assert_eq!(config.request_timeout, Duration::from_secs(15));
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.retry_delay, Duration::from_secs(1));
        assert!(config.base_url.is_none());
    }

    #[test]
    fn test_api_config_rejects_zero_attempts() {
        let result = ApiConfig::builder().max_attempts(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_from_lookup_reads_values() {
        let vars: HashMap<&str, &str> = [
            (ENV_API_URL, "https://api.example.io"),
            (ENV_API_TIMEOUT_MS, "2000"),
            (ENV_API_RETRY_ATTEMPTS, "5"),
            (ENV_API_RETRY_DELAY_MS, "250"),
        ]
        .into_iter()
        .collect();

        let config = ApiConfig::from_lookup(|var| vars.get(var).map(|v| v.to_string()))
            .expect("valid config");

        assert_eq!(config.base_url.as_deref(), Some("https://api.example.io"));
        assert_eq!(config.request_timeout, Duration::from_millis(2000));
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.retry_delay, Duration::from_millis(250));
    }

    #[test]
    fn test_from_lookup_rejects_garbage_numbers() {
        let result = ApiConfig::from_lookup(|var| {
            (var == ENV_API_TIMEOUT_MS).then(|| "soon".to_string())
        });

        assert!(matches!(
            result,
            Err(ConfigError::InvalidVar {
                var: ENV_API_TIMEOUT_MS,
                ..
            })
        ));
    }

    #[test]
    fn test_validate_environment_requires_base_url() {
        let config = ApiConfig::default();
        assert!(config.validate_environment().is_err());
    }

    #[test]
    fn test_validate_environment_rejects_bad_scheme() {
        let config = ApiConfig::builder()
            .base_url("ftp://api.example.io")
            .build()
            .unwrap();
        assert!(config.validate_environment().is_err());
    }

    #[test]
    fn test_validate_environment_checks_contract_address() {
        let good = ApiConfig::builder()
            .base_url("https://api.example.io")
            .contract_address("0x00000000000000000000000000000000deadbeef")
            .build()
            .unwrap();
        assert!(good.validate_environment().is_ok());

        let bad = ApiConfig::builder()
            .base_url("https://api.example.io")
            .contract_address("not-an-address")
            .build()
            .unwrap();
        assert!(bad.validate_environment().is_err());
    }

    #[test]
    fn test_validate_environment_checks_rpc_url() {
        let bad = ApiConfig::builder()
            .base_url("https://api.example.io")
            .chain_rpc_url("not a url")
            .build()
            .unwrap();
        assert!(bad.validate_environment().is_err());
    }

    #[test]
    fn test_contract_address_format() {
        assert!(is_contract_address(
            "0x1234567890abcdef1234567890ABCDEF12345678"
        ));
        assert!(!is_contract_address("0x1234"));
        assert!(!is_contract_address(
            "1x1234567890abcdef1234567890abcdef12345678"
        ));
        assert!(!is_contract_address(
            "0xzzzz567890abcdef1234567890abcdef12345678"
        ));
    }
}
