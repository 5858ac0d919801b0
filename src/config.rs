//! Configuration surface recognized by the adapter, subscription manager, connection pool,
//! heartbeat controller, reconnect strategy and pipeline stages. These are plain
//! `serde`-deserializable structs with `Default` impls carrying sensible defaults;
//! loading them from a file or CLI flags is out of core scope.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn de_duration_ms<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let millis = u64::deserialize(deserializer)?;
    Ok(Duration::from_millis(millis))
}

fn se_duration_ms<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// Backpressure strategy shared by the pipeline and buffer stage configuration.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackpressureStrategy {
    Block,
    Drop,
    Spill,
}

impl Default for BackpressureStrategy {
    fn default() -> Self {
        BackpressureStrategy::Block
    }
}

/// Pipeline stage error-handling strategy.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorStrategy {
    FailFast,
    Continue,
    Retry,
}

impl Default for ErrorStrategy {
    fn default() -> Self {
        ErrorStrategy::Continue
    }
}

/// Router stage evaluation strategy.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    FirstMatch,
    AllMatches,
    PriorityBased,
}

impl Default for RoutingStrategy {
    fn default() -> Self {
        RoutingStrategy::FirstMatch
    }
}

/// Buffer partitioning key.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionBy {
    Exchange,
    Symbol,
    DataType,
    Custom,
}

impl Default for PartitionBy {
    fn default() -> Self {
        PartitionBy::Symbol
    }
}

/// Exchange endpoint configuration for [`crate::exchange::binance::adapter::BinanceAdapter`].
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EndpointConfig {
    pub ws: String,
    pub rest: String,
}

/// `connection{...}` block of the adapter config.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ConnectionOptions {
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    pub max_retries: u32,
    #[serde(with = "duration_ms")]
    pub retry_interval: Duration,
    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_retries: 10,
            retry_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(20),
        }
    }
}

/// Credentials for Binance's signed REST endpoints. Public market-data streams never need
/// these; they're only consulted by `BinanceAdapter::sign_request`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Credentials {
    pub api_key: String,
    pub secret_key: String,
}

/// Top-level adapter configuration.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AdapterConfig {
    pub endpoints: EndpointConfig,
    pub connection: ConnectionOptions,
    pub credentials: Option<Credentials>,
}

impl AdapterConfig {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.endpoints.ws.trim().is_empty() {
            return Err(CoreError::config("endpoints.ws is required"));
        }
        if self.endpoints.rest.trim().is_empty() {
            return Err(CoreError::config("endpoints.rest is required"));
        }
        Ok(())
    }

    /// Overlays `BINANCE_*` environment variables onto a default configuration.
    pub fn from_env() -> Self {
        let mut cfg = Self {
            endpoints: EndpointConfig {
                ws: std::env::var("BINANCE_WS_ENDPOINT")
                    .unwrap_or_else(|_| "wss://stream.binance.com:9443".to_string()),
                rest: "https://api.binance.com".to_string(),
            },
            connection: ConnectionOptions::default(),
            credentials: None,
        };

        if let Ok(v) = std::env::var("BINANCE_CONNECTION_TIMEOUT") {
            if let Ok(secs) = v.parse::<u64>() {
                cfg.connection.timeout = Duration::from_secs(secs);
            }
        }

        if let (Ok(api_key), Ok(secret_key)) =
            (std::env::var("BINANCE_API_KEY"), std::env::var("BINANCE_API_SECRET"))
        {
            cfg.credentials = Some(Credentials { api_key, secret_key });
        }

        cfg
    }
}

/// `retryConfig{...}` used by both the subscription manager and reconnect strategy.
#[derive(Copy, Clone, Debug, Deserialize, Serialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    #[serde(with = "duration_ms")]
    pub initial_delay: Duration,
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
    #[serde(with = "duration_ms")]
    pub reset_after: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
            reset_after: Duration::from_secs(60),
        }
    }
}

/// `validation{...}` block of the subscription manager config.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ValidationConfig {
    pub strict_validation: bool,
    pub symbol_pattern: String,
    pub max_subscriptions: usize,
    pub disabled_data_types: Vec<crate::subscription::DataType>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            strict_validation: true,
            symbol_pattern: "^[A-Z0-9]+$".to_string(),
            max_subscriptions: 1000,
            disabled_data_types: Vec::new(),
        }
    }
}

/// Subscription manager configuration.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SubscriptionManagerConfig {
    pub base_ws_url: String,
    pub max_streams_per_connection: usize,
    #[serde(with = "duration_ms")]
    pub subscription_timeout: Duration,
    pub auto_resubscribe: bool,
    pub retry: RetryConfig,
    pub validation: ValidationConfig,
}

impl Default for SubscriptionManagerConfig {
    fn default() -> Self {
        Self {
            base_ws_url: "wss://stream.binance.com:9443".to_string(),
            max_streams_per_connection: 200,
            subscription_timeout: Duration::from_secs(10),
            auto_resubscribe: true,
            retry: RetryConfig::default(),
            validation: ValidationConfig::default(),
        }
    }
}

impl SubscriptionManagerConfig {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_streams_per_connection == 0 {
            return Err(CoreError::config("maxStreamsPerConnection must be > 0"));
        }
        if self.validation.max_subscriptions == 0 {
            return Err(CoreError::config("maxSubscriptions must be > 0"));
        }
        regex::Regex::new(&self.validation.symbol_pattern)?;
        Ok(())
    }
}

/// Connection pool configuration.
#[derive(Copy, Clone, Debug, Deserialize, Serialize)]
pub struct PoolConfig {
    pub max_connections: usize,
    pub max_streams_per_connection: usize,
    #[serde(with = "duration_ms")]
    pub connection_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub idle_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub health_check_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 8,
            max_streams_per_connection: 200,
            connection_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
            health_check_interval: Duration::from_secs(15),
        }
    }
}

/// Heartbeat controller configuration.
#[derive(Copy, Clone, Debug, Deserialize, Serialize)]
pub struct HeartbeatConfig {
    #[serde(with = "duration_ms")]
    pub ping_timeout_threshold: Duration,
    #[serde(with = "opt_duration_ms", default)]
    pub unsolicited_pong_interval: Option<Duration>,
    #[serde(with = "duration_ms")]
    pub health_check_interval: Duration,
    #[serde(with = "duration_ms")]
    pub pong_response_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_timeout_threshold: Duration::from_secs(60),
            unsolicited_pong_interval: None,
            health_check_interval: Duration::from_secs(15),
            pong_response_timeout: Duration::from_secs(5),
        }
    }
}

/// Reconnect strategy configuration.
#[derive(Copy, Clone, Debug, Deserialize, Serialize)]
pub struct ReconnectConfig {
    #[serde(with = "duration_ms")]
    pub initial_delay: Duration,
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_retries: u32,
    pub jitter: bool,
    #[serde(with = "duration_ms")]
    pub reset_after: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            max_retries: 10,
            jitter: true,
            reset_after: Duration::from_secs(60),
        }
    }
}

/// `errorHandling{...}` block of the pipeline configuration.
#[derive(Copy, Clone, Debug, Deserialize, Serialize)]
pub struct ErrorHandlingConfig {
    pub strategy: ErrorStrategy,
    pub max_retries: u32,
    #[serde(with = "duration_ms")]
    pub retry_interval: Duration,
}

impl Default for ErrorHandlingConfig {
    fn default() -> Self {
        Self {
            strategy: ErrorStrategy::Continue,
            max_retries: 3,
            retry_interval: Duration::from_millis(100),
        }
    }
}

/// `performance{...}` block of the pipeline configuration.
#[derive(Copy, Clone, Debug, Deserialize, Serialize)]
pub struct PerformanceConfig {
    pub max_concurrency: usize,
    pub queue_size: usize,
    pub backpressure_strategy: BackpressureStrategy,
    pub memory_limit: usize,
    pub gc_threshold: usize,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            queue_size: 10_000,
            backpressure_strategy: BackpressureStrategy::Block,
            memory_limit: 256 * 1024 * 1024,
            gc_threshold: 8192,
        }
    }
}

/// `monitoring{...}` block of the pipeline configuration.
#[derive(Copy, Clone, Debug, Deserialize, Serialize)]
pub struct MonitoringConfig {
    pub enable_metrics: bool,
    pub enable_tracing: bool,
    #[serde(with = "duration_ms")]
    pub metrics_interval: Duration,
    #[serde(with = "duration_ms")]
    pub health_check_interval: Duration,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enable_metrics: true,
            enable_tracing: true,
            metrics_interval: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(15),
        }
    }
}

/// Per-stage configuration shared by every [`crate::pipeline::Stage`].
#[derive(Copy, Clone, Debug, Deserialize, Serialize)]
pub struct StageConfig {
    pub enabled: bool,
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: Duration::from_secs(5),
            circuit_breaker: None,
        }
    }
}

/// Optional per-stage circuit breaker configuration.
#[derive(Copy, Clone, Debug, Deserialize, Serialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    #[serde(with = "duration_ms")]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Pipeline-level configuration.
#[derive(Copy, Clone, Debug, Deserialize, Serialize)]
pub struct PipelineConfig {
    pub error_handling: ErrorHandlingConfig,
    pub performance: PerformanceConfig,
    pub monitoring: MonitoringConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            error_handling: ErrorHandlingConfig::default(),
            performance: PerformanceConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

/// `bufferPolicy{...}` block of the buffer stage configuration.
#[derive(Copy, Clone, Debug, Deserialize, Serialize)]
pub struct BufferPolicy {
    pub max_size: usize,
    #[serde(with = "duration_ms")]
    pub max_age: Duration,
    #[serde(with = "duration_ms")]
    pub flush_interval: Duration,
    pub backpressure_threshold: f64,
}

impl Default for BufferPolicy {
    fn default() -> Self {
        Self {
            max_size: 500,
            max_age: Duration::from_secs(5),
            flush_interval: Duration::from_secs(1),
            backpressure_threshold: 0.8,
        }
    }
}

/// Buffer stage configuration.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BufferConfig {
    pub buffer_policy: BufferPolicy,
    pub partition_by: PartitionBy,
    pub enable_backpressure: bool,
    pub backpressure_strategy: BackpressureStrategy,
    pub enable_compression: bool,
    pub spill_path: Option<String>,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            buffer_policy: BufferPolicy::default(),
            partition_by: PartitionBy::default(),
            enable_backpressure: true,
            backpressure_strategy: BackpressureStrategy::Block,
            enable_compression: false,
            spill_path: None,
        }
    }
}

/// Router stage configuration. `rules` are supplied programmatically
/// via [`crate::pipeline::router::RouterStage::add_rule`] rather than serialized inline, since
/// `function` conditions carry closures.
#[derive(Copy, Clone, Debug, Deserialize, Serialize)]
pub struct RouterConfig {
    pub enable_fallback: bool,
    pub routing_strategy: RoutingStrategy,
    pub enable_caching: bool,
    pub enable_duplication: bool,
    pub cache_size: usize,
    #[serde(with = "duration_ms")]
    pub cache_ttl: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            enable_fallback: false,
            routing_strategy: RoutingStrategy::FirstMatch,
            enable_caching: true,
            enable_duplication: false,
            cache_size: 4096,
            cache_ttl: Duration::from_secs(60),
        }
    }
}

/// Publish stage per-topic batching policy.
#[derive(Copy, Clone, Debug, Deserialize, Serialize)]
pub struct PublishPolicy {
    pub max_batch_size: usize,
    pub max_latency_ms: u64,
}

impl Default for PublishPolicy {
    fn default() -> Self {
        Self {
            max_batch_size: 500,
            max_latency_ms: 250,
        }
    }
}

mod duration_ms {
    use super::*;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        se_duration_ms(duration, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        de_duration_ms(deserializer)
    }
}

mod opt_duration_ms {
    use super::*;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapter_config_requires_endpoints() {
        let cfg = AdapterConfig {
            endpoints: EndpointConfig {
                ws: String::new(),
                rest: "https://api.binance.com".to_string(),
            },
            connection: ConnectionOptions::default(),
            credentials: None,
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn subscription_manager_config_rejects_zero_caps() {
        let mut cfg = SubscriptionManagerConfig::default();
        cfg.max_streams_per_connection = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn subscription_manager_config_rejects_bad_regex() {
        let mut cfg = SubscriptionManagerConfig::default();
        cfg.validation.symbol_pattern = "[".to_string();
        assert!(cfg.validate().is_err());
    }
}
