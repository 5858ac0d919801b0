//! Pipeline core: a configured, ordered list of [`Stage`]s that every
//! normalized [`MarketData`](crate::model::MarketData) event traverses once.

pub mod buffer;
pub mod publish;
pub mod router;

use crate::config::{CircuitBreakerConfig, ErrorStrategy, PipelineConfig, StageConfig};
use crate::error::CoreError;
use crate::model::MarketData;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{error, warn};

/// Metadata carried alongside the [`MarketData`] payload through every stage.
#[derive(Clone, Debug)]
pub struct EnvelopeMetadata {
    pub exchange: String,
    pub symbol: String,
    pub data_type: String,
    pub priority: u8,
    pub retry_count: u32,
    pub routing_keys: Option<Vec<String>>,
}

/// The per-pipeline envelope wrapping one [`MarketData`] event.
#[derive(Clone, Debug)]
pub struct PipelineData {
    pub id: String,
    pub market_data: MarketData,
    pub metadata: EnvelopeMetadata,
    pub timestamp: Instant,
    pub source: String,
    pub attributes: HashMap<String, Value>,
}

impl PipelineData {
    pub fn new(market_data: MarketData, source: impl Into<String>) -> Self {
        let metadata = EnvelopeMetadata {
            exchange: market_data.exchange.clone(),
            symbol: market_data.symbol.0.clone(),
            data_type: market_data.data_type.to_string(),
            priority: 0,
            retry_count: 0,
            routing_keys: None,
        };
        Self {
            id: uuid_v4_like(),
            market_data,
            metadata,
            timestamp: Instant::now(),
            source: source.into(),
            attributes: HashMap::new(),
        }
    }
}

/// A lightweight, dependency-free id generator; the pipeline only needs per-process uniqueness
/// for tracing/log correlation, not a globally unique identifier.
fn uuid_v4_like() -> String {
    use std::sync::atomic::{AtomicU64, Ordering as O};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, O::SeqCst);
    format!("pd-{:016x}", n)
}

/// Per-traversal context handed to every [`Stage::process`] call.
#[derive(Clone, Debug)]
pub struct PipelineContext {
    pub stage_index: usize,
    pub pipeline_id: String,
}

/// Lifecycle of a [`Pipeline`].
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PipelineLifecycle {
    Uninitialized,
    Initialized,
    Running,
    Stopped,
    Destroyed,
}

/// Rolling metrics kept per stage and at the pipeline level.
#[derive(Default)]
pub struct Metrics {
    pub total_processed: AtomicU64,
    pub total_errors: AtomicU64,
    average_latency_us: Mutex<f64>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct MetricsSnapshot {
    pub total_processed: u64,
    pub total_errors: u64,
    pub average_latency: Duration,
}

impl Metrics {
    fn record(&self, latency: Duration, errored: bool) {
        self.total_processed.fetch_add(1, Ordering::Relaxed);
        if errored {
            self.total_errors.fetch_add(1, Ordering::Relaxed);
        }
        // Exponential moving average over the last window, alpha chosen so ~20
        // samples dominate the estimate.
        const ALPHA: f64 = 0.1;
        let mut avg = self.average_latency_us.lock().unwrap();
        let sample = latency.as_secs_f64() * 1_000_000.0;
        *avg = if *avg == 0.0 { sample } else { ALPHA * sample + (1.0 - ALPHA) * *avg };
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_processed: self.total_processed.load(Ordering::Relaxed),
            total_errors: self.total_errors.load(Ordering::Relaxed),
            average_latency: Duration::from_secs_f64(
                *self.average_latency_us.lock().unwrap() / 1_000_000.0,
            ),
        }
    }
}

/// Per-stage circuit breaker state: `CLOSED -> OPEN` after `failureThreshold`
/// consecutive failures, `OPEN -> HALF_OPEN` after `resetTimeout`, `HALF_OPEN -> CLOSED` on a
/// successful probe or back to `OPEN` on failure.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    consecutive_failures: AtomicU32,
    opened_at: Mutex<Option<Instant>>,
}

impl CircuitBreaker {
    fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState::Closed),
            consecutive_failures: AtomicU32::new(0),
            opened_at: Mutex::new(None),
        }
    }

    /// Call before invoking the stage. Returns an error if the breaker is open and the reset
    /// timeout hasn't elapsed; otherwise transitions `OPEN -> HALF_OPEN` once it has.
    fn before_call(&self) -> Result<(), CoreError> {
        let mut state = self.state.lock().unwrap();
        if *state == BreakerState::Open {
            let opened_at = self.opened_at.lock().unwrap();
            if opened_at.map(|t| t.elapsed() >= self.config.reset_timeout).unwrap_or(false) {
                *state = BreakerState::HalfOpen;
            } else {
                return Err(CoreError::pipeline("circuit breaker open"));
            }
        }
        Ok(())
    }

    fn record_result(&self, success: bool) {
        let mut state = self.state.lock().unwrap();
        if success {
            self.consecutive_failures.store(0, Ordering::SeqCst);
            *state = BreakerState::Closed;
        } else {
            let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
            if failures >= self.config.failure_threshold || *state == BreakerState::HalfOpen {
                *state = BreakerState::Open;
                *self.opened_at.lock().unwrap() = Some(Instant::now());
            }
        }
    }
}

/// A single stage in the pipeline. Returning `Ok(None)` absorbs the envelope
/// (processing terminates successfully without propagating further).
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    async fn process(
        &self,
        data: PipelineData,
        ctx: &PipelineContext,
    ) -> Result<Option<PipelineData>, CoreError>;

    async fn initialize(&self) -> Result<(), CoreError> {
        Ok(())
    }

    async fn destroy(&self) -> Result<(), CoreError> {
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        true
    }
}

struct StageSlot {
    stage: Box<dyn Stage>,
    config: StageConfig,
    breaker: Option<CircuitBreaker>,
    metrics: Metrics,
}

/// Runs [`MarketData`] through a fixed, ordered sequence of [`Stage`]s.
pub struct Pipeline {
    config: PipelineConfig,
    stages: Vec<StageSlot>,
    lifecycle: Mutex<PipelineLifecycle>,
    metrics: Metrics,
    id: String,
}

impl Pipeline {
    pub fn new(id: impl Into<String>, config: PipelineConfig) -> Self {
        Self {
            config,
            stages: Vec::new(),
            lifecycle: Mutex::new(PipelineLifecycle::Uninitialized),
            metrics: Metrics::default(),
            id: id.into(),
        }
    }

    pub fn add_stage(&mut self, stage: Box<dyn Stage>, config: StageConfig) {
        let breaker = config.circuit_breaker.map(CircuitBreaker::new);
        self.stages.push(StageSlot {
            stage,
            config,
            breaker,
            metrics: Metrics::default(),
        });
    }

    /// `uninit -> initialized`. Calls every stage's `initialize` in order.
    pub async fn initialize(&self) -> Result<(), CoreError> {
        let mut lifecycle = self.lifecycle.lock().unwrap();
        if *lifecycle != PipelineLifecycle::Uninitialized {
            return Ok(());
        }
        *lifecycle = PipelineLifecycle::Initialized;
        drop(lifecycle);
        for slot in &self.stages {
            slot.stage.initialize().await?;
        }
        Ok(())
    }

    /// `initialized -> running`. A duplicate `start` is a no-op.
    pub fn start(&self) -> Result<(), CoreError> {
        let mut lifecycle = self.lifecycle.lock().unwrap();
        match *lifecycle {
            PipelineLifecycle::Uninitialized => {
                Err(CoreError::pipeline("cannot start an uninitialized pipeline"))
            }
            PipelineLifecycle::Running => Ok(()),
            _ => {
                *lifecycle = PipelineLifecycle::Running;
                Ok(())
            }
        }
    }

    /// `running -> stopped`. A duplicate `stop` is a no-op.
    pub fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().unwrap();
        if *lifecycle == PipelineLifecycle::Running {
            *lifecycle = PipelineLifecycle::Stopped;
        }
    }

    pub async fn destroy(&self) -> Result<(), CoreError> {
        *self.lifecycle.lock().unwrap() = PipelineLifecycle::Destroyed;
        for slot in &self.stages {
            slot.stage.destroy().await?;
        }
        Ok(())
    }

    pub fn lifecycle(&self) -> PipelineLifecycle {
        *self.lifecycle.lock().unwrap()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Wraps `market_data` in a [`PipelineData`] envelope and runs it through every enabled
    /// stage in order, applying each stage's error strategy and circuit breaker.
    pub async fn process(&self, market_data: MarketData, source: &str) -> Result<(), CoreError> {
        if self.lifecycle() != PipelineLifecycle::Running {
            return Err(CoreError::pipeline("pipeline is not running"));
        }

        let mut data = Some(PipelineData::new(market_data, source));
        let pipeline_id = self.id.clone();

        for (index, slot) in self.stages.iter().enumerate() {
            let Some(current) = data.take() else {
                break;
            };
            if !slot.config.enabled {
                data = Some(current);
                continue;
            }

            let ctx = PipelineContext {
                stage_index: index,
                pipeline_id: pipeline_id.clone(),
            };

            if let Some(breaker) = &slot.breaker {
                if let Err(err) = breaker.before_call() {
                    self.metrics.record(Duration::ZERO, true);
                    return Err(err);
                }
            }

            let start = Instant::now();
            let mut attempt = 0u32;
            let outcome = loop {
                let result = slot.stage.process(current.clone(), &ctx).await;
                match (&result, self.config.error_handling.strategy) {
                    (Err(_), ErrorStrategy::Retry) if attempt < self.config.error_handling.max_retries => {
                        attempt += 1;
                        tokio::time::sleep(self.config.error_handling.retry_interval).await;
                        continue;
                    }
                    _ => break result,
                }
            };
            let latency = start.elapsed();

            if let Some(breaker) = &slot.breaker {
                breaker.record_result(outcome.is_ok());
            }
            slot.metrics.record(latency, outcome.is_err());
            self.metrics.record(latency, outcome.is_err());

            match outcome {
                Ok(next) => data = next,
                Err(err) => match self.config.error_handling.strategy {
                    ErrorStrategy::FailFast => return Err(err),
                    ErrorStrategy::Continue | ErrorStrategy::Retry => {
                        warn!(stage = slot.stage.name(), %err, "stage error, dropping envelope");
                        return Ok(());
                    }
                },
            }
        }
        Ok(())
    }

    pub fn is_healthy(&self) -> bool {
        self.stages.iter().all(|slot| slot.stage.is_healthy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::model::{MarketDataPayload, Symbol, Trade};
    use crate::subscription::DataType;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn sample_market_data() -> MarketData {
        MarketData::new(
            "binance",
            Symbol("BTC/USDT".to_string()),
            DataType::Trade,
            chrono::Utc::now(),
            MarketDataPayload::Trade(Trade {
                id: "1".to_string(),
                price: 1.0,
                quantity: 1.0,
                side: crate::model::Side::Buy,
                timestamp: chrono::Utc::now(),
            }),
        )
    }

    struct PassthroughStage {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Stage for PassthroughStage {
        fn name(&self) -> &str {
            "passthrough"
        }

        async fn process(
            &self,
            data: PipelineData,
            _ctx: &PipelineContext,
        ) -> Result<Option<PipelineData>, CoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Some(data))
        }
    }

    struct AbsorbingStage;

    #[async_trait]
    impl Stage for AbsorbingStage {
        fn name(&self) -> &str {
            "absorbing"
        }

        async fn process(
            &self,
            _data: PipelineData,
            _ctx: &PipelineContext,
        ) -> Result<Option<PipelineData>, CoreError> {
            Ok(None)
        }
    }

    struct FailingStage;

    #[async_trait]
    impl Stage for FailingStage {
        fn name(&self) -> &str {
            "failing"
        }

        async fn process(
            &self,
            _data: PipelineData,
            _ctx: &PipelineContext,
        ) -> Result<Option<PipelineData>, CoreError> {
            Err(CoreError::pipeline("boom"))
        }
    }

    #[tokio::test]
    async fn starting_uninitialized_pipeline_fails() {
        let pipeline = Pipeline::new("p1", PipelineConfig::default());
        assert!(pipeline.start().is_err());
    }

    #[tokio::test]
    async fn duplicate_start_and_stop_are_no_ops() {
        let pipeline = Pipeline::new("p1", PipelineConfig::default());
        pipeline.initialize().await.unwrap();
        pipeline.start().unwrap();
        pipeline.start().unwrap();
        pipeline.stop();
        pipeline.stop();
        assert_eq!(pipeline.lifecycle(), PipelineLifecycle::Stopped);
    }

    #[tokio::test]
    async fn absorbing_stage_terminates_processing_successfully() {
        let mut pipeline = Pipeline::new("p1", PipelineConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        pipeline.add_stage(Box::new(AbsorbingStage), StageConfig::default());
        pipeline.add_stage(
            Box::new(PassthroughStage { calls: Arc::clone(&calls) }),
            StageConfig::default(),
        );
        pipeline.initialize().await.unwrap();
        pipeline.start().unwrap();

        pipeline.process(sample_market_data(), "test").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(pipeline.metrics().total_processed, 1);
    }

    #[tokio::test]
    async fn continue_strategy_drops_item_on_stage_error_without_failing_process() {
        let mut pipeline = Pipeline::new("p1", PipelineConfig::default());
        pipeline.add_stage(Box::new(FailingStage), StageConfig::default());
        pipeline.initialize().await.unwrap();
        pipeline.start().unwrap();

        let result = pipeline.process(sample_market_data(), "test").await;
        assert!(result.is_ok());
        assert_eq!(pipeline.metrics().total_errors, 1);
    }

    #[tokio::test]
    async fn fail_fast_strategy_propagates_stage_error() {
        let mut cfg = PipelineConfig::default();
        cfg.error_handling.strategy = ErrorStrategy::FailFast;
        let mut pipeline = Pipeline::new("p1", cfg);
        pipeline.add_stage(Box::new(FailingStage), StageConfig::default());
        pipeline.initialize().await.unwrap();
        pipeline.start().unwrap();

        assert!(pipeline.process(sample_market_data(), "test").await.is_err());
    }

    #[test]
    fn circuit_breaker_opens_after_failure_threshold_and_half_opens_after_timeout() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 2,
            reset_timeout: Duration::from_millis(10),
        });
        assert!(breaker.before_call().is_ok());
        breaker.record_result(false);
        assert!(breaker.before_call().is_ok());
        breaker.record_result(false);
        assert!(breaker.before_call().is_err());

        std::thread::sleep(Duration::from_millis(20));
        assert!(breaker.before_call().is_ok());
    }
}
