//! Buffer stage: accumulates envelopes into per-partition batches and flushes them, via a
//! configured async callback, on size, age, or interval triggers, or on demand.

use crate::config::{BackpressureStrategy, BufferConfig, PartitionBy};
use crate::error::CoreError;
use crate::pipeline::{PipelineContext, PipelineData, Stage};
use crate::util::{Emitter, ListenerToken};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::warn;

fn partition_key(data: &PipelineData, partition_by: PartitionBy) -> String {
    match partition_by {
        PartitionBy::Exchange => data.metadata.exchange.clone(),
        PartitionBy::Symbol => data.metadata.symbol.clone(),
        PartitionBy::DataType => data.metadata.data_type.clone(),
        PartitionBy::Custom => data
            .metadata
            .routing_keys
            .as_ref()
            .and_then(|keys| keys.first())
            .cloned()
            .unwrap_or_else(|| "default".to_string()),
    }
}

/// Rough wire-size estimate for a buffered envelope, used for `byteEstimate` accounting. Exact
/// to the byte for the JSON encoding the publish stage will eventually produce; an estimate is
/// all the buffer stage needs since it never serializes for real.
fn estimate_bytes(data: &PipelineData) -> usize {
    serde_json::to_vec(&data.market_data).map(|bytes| bytes.len()).unwrap_or(0)
}

/// Asynchronously hands a flushed partition's items off to storage/downstream transport.
/// Failure leaves the items buffered for the next flush attempt.
pub type FlushCallback =
    Arc<dyn Fn(Vec<PipelineData>) -> BoxFuture<'static, Result<(), CoreError>> + Send + Sync>;

struct Partition {
    items: Vec<PipelineData>,
    opened_at: Instant,
    byte_estimate: usize,
    newest_ts: Option<DateTime<Utc>>,
}

impl Partition {
    fn new() -> Self {
        Self { items: Vec::new(), opened_at: Instant::now(), byte_estimate: 0, newest_ts: None }
    }

    fn push(&mut self, data: PipelineData) {
        self.byte_estimate += estimate_bytes(&data);
        let ts = data.market_data.timestamp;
        self.newest_ts = Some(self.newest_ts.map_or(ts, |newest| newest.max(ts)));
        self.items.push(data);
    }
}

/// A flushed batch, handed to whoever drains [`BufferStage::flushed`].
#[derive(Clone, Debug)]
pub struct FlushedBatch {
    pub partition: String,
    pub items: Vec<PipelineData>,
    pub reason: FlushReason,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum FlushReason {
    Size,
    Age,
    Interval,
    Manual,
}

/// Events emitted by the buffer stage as it accumulates and flushes partitions.
#[derive(Clone, Debug)]
pub enum BufferEvent {
    BufferInitialized,
    DataBuffered { partition: String, size: usize },
    PartitionFlushed { partition: String, items: usize, reason: FlushReason },
    DataSpilled { partition: String, items: usize },
    DataDropped { reason: String },
    AllPartitionsCleared,
}

/// Holds data in memory, partitioned by [`PartitionBy`], and flushes it through a configured
/// [`FlushCallback`] on the configured triggers.
pub struct BufferStage {
    config: BufferConfig,
    partitions: Mutex<HashMap<String, Partition>>,
    flushed_tx: mpsc::UnboundedSender<FlushedBatch>,
    flushed_rx: Mutex<Option<mpsc::UnboundedReceiver<FlushedBatch>>>,
    flush_callback: FlushCallback,
    flush_errors: AtomicU64,
    events: Emitter<BufferEvent>,
}

impl BufferStage {
    pub fn new(config: BufferConfig, flush_callback: FlushCallback) -> Self {
        let (flushed_tx, flushed_rx) = mpsc::unbounded_channel();
        Self {
            config,
            partitions: Mutex::new(HashMap::new()),
            flushed_tx,
            flushed_rx: Mutex::new(Some(flushed_rx)),
            flush_callback,
            flush_errors: AtomicU64::new(0),
            events: Emitter::new(),
        }
    }

    /// Takes ownership of the flush event stream. Can only be called once.
    pub fn flushed(&self) -> mpsc::UnboundedReceiver<FlushedBatch> {
        self.flushed_rx
            .lock()
            .unwrap()
            .take()
            .expect("flushed() called more than once")
    }

    pub fn on_event<F>(&self, listener: F) -> ListenerToken<BufferEvent>
    where
        F: Fn(&BufferEvent) + Send + Sync + 'static,
    {
        self.events.on(listener)
    }

    pub fn flush_error_count(&self) -> u64 {
        self.flush_errors.load(Ordering::Relaxed)
    }

    fn occupancy(&self) -> f64 {
        let partitions = self.partitions.lock().unwrap();
        let total: usize = partitions.values().map(|p| p.items.len()).sum();
        let capacity = self.config.buffer_policy.max_size.max(1) * partitions.len().max(1);
        total as f64 / capacity as f64
    }

    /// Invokes the configured flush callback for `items`. On success the caller's removal of the
    /// partition stands and a [`FlushedBatch`] is emitted; on failure the items are put back so
    /// the next trigger retries them, and the error counter is incremented.
    async fn flush_partition(&self, key: &str, items: Vec<PipelineData>, reason: FlushReason) {
        if items.is_empty() {
            return;
        }
        let count = items.len();
        match (self.flush_callback)(items.clone()).await {
            Ok(()) => {
                self.events.emit(BufferEvent::PartitionFlushed {
                    partition: key.to_string(),
                    items: count,
                    reason,
                });
                let _ = self.flushed_tx.send(FlushedBatch { partition: key.to_string(), items, reason });
            }
            Err(err) => {
                self.flush_errors.fetch_add(1, Ordering::Relaxed);
                warn!(partition = key, %err, "flush callback failed, retaining buffered items for retry");
                let mut partitions = self.partitions.lock().unwrap();
                let partition = partitions.entry(key.to_string()).or_insert_with(Partition::new);
                for item in items.into_iter().rev() {
                    partition.items.insert(0, item);
                }
            }
        }
    }

    /// Force-flushes every partition regardless of size or age. Used on shutdown and by test
    /// harnesses that don't want to wait out the interval trigger.
    pub async fn flush_all(&self) {
        let keys: Vec<String> = {
            let partitions = self.partitions.lock().unwrap();
            partitions.keys().cloned().collect()
        };
        for key in keys {
            let items = {
                let mut partitions = self.partitions.lock().unwrap();
                partitions.remove(&key).map(|p| p.items)
            };
            if let Some(items) = items {
                self.flush_partition(&key, items, FlushReason::Manual).await;
            }
        }
    }

    /// Discards every buffered partition without flushing it. Used on reset.
    pub fn clear_all(&self) {
        self.partitions.lock().unwrap().clear();
        self.events.emit(BufferEvent::AllPartitionsCleared);
    }

    /// Background ticker driving the `flushInterval` trigger; run as a spawned task for the
    /// lifetime of the pipeline.
    pub async fn run_interval_flush(&self) {
        let mut ticker = tokio::time::interval(self.config.buffer_policy.flush_interval);
        loop {
            ticker.tick().await;
            let ready: Vec<(String, Vec<PipelineData>)> = {
                let mut partitions = self.partitions.lock().unwrap();
                let keys: Vec<String> = partitions.keys().cloned().collect();
                keys.into_iter()
                    .filter_map(|key| partitions.remove(&key).map(|p| (key, p.items)))
                    .collect()
            };
            for (key, items) in ready {
                self.flush_partition(&key, items, FlushReason::Interval).await;
            }
        }
    }
}

#[async_trait]
impl Stage for BufferStage {
    fn name(&self) -> &str {
        "buffer"
    }

    async fn initialize(&self) -> Result<(), CoreError> {
        self.events.emit(BufferEvent::BufferInitialized);
        Ok(())
    }

    async fn process(
        &self,
        data: PipelineData,
        _ctx: &PipelineContext,
    ) -> Result<Option<PipelineData>, CoreError> {
        let key = partition_key(&data, self.config.partition_by);

        if self.config.enable_backpressure
            && self.occupancy() >= self.config.buffer_policy.backpressure_threshold
        {
            match self.config.backpressure_strategy {
                BackpressureStrategy::Block => {
                    // No independent readiness signal to block on here; the caller already
                    // serializes calls through the pipeline, so surface the condition instead.
                    warn!("buffer stage at backpressure threshold, blocking strategy degrades to continue");
                }
                BackpressureStrategy::Drop => {
                    self.events.emit(BufferEvent::DataDropped { reason: "backpressure".to_string() });
                    return Ok(None);
                }
                BackpressureStrategy::Spill => {
                    if self.config.spill_path.is_none() {
                        return Err(CoreError::pipeline(
                            "spill backpressure strategy requires spill_path",
                        ));
                    }
                    // Spilling to disk is delegated to the configured sink; the in-memory buffer
                    // still accepts the item so ordering within the partition is preserved.
                    self.events.emit(BufferEvent::DataSpilled { partition: key.clone(), items: 1 });
                }
            }
        }

        let (size_trigger, age_trigger, partition_size) = {
            let mut partitions = self.partitions.lock().unwrap();
            let partition = partitions.entry(key.clone()).or_insert_with(Partition::new);
            partition.push(data);
            (
                partition.items.len() >= self.config.buffer_policy.max_size,
                partition.opened_at.elapsed() >= self.config.buffer_policy.max_age,
                partition.items.len(),
            )
        };
        self.events.emit(BufferEvent::DataBuffered { partition: key.clone(), size: partition_size });

        if size_trigger || age_trigger {
            let items = {
                let mut partitions = self.partitions.lock().unwrap();
                partitions.remove(&key).map(|p| p.items)
            };
            if let Some(items) = items {
                let reason = if size_trigger { FlushReason::Size } else { FlushReason::Age };
                self.flush_partition(&key, items, reason).await;
            }
        }

        Ok(None)
    }
}
