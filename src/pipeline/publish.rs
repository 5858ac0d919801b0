//! Publish stage: batches envelopes per topic and flushes to a [`PublishSink`] on size or
//! latency triggers, retrying failed batches with a bounded exponential backoff.

use crate::config::PublishPolicy;
use crate::error::CoreError;
use crate::pipeline::{PipelineContext, PipelineData, Stage};
use crate::sink::PublishSink;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{error, warn};

struct TopicBatch {
    items: Vec<PipelineData>,
    opened_at: Instant,
}

impl TopicBatch {
    fn new() -> Self {
        Self { items: Vec::new(), opened_at: Instant::now() }
    }
}

/// The terminal stage. Requires the router stage to have already tagged
/// `metadata.routing_keys`; an envelope without routing keys is published to `"default"`.
pub struct PublishStage {
    policy: PublishPolicy,
    sink: Arc<dyn PublishSink>,
    batches: Mutex<HashMap<String, TopicBatch>>,
    max_retries: u32,
}

impl PublishStage {
    pub fn new(policy: PublishPolicy, sink: Arc<dyn PublishSink>) -> Self {
        Self {
            policy,
            sink,
            batches: Mutex::new(HashMap::new()),
            max_retries: 3,
        }
    }

    fn serialize(data: &PipelineData) -> Result<Vec<u8>, CoreError> {
        serde_json::to_vec(&data.market_data).map_err(CoreError::from)
    }

    /// The `{exchange, symbol, type, timestamp, source, processedAt}` attribute set every
    /// published message carries, derived from the envelope being published.
    fn attributes_for(item: &PipelineData) -> HashMap<String, String> {
        let mut attributes = HashMap::new();
        attributes.insert("exchange".to_string(), item.metadata.exchange.clone());
        attributes.insert("symbol".to_string(), item.metadata.symbol.clone());
        attributes.insert("type".to_string(), item.metadata.data_type.clone());
        attributes.insert("timestamp".to_string(), item.market_data.timestamp.to_rfc3339());
        attributes.insert("source".to_string(), item.source.clone());
        attributes.insert("processedAt".to_string(), chrono::Utc::now().to_rfc3339());
        attributes
    }

    /// Publishes one topic's accumulated batch with bounded exponential backoff on failure.
    /// No jitter here, unlike the reconnect strategy: batches aren't competing for a shared
    /// server the way reconnect attempts are, so there's nothing to desynchronize.
    async fn flush_topic(&self, topic: &str, items: Vec<PipelineData>) {
        if items.is_empty() {
            return;
        }
        let messages: Result<Vec<(Vec<u8>, HashMap<String, String>)>, CoreError> = items
            .iter()
            .map(|item| Self::serialize(item).map(|payload| (payload, Self::attributes_for(item))))
            .collect();
        let messages = match messages {
            Ok(m) => m,
            Err(err) => {
                error!(%topic, %err, "failed to serialize batch, dropping");
                return;
            }
        };

        let mut attempt = 0;
        loop {
            let outcome = self.sink.publish_batch(topic, &messages).await;
            if outcome.failure_count == 0 {
                return;
            }
            attempt += 1;
            if attempt > self.max_retries {
                warn!(%topic, failures = outcome.failure_count, "giving up on batch after max retries");
                return;
            }
            let delay = Duration::from_millis(50 * 2u64.pow(attempt));
            tokio::time::sleep(delay).await;
        }
    }

    async fn maybe_flush(&self, topic: &str) {
        let ready = {
            let mut batches = self.batches.lock().await;
            let batch = batches.get(topic);
            let size_trigger = batch
                .map(|b| b.items.len() >= self.policy.max_batch_size)
                .unwrap_or(false);
            let age_trigger = batch
                .map(|b| b.opened_at.elapsed() >= Duration::from_millis(self.policy.max_latency_ms))
                .unwrap_or(false);
            if size_trigger || age_trigger {
                batches.remove(topic)
            } else {
                None
            }
        };
        if let Some(batch) = ready {
            self.flush_topic(topic, batch.items).await;
        }
    }

    /// Background ticker driving the latency-based flush trigger for topics that never hit
    /// `max_batch_size`.
    pub async fn run_latency_flush(&self) {
        let mut ticker = tokio::time::interval(Duration::from_millis(self.policy.max_latency_ms));
        loop {
            ticker.tick().await;
            let topics: Vec<String> = self.batches.lock().await.keys().cloned().collect();
            for topic in topics {
                self.maybe_flush(&topic).await;
            }
        }
    }
}

#[async_trait]
impl Stage for PublishStage {
    fn name(&self) -> &str {
        "publish"
    }

    async fn process(
        &self,
        data: PipelineData,
        _ctx: &PipelineContext,
    ) -> Result<Option<PipelineData>, CoreError> {
        // An envelope routed to multiple topics (fan-out/duplication) is published to every one
        // of them, not just the first.
        let topics = data
            .metadata
            .routing_keys
            .clone()
            .filter(|keys| !keys.is_empty())
            .unwrap_or_else(|| vec!["default".to_string()]);

        {
            let mut batches = self.batches.lock().await;
            for topic in &topics {
                batches.entry(topic.clone()).or_insert_with(TopicBatch::new).items.push(data.clone());
            }
        }
        for topic in &topics {
            self.maybe_flush(topic).await;
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MarketData, MarketDataPayload, Symbol, Trade};
    use crate::sink::InMemorySink;
    use crate::subscription::DataType;

    fn sample() -> PipelineData {
        let market_data = MarketData::new(
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
        );
        let mut data = PipelineData::new(market_data, "test");
        data.metadata.routing_keys = Some(vec!["trades".to_string()]);
        data
    }

    #[tokio::test]
    async fn flushes_when_batch_reaches_max_size() {
        let sink = Arc::new(InMemorySink::new());
        let mut policy = PublishPolicy::default();
        policy.max_batch_size = 2;
        policy.max_latency_ms = 60_000;
        let stage = PublishStage::new(policy, sink.clone());
        let ctx = PipelineContext { stage_index: 0, pipeline_id: "p".to_string() };

        stage.process(sample(), &ctx).await.unwrap();
        stage.process(sample(), &ctx).await.unwrap();

        let published = sink.drain().await;
        assert_eq!(published.len(), 2);
        assert!(published.iter().all(|(topic, _, _)| topic == "trades"));
    }

    #[tokio::test]
    async fn envelope_without_routing_keys_goes_to_default_topic() {
        let sink = Arc::new(InMemorySink::new());
        let mut policy = PublishPolicy::default();
        policy.max_batch_size = 1;
        let stage = PublishStage::new(policy, sink.clone());
        let ctx = PipelineContext { stage_index: 0, pipeline_id: "p".to_string() };

        let market_data = MarketData::new(
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
        );
        stage.process(PipelineData::new(market_data, "test"), &ctx).await.unwrap();

        let published = sink.drain().await;
        assert_eq!(published[0].0, "default");
    }

    #[tokio::test]
    async fn published_message_carries_envelope_attributes() {
        let sink = Arc::new(InMemorySink::new());
        let mut policy = PublishPolicy::default();
        policy.max_batch_size = 1;
        let stage = PublishStage::new(policy, sink.clone());
        let ctx = PipelineContext { stage_index: 0, pipeline_id: "p".to_string() };

        stage.process(sample(), &ctx).await.unwrap();

        let published = sink.drain().await;
        let (_, _, attributes) = &published[0];
        assert_eq!(attributes.get("exchange").map(String::as_str), Some("binance"));
        assert_eq!(attributes.get("symbol").map(String::as_str), Some("BTC/USDT"));
        assert_eq!(attributes.get("type").map(String::as_str), Some("Trade"));
        assert_eq!(attributes.get("source").map(String::as_str), Some("test"));
        assert!(attributes.contains_key("timestamp"));
        assert!(attributes.contains_key("processedAt"));
    }

    #[tokio::test]
    async fn envelope_routed_to_multiple_topics_is_published_to_each() {
        let sink = Arc::new(InMemorySink::new());
        let mut policy = PublishPolicy::default();
        policy.max_batch_size = 1;
        let stage = PublishStage::new(policy, sink.clone());
        let ctx = PipelineContext { stage_index: 0, pipeline_id: "p".to_string() };

        let mut data = sample();
        data.metadata.routing_keys = Some(vec!["topic-a".to_string(), "topic-b".to_string()]);
        stage.process(data, &ctx).await.unwrap();

        let published = sink.drain().await;
        let mut topics: Vec<&str> = published.iter().map(|(topic, _, _)| topic.as_str()).collect();
        topics.sort();
        assert_eq!(topics, vec!["topic-a", "topic-b"]);
    }
}
