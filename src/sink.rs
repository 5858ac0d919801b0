//! Publishing sink: the boundary between the pipeline's publish stage and whatever
//! downstream message bus or storage actually receives published market data. Kept as a trait
//! so the core crate never depends on a concrete broker client.

use crate::error::CoreError;
use async_trait::async_trait;
use std::collections::HashMap;

/// Result of a batch publish call.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct BatchOutcome {
    pub success_count: usize,
    pub failure_count: usize,
}

/// A downstream destination for published market data. Implementations are expected to be
/// cheap to clone (an `Arc` handle around a client) since the publish stage holds one per
/// pipeline for its lifetime.
#[async_trait]
pub trait PublishSink: Send + Sync {
    /// Publishes a single message to `topic`, returning a sink-assigned message id.
    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        attributes: &HashMap<String, String>,
    ) -> Result<String, CoreError>;

    /// Publishes a batch of `(payload, attributes)` pairs to `topic`. The default
    /// implementation publishes sequentially; sinks with a native batch API should override
    /// this for lower overhead.
    async fn publish_batch(
        &self,
        topic: &str,
        messages: &[(Vec<u8>, HashMap<String, String>)],
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for (payload, attributes) in messages {
            match self.publish(topic, payload, attributes).await {
                Ok(_) => outcome.success_count += 1,
                Err(_) => outcome.failure_count += 1,
            }
        }
        outcome
    }
}

/// An in-memory sink that records every publish call; used by tests and as a local development
/// fallback when no real broker is configured.
pub struct InMemorySink {
    published: tokio::sync::Mutex<Vec<(String, Vec<u8>, HashMap<String, String>)>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self {
            published: tokio::sync::Mutex::new(Vec::new()),
            next_id: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub async fn drain(&self) -> Vec<(String, Vec<u8>, HashMap<String, String>)> {
        std::mem::take(&mut *self.published.lock().await)
    }
}

impl Default for InMemorySink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PublishSink for InMemorySink {
    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        attributes: &HashMap<String, String>,
    ) -> Result<String, CoreError> {
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.published
            .lock()
            .await
            .push((topic.to_string(), payload.to_vec(), attributes.clone()));
        Ok(format!("mem-{id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_sink_records_published_messages() {
        let sink = InMemorySink::new();
        let id = sink.publish("topic-a", b"hello", &HashMap::new()).await.unwrap();
        assert_eq!(id, "mem-0");
        let recorded = sink.drain().await;
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].0, "topic-a");
    }

    #[tokio::test]
    async fn default_publish_batch_reports_per_message_outcome() {
        let sink = InMemorySink::new();
        let messages = vec![
            (b"a".to_vec(), HashMap::new()),
            (b"b".to_vec(), HashMap::new()),
        ];
        let outcome = sink.publish_batch("topic-a", &messages).await;
        assert_eq!(outcome, BatchOutcome { success_count: 2, failure_count: 0 });
    }
}
