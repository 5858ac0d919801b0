//! Binance exchange adapter: wires the connection pool, subscription manager, and message
//! parser together behind one entry point, builds stream names per Binance's documented
//! conventions, and feeds parsed market data into the pipeline.

use crate::config::{
    AdapterConfig, HeartbeatConfig, PoolConfig, ReconnectConfig, SubscriptionManagerConfig,
};
use crate::connection::{Connection, FrameBuilder, MessageSink, RawStreamMessage};
use crate::error::CoreError;
use crate::exchange::binance::auth::{build_signed_headers, SignedHeaders};
use crate::exchange::binance::model::StreamRequest;
use crate::exchange::binance::parser;
use crate::pipeline::Pipeline;
use crate::pool::ConnectionPool;
use crate::subscription::events::BatchResult;
use crate::subscription::manager::SubscriptionManager;
use crate::subscription::{DataType, Subscription};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Builds the stream-name segment Binance expects after the `@`, e.g. `trade`, `kline_1m`,
/// `depth20@100ms`.
fn stream_suffix(data_type: DataType) -> String {
    match data_type {
        DataType::Trade => "trade".to_string(),
        DataType::Ticker => "ticker".to_string(),
        DataType::Depth => "depth20@100ms".to_string(),
        DataType::OrderBook => "depth@100ms".to_string(),
        other => format!("kline_{}", other.kline_interval().expect("kline data type")),
    }
}

/// Builds the full Binance combined-stream name for one subscription, e.g. `btcusdt@trade`.
pub fn stream_name(sub: &Subscription) -> String {
    format!("{}@{}", sub.symbol.to_lowercase(), stream_suffix(sub.data_type))
}

/// The thin wiring layer between the generic core and Binance's wire conventions.
pub struct BinanceAdapter {
    config: AdapterConfig,
    pool: Arc<ConnectionPool>,
    subscriptions: SubscriptionManager,
    pipeline: Arc<Pipeline>,
}

impl BinanceAdapter {
    pub async fn new(
        config: AdapterConfig,
        subscription_config: SubscriptionManagerConfig,
        pool_config: PoolConfig,
        heartbeat_config: HeartbeatConfig,
        reconnect_config: ReconnectConfig,
        pipeline: Arc<Pipeline>,
    ) -> Result<Arc<Self>, CoreError> {
        config.validate()?;

        let subscriptions = SubscriptionManager::new();
        subscriptions.initialize(subscription_config)?;

        let subscribe_frame: FrameBuilder = Arc::new(|names, id| {
            let request = StreamRequest { method: "SUBSCRIBE", params: names, id };
            serde_json::to_value(request).expect("StreamRequest always serializes")
        });
        let unsubscribe_frame: FrameBuilder = Arc::new(|names, id| {
            let request = StreamRequest { method: "UNSUBSCRIBE", params: names, id };
            serde_json::to_value(request).expect("StreamRequest always serializes")
        });

        let pipeline_for_sink = Arc::clone(&pipeline);
        let message_sink: MessageSink = Arc::new(move |msg: RawStreamMessage| {
            let pipeline = Arc::clone(&pipeline_for_sink);
            // process() is async and the connection's read loop cannot await here without
            // stalling on other frames/commands, so hand the envelope to its own task.
            tokio::spawn(async move {
                let stream_symbol = msg.stream.split('@').next().unwrap_or(&msg.stream);
                match parser::parse(stream_symbol, &msg.data) {
                    Ok(Some(market_data)) => {
                        if let Err(err) = pipeline.process(market_data, &msg.connection_id).await {
                            warn!(connection_id = %msg.connection_id, %err, "pipeline rejected market data");
                        }
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!(connection_id = %msg.connection_id, stream = %msg.stream, %err, "failed to parse stream frame");
                    }
                }
            });
        });

        let pool = ConnectionPool::new(
            pool_config,
            config.endpoints.ws.clone(),
            heartbeat_config,
            reconnect_config,
            subscribe_frame,
            unsubscribe_frame,
            message_sink,
        );

        Ok(Arc::new(Self { config, pool, subscriptions, pipeline }))
    }

    pub async fn start(self: &Arc<Self>) -> Result<(), CoreError> {
        self.pipeline.initialize().await?;
        self.pipeline.start()?;
        self.pool.start_background_tasks().await;
        Ok(())
    }

    /// Validates and records `subs` with the subscription manager, places the resulting stream
    /// names on an available pooled connection, and sends the wire-level subscribe frame.
    pub async fn subscribe(&self, subs: Vec<Subscription>) -> Result<BatchResult, CoreError> {
        let result = self.subscriptions.subscribe(subs)?;
        if result.successful.is_empty() {
            return Ok(result);
        }

        let stream_names: Vec<String> =
            result.successful.iter().map(|info| stream_name(&info.subscription)).collect();
        let connection = self.pool.get_available_connection(stream_names.len()).await?;
        connection.subscribe(stream_names).await?;

        for info in &result.successful {
            self.subscriptions.bind_connection(&info.key, &connection.id);
        }
        Ok(result)
    }

    pub async fn unsubscribe(&self, subs: Vec<Subscription>) -> Result<BatchResult, CoreError> {
        let result = self.subscriptions.unsubscribe(subs)?;
        if result.successful.is_empty() {
            return Ok(result);
        }

        let mut by_connection: std::collections::HashMap<String, Vec<String>> =
            std::collections::HashMap::new();
        for info in &result.successful {
            if let Some(connection_id) = &info.connection_id {
                by_connection
                    .entry(connection_id.clone())
                    .or_default()
                    .push(stream_name(&info.subscription));
            }
        }

        for (connection_id, names) in by_connection {
            if let Some(connection) = self
                .pool
                .connections()
                .await
                .into_iter()
                .find(|c| c.id == connection_id)
            {
                connection.unsubscribe(names).await?;
            }
        }
        Ok(result)
    }

    /// Signs a REST query string using the configured credentials.
    pub fn sign_request(&self, query_string: &str) -> Result<SignedHeaders, CoreError> {
        let credentials = self
            .config
            .credentials
            .as_ref()
            .ok_or_else(|| CoreError::auth("no credentials configured for signed REST request"))?;
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|err| CoreError::auth(format!("system clock before epoch: {err}")))?
            .as_millis() as i64;
        Ok(build_signed_headers(&credentials.api_key, &credentials.secret_key, query_string, timestamp))
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
        self.subscriptions.destroy();
        self.pipeline.stop();
        let _ = self.pipeline.destroy().await;
    }
}
