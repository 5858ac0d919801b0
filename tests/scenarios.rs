//! End-to-end scenarios exercising the subscription manager, pipeline stages and publish sink
//! together, using in-memory fakes in place of a live exchange socket.

use market_data_core::config::{
    BufferConfig, PipelineConfig, PublishPolicy, RouterConfig, SubscriptionManagerConfig,
};
use market_data_core::model::{MarketDataPayload, Symbol, Ticker, Trade};
use market_data_core::pipeline::buffer::BufferStage;
use market_data_core::pipeline::publish::PublishStage;
use market_data_core::pipeline::router::{Condition, Field, Rule, RouterStage};
use market_data_core::pipeline::Pipeline;
use market_data_core::sink::InMemorySink;
use market_data_core::{DataType, MarketData, Subscription, SubscriptionManagerConfig as SubCfg};
use std::sync::Arc;

fn trade(symbol: &str) -> MarketData {
    MarketData::new(
        "binance",
        Symbol(symbol.to_string()),
        DataType::Trade,
        chrono::Utc::now(),
        MarketDataPayload::Trade(Trade {
            id: "1".to_string(),
            price: 27000.0,
            quantity: 0.5,
            side: market_data_core::model::Side::Buy,
            timestamp: chrono::Utc::now(),
        }),
    )
}

fn ticker(symbol: &str) -> MarketData {
    MarketData::new(
        "binance",
        Symbol(symbol.to_string()),
        DataType::Ticker,
        chrono::Utc::now(),
        MarketDataPayload::Ticker(Ticker {
            last_price: 27000.0,
            bid_price: 26999.0,
            ask_price: 27001.0,
            change_24h: 100.0,
            volume_24h: 5000.0,
            high_24h: 27500.0,
            low_24h: 26500.0,
        }),
    )
}

/// S1: subscribing to a symbol and data type, then seeing published events on the expected
/// topic once they traverse router and publish stages.
#[tokio::test]
async fn subscribe_and_receive_routes_trades_to_trades_topic() {
    let manager = market_data_core::subscription::manager::SubscriptionManager::new();
    manager.initialize(SubCfg::default()).unwrap();
    let result = manager
        .subscribe(vec![Subscription::new("BTCUSDT", DataType::Trade)])
        .unwrap();
    assert_eq!(result.summary().successful, 1);

    let sink = Arc::new(InMemorySink::new());
    let mut pipeline = Pipeline::new("s1", PipelineConfig::default());
    let mut router = RouterStage::new(RouterConfig::default(), None);
    router.add_rule(Rule {
        name: "trades".to_string(),
        condition: Condition::Exact { field: Field::DataType, value: "Trade".to_string() },
        topics: vec!["trades".to_string()],
        priority: 0,
    });
    pipeline.add_stage(Box::new(router), Default::default());
    pipeline.add_stage(
        Box::new(PublishStage::new(PublishPolicy { max_batch_size: 1, max_latency_ms: 60_000 }, Arc::clone(&sink) as Arc<dyn market_data_core::sink::PublishSink>)),
        Default::default(),
    );
    pipeline.initialize().await.unwrap();
    pipeline.start().unwrap();

    pipeline.process(trade("BTC/USDT"), "conn-1").await.unwrap();

    let published = sink.drain().await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, "trades");
}

/// S3: a batch subscribe that would exceed the configured cap fails wholesale, with no items
/// entering the active set and no events reaching the pipeline.
#[tokio::test]
async fn oversized_batch_subscribe_fails_wholesale_and_admits_nothing() {
    let manager = market_data_core::subscription::manager::SubscriptionManager::new();
    let mut cfg = SubscriptionManagerConfig::default();
    cfg.validation.max_subscriptions = 3;
    manager.initialize(cfg).unwrap();

    let subs: Vec<_> = (0..5)
        .map(|i| Subscription::new(format!("SYM{i}"), DataType::Trade))
        .collect();
    let err = manager.subscribe(subs).unwrap_err();
    assert!(err.message.contains("Would exceed maximum subscriptions: 5 > 3"));
    assert!(manager.get_active_subscriptions().is_empty());
}

/// S2 (resubscribe-on-reconnect): subscriptions bound to a replaced connection keep their
/// identity key and migrate to the new connection id without re-entering the active set twice.
#[tokio::test]
async fn resubscribe_on_reconnect_keeps_identity_stable() {
    let manager = market_data_core::subscription::manager::SubscriptionManager::new();
    manager.initialize(SubCfg::default()).unwrap();
    let sub = Subscription::new("ETHUSDT", DataType::Ticker);
    let result = manager.subscribe(vec![sub.clone()]).unwrap();
    manager.bind_connection(&result.successful[0].key, "conn-a");

    manager.resubscribe_on_reconnect("conn-a", "conn-b");

    let active = manager.get_active_subscriptions();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].connection_id.as_deref(), Some("conn-b"));
    assert_eq!(active[0].key, sub.key());
}

/// Buffer stage accumulates per-partition and flushes once size is reached, feeding a batch of
/// the expected size downstream.
#[tokio::test]
async fn buffered_trades_flush_as_one_batch_once_full() {
    use market_data_core::pipeline::{PipelineContext, PipelineData, Stage};

    let mut config = BufferConfig::default();
    config.buffer_policy.max_size = 3;
    let stage = BufferStage::new(config);
    let mut flushed = stage.flushed();
    let ctx = PipelineContext { stage_index: 0, pipeline_id: "p".to_string() };

    for _ in 0..3 {
        stage.process(PipelineData::new(trade("BTC/USDT"), "conn-1"), &ctx).await.unwrap();
    }

    let batch = flushed.try_recv().unwrap();
    assert_eq!(batch.items.len(), 3);
}

/// Router fallback: an event matching no rule is sent to the configured dead-letter topic
/// rather than silently dropped, when fallback routing is enabled.
#[tokio::test]
async fn unmatched_event_falls_back_to_dead_letter_topic() {
    let mut router_config = RouterConfig::default();
    router_config.enable_fallback = true;
    let router = RouterStage::new(router_config, Some("dead-letter".to_string()));

    let sink = Arc::new(InMemorySink::new());
    let mut pipeline = Pipeline::new("s-fallback", PipelineConfig::default());
    pipeline.add_stage(Box::new(router), Default::default());
    pipeline.add_stage(
        Box::new(PublishStage::new(
            PublishPolicy { max_batch_size: 1, max_latency_ms: 60_000 },
            Arc::clone(&sink) as Arc<dyn market_data_core::sink::PublishSink>,
        )),
        Default::default(),
    );
    pipeline.initialize().await.unwrap();
    pipeline.start().unwrap();

    pipeline.process(ticker("ETH/USDT"), "conn-1").await.unwrap();

    let published = sink.drain().await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, "dead-letter");
}

/// S6-style shutdown: clearing all subscriptions is idempotent and leaves the manager usable.
#[tokio::test]
async fn clearing_subscriptions_twice_is_safe() {
    let manager = market_data_core::subscription::manager::SubscriptionManager::new();
    manager.initialize(SubCfg::default()).unwrap();
    manager
        .subscribe(vec![Subscription::new("BTCUSDT", DataType::Trade)])
        .unwrap();
    manager.clear_all_subscriptions();
    manager.clear_all_subscriptions();
    assert!(manager.get_active_subscriptions().is_empty());
}
