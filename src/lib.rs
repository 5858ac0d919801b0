//! Crypto exchange market-data ingestion core: maintains a pool of WebSocket connections to an
//! exchange, tracks logical subscriptions across them, normalizes exchange-specific wire
//! formats into one typed event model, and runs every event through a configurable processing
//! pipeline before handing it to a publishing sink.

pub mod config;
pub mod connection;
pub mod error;
pub mod exchange;
pub mod heartbeat;
pub mod model;
pub mod pipeline;
pub mod pool;
pub mod reconnect;
pub mod sink;
pub mod subscription;
pub mod util;

pub use config::{AdapterConfig, HeartbeatConfig, PoolConfig, ReconnectConfig, SubscriptionManagerConfig};
pub use error::{CoreError, ErrorKind};
pub use exchange::binance::adapter::BinanceAdapter;
pub use model::MarketData;
pub use pipeline::Pipeline;
pub use subscription::{DataType, Subscription};
