//! Normalized market data model. [`MarketData`] is the typed envelope every
//! exchange-specific payload is parsed into exactly once by the message parser, then carried
//! unchanged through the rest of the pipeline.

use crate::subscription::DataType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Side of a [`Trade`].
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

/// Display-form symbol, `BASE/QUOTE`, as opposed to the canonical concatenated storage form
/// used for identity keys and stream-name derivation.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Deserialize, Serialize)]
pub struct Symbol(pub String);

impl Display for Symbol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Symbol {
    fn from(value: &str) -> Self {
        Symbol(value.to_string())
    }
}

/// Normalised public trade payload.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct Trade {
    pub id: String,
    pub price: f64,
    pub quantity: f64,
    pub side: Side,
    pub timestamp: DateTime<Utc>,
}

/// Normalised 24h rolling ticker payload.
#[derive(Copy, Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct Ticker {
    pub last_price: f64,
    pub bid_price: f64,
    pub ask_price: f64,
    pub change_24h: f64,
    pub volume_24h: f64,
    pub high_24h: f64,
    pub low_24h: f64,
}

/// Normalised OHLCV kline/candle payload.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct Kline {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub interval: String,
}

/// One side of a depth snapshot/update: `(price, quantity)`.
pub type DepthLevel = (f64, f64);

/// Normalised order book depth payload.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct Depth {
    pub bids: Vec<DepthLevel>,
    pub asks: Vec<DepthLevel>,
    pub update_time: DateTime<Utc>,
}

/// Tagged union over the typed payload variants normalised market data can carry.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum MarketDataPayload {
    Trade(Trade),
    Ticker(Ticker),
    Kline(Kline),
    Depth(Depth),
}

/// One normalised market data event flowing from an exchange into the pipeline.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct MarketData {
    pub exchange: String,
    /// Display form, `BASE/QUOTE`.
    pub symbol: Symbol,
    pub data_type: DataType,
    /// Exchange event time.
    pub timestamp: DateTime<Utc>,
    /// Ingress time at this process.
    pub received_at: DateTime<Utc>,
    pub data: MarketDataPayload,
    pub sequence: Option<u64>,
}

impl MarketData {
    pub fn new(
        exchange: impl Into<String>,
        symbol: Symbol,
        data_type: DataType,
        timestamp: DateTime<Utc>,
        data: MarketDataPayload,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            symbol,
            data_type,
            timestamp,
            received_at: Utc::now(),
            data,
            sequence: None,
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_round_trips_through_json() {
        let trade = MarketDataPayload::Trade(Trade {
            id: "1".to_string(),
            price: 100.0,
            quantity: 1.0,
            side: Side::Buy,
            timestamp: Utc::now(),
        });
        let json = serde_json::to_string(&trade).unwrap();
        let back: MarketDataPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(trade, back);
    }
}
