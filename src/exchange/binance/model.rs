//! Binance wire types: the raw shapes carried inside the `{stream, data}` combined-stream
//! envelope. Every numeric field arrives as a decimal string on the wire;
//! parsing into `f64` is accepted lossily for this domain.

use serde::Deserialize;

/// Discriminates which payload variant `data` holds, via the `e` field Binance sends on every
/// combined-stream event.
#[derive(Deserialize)]
pub struct EventEnvelope {
    pub e: String,
}

#[derive(Deserialize)]
pub struct TradeEvent {
    #[serde(rename = "t")]
    pub trade_id: u64,
    #[serde(rename = "p")]
    pub price: String,
    #[serde(rename = "q")]
    pub quantity: String,
    #[serde(rename = "m")]
    pub buyer_is_maker: bool,
    #[serde(rename = "T")]
    pub trade_time: u64,
}

#[derive(Deserialize)]
pub struct TickerEvent {
    #[serde(rename = "c")]
    pub last_price: String,
    #[serde(rename = "b")]
    pub bid_price: String,
    #[serde(rename = "a")]
    pub ask_price: String,
    #[serde(rename = "p")]
    pub change_24h: String,
    #[serde(rename = "v")]
    pub volume_24h: String,
    #[serde(rename = "h")]
    pub high_24h: String,
    #[serde(rename = "l")]
    pub low_24h: String,
    #[serde(rename = "E")]
    pub event_time: u64,
}

#[derive(Deserialize)]
pub struct KlinePayload {
    #[serde(rename = "o")]
    pub open: String,
    #[serde(rename = "h")]
    pub high: String,
    #[serde(rename = "l")]
    pub low: String,
    #[serde(rename = "c")]
    pub close: String,
    #[serde(rename = "v")]
    pub volume: String,
    #[serde(rename = "t")]
    pub open_time: u64,
    #[serde(rename = "T")]
    pub close_time: u64,
    #[serde(rename = "i")]
    pub interval: String,
}

#[derive(Deserialize)]
pub struct KlineEvent {
    #[serde(rename = "k")]
    pub kline: KlinePayload,
}

#[derive(Deserialize)]
pub struct DepthUpdateEvent {
    #[serde(rename = "b")]
    pub bids: Vec<[String; 2]>,
    #[serde(rename = "a")]
    pub asks: Vec<[String; 2]>,
    #[serde(rename = "E")]
    pub event_time: u64,
}

/// Outbound `SUBSCRIBE`/`UNSUBSCRIBE` control frame. See <https://binance-docs.github.io/apidocs/spot/en/#live-subscribing-unsubscribing-to-streams>.
#[derive(serde::Serialize)]
pub struct StreamRequest<'a> {
    pub method: &'static str,
    pub params: &'a [String],
    pub id: u64,
}
