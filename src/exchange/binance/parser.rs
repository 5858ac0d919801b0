//! Binance message parser. Dispatches on the `e` discriminator Binance
//! attaches to every combined-stream event and normalizes into [`crate::model::MarketData`].

use crate::error::CoreError;
use crate::exchange::binance::model::{
    DepthUpdateEvent, EventEnvelope, KlineEvent, TickerEvent, TradeEvent,
};
use crate::model::{Depth, Kline, MarketData, MarketDataPayload, Side, Symbol, Ticker, Trade};
use crate::subscription::DataType;
use crate::util::epoch_ms_to_datetime_utc;

const KNOWN_QUOTE_SUFFIXES: [&str; 6] = ["USDT", "BUSD", "BTC", "ETH", "BNB", "USDC"];

/// Normalizes a canonical storage-form symbol (e.g. `BTCUSDT`) into the `BASE/QUOTE` display
/// form. Idempotent: a symbol already containing `/` is uppercased and passed
/// through unchanged, so re-normalizing an already-normalized symbol is a no-op.
pub fn normalize_symbol(symbol: &str) -> String {
    let upper = symbol.to_uppercase();
    if upper.contains('/') {
        return upper;
    }
    for suffix in KNOWN_QUOTE_SUFFIXES {
        if let Some(base) = upper.strip_suffix(suffix) {
            if !base.is_empty() {
                return format!("{base}/{suffix}");
            }
        }
    }
    upper
}

fn parse_f64(raw: &str) -> Result<f64, CoreError> {
    raw.parse::<f64>()
        .map_err(|err| CoreError::data(format!("invalid decimal '{raw}': {err}")))
}

fn parse_levels(raw: &[[String; 2]]) -> Result<Vec<(f64, f64)>, CoreError> {
    raw.iter()
        .map(|[price, qty]| Ok((parse_f64(price)?, parse_f64(qty)?)))
        .collect()
}

/// Parses one raw JSON payload already routed to `data_type` by [`discriminate`], producing the
/// normalized [`MarketData`] event. Returns `Ok(None)` for an unrecognized
/// discriminator, which the connection's message sink silently drops rather than erroring.
pub fn parse(stream_symbol: &str, payload: &serde_json::Value) -> Result<Option<MarketData>, CoreError> {
    let envelope: EventEnvelope = serde_json::from_value(payload.clone())?;
    let display_symbol = Symbol(normalize_symbol(stream_symbol));

    let (data_type, market_payload, timestamp_ms) = match envelope.e.as_str() {
        "trade" => {
            let event: TradeEvent = serde_json::from_value(payload.clone())?;
            let trade = Trade {
                id: event.trade_id.to_string(),
                price: parse_f64(&event.price)?,
                quantity: parse_f64(&event.quantity)?,
                side: if event.buyer_is_maker { Side::Sell } else { Side::Buy },
                timestamp: epoch_ms_to_datetime_utc(event.trade_time),
            };
            (DataType::Trade, MarketDataPayload::Trade(trade), event.trade_time)
        }
        "24hrTicker" => {
            let event: TickerEvent = serde_json::from_value(payload.clone())?;
            let ticker = Ticker {
                last_price: parse_f64(&event.last_price)?,
                bid_price: parse_f64(&event.bid_price)?,
                ask_price: parse_f64(&event.ask_price)?,
                change_24h: parse_f64(&event.change_24h)?,
                volume_24h: parse_f64(&event.volume_24h)?,
                high_24h: parse_f64(&event.high_24h)?,
                low_24h: parse_f64(&event.low_24h)?,
            };
            (DataType::Ticker, MarketDataPayload::Ticker(ticker), event.event_time)
        }
        "kline" => {
            let event: KlineEvent = serde_json::from_value(payload.clone())?;
            let k = event.kline;
            let data_type = DataType::from_kline_interval(&k.interval).ok_or_else(|| {
                CoreError::data(format!("unsupported kline interval '{}'", k.interval))
            })?;
            let kline = Kline {
                open: parse_f64(&k.open)?,
                high: parse_f64(&k.high)?,
                low: parse_f64(&k.low)?,
                close: parse_f64(&k.close)?,
                volume: parse_f64(&k.volume)?,
                open_time: epoch_ms_to_datetime_utc(k.open_time),
                close_time: epoch_ms_to_datetime_utc(k.close_time),
                interval: k.interval,
            };
            (data_type, MarketDataPayload::Kline(kline), k.close_time)
        }
        "depthUpdate" => {
            let event: DepthUpdateEvent = serde_json::from_value(payload.clone())?;
            let depth = Depth {
                bids: parse_levels(&event.bids)?,
                asks: parse_levels(&event.asks)?,
                update_time: epoch_ms_to_datetime_utc(event.event_time),
            };
            (DataType::Depth, MarketDataPayload::Depth(depth), event.event_time)
        }
        _ => return Ok(None),
    };

    Ok(Some(MarketData::new(
        "binance",
        display_symbol,
        data_type,
        epoch_ms_to_datetime_utc(timestamp_ms),
        market_payload,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalize_symbol_splits_on_known_quote_suffix() {
        assert_eq!(normalize_symbol("btcusdt"), "BTC/USDT");
        assert_eq!(normalize_symbol("ETHBTC"), "ETH/BTC");
    }

    #[test]
    fn normalize_symbol_is_idempotent() {
        let once = normalize_symbol("btcusdt");
        let twice = normalize_symbol(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn normalize_symbol_falls_back_to_uppercase_for_unknown_suffix() {
        assert_eq!(normalize_symbol("xyzabc"), "XYZABC");
    }

    #[test]
    fn parses_trade_event() {
        let payload = json!({
            "e": "trade", "t": 12345u64, "p": "27000.50", "q": "0.001",
            "m": false, "T": 1_700_000_000_000u64
        });
        let parsed = parse("BTCUSDT", &payload).unwrap().unwrap();
        assert_eq!(parsed.data_type, DataType::Trade);
        match parsed.data {
            MarketDataPayload::Trade(t) => {
                assert_eq!(t.side, Side::Buy);
                assert_eq!(t.price, 27000.50);
            }
            _ => panic!("expected trade payload"),
        }
    }

    #[test]
    fn parses_kline_event_into_interval_specific_data_type() {
        let payload = json!({
            "e": "kline",
            "k": {
                "o": "1.0", "h": "2.0", "l": "0.5", "c": "1.5", "v": "10.0",
                "t": 1_700_000_000_000u64, "T": 1_700_000_060_000u64, "i": "1m"
            }
        });
        let parsed = parse("ETHUSDT", &payload).unwrap().unwrap();
        assert_eq!(parsed.data_type, DataType::Kline1m);
    }

    #[test]
    fn unknown_discriminator_is_silently_dropped() {
        let payload = json!({"e": "something_new"});
        assert!(parse("BTCUSDT", &payload).unwrap().is_none());
    }
}
