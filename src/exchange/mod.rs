//! Exchange adapters. Only Binance is implemented; the module exists so a
//! second exchange can be added beside it without touching the connection, pool,
//! subscription, or pipeline layers.

pub mod binance;
