//! Binance exchange adapter: wire model, message parser, REST request
//! signing, and the adapter that wires the connection pool and subscription manager to the
//! pipeline.

pub mod adapter;
pub mod auth;
pub mod model;
pub mod parser;
