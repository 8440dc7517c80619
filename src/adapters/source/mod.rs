//! Quote Source Adapters
//!
//! Implements the `QuoteSource` port for the JSON WebSocket gateway.

pub mod ws;

pub use ws::WsQuoteSource;
