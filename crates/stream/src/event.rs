//! Values delivered to callers waiting on a stream.

use std::sync::Arc;

use cm_core::types::{Ticker, Trade};

use crate::orderbook::OrderBookView;

/// One update for a message hash.
#[derive(Debug, Clone, PartialEq)]
pub enum MarketEvent {
    Ticker(Ticker),
    Trades(Vec<Trade>),
    /// Point-in-time copy of a reconciled book.
    OrderBook(Arc<OrderBookView>),
    /// Payload the protocol left unparsed.
    Json(serde_json::Value),
}

impl MarketEvent {
    pub fn as_ticker(&self) -> Option<&Ticker> {
        match self {
            MarketEvent::Ticker(ticker) => Some(ticker),
            _ => None,
        }
    }

    pub fn as_order_book(&self) -> Option<&OrderBookView> {
        match self {
            MarketEvent::OrderBook(view) => Some(view),
            _ => None,
        }
    }
}
