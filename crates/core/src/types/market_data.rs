//! Normalized market data types shared by every exchange protocol.
//!
//! Exchange strategies convert wire-format messages into these structures
//! before handing them to the streaming layer. Prices and amounts are kept as
//! [`Decimal`] so that the exact wire representation survives (checksums are
//! computed over it).

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Taker side of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    /// Buy / long.
    Buy,
    /// Sell / short.
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

/// Top-of-book ticker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    /// Unified symbol (e.g. `"BTC/USDT"`).
    pub symbol: String,
    /// Best bid price.
    pub bid: Option<Decimal>,
    /// Best ask price.
    pub ask: Option<Decimal>,
    /// Quantity available at the best bid.
    pub bid_volume: Option<Decimal>,
    /// Quantity available at the best ask.
    pub ask_volume: Option<Decimal>,
    /// Last traded price.
    pub last: Option<Decimal>,
    /// Exchange timestamp, milliseconds since the epoch.
    pub timestamp: Option<i64>,
}

impl Ticker {
    /// Mid price `(bid + ask) / 2`, if both sides are present.
    pub fn mid_price(&self) -> Option<Decimal> {
        Some((self.bid? + self.ask?) / Decimal::TWO)
    }

    /// Spread `ask - bid`, if both sides are present.
    pub fn spread(&self) -> Option<Decimal> {
        Some(self.ask? - self.bid?)
    }
}

/// Individual public trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    /// Unified symbol.
    pub symbol: String,
    /// Exchange-assigned trade identifier.
    pub id: String,
    /// Trade price.
    pub price: Decimal,
    /// Trade amount in base currency.
    pub amount: Decimal,
    /// Taker side (the aggressor).
    pub side: Side,
    /// Exchange timestamp, milliseconds since the epoch.
    pub timestamp: i64,
}

/// Current wall-clock time in milliseconds since the epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
