//! Core types for the CM streaming layer.
//!
//! Normalized, exchange-independent representations of the updates that
//! flow through a watched stream.

pub mod market_data;

// Re-export primary types for convenient access via `cm_core::types::*`.
pub use market_data::{now_millis, Side, Ticker, Trade};
