//! # cm-stream
//!
//! Shared streaming connections for exchange market data. One
//! [`WsClient`] per URL multiplexes any number of logical subscriptions,
//! callers wait on [`Deferred`] cells keyed by message hash, outbound frames
//! are paced by a token-bucket [`Throttler`], and incremental order books are
//! kept in sync with the exchange through nonce-checked deltas, cached
//! replays and CRC32 checksums.
//!
//! Exchange specifics are injected through [`ExchangeProtocol`] and
//! [`SnapshotSource`]; [`StreamCoordinator`] wires them together.

pub mod cache;
pub mod client;
pub mod coordinator;
pub mod deferred;
pub mod error;
pub mod event;
pub mod orderbook;
pub mod protocol;
pub mod reconnect;
pub mod throttler;
pub mod transport;

pub use cache::TradeCache;
pub use client::{ClientConfig, ConnectionStatus, MessageHandler, Subscription, WsClient};
pub use coordinator::{CoordinatorBuilder, StreamCoordinator};
pub use deferred::{race, Deferred, Settlement};
pub use error::StreamError;
pub use event::MarketEvent;
pub use orderbook::{BookDelta, BookKind, BookSnapshot, Level, OrderBook, OrderBookView};
pub use protocol::{ExchangeProtocol, HttpSnapshotSource, Inbound, SnapshotSource};
pub use reconnect::ReconnectPolicy;
pub use throttler::Throttler;
pub use transport::{Frame, Transport, TungsteniteTransport};
