//! Exchange strategy seam.
//!
//! The streaming core never parses an exchange's wire format. An
//! [`ExchangeProtocol`] turns inbound frames into routed [`Inbound`] items and
//! builds subscribe/unsubscribe/ping frames; a [`SnapshotSource`] fetches full
//! order books over REST to seed or reseed a replica.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cm_core::config::RestConfig;

use crate::error::StreamError;
use crate::event::MarketEvent;
use crate::orderbook::{BookDelta, BookSnapshot, OrderBook, DEFAULT_CHECKSUM_DEPTH};
use crate::transport::Frame;

/// One routed item parsed out of an inbound frame.
#[derive(Debug, Clone)]
pub enum Inbound {
    /// Resolve `message_hash` with `event`.
    Update {
        message_hash: String,
        event: MarketEvent,
    },
    /// Full book pushed over the stream.
    BookSnapshot {
        message_hash: String,
        snapshot: BookSnapshot,
    },
    /// Incremental book update for `symbol`.
    BookDelta {
        message_hash: String,
        symbol: String,
        delta: BookDelta,
    },
    /// Exchange error for one hash, or for every waiter when `None`.
    Error {
        message_hash: Option<String>,
        error: StreamError,
    },
    /// Application-level pong.
    Pong,
}

/// Per-exchange wire format.
pub trait ExchangeProtocol: Send + Sync + 'static {
    /// Split a frame into routed items. An `Err` rejects every wait pending on
    /// the connection; the connection itself stays up.
    fn parse_message(&self, frame: &Frame) -> Result<Vec<Inbound>, StreamError>;

    /// Subscribe frame for `topic`, or `None` if the stream needs none.
    fn subscribe_frame(&self, topic: &str, params: &serde_json::Value) -> Option<Frame>;

    /// Unsubscribe frame for `topic`.
    fn unsubscribe_frame(&self, _topic: &str, _params: &serde_json::Value) -> Option<Frame> {
        None
    }

    /// Keepalive frame.
    fn ping_frame(&self) -> Frame {
        Frame::Ping(Vec::new())
    }

    /// Checksum compared against [`BookDelta::checksum`].
    fn checksum(&self, book: &OrderBook) -> u32 {
        book.checksum(DEFAULT_CHECKSUM_DEPTH)
    }
}

/// REST order book snapshots.
#[async_trait]
pub trait SnapshotSource: Send + Sync + 'static {
    async fn fetch_snapshot(&self, symbol: &str, limit: Option<usize>) -> Result<BookSnapshot, StreamError>;
}

/// Builds the request URL for `(symbol, limit)`.
pub type EndpointFn = Arc<dyn Fn(&str, Option<usize>) -> String + Send + Sync>;

/// Converts a JSON body into a snapshot for `symbol`.
pub type SnapshotParser = Arc<dyn Fn(&str, serde_json::Value) -> Result<BookSnapshot, StreamError> + Send + Sync>;

/// [`SnapshotSource`] over HTTP GET with a JSON body.
#[derive(Clone)]
pub struct HttpSnapshotSource {
    http: reqwest::Client,
    endpoint: EndpointFn,
    parser: SnapshotParser,
}

impl HttpSnapshotSource {
    pub fn new(timeout: Duration, endpoint: EndpointFn, parser: SnapshotParser) -> Result<Self, StreamError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StreamError::Network {
                url: String::new(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            http,
            endpoint,
            parser,
        })
    }

    /// Source using the `rest` section's request timeout.
    pub fn from_config(config: &RestConfig, endpoint: EndpointFn, parser: SnapshotParser) -> Result<Self, StreamError> {
        Self::new(Duration::from_millis(config.timeout_ms), endpoint, parser)
    }
}

#[async_trait]
impl SnapshotSource for HttpSnapshotSource {
    async fn fetch_snapshot(&self, symbol: &str, limit: Option<usize>) -> Result<BookSnapshot, StreamError> {
        let url = (self.endpoint)(symbol, limit);
        let classify = |e: reqwest::Error| {
            if e.is_timeout() {
                StreamError::timeout(&url, e.to_string())
            } else {
                StreamError::network(&url, e.to_string())
            }
        };

        let body: serde_json::Value = self
            .http
            .get(&url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(classify)?
            .json()
            .await
            .map_err(classify)?;

        tracing::debug!(symbol, url = %cm_core::logging::redact_url(&url), "fetched order book snapshot");
        (self.parser)(symbol, body)
    }
}
