//! In-memory exchange used by the integration tests.
//!
//! `MockTransport` hands each opened connection to the test as a [`Peer`]
//! (frames the client sent, plus a sender for frames the "exchange" pushes).
//! `JsonProtocol` speaks a small JSON dialect:
//!
//! - `{"topic":"ticker","symbol":S,"price":P}` resolves `ticker:S`
//! - `{"topic":"trades","symbol":S,"id":I,"price":P,"amount":A,"side":"buy"}` resolves `trades:S`
//! - `{"topic":"book","symbol":S,"U":first,"u":last,"bids":[[p,a]],"asks":[],"checksum":c}`
//!   is a delta for `book:S`
//! - `{"topic":"snapshot","symbol":S,"u":n,"bids":..,"asks":..}` is a pushed snapshot
//! - `{"error":msg,"hash":H}` rejects `H`
//! - `{"pong":true}` answers the keepalive ping `{"op":"ping"}`

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use cm_core::config::StreamConfig;
use cm_core::types::{now_millis, Side, Trade};
use cm_stream::protocol::{ExchangeProtocol, Inbound, SnapshotSource};
use cm_stream::transport::{FrameSink, FrameStream, Transport};
use cm_stream::{BookDelta, BookSnapshot, Frame, Level, MarketEvent, StreamCoordinator, StreamError};

pub const URL: &str = "wss://stream.mock-exchange.test/ws";

// ── Transport ──────────────────────────────────────────────────────────

/// Test side of one opened connection.
pub struct Peer {
    pub sent: mpsc::UnboundedReceiver<Frame>,
    pub inbound: mpsc::UnboundedSender<Result<Frame, StreamError>>,
}

impl Peer {
    /// Push a JSON text frame to the client.
    pub fn push(&self, value: Value) {
        let _ = self.inbound.send(Ok(Frame::Text(value.to_string())));
    }

    /// Next frame the client sent, parsed as JSON.
    pub async fn next_sent(&mut self) -> Value {
        let frame = self.sent.recv().await.expect("client sink dropped");
        let text = frame.as_text().expect("text frame");
        serde_json::from_str(text).expect("json frame")
    }

    /// Frames already sent and not yet read.
    pub fn drain_sent(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.sent.try_recv() {
            if let Some(text) = frame.as_text() {
                frames.push(serde_json::from_str(text).expect("json frame"));
            }
        }
        frames
    }
}

pub struct MockTransport {
    pub opens: AtomicUsize,
    pub refuse: AtomicBool,
    peers: mpsc::UnboundedSender<Peer>,
}

impl MockTransport {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

struct MockSink(mpsc::UnboundedSender<Frame>);
struct MockStream(mpsc::UnboundedReceiver<Result<Frame, StreamError>>);

#[async_trait]
impl FrameSink for MockSink {
    async fn send(&mut self, frame: Frame) -> Result<(), StreamError> {
        self.0.send(frame).map_err(|_| StreamError::Network {
            url: URL.to_string(),
            reason: "peer gone".to_string(),
        })
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        Ok(())
    }
}

#[async_trait]
impl FrameStream for MockStream {
    async fn next_frame(&mut self) -> Option<Result<Frame, StreamError>> {
        self.0.recv().await
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, url: &str) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>), StreamError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(StreamError::Network {
                url: url.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let _ = self.peers.send(Peer {
            sent: sent_rx,
            inbound: in_tx,
        });
        Ok((Box::new(MockSink(sent_tx)), Box::new(MockStream(in_rx))))
    }
}

// ── Protocol ───────────────────────────────────────────────────────────

pub struct JsonProtocol;

fn decimal(value: &Value) -> Result<Decimal, StreamError> {
    value
        .as_str()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| StreamError::Exchange(format!("bad decimal {value}")))
}

fn levels(value: &Value) -> Result<Vec<Level>, StreamError> {
    value
        .as_array()
        .map(|pairs| {
            pairs
                .iter()
                .map(|pair| Ok(Level::new(decimal(&pair[0])?, decimal(&pair[1])?)))
                .collect()
        })
        .unwrap_or_else(|| Ok(Vec::new()))
}

impl ExchangeProtocol for JsonProtocol {
    fn parse_message(&self, frame: &Frame) -> Result<Vec<Inbound>, StreamError> {
        let text = frame
            .as_text()
            .ok_or_else(|| StreamError::Exchange("unexpected binary frame".into()))?;
        let msg: Value = serde_json::from_str(text).map_err(|e| StreamError::Exchange(e.to_string()))?;

        if msg["pong"].as_bool() == Some(true) {
            return Ok(vec![Inbound::Pong]);
        }
        if let Some(error) = msg["error"].as_str() {
            return Ok(vec![Inbound::Error {
                message_hash: msg["hash"].as_str().map(str::to_string),
                error: StreamError::Exchange(error.to_string()),
            }]);
        }

        let symbol = msg["symbol"].as_str().unwrap_or_default().to_string();
        let item = match msg["topic"].as_str() {
            Some("ticker") => Inbound::Update {
                message_hash: format!("ticker:{symbol}"),
                event: MarketEvent::Json(msg["price"].clone()),
            },
            Some("trades") => Inbound::Update {
                message_hash: format!("trades:{symbol}"),
                event: MarketEvent::Trades(vec![Trade {
                    id: msg["id"].to_string(),
                    price: decimal(&msg["price"])?,
                    amount: decimal(&msg["amount"])?,
                    side: if msg["side"] == "sell" { Side::Sell } else { Side::Buy },
                    timestamp: msg["ts"].as_i64().unwrap_or_else(now_millis),
                    symbol: symbol.clone(),
                }]),
            },
            Some("book") => {
                let last = msg["u"].as_u64().unwrap_or_default();
                Inbound::BookDelta {
                    message_hash: format!("book:{symbol}"),
                    delta: BookDelta {
                        first_nonce: msg["U"].as_u64().unwrap_or(last),
                        last_nonce: last,
                        bids: levels(&msg["bids"])?,
                        asks: levels(&msg["asks"])?,
                        timestamp: None,
                        checksum: msg["checksum"].as_u64().map(|c| c as u32),
                    },
                    symbol,
                }
            }
            Some("snapshot") => Inbound::BookSnapshot {
                message_hash: format!("book:{symbol}"),
                snapshot: BookSnapshot {
                    bids: levels(&msg["bids"])?,
                    asks: levels(&msg["asks"])?,
                    nonce: msg["u"].as_u64(),
                    timestamp: None,
                    symbol,
                },
            },
            other => return Err(StreamError::Exchange(format!("unknown topic {other:?}"))),
        };
        Ok(vec![item])
    }

    fn subscribe_frame(&self, topic: &str, params: &Value) -> Option<Frame> {
        Some(Frame::json(&json!({"op": "subscribe", "topic": topic, "params": params})))
    }

    fn unsubscribe_frame(&self, topic: &str, params: &Value) -> Option<Frame> {
        Some(Frame::json(&json!({"op": "unsubscribe", "topic": topic, "params": params})))
    }

    fn ping_frame(&self) -> Frame {
        Frame::json(&json!({"op": "ping"}))
    }
}

// ── Snapshots ──────────────────────────────────────────────────────────

/// Serves the queued snapshots in order, repeating the last one.
pub struct ScriptedSnapshots {
    queue: Mutex<VecDeque<BookSnapshot>>,
    pub fetches: AtomicUsize,
}

impl ScriptedSnapshots {
    pub fn new(snapshots: Vec<BookSnapshot>) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(snapshots.into()),
            fetches: AtomicUsize::new(0),
        })
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotSource for ScriptedSnapshots {
    async fn fetch_snapshot(&self, symbol: &str, _limit: Option<usize>) -> Result<BookSnapshot, StreamError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let mut queue = self.queue.lock();
        let snapshot = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        snapshot
            .map(|s| BookSnapshot {
                symbol: symbol.to_string(),
                ..s
            })
            .ok_or_else(|| StreamError::Exchange("no snapshot scripted".into()))
    }
}

/// Two-level book at `nonce`: bid 100 x 1, ask 101 x 1.
pub fn snapshot(nonce: u64) -> BookSnapshot {
    BookSnapshot {
        symbol: "BTC/USDT".to_string(),
        bids: vec![Level::new(Decimal::from(100), Decimal::from(1))],
        asks: vec![Level::new(Decimal::from(101), Decimal::from(1))],
        nonce: Some(nonce),
        timestamp: None,
    }
}

/// Single-id delta setting the 99 bid to `nonce` units.
pub fn delta_msg(symbol: &str, nonce: u64) -> Value {
    json!({
        "topic": "book",
        "symbol": symbol,
        "u": nonce,
        "bids": [["99", nonce.to_string()]],
        "asks": [],
    })
}

// ── Harness ────────────────────────────────────────────────────────────

pub struct Harness {
    pub coordinator: StreamCoordinator,
    pub transport: Arc<MockTransport>,
    pub peers: mpsc::UnboundedReceiver<Peer>,
}

impl Harness {
    pub async fn next_peer(&mut self) -> Peer {
        self.peers.recv().await.expect("transport dropped")
    }
}

/// No keepalive and buckets deep enough that nothing waits.
pub fn fast_config() -> StreamConfig {
    let mut config = StreamConfig::default();
    config.connection.keepalive_ms = 0;
    config.throttle.capacity = 1_000.0;
    config.throttle.tokens = 1_000.0;
    config.throttle.refill_rate = 1.0;
    config.rest.throttle.capacity = 1_000.0;
    config.rest.throttle.tokens = 1_000.0;
    config.rest.throttle.refill_rate = 1.0;
    config
}

pub fn harness(config: StreamConfig, snapshots: Option<Arc<dyn SnapshotSource>>) -> Harness {
    let (peers_tx, peers) = mpsc::unbounded_channel();
    let transport = Arc::new(MockTransport {
        opens: AtomicUsize::new(0),
        refuse: AtomicBool::new(false),
        peers: peers_tx,
    });
    let mut builder = StreamCoordinator::builder(Arc::new(JsonProtocol))
        .config(config)
        .transport(transport.clone());
    if let Some(source) = snapshots {
        builder = builder.snapshot_source(source);
    }
    Harness {
        coordinator: builder.build(),
        transport,
        peers,
    }
}
