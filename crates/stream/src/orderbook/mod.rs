//! Incremental order book replica.
//!
//! A book starts unsynced: deltas are parked in a cache until a snapshot
//! arrives. [`OrderBook::sync`] then locates the first cached delta that
//! continues the snapshot ([`cache_index`]), drops everything older, applies
//! the rest and clears the cache, all in one call. After that every delta
//! must continue the nonce sequence. A gap or a checksum mismatch drops the
//! book back to the unsynced state and is returned as an [`OrderBookError`];
//! the owner then resyncs from a fresh snapshot.

pub mod checksum;
pub mod side;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub use checksum::{checksum_payload, crc32_checksum, DEFAULT_CHECKSUM_DEPTH};
pub use side::{BookKind, Level, OrderBookSide, SideKind};

/// Errors that force a resync.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrderBookError {
    /// A delta skipped ahead of the current nonce.
    #[error("nonce gap: expected {expected}, received {received}")]
    NonceGap { expected: u64, received: u64 },
    /// The recomputed checksum differs from the exchange's.
    #[error("checksum mismatch: exchange {expected}, computed {computed}")]
    ChecksumMismatch { expected: u32, computed: u32 },
    /// The snapshot predates every cached delta, so the gap between them
    /// cannot be filled.
    #[error("snapshot {snapshot} is older than the first cached delta {first_cached}")]
    SnapshotTooOld { snapshot: u64, first_cached: u64 },
}

/// Full book state used to seed or reseed a replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub symbol: String,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
    /// Sequence number of the last update included.
    pub nonce: Option<u64>,
    pub timestamp: Option<i64>,
}

/// One incremental update message.
///
/// Exchanges that number each message with a single sequence id set
/// `first_nonce == last_nonce`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookDelta {
    pub first_nonce: u64,
    pub last_nonce: u64,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
    pub timestamp: Option<i64>,
    /// Exchange checksum of the book after this delta.
    pub checksum: Option<u32>,
}

/// Outcome of [`OrderBook::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// No snapshot yet; the delta was cached.
    Cached,
    /// Already covered by the current nonce; ignored.
    Stale,
    /// Levels were stored and the nonce advanced.
    Applied,
}

/// Point-in-time copy of a book handed to readers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookView {
    pub symbol: String,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
    pub nonce: Option<u64>,
    pub timestamp: Option<i64>,
}

impl OrderBookView {
    pub fn best_bid(&self) -> Option<&Level> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&Level> {
        self.asks.first()
    }

    /// `(best_bid + best_ask) / 2`, if both sides are present.
    pub fn mid_price(&self) -> Option<Decimal> {
        Some((self.best_bid()?.price + self.best_ask()?.price) / Decimal::TWO)
    }
}

/// Locate the first delta in `cache` (sorted by nonce) that continues a
/// snapshot taken at `snapshot_nonce`.
///
/// - `None`: the snapshot is older than the first cached delta; fetch again.
/// - `Some(i)`: deltas before `i` are stale; `cache[i..]` must be applied.
/// - `Some(cache.len())`: the snapshot is newer than everything cached.
pub fn cache_index(snapshot_nonce: u64, cache: &[BookDelta]) -> Option<usize> {
    let first = match cache.first() {
        Some(first) => first,
        None => return Some(0),
    };
    if snapshot_nonce.saturating_add(1) < first.first_nonce {
        return None;
    }
    let index = cache
        .iter()
        .position(|delta| {
            delta.first_nonce <= snapshot_nonce.saturating_add(1) && delta.last_nonce > snapshot_nonce
        })
        .unwrap_or(cache.len());
    Some(index)
}

/// Incremental order book for one symbol.
#[derive(Debug, Clone)]
pub struct OrderBook {
    symbol: String,
    kind: BookKind,
    /// Default depth for views; `None` is unlimited.
    depth: Option<usize>,
    bids: OrderBookSide,
    asks: OrderBookSide,
    nonce: Option<u64>,
    timestamp: Option<i64>,
    cache: Vec<BookDelta>,
    synced: bool,
}

impl OrderBook {
    /// Empty, unsynced book.
    pub fn new(symbol: impl Into<String>, kind: BookKind, depth: Option<usize>) -> Self {
        Self {
            symbol: symbol.into(),
            kind,
            depth,
            bids: OrderBookSide::new(SideKind::Bids, kind),
            asks: OrderBookSide::new(SideKind::Asks, kind),
            nonce: None,
            timestamp: None,
            cache: Vec::new(),
            synced: false,
        }
    }

    /// Book seeded from `snapshot`.
    pub fn from_snapshot(snapshot: BookSnapshot, kind: BookKind, depth: Option<usize>) -> Self {
        let mut book = Self::new(snapshot.symbol.clone(), kind, depth);
        book.reset(snapshot);
        book
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn kind(&self) -> BookKind {
        self.kind
    }

    pub fn nonce(&self) -> Option<u64> {
        self.nonce
    }

    pub fn timestamp(&self) -> Option<i64> {
        self.timestamp
    }

    /// True once a snapshot has been applied.
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Deltas waiting for a snapshot.
    pub fn cached(&self) -> &[BookDelta] {
        &self.cache
    }

    /// Replace both sides with `snapshot`, record its nonce and clear the
    /// delta cache.
    pub fn reset(&mut self, snapshot: BookSnapshot) {
        self.bids.clear();
        self.asks.clear();
        for level in snapshot.bids {
            self.bids.store(level);
        }
        for level in snapshot.asks {
            self.asks.store(level);
        }
        self.nonce = snapshot.nonce;
        self.timestamp = snapshot.timestamp;
        self.cache.clear();
        self.synced = true;
    }

    /// Drop all state and start caching again.
    pub fn invalidate(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.nonce = None;
        self.timestamp = None;
        self.cache.clear();
        self.synced = false;
    }

    /// Apply `delta`, verifying any exchange checksum with the default CRC32
    /// over the top 25 levels.
    pub fn apply(&mut self, delta: BookDelta) -> Result<Applied, OrderBookError> {
        self.apply_with(delta, &|book: &OrderBook| book.checksum(DEFAULT_CHECKSUM_DEPTH))
    }

    /// Apply `delta`, verifying any exchange checksum with `checksum`.
    ///
    /// On error the book is invalidated. A delta that skipped ahead stays in
    /// the cache for the next snapshot.
    pub fn apply_with(
        &mut self,
        delta: BookDelta,
        checksum: &dyn Fn(&OrderBook) -> u32,
    ) -> Result<Applied, OrderBookError> {
        if !self.synced {
            self.cache.push(delta);
            return Ok(Applied::Cached);
        }

        if let Some(nonce) = self.nonce {
            if delta.last_nonce <= nonce {
                tracing::trace!(
                    symbol = %self.symbol,
                    received = delta.last_nonce,
                    last = nonce,
                    "dropping stale book delta"
                );
                return Ok(Applied::Stale);
            }
            if delta.first_nonce > nonce.saturating_add(1) {
                let error = OrderBookError::NonceGap {
                    expected: nonce.saturating_add(1),
                    received: delta.first_nonce,
                };
                // Back to caching; the next snapshot may still need this delta.
                self.invalidate();
                self.cache.push(delta);
                return Err(error);
            }
        }

        for level in delta.bids {
            self.bids.store(level);
        }
        for level in delta.asks {
            self.asks.store(level);
        }
        self.nonce = Some(delta.last_nonce);
        if delta.timestamp.is_some() {
            self.timestamp = delta.timestamp;
        }

        if let Some(expected) = delta.checksum {
            let computed = checksum(self);
            if computed != expected {
                self.invalidate();
                return Err(OrderBookError::ChecksumMismatch { expected, computed });
            }
        }
        Ok(Applied::Applied)
    }

    /// [`sync_with`](Self::sync_with) using the default checksum.
    pub fn sync(&mut self, snapshot: BookSnapshot) -> Result<usize, OrderBookError> {
        self.sync_with(snapshot, &|book: &OrderBook| book.checksum(DEFAULT_CHECKSUM_DEPTH))
    }

    /// Seed the book from `snapshot` and replay the cached deltas that follow
    /// it. Returns how many deltas were applied.
    ///
    /// If the snapshot is older than every cached delta the book is left
    /// untouched (cache included) and [`OrderBookError::SnapshotTooOld`] is
    /// returned so the caller can fetch a newer one.
    pub fn sync_with(
        &mut self,
        snapshot: BookSnapshot,
        checksum: &dyn Fn(&OrderBook) -> u32,
    ) -> Result<usize, OrderBookError> {
        let mut cache = std::mem::take(&mut self.cache);
        cache.sort_by_key(|delta| (delta.first_nonce, delta.last_nonce));

        let index = match snapshot.nonce {
            Some(nonce) => match cache_index(nonce, &cache) {
                Some(index) => index,
                None => {
                    let first_cached = cache[0].first_nonce;
                    self.cache = cache;
                    return Err(OrderBookError::SnapshotTooOld {
                        snapshot: nonce,
                        first_cached,
                    });
                }
            },
            None => 0,
        };

        self.reset(snapshot);
        let mut applied = 0;
        let mut pending = cache.into_iter().skip(index);
        for delta in pending.by_ref() {
            match self.apply_with(delta, checksum) {
                Ok(Applied::Applied) => applied += 1,
                Ok(_) => {}
                Err(error) => {
                    self.cache.extend(pending);
                    return Err(error);
                }
            }
        }
        tracing::debug!(
            symbol = %self.symbol,
            nonce = ?self.nonce,
            skipped = index,
            applied,
            "order book synced from snapshot"
        );
        Ok(applied)
    }

    /// Bids best-first, up to `depth` (default: the book's depth).
    pub fn bids(&self, depth: Option<usize>) -> Vec<Level> {
        self.bids.top(depth.or(self.depth))
    }

    /// Asks best-first, up to `depth` (default: the book's depth).
    pub fn asks(&self, depth: Option<usize>) -> Vec<Level> {
        self.asks.top(depth.or(self.depth))
    }

    pub fn bid_side(&self) -> &OrderBookSide {
        &self.bids
    }

    pub fn ask_side(&self) -> &OrderBookSide {
        &self.asks
    }

    /// Returns the highest bid level, if any.
    pub fn best_bid(&self) -> Option<Level> {
        self.bids.best()
    }

    /// Returns the lowest ask level, if any.
    pub fn best_ask(&self) -> Option<Level> {
        self.asks.best()
    }

    /// Returns the mid-price: (best_bid + best_ask) / 2.
    pub fn mid_price(&self) -> Option<Decimal> {
        Some((self.best_bid()?.price + self.best_ask()?.price) / Decimal::TWO)
    }

    /// Returns the spread: best_ask - best_bid.
    pub fn spread(&self) -> Option<Decimal> {
        Some(self.best_ask()?.price - self.best_bid()?.price)
    }

    /// Spread in basis points of the mid-price.
    pub fn spread_bps(&self) -> Option<f64> {
        let mid = self.mid_price()?;
        if mid.is_zero() {
            return None;
        }
        (self.spread()? / mid * Decimal::from(10_000)).to_f64()
    }

    /// Returns `true` if the book is crossed (best_bid >= best_ask).
    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => bid.price >= ask.price,
            _ => false,
        }
    }

    /// Returns `(bid_level_count, ask_level_count)`.
    pub fn level_count(&self) -> (usize, usize) {
        (self.bids.len(), self.asks.len())
    }

    /// CRC32 over the top `depth` levels of each side.
    pub fn checksum(&self, depth: usize) -> u32 {
        crc32_checksum(&self.bids.top(Some(depth)), &self.asks.top(Some(depth)))
    }

    /// Point-in-time copy limited to `depth` (default: the book's depth).
    pub fn view(&self, depth: Option<usize>) -> OrderBookView {
        OrderBookView {
            symbol: self.symbol.clone(),
            bids: self.bids(depth),
            asks: self.asks(depth),
            nonce: self.nonce,
            timestamp: self.timestamp,
        }
    }
}
