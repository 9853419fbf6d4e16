//! One side of an order book.
//!
//! Levels live in a [`BTreeMap`] keyed by `(price, order id)`; the id part is
//! only populated for [`BookKind::Indexed`] books. Bids iterate the map in
//! reverse so both sides yield the best price first.

use std::collections::{BTreeMap, HashMap};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Granularity of the levels a book keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookKind {
    /// Price -> amount.
    Aggregated,
    /// Price -> amount and number of orders at that price.
    Counted,
    /// Order id -> price and amount; supports per-order removal.
    Indexed,
}

/// Bid or ask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SideKind {
    /// Buy side, highest price first.
    Bids,
    /// Sell side, lowest price first.
    Asks,
}

/// A price level or, for indexed books, a single resting order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Level {
    pub price: Decimal,
    pub amount: Decimal,
    /// Order count at this price (counted books).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    /// Exchange order id (indexed books).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl Level {
    /// Aggregated level.
    pub fn new(price: Decimal, amount: Decimal) -> Self {
        Self {
            price,
            amount,
            count: None,
            id: None,
        }
    }

    /// Level with an order count.
    pub fn counted(price: Decimal, amount: Decimal, count: u32) -> Self {
        Self {
            count: Some(count),
            ..Self::new(price, amount)
        }
    }

    /// Single order keyed by exchange id.
    pub fn order(id: impl Into<String>, price: Decimal, amount: Decimal) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::new(price, amount)
        }
    }
}

type LevelKey = (Decimal, Option<String>);

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    amount: Decimal,
    count: Option<u32>,
}

/// Sorted levels for one side of the book.
#[derive(Debug, Clone)]
pub struct OrderBookSide {
    side: SideKind,
    kind: BookKind,
    levels: BTreeMap<LevelKey, Entry>,
    /// Indexed books only: order id -> current price.
    orders: HashMap<String, Decimal>,
}

impl OrderBookSide {
    pub fn new(side: SideKind, kind: BookKind) -> Self {
        Self {
            side,
            kind,
            levels: BTreeMap::new(),
            orders: HashMap::new(),
        }
    }

    pub fn side(&self) -> SideKind {
        self.side
    }

    /// Set a level (never adds to it). A zero amount, or a zero count on a
    /// counted book, removes it. For indexed books an order that moved price
    /// is removed from its old level first.
    pub fn store(&mut self, level: Level) {
        match self.kind {
            BookKind::Aggregated => {
                let key = (level.price, None);
                if level.amount.is_zero() {
                    self.levels.remove(&key);
                } else {
                    self.levels.insert(
                        key,
                        Entry {
                            amount: level.amount,
                            count: None,
                        },
                    );
                }
            }
            BookKind::Counted => {
                let key = (level.price, None);
                if level.amount.is_zero() || level.count == Some(0) {
                    self.levels.remove(&key);
                } else {
                    self.levels.insert(
                        key,
                        Entry {
                            amount: level.amount,
                            count: level.count,
                        },
                    );
                }
            }
            BookKind::Indexed => {
                let id = level.id.unwrap_or_else(|| level.price.to_string());
                if let Some(old_price) = self.orders.remove(&id) {
                    self.levels.remove(&(old_price, Some(id.clone())));
                }
                if !level.amount.is_zero() {
                    self.orders.insert(id.clone(), level.price);
                    self.levels.insert(
                        (level.price, Some(id)),
                        Entry {
                            amount: level.amount,
                            count: None,
                        },
                    );
                }
            }
        }
    }

    /// Drop every level.
    pub fn clear(&mut self) {
        self.levels.clear();
        self.orders.clear();
    }

    /// Number of levels (orders, for indexed books).
    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Levels best-first.
    pub fn iter(&self) -> Box<dyn Iterator<Item = Level> + '_> {
        let to_level = |((price, id), entry): (&LevelKey, &Entry)| Level {
            price: *price,
            amount: entry.amount,
            count: entry.count,
            id: id.clone(),
        };
        match self.side {
            SideKind::Bids => Box::new(self.levels.iter().rev().map(to_level)),
            SideKind::Asks => Box::new(self.levels.iter().map(to_level)),
        }
    }

    /// Best level.
    pub fn best(&self) -> Option<Level> {
        self.iter().next()
    }

    /// Up to `depth` levels best-first; `None` returns all of them.
    pub fn top(&self, depth: Option<usize>) -> Vec<Level> {
        self.iter().take(depth.unwrap_or(usize::MAX)).collect()
    }

    /// Total amount over the top `depth` levels.
    pub fn volume(&self, depth: usize) -> Decimal {
        self.iter().take(depth).map(|level| level.amount).sum()
    }
}
