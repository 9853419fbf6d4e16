//! Bounded history of streamed trades per message hash.
//!
//! Trades that arrive while nobody waits on their hash are kept and handed
//! to the next waiter together with the update that wakes it, so nothing
//! streamed between two watches is lost. The oldest trades are dropped once
//! the history reaches its limit.

use std::collections::VecDeque;

use cm_core::types::Trade;

#[derive(Debug, Clone)]
pub struct TradeCache {
    limit: usize,
    trades: VecDeque<Trade>,
    /// Trades at the back of `trades` no waiter has received yet.
    undelivered: usize,
}

impl TradeCache {
    /// Empty cache keeping at most `limit` trades (at least one).
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            limit,
            trades: VecDeque::with_capacity(limit.min(1_024)),
            undelivered: 0,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn len(&self) -> usize {
        self.trades.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trades.is_empty()
    }

    /// Add trades in arrival order, evicting the oldest past the limit.
    pub fn append(&mut self, trades: impl IntoIterator<Item = Trade>) {
        for trade in trades {
            self.trades.push_back(trade);
            if self.trades.len() > self.limit {
                self.trades.pop_front();
            }
            self.undelivered = (self.undelivered + 1).min(self.limit);
        }
    }

    /// Trades not yet delivered, oldest first. Does not mark them delivered.
    pub fn undelivered(&self) -> Vec<Trade> {
        let skip = self.trades.len() - self.undelivered;
        self.trades.iter().skip(skip).cloned().collect()
    }

    /// Record that every trade so far reached a waiter.
    pub fn mark_delivered(&mut self) {
        self.undelivered = 0;
    }

    /// Whole history, oldest first.
    pub fn to_vec(&self) -> Vec<Trade> {
        self.trades.iter().cloned().collect()
    }
}
