//! Single-assignment, cancellable completion cell with race-selection.
//!
//! A [`Deferred`] starts pending and is settled exactly once by
//! [`resolve`](Deferred::resolve), [`reject`](Deferred::reject) or
//! [`cancel`](Deferred::cancel). Later calls are no-ops that return `false`.
//! Any number of tasks may [`wait`](Deferred::wait) on clones of the same
//! cell; settling wakes all of them. Dropping a waiter's future only stops
//! that waiter.
//!
//! Settlement is published through a [`tokio::sync::watch`] channel, so a
//! waiter that subscribes after settlement observes the final state on its
//! first poll and never suspends.

use std::fmt;
use std::future::IntoFuture;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{select_all, BoxFuture};
use tokio::sync::watch;

use crate::error::StreamError;

/// State of a [`Deferred`].
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement<T> {
    /// Not settled yet.
    Pending,
    /// Settled with a value.
    Resolved(T),
    /// Settled with an error.
    Rejected(StreamError),
    /// Settled by cancellation.
    Cancelled,
}

impl<T> Settlement<T> {
    fn is_pending(&self) -> bool {
        matches!(self, Settlement::Pending)
    }
}

/// Process-wide settlement order, so a race can tell which member settled
/// first even when it observes several at once.
static SETTLE_SEQ: AtomicU64 = AtomicU64::new(1);

/// Shared, single-assignment completion cell.
///
/// Cloning yields another handle to the same cell.
pub struct Deferred<T> {
    state: Arc<watch::Sender<Settlement<T>>>,
    /// Position in [`SETTLE_SEQ`]; 0 while pending.
    settled_at: Arc<AtomicU64>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            settled_at: Arc::clone(&self.settled_at),
        }
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.state.borrow() {
            Settlement::Pending => "pending",
            Settlement::Resolved(_) => "resolved",
            Settlement::Rejected(_) => "rejected",
            Settlement::Cancelled => "cancelled",
        };
        f.debug_struct("Deferred").field("state", &state).finish()
    }
}

impl<T: Clone + Send + Sync + 'static> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> Deferred<T> {
    /// Create a pending cell.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Settlement::Pending);
        Self {
            state: Arc::new(tx),
            settled_at: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Create a cell that is already rejected.
    pub fn rejected(error: StreamError) -> Self {
        let deferred = Self::new();
        deferred.reject(error);
        deferred
    }

    /// Create a cell that rejects with `error` after `delay`.
    ///
    /// Racing it against another cell gives that wait a deadline. Must be
    /// called from within a Tokio runtime.
    pub fn reject_after(delay: Duration, error: StreamError) -> Self {
        let deferred = Self::new();
        let timer = deferred.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    timer.reject(error);
                }
                _ = timer.settlement() => {}
            }
        });
        deferred
    }

    /// Settle with `value`. Returns `false` if already settled.
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Settlement::Resolved(value))
    }

    /// Settle with `error`. Returns `false` if already settled.
    pub fn reject(&self, error: StreamError) -> bool {
        self.settle(Settlement::Rejected(error))
    }

    /// Settle as cancelled. Returns `false` if already settled.
    pub fn cancel(&self) -> bool {
        self.settle(Settlement::Cancelled)
    }

    fn settle(&self, outcome: Settlement<T>) -> bool {
        let mut outcome = Some(outcome);
        self.state.send_if_modified(|state| {
            if !state.is_pending() {
                return false;
            }
            if let Some(outcome) = outcome.take() {
                *state = outcome;
            }
            // Stamped under the channel's write lock, before any waiter sees
            // the new state.
            self.settled_at
                .store(SETTLE_SEQ.fetch_add(1, Ordering::SeqCst), Ordering::SeqCst);
            true
        })
    }

    /// True until the cell is settled.
    pub fn is_pending(&self) -> bool {
        self.state.borrow().is_pending()
    }

    /// True if the cell was settled by [`cancel`](Self::cancel).
    pub fn is_cancelled(&self) -> bool {
        matches!(*self.state.borrow(), Settlement::Cancelled)
    }

    /// Current state without waiting.
    pub fn peek(&self) -> Settlement<T> {
        self.state.borrow().clone()
    }

    /// Whether two handles point at the same cell.
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    /// Wait for the terminal state.
    pub async fn settlement(&self) -> Settlement<T> {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let settled = match rx.wait_for(|state| !state.is_pending()).await {
            Ok(state) => state.clone(),
            Err(_) => Settlement::Rejected(StreamError::ClosedByUser),
        };
        settled
    }

    /// Resolved or rejected outcome together with its settlement order.
    fn outcome(&self) -> Option<(u64, Settlement<T>)> {
        let state = self.state.borrow();
        match &*state {
            Settlement::Resolved(_) | Settlement::Rejected(_) => {
                Some((self.settled_at.load(Ordering::SeqCst), (*state).clone()))
            }
            Settlement::Pending | Settlement::Cancelled => None,
        }
    }

    /// Wait for the value.
    ///
    /// A cancelled cell yields [`StreamError::Cancelled`]. An already settled
    /// cell returns on the first poll.
    pub async fn wait(&self) -> Result<T, StreamError> {
        match self.settlement().await {
            Settlement::Resolved(value) => Ok(value),
            Settlement::Rejected(error) => Err(error),
            Settlement::Cancelled | Settlement::Pending => Err(StreamError::Cancelled),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> IntoFuture for Deferred<T> {
    type Output = Result<T, StreamError>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.wait().await })
    }
}

/// Settle with whichever member settles first.
///
/// - A resolved or rejected member settles the race with the same outcome.
///   When several have settled by the time the race looks, the earliest
///   settlement wins regardless of position in `members`.
/// - Cancelled members, including ones cancelled before the call, are
///   skipped.
/// - If every member is cancelled, or `members` is empty, the race rejects
///   with [`StreamError::ClosedByUser`].
/// - Cancelling the returned cell cancels every member that is still
///   pending, even if other callers also wait on it.
///
/// Must be called from within a Tokio runtime.
pub fn race<T: Clone + Send + Sync + 'static>(members: Vec<Deferred<T>>) -> Deferred<T> {
    let race = Deferred::new();
    let handle = race.clone();
    tokio::spawn(async move {
        let mut members = members;
        loop {
            members.retain(|member| !member.is_cancelled());
            if members.is_empty() {
                handle.reject(StreamError::ClosedByUser);
                return;
            }

            let waits = members.iter().cloned().map(|member| {
                Box::pin(async move { member.settlement().await })
            });

            tokio::select! {
                _ = select_all(waits) => {
                    let first = members
                        .iter()
                        .filter_map(Deferred::outcome)
                        .min_by_key(|(settled_at, _)| *settled_at);
                    match first {
                        Some((_, Settlement::Resolved(value))) => {
                            handle.resolve(value);
                            return;
                        }
                        Some((_, Settlement::Rejected(error))) => {
                            handle.reject(error);
                            return;
                        }
                        // Only cancellations so far; `retain` drops them next pass.
                        _ => {}
                    }
                }
                _ = handle.settlement() => {
                    if handle.is_cancelled() {
                        for member in &members {
                            member.cancel();
                        }
                    }
                    return;
                }
            }
        }
    });
    race
}
