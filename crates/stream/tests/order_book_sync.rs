//! Order book reconciliation end to end: REST seeding, cached delta replay,
//! resync after gaps and checksum mismatches, and teardown when no snapshot
//! lines up.

mod common;

use std::sync::Arc;

use rust_decimal::Decimal;
use serde_json::json;

use cm_stream::orderbook::DEFAULT_CHECKSUM_DEPTH;
use cm_stream::{BookKind, Frame, MarketEvent, OrderBook, OrderBookView, StreamError};
use common::{delta_msg, fast_config, harness, snapshot, Harness, ScriptedSnapshots, URL};

const SYMBOL: &str = "BTC/USDT";
const HASH: &str = "book:BTC/USDT";

fn watch_book(h: &Harness) -> cm_stream::Deferred<MarketEvent> {
    h.coordinator.watch_order_book(
        URL,
        SYMBOL,
        BookKind::Aggregated,
        None,
        HASH,
        Some(Frame::json(&json!({"op": "subscribe", "topic": "depth.BTCUSDT"}))),
        HASH,
        None,
    )
}

async fn view(wait: cm_stream::Deferred<MarketEvent>) -> Arc<OrderBookView> {
    match wait.wait().await {
        Ok(MarketEvent::OrderBook(view)) => view,
        other => panic!("expected a book, got {other:?}"),
    }
}

fn bid_amount(view: &OrderBookView, price: i64) -> Option<Decimal> {
    view.bids
        .iter()
        .find(|level| level.price == Decimal::from(price))
        .map(|level| level.amount)
}

#[tokio::test]
async fn test_snapshot_replays_only_deltas_after_its_nonce() {
    let n = 500;
    let snapshots = ScriptedSnapshots::new(vec![snapshot(n)]);
    let mut h = harness(fast_config(), Some(snapshots.clone()));
    let wait = watch_book(&h);
    let peer = h.next_peer().await;

    // N-2..N+2 out of order, with a duplicate.
    for nonce in [n + 1, n - 2, n, n + 2, n - 1, n + 1] {
        peer.push(delta_msg(SYMBOL, nonce));
    }

    let book = view(wait).await;
    assert_eq!(book.nonce, Some(n + 2));
    assert_eq!(bid_amount(&book, 99), Some(Decimal::from(n + 2)));
    assert_eq!(bid_amount(&book, 100), Some(Decimal::from(1)));
    assert_eq!(snapshots.fetches(), 1);

    // Live deltas continue the sequence.
    let next = watch_book(&h);
    peer.push(delta_msg(SYMBOL, n + 3));
    assert_eq!(view(next).await.nonce, Some(n + 3));
    assert_eq!(
        h.coordinator.order_book_view(SYMBOL, None).unwrap().nonce,
        Some(n + 3)
    );
}

#[tokio::test]
async fn test_pushed_snapshot_seeds_without_rest() {
    let mut h = harness(fast_config(), None);
    let wait = watch_book(&h);
    let peer = h.next_peer().await;

    peer.push(json!({
        "topic": "snapshot",
        "symbol": SYMBOL,
        "u": 5,
        "bids": [["100", "2"]],
        "asks": [["101", "3"]],
    }));
    let seeded = view(wait).await;
    assert_eq!(seeded.nonce, Some(5));
    assert_eq!(seeded.mid_price(), Some(Decimal::new(1005, 1)));

    let next = watch_book(&h);
    peer.push(delta_msg(SYMBOL, 6));
    let updated = view(next).await;
    assert_eq!(updated.nonce, Some(6));
    assert_eq!(bid_amount(&updated, 99), Some(Decimal::from(6)));
}

#[tokio::test]
async fn test_nonce_gap_resyncs_from_fresh_snapshot() {
    let snapshots = ScriptedSnapshots::new(vec![snapshot(10), snapshot(12)]);
    let mut h = harness(fast_config(), Some(snapshots.clone()));
    let wait = watch_book(&h);
    let peer = h.next_peer().await;

    peer.push(delta_msg(SYMBOL, 11));
    assert_eq!(view(wait).await.nonce, Some(11));

    // 12 is lost; 13 arrives, gets cached and is replayed on the new snapshot.
    let after_gap = watch_book(&h);
    peer.push(delta_msg(SYMBOL, 13));
    let book = view(after_gap).await;
    assert_eq!(book.nonce, Some(13));
    assert_eq!(bid_amount(&book, 99), Some(Decimal::from(13)));
    assert_eq!(snapshots.fetches(), 2);
}

#[tokio::test]
async fn test_checksum_mismatch_resyncs() {
    let snapshots = ScriptedSnapshots::new(vec![snapshot(10), snapshot(20)]);
    let mut h = harness(fast_config(), Some(snapshots.clone()));
    let wait = watch_book(&h);
    let peer = h.next_peer().await;

    // Checksum the exchange would publish after delta 11.
    let mut replica = OrderBook::from_snapshot(snapshot(10), BookKind::Aggregated, None);
    let mut good = delta_msg(SYMBOL, 11);
    replica
        .apply(cm_stream::BookDelta {
            first_nonce: 11,
            last_nonce: 11,
            bids: vec![cm_stream::Level::new(Decimal::from(99), Decimal::from(11))],
            asks: vec![],
            timestamp: None,
            checksum: None,
        })
        .unwrap();
    good["checksum"] = json!(replica.checksum(DEFAULT_CHECKSUM_DEPTH));

    // The first delta kicks off the REST seed; 11 is replayed and verified.
    peer.push(delta_msg(SYMBOL, 10));
    peer.push(good);
    assert_eq!(view(wait).await.nonce, Some(11));

    let mut bad = delta_msg(SYMBOL, 12);
    bad["checksum"] = json!(1);
    let resynced = watch_book(&h);
    peer.push(bad);
    let book = view(resynced).await;
    assert_eq!(book.nonce, Some(20));
    assert_eq!(bid_amount(&book, 99), None);
    assert_eq!(snapshots.fetches(), 2);
}

#[tokio::test]
async fn test_checksum_check_can_be_disabled() {
    let mut config = fast_config();
    config.order_book.checksum = false;
    let snapshots = ScriptedSnapshots::new(vec![snapshot(10)]);
    let mut h = harness(config, Some(snapshots.clone()));
    let wait = watch_book(&h);
    let peer = h.next_peer().await;

    let mut wrong = delta_msg(SYMBOL, 11);
    wrong["checksum"] = json!(1);
    peer.push(wrong);
    assert_eq!(view(wait).await.nonce, Some(11));
    assert_eq!(snapshots.fetches(), 1);
}

#[tokio::test]
async fn test_exhausted_retries_tear_down_subscription() {
    let mut config = fast_config();
    config.order_book.max_retries = 3;
    // Always older than the cached deltas.
    let snapshots = ScriptedSnapshots::new(vec![snapshot(1)]);
    let mut h = harness(config, Some(snapshots.clone()));
    let wait = watch_book(&h);
    let mut peer = h.next_peer().await;
    assert_eq!(peer.next_sent().await["topic"], "depth.BTCUSDT");

    peer.push(delta_msg(SYMBOL, 50));
    peer.push(delta_msg(SYMBOL, 51));

    match wait.wait().await {
        Err(StreamError::Consistency { symbol, reason }) => {
            assert_eq!(symbol, SYMBOL);
            assert!(reason.contains("3 attempts"), "{reason}");
        }
        other => panic!("expected consistency error, got {other:?}"),
    }
    assert_eq!(snapshots.fetches(), 3);
    assert!(h.coordinator.order_book_view(SYMBOL, None).is_none());
    assert!(h.coordinator.last_event(HASH).is_none());
    let client = h.coordinator.client(URL);
    assert!(client.subscription(HASH).is_none());

    // The next watch subscribes from scratch.
    let again = watch_book(&h);
    assert_eq!(peer.next_sent().await["topic"], "depth.BTCUSDT");
    assert!(again.is_pending());
}

#[tokio::test]
async fn test_unwatch_drops_book() {
    let snapshots = ScriptedSnapshots::new(vec![snapshot(10)]);
    let mut h = harness(fast_config(), Some(snapshots));
    let wait = watch_book(&h);
    let peer = h.next_peer().await;
    peer.push(delta_msg(SYMBOL, 11));
    view(wait).await;
    assert!(h.coordinator.order_book_view(SYMBOL, None).is_some());

    h.coordinator.unwatch(URL, &[HASH], &[HASH], None).await.unwrap();
    assert!(h.coordinator.order_book_view(SYMBOL, None).is_none());
    assert!(h.coordinator.last_event(HASH).is_none());
}
