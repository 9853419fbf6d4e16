//! Session-level entry point: one client per URL, subscription
//! de-duplication, routing of parsed messages and order book upkeep.
//!
//! [`StreamCoordinator::watch`] is the whole public contract for streaming
//! callers: it makes sure the URL's [`WsClient`] is connecting, records the
//! subscription once, sends its frame after the connection is up and returns
//! the shared wait for a message hash. Inbound frames go through the
//! injected [`ExchangeProtocol`]; book snapshots and deltas are reconciled
//! here, including the REST resync when a book falls out of sequence.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use cm_core::config::StreamConfig;
use cm_core::logging::redact_url;
use cm_core::types::Trade;
use parking_lot::Mutex;

use crate::cache::TradeCache;
use crate::client::{ClientConfig, ConnectionStatus, MessageHandler, Subscription, WsClient};
use crate::deferred::{race, Deferred};
use crate::error::StreamError;
use crate::event::MarketEvent;
use crate::orderbook::{
    Applied, BookDelta, BookKind, BookSnapshot, OrderBook, OrderBookError, OrderBookView,
};
use crate::protocol::{ExchangeProtocol, Inbound, SnapshotSource};
use crate::reconnect::ReconnectPolicy;
use crate::throttler::Throttler;
use crate::transport::{Frame, Transport, TungsteniteTransport};

/// Builder for [`StreamCoordinator`].
pub struct CoordinatorBuilder {
    protocol: Arc<dyn ExchangeProtocol>,
    transport: Option<Arc<dyn Transport>>,
    snapshots: Option<Arc<dyn SnapshotSource>>,
    config: StreamConfig,
}

impl CoordinatorBuilder {
    pub fn config(mut self, config: StreamConfig) -> Self {
        self.config = config;
        self
    }

    /// Defaults to [`TungsteniteTransport`].
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// REST source used to seed books and to resync them after a gap.
    /// Without one, books must be seeded by snapshots pushed on the stream.
    pub fn snapshot_source(mut self, source: Arc<dyn SnapshotSource>) -> Self {
        self.snapshots = Some(source);
        self
    }

    pub fn build(self) -> StreamCoordinator {
        let config = self.config;
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(TungsteniteTransport));
        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| Shared {
            protocol: self.protocol,
            transport,
            snapshots: self.snapshots,
            client_config: ClientConfig::from(&config.connection),
            reconnect: ReconnectPolicy::from(&config.reconnect),
            rest_throttler: Throttler::new(config.rest.throttle.clone()),
            router: Arc::new(Router {
                shared: weak.clone(),
            }),
            config,
            clients: Mutex::new(HashMap::new()),
            books: Mutex::new(HashMap::new()),
            last_events: Mutex::new(HashMap::new()),
            trades: Mutex::new(HashMap::new()),
            next_load: AtomicU64::new(1),
        });
        StreamCoordinator { shared }
    }
}

/// Owns the client registry and cached market state of one session.
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct StreamCoordinator {
    shared: Arc<Shared>,
}

struct Shared {
    protocol: Arc<dyn ExchangeProtocol>,
    transport: Arc<dyn Transport>,
    snapshots: Option<Arc<dyn SnapshotSource>>,
    config: StreamConfig,
    client_config: ClientConfig,
    reconnect: ReconnectPolicy,
    /// Paces snapshot fetches across every book.
    rest_throttler: Throttler,
    router: Arc<Router>,
    clients: Mutex<HashMap<String, WsClient>>,
    /// Keyed by symbol.
    books: Mutex<HashMap<String, BookEntry>>,
    /// Most recent value per message hash.
    last_events: Mutex<HashMap<String, MarketEvent>>,
    /// Bounded trade history per message hash.
    trades: Mutex<HashMap<String, TradeCache>>,
    next_load: AtomicU64,
}

struct BookEntry {
    book: OrderBook,
    url: String,
    message_hash: String,
    /// Id of the snapshot loader currently responsible for this book.
    loading: Option<u64>,
}

/// What to do once the book lock is released.
enum BookAction {
    Nothing,
    Publish(Arc<OrderBookView>),
    Load(u64),
    Fail(OrderBookError),
}

impl StreamCoordinator {
    pub fn builder(protocol: Arc<dyn ExchangeProtocol>) -> CoordinatorBuilder {
        CoordinatorBuilder {
            protocol,
            transport: None,
            snapshots: None,
            config: StreamConfig::default(),
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.shared.config
    }

    /// Client for `url`, created on first use.
    pub fn client(&self, url: &str) -> WsClient {
        self.shared.client(url)
    }

    // ── Watching ───────────────────────────────────────────────────────

    /// Wait for the next update on `message_hash` from `url`.
    ///
    /// `message` is the subscribe frame. It is sent once per connection for
    /// `subscribe_hash`; with no subscribe hash it is sent on every call.
    /// `subscription` carries the send cost and the symbol whose cached state
    /// the subscription owns.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn watch(
        &self,
        url: &str,
        message_hash: &str,
        message: Option<Frame>,
        subscribe_hash: Option<&str>,
        subscription: Subscription,
    ) -> Deferred<MarketEvent> {
        let client = self.shared.client(url);
        let connected = match self.shared.ensure_connected(&client) {
            Ok(connected) => connected,
            Err(error) => return Deferred::rejected(error),
        };

        let Some(subscribe_hash) = subscribe_hash else {
            if client.has_future(message_hash) {
                return client.future(message_hash);
            }
            let future = client.future(message_hash);
            if let Some(frame) = message {
                spawn_send(client, connected, frame, subscription.cost);
            }
            return future;
        };

        let future = client.future(message_hash);
        let mut record = subscription;
        record.message = message;
        if client.subscribe(subscribe_hash, record) {
            tracing::debug!(
                url = %redact_url(url),
                message_hash,
                subscribe_hash,
                "new subscription"
            );
            let hash = subscribe_hash.to_string();
            tokio::spawn(async move {
                if connected.wait().await.is_err() {
                    return;
                }
                if let Err(error) = client.send_subscription(&hash).await {
                    tracing::debug!(subscribe_hash = %hash, error = %error, "subscribe frame not sent");
                }
            });
        }
        future
    }

    /// Watch several message hashes behind one subscribe frame; the result
    /// settles with whichever hash updates first.
    ///
    /// Cancelling the returned wait cancels the per-hash waits as well, even
    /// if other callers share them.
    pub fn watch_multiple(
        &self,
        url: &str,
        message_hashes: &[&str],
        message: Option<Frame>,
        subscribe_hashes: &[&str],
        subscription: Subscription,
    ) -> Deferred<MarketEvent> {
        let client = self.shared.client(url);
        let connected = match self.shared.ensure_connected(&client) {
            Ok(connected) => connected,
            Err(error) => return Deferred::rejected(error),
        };

        let futures: Vec<_> = message_hashes
            .iter()
            .map(|hash| client.future(hash))
            .collect();

        // The combined frame goes out once; the records only mark the hashes
        // as covered.
        let mut record = subscription.clone();
        record.message = None;
        let newly: Vec<String> = subscribe_hashes
            .iter()
            .filter(|hash| client.subscribe(hash, record.clone()))
            .map(|hash| hash.to_string())
            .collect();

        if subscribe_hashes.is_empty() || !newly.is_empty() {
            if let Some(frame) = message {
                let client = client.clone();
                let cost = subscription.cost;
                tokio::spawn(async move {
                    if connected.wait().await.is_err() {
                        return;
                    }
                    if let Err(error) = client.send_throttled(frame, cost).await {
                        tracing::debug!(error = %error, "subscribe frame not sent");
                        return;
                    }
                    for hash in &newly {
                        let _ = client.send_subscription(hash).await;
                    }
                });
            }
        }
        race(futures)
    }

    /// Watch the reconciled order book for `symbol`.
    ///
    /// The book is registered before subscribing so deltas that arrive ahead
    /// of any snapshot are cached. With a snapshot source configured the first
    /// cached delta triggers the REST seed.
    #[allow(clippy::too_many_arguments)]
    pub fn watch_order_book(
        &self,
        url: &str,
        symbol: &str,
        kind: BookKind,
        depth: Option<usize>,
        message_hash: &str,
        message: Option<Frame>,
        subscribe_hash: &str,
        cost: Option<f64>,
    ) -> Deferred<MarketEvent> {
        self.shared.books.lock().entry(symbol.to_string()).or_insert_with(|| BookEntry {
            book: OrderBook::new(symbol, kind, depth),
            url: url.to_string(),
            message_hash: message_hash.to_string(),
            loading: None,
        });
        let mut subscription = Subscription::new(None).with_symbol(symbol);
        subscription.cost = cost;
        self.watch(url, message_hash, message, Some(subscribe_hash), subscription)
    }

    /// Drop subscriptions and their cached state. Pending waits on
    /// `message_hashes` are rejected with [`StreamError::Unsubscribed`]; the
    /// unsubscribe `message` is sent only if the connection is up.
    pub async fn unwatch(
        &self,
        url: &str,
        message_hashes: &[&str],
        subscribe_hashes: &[&str],
        message: Option<Frame>,
    ) -> Result<(), StreamError> {
        let Some(client) = self.shared.clients.lock().get(url).cloned() else {
            return Ok(());
        };

        let mut symbols = Vec::new();
        for hash in subscribe_hashes {
            if let Some(symbol) = client.unsubscribe(hash).and_then(|s| s.symbol) {
                symbols.push(symbol);
            }
        }
        {
            let mut books = self.shared.books.lock();
            books.retain(|symbol, entry| {
                let owned = symbols.contains(symbol)
                    || (entry.url == url && message_hashes.contains(&entry.message_hash.as_str()));
                !owned
            });
        }
        {
            let mut trades = self.shared.trades.lock();
            let mut last_events = self.shared.last_events.lock();
            for hash in message_hashes {
                trades.remove(*hash);
                last_events.remove(*hash);
            }
        }
        let mut rejected = 0;
        for hash in message_hashes {
            client.discard_rejection(hash);
            if client.reject_if_pending(StreamError::Unsubscribed(hash.to_string()), hash) {
                rejected += 1;
            }
        }
        tracing::debug!(url = %redact_url(url), ?subscribe_hashes, rejected, "unwatched");

        match message {
            Some(frame) if client.status() == ConnectionStatus::Connected => {
                client.send_throttled(frame, None).await
            }
            _ => Ok(()),
        }
    }

    /// Close every client, rejecting their pending waits with
    /// [`StreamError::ClosedByUser`], and forget all cached state.
    pub async fn close(&self) {
        let clients: Vec<WsClient> = self
            .shared
            .clients
            .lock()
            .drain()
            .map(|(_, client)| client)
            .collect();
        for client in &clients {
            client.close().await;
        }
        self.shared.books.lock().clear();
        self.shared.last_events.lock().clear();
        self.shared.trades.lock().clear();
        tracing::info!(clients = clients.len(), "stream coordinator closed");
    }

    // ── Cached state ───────────────────────────────────────────────────

    /// Most recent value delivered for `message_hash`.
    pub fn last_event(&self, message_hash: &str) -> Option<MarketEvent> {
        self.shared.last_events.lock().get(message_hash).cloned()
    }

    /// Trades kept for `message_hash`, oldest first, at most
    /// `cache.trades_limit` of them.
    pub fn trades(&self, message_hash: &str) -> Vec<Trade> {
        self.shared
            .trades
            .lock()
            .get(message_hash)
            .map(TradeCache::to_vec)
            .unwrap_or_default()
    }

    /// Current view of the book for `symbol`, if it is in sync.
    pub fn order_book_view(&self, symbol: &str, depth: Option<usize>) -> Option<OrderBookView> {
        let books = self.shared.books.lock();
        let entry = books.get(symbol)?;
        entry.book.is_synced().then(|| entry.book.view(depth))
    }

    // ── Factories ──────────────────────────────────────────────────────

    /// Aggregated (price → amount) book seeded from `snapshot`.
    pub fn order_book(&self, snapshot: BookSnapshot, depth: Option<usize>) -> OrderBook {
        OrderBook::from_snapshot(snapshot, BookKind::Aggregated, depth)
    }

    /// Book that also tracks the order count per level.
    pub fn counted_order_book(&self, snapshot: BookSnapshot, depth: Option<usize>) -> OrderBook {
        OrderBook::from_snapshot(snapshot, BookKind::Counted, depth)
    }

    /// Book keyed by order id.
    pub fn indexed_order_book(&self, snapshot: BookSnapshot, depth: Option<usize>) -> OrderBook {
        OrderBook::from_snapshot(snapshot, BookKind::Indexed, depth)
    }

    pub fn subscribe_frame(&self, topic: &str, params: &serde_json::Value) -> Option<Frame> {
        self.shared.protocol.subscribe_frame(topic, params)
    }

    pub fn unsubscribe_frame(&self, topic: &str, params: &serde_json::Value) -> Option<Frame> {
        self.shared.protocol.unsubscribe_frame(topic, params)
    }
}

impl std::fmt::Debug for StreamCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamCoordinator")
            .field("clients", &self.shared.clients.lock().len())
            .field("books", &self.shared.books.lock().len())
            .finish()
    }
}

/// Send `frame` once `connected` resolves. Failures end the generation
/// through the client; the caller only sees them via its wait.
fn spawn_send(client: WsClient, connected: Deferred<()>, frame: Frame, cost: Option<f64>) {
    tokio::spawn(async move {
        if connected.wait().await.is_err() {
            return;
        }
        if let Err(error) = client.send_throttled(frame, cost).await {
            tracing::debug!(error = %error, "frame not sent");
        }
    });
}

impl Shared {
    fn client(&self, url: &str) -> WsClient {
        self.clients
            .lock()
            .entry(url.to_string())
            .or_insert_with(|| {
                tracing::debug!(url = %redact_url(url), "creating client");
                WsClient::new(
                    url,
                    Arc::clone(&self.transport),
                    self.router.clone(),
                    self.client_config.clone(),
                    self.config.throttle.clone(),
                )
            })
            .clone()
    }

    /// `connected` wait of the live or opening generation, or a new attempt
    /// delayed by the reconnect backoff.
    fn ensure_connected(&self, client: &WsClient) -> Result<Deferred<()>, StreamError> {
        if client.status() != ConnectionStatus::Disconnected {
            return Ok(client.connect(Duration::ZERO));
        }
        let failures = client.failures();
        let backoff = if failures == 0 {
            Duration::ZERO
        } else {
            self.reconnect
                .delay_for(failures, client.url())
                .ok_or_else(|| {
                    StreamError::network(
                        client.url(),
                        format!(
                            "giving up after {failures} failed connection attempts (max {})",
                            self.reconnect.max_retries
                        ),
                    )
                })?
        };
        Ok(client.connect(backoff))
    }

    /// Append to the hash's history and wake its waiter with every trade it
    /// has not seen, including ones that arrived while nobody waited.
    fn on_trades(&self, client: &WsClient, message_hash: String, trades: Vec<Trade>) {
        let mut caches = self.trades.lock();
        let cache = caches
            .entry(message_hash.clone())
            .or_insert_with(|| TradeCache::new(self.config.cache.trades_limit));
        cache.append(trades);
        let event = MarketEvent::Trades(cache.undelivered());
        self.last_events
            .lock()
            .insert(message_hash.clone(), event.clone());
        if client.resolve(event, &message_hash) {
            cache.mark_delivered();
        } else {
            tracing::trace!(message_hash = %message_hash, held = cache.len(), "trades held for next watch");
        }
    }

    fn route(self: &Arc<Self>, client: &WsClient, item: Inbound) {
        match item {
            Inbound::Update {
                message_hash,
                event: MarketEvent::Trades(trades),
            } => self.on_trades(client, message_hash, trades),
            Inbound::Update {
                message_hash,
                event,
            } => {
                self.last_events
                    .lock()
                    .insert(message_hash.clone(), event.clone());
                client.resolve(event, &message_hash);
            }
            Inbound::BookSnapshot {
                message_hash,
                snapshot,
            } => self.on_book_snapshot(client, message_hash, snapshot),
            Inbound::BookDelta {
                message_hash,
                symbol,
                delta,
            } => self.on_book_delta(client, message_hash, symbol, delta),
            Inbound::Error {
                message_hash,
                error,
            } => {
                tracing::warn!(message_hash = ?message_hash, error = %error, "exchange error");
                client.reject(error, message_hash.as_deref());
            }
            Inbound::Pong => client.on_pong(),
        }
    }

    fn new_entry(&self, url: &str, message_hash: &str, symbol: &str) -> BookEntry {
        let depth = self.config.order_book.depth;
        BookEntry {
            book: OrderBook::new(symbol, BookKind::Aggregated, (depth > 0).then_some(depth)),
            url: url.to_string(),
            message_hash: message_hash.to_string(),
            loading: None,
        }
    }

    fn on_book_snapshot(self: &Arc<Self>, client: &WsClient, message_hash: String, snapshot: BookSnapshot) {
        let symbol = snapshot.symbol.clone();
        let action = {
            let mut books = self.books.lock();
            let entry = books
                .entry(symbol.clone())
                .or_insert_with(|| self.new_entry(client.url(), &message_hash, &symbol));
            entry.message_hash = message_hash.clone();
            let protocol = &self.protocol;
            match entry.book.sync_with(snapshot, &|book: &OrderBook| protocol.checksum(book)) {
                Ok(_) => {
                    entry.loading = None;
                    BookAction::Publish(Arc::new(entry.book.view(None)))
                }
                Err(error) => self.recover(entry, error),
            }
        };
        self.act(client, &message_hash, &symbol, action);
    }

    fn on_book_delta(self: &Arc<Self>, client: &WsClient, message_hash: String, symbol: String, mut delta: BookDelta) {
        if !self.config.order_book.checksum {
            delta.checksum = None;
        }
        let action = {
            let mut books = self.books.lock();
            let entry = books
                .entry(symbol.clone())
                .or_insert_with(|| self.new_entry(client.url(), &message_hash, &symbol));
            let protocol = &self.protocol;
            match entry.book.apply_with(delta, &|book: &OrderBook| protocol.checksum(book)) {
                Ok(Applied::Applied) => BookAction::Publish(Arc::new(entry.book.view(None))),
                Ok(Applied::Stale) => BookAction::Nothing,
                Ok(Applied::Cached) => match (entry.loading, &self.snapshots) {
                    (None, Some(_)) => BookAction::Load(self.start_load(entry)),
                    _ => BookAction::Nothing,
                },
                Err(error) => self.recover(entry, error),
            }
        };
        self.act(client, &message_hash, &symbol, action);
    }

    /// The book already dropped back to caching; hand it to a loader, or fail
    /// if there is nothing to reseed it from.
    fn recover(&self, entry: &mut BookEntry, error: OrderBookError) -> BookAction {
        tracing::warn!(symbol = %entry.book.symbol(), error = %error, "order book out of sync");
        if self.snapshots.is_none() {
            return BookAction::Fail(error);
        }
        match entry.loading {
            Some(_) => BookAction::Nothing,
            None => BookAction::Load(self.start_load(entry)),
        }
    }

    fn start_load(&self, entry: &mut BookEntry) -> u64 {
        let id = self.next_load.fetch_add(1, Ordering::Relaxed);
        entry.loading = Some(id);
        id
    }

    fn act(self: &Arc<Self>, client: &WsClient, message_hash: &str, symbol: &str, action: BookAction) {
        match action {
            BookAction::Nothing => {}
            BookAction::Publish(view) => self.publish(client, message_hash, view),
            BookAction::Load(id) => {
                tokio::spawn(Arc::clone(self).load_order_book(
                    client.clone(),
                    symbol.to_string(),
                    message_hash.to_string(),
                    id,
                ));
            }
            BookAction::Fail(error) => {
                let error = StreamError::consistency(symbol, error.to_string());
                self.teardown_book(client, symbol, message_hash, error);
            }
        }
    }

    fn publish(&self, client: &WsClient, message_hash: &str, view: Arc<OrderBookView>) {
        let event = MarketEvent::OrderBook(view);
        self.last_events
            .lock()
            .insert(message_hash.to_string(), event.clone());
        client.resolve(event, message_hash);
    }

    /// Remove the book, its cached event and the subscriptions owning it, then
    /// reject the wait. The next watch resubscribes from scratch.
    fn teardown_book(&self, client: &WsClient, symbol: &str, message_hash: &str, error: StreamError) {
        self.books.lock().remove(symbol);
        self.last_events.lock().remove(message_hash);
        let dropped = client.unsubscribe_symbol(symbol);
        tracing::error!(symbol, ?dropped, error = %error, "order book torn down");
        client.reject(error, Some(message_hash));
    }

    fn is_loading(&self, symbol: &str, id: u64) -> bool {
        self.books
            .lock()
            .get(symbol)
            .map_or(false, |entry| entry.loading == Some(id))
    }

    /// Fetch snapshots until one lines up with the cached deltas, at most
    /// `order_book.max_retries` times, with no backoff between attempts
    /// beyond the REST throttle.
    async fn load_order_book(self: Arc<Self>, client: WsClient, symbol: String, message_hash: String, id: u64) {
        let Some(source) = self.snapshots.clone() else {
            return;
        };
        let attempts = self.config.order_book.max_retries.max(1);
        let limit = Some(self.config.rest.snapshot_limit);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            self.rest_throttler.throttle(None).await;
            // Unwatched, disconnected or superseded while waiting.
            if !self.is_loading(&symbol, id) {
                return;
            }
            let snapshot = match source.fetch_snapshot(&symbol, limit).await {
                Ok(snapshot) => snapshot,
                Err(error) => {
                    tracing::warn!(symbol = %symbol, attempt, error = %error, "snapshot fetch failed");
                    last_error = error.to_string();
                    continue;
                }
            };

            let outcome = {
                let mut books = self.books.lock();
                let Some(entry) = books.get_mut(&symbol) else {
                    return;
                };
                if entry.loading != Some(id) {
                    return;
                }
                let protocol = &self.protocol;
                match entry.book.sync_with(snapshot, &|book: &OrderBook| protocol.checksum(book)) {
                    Ok(applied) => {
                        entry.loading = None;
                        Ok((applied, Arc::new(entry.book.view(None))))
                    }
                    Err(error) => Err(error),
                }
            };
            match outcome {
                Ok((applied, view)) => {
                    tracing::info!(symbol = %symbol, attempt, applied, "order book synced");
                    self.publish(&client, &message_hash, view);
                    return;
                }
                Err(error) => {
                    tracing::debug!(symbol = %symbol, attempt, error = %error, "snapshot does not line up with cached deltas");
                    last_error = error.to_string();
                }
            }
        }

        let error = StreamError::consistency(
            &symbol,
            format!("no usable snapshot after {attempts} attempts: {last_error}"),
        );
        self.teardown_book(&client, &symbol, &message_hash, error);
    }
}

/// [`MessageHandler`] installed on every client of a coordinator.
///
/// Holds the session weakly; clients outliving their coordinator simply stop
/// routing.
struct Router {
    shared: Weak<Shared>,
}

impl MessageHandler for Router {
    fn handle_message(&self, client: &WsClient, frame: Frame) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let items = match shared.protocol.parse_message(&frame) {
            Ok(items) => items,
            Err(error) => {
                tracing::warn!(url = %redact_url(client.url()), error = %error, "failed to parse message");
                client.reject(error, None);
                return;
            }
        };
        for item in items {
            shared.route(client, item);
        }
    }

    fn ping_frame(&self) -> Frame {
        match self.shared.upgrade() {
            Some(shared) => shared.protocol.ping_frame(),
            None => Frame::Ping(Vec::new()),
        }
    }

    fn on_disconnect(&self, client: &WsClient, _error: &StreamError, dropped: &[(String, Subscription)]) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let mut books = shared.books.lock();
        let before = books.len();
        books.retain(|_, entry| entry.url != client.url());
        tracing::debug!(
            url = %redact_url(client.url()),
            books = before - books.len(),
            subscriptions = dropped.len(),
            "dropped state of lost connection"
        );
    }
}
