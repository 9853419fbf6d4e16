//! Shared streaming connection with message-hash multiplexing.
//!
//! [`WsClient`] owns at most one physical connection to its URL at a time.
//! Any number of callers wait on it through [`Deferred`]s keyed by message
//! hash; the injected [`MessageHandler`] turns inbound frames into
//! [`resolve`](WsClient::resolve) / [`reject`](WsClient::reject) calls.
//!
//! Each successful [`connect`](WsClient::connect) starts a new *generation*
//! with its own receive and keepalive tasks. When the generation ends (remote
//! close, I/O error, missed pongs) every pending wait is rejected, the
//! subscription records are dropped and the client returns to
//! [`ConnectionStatus::Disconnected`]. It never reconnects by itself.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cm_core::config::{ConnectionConfig, ThrottleConfig};
use cm_core::logging::redact_url;
use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::deferred::Deferred;
use crate::error::StreamError;
use crate::event::MarketEvent;
use crate::throttler::Throttler;
use crate::transport::{Frame, FrameSink, FrameStream, Transport};

/// Errors held for hashes nobody awaits; further ones are dropped.
pub const MAX_QUEUED_REJECTIONS: usize = 1_024;

/// Handshake and keepalive settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Upper bound for opening the transport.
    pub connection_timeout: Duration,
    /// Ping interval; zero disables keepalive.
    pub keepalive: Duration,
    /// Unanswered pings tolerated before the connection is declared dead.
    pub max_ping_pong_misses: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::from(&ConnectionConfig::default())
    }
}

impl From<&ConnectionConfig> for ClientConfig {
    fn from(config: &ConnectionConfig) -> Self {
        Self {
            connection_timeout: Duration::from_millis(config.connection_timeout_ms),
            keepalive: Duration::from_millis(config.keepalive_ms),
            max_ping_pong_misses: config.max_ping_pong_misses,
        }
    }
}

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// A logical subscription sharing the connection.
#[derive(Debug, Clone)]
pub struct Subscription {
    /// Frame sent once per generation; `None` for streams the exchange pushes
    /// unprompted.
    pub message: Option<Frame>,
    /// Throttle cost of sending `message` (default: the bucket's cost).
    pub cost: Option<f64>,
    /// Symbol whose cached state this subscription owns.
    pub symbol: Option<String>,
    sent: bool,
}

impl Subscription {
    pub fn new(message: Option<Frame>) -> Self {
        Self {
            message,
            cost: None,
            symbol: None,
            sent: false,
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }

    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    /// Whether the frame went out on the current generation.
    pub fn is_sent(&self) -> bool {
        self.sent
    }
}

/// Strategy that interprets inbound frames for one client.
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle one data frame. Implementations settle waits through
    /// [`WsClient::resolve`] and [`WsClient::reject`]; they must not block.
    fn handle_message(&self, client: &WsClient, frame: Frame);

    /// Frame sent by the keepalive loop.
    fn ping_frame(&self) -> Frame {
        Frame::Ping(Vec::new())
    }

    /// Called after a generation ended, with the subscriptions it dropped.
    fn on_disconnect(&self, _client: &WsClient, _error: &StreamError, _dropped: &[(String, Subscription)]) {}
}

/// Shared connection for one URL. Cloning yields another handle.
#[derive(Clone)]
pub struct WsClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    url: String,
    transport: Arc<dyn Transport>,
    handler: Arc<dyn MessageHandler>,
    throttler: Throttler,
    config: ClientConfig,
    state: Mutex<ClientState>,
    /// Sink of the live generation, tagged with its generation number.
    sink: tokio::sync::Mutex<Option<(u64, Box<dyn FrameSink>)>>,
}

struct ClientState {
    status: ConnectionStatus,
    generation: u64,
    /// Consecutive failed generations; reset once a handshake succeeds.
    failures: u32,
    missed_pongs: u32,
    futures: HashMap<String, Deferred<MarketEvent>>,
    /// Errors for hashes nobody was waiting on yet.
    rejections: HashMap<String, StreamError>,
    subscriptions: HashMap<String, Subscription>,
    error: Option<StreamError>,
    connected: Option<Deferred<()>>,
    cancel: CancellationToken,
}

impl WsClient {
    pub fn new(
        url: impl Into<String>,
        transport: Arc<dyn Transport>,
        handler: Arc<dyn MessageHandler>,
        config: ClientConfig,
        throttle: ThrottleConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                url: url.into(),
                transport,
                handler,
                throttler: Throttler::new(throttle),
                config,
                state: Mutex::new(ClientState {
                    status: ConnectionStatus::Disconnected,
                    generation: 0,
                    failures: 0,
                    missed_pongs: 0,
                    futures: HashMap::new(),
                    rejections: HashMap::new(),
                    subscriptions: HashMap::new(),
                    error: None,
                    connected: None,
                    cancel: CancellationToken::new(),
                }),
                sink: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.state.lock().status
    }

    /// Connection generation; increases with every `connect` that opens.
    pub fn generation(&self) -> u64 {
        self.inner.state.lock().generation
    }

    /// Consecutive failed connection generations.
    pub fn failures(&self) -> u32 {
        self.inner.state.lock().failures
    }

    /// Error that ended the last generation.
    pub fn last_error(&self) -> Option<StreamError> {
        self.inner.state.lock().error.clone()
    }

    /// Bucket shared by every send over this connection.
    pub fn throttler(&self) -> &Throttler {
        &self.inner.throttler
    }

    // ── Waits ──────────────────────────────────────────────────────────

    /// Pending wait for `message_hash`, created if absent.
    ///
    /// An error queued for the hash by an earlier [`reject`](Self::reject)
    /// is delivered immediately.
    pub fn future(&self, message_hash: &str) -> Deferred<MarketEvent> {
        let mut state = self.inner.state.lock();
        if let Some(error) = state.rejections.remove(message_hash) {
            state.futures.remove(message_hash);
            return Deferred::rejected(error);
        }
        let deferred = state
            .futures
            .entry(message_hash.to_string())
            .or_insert_with(Deferred::new);
        if !deferred.is_pending() {
            *deferred = Deferred::new();
        }
        deferred.clone()
    }

    /// Whether someone is waiting on `message_hash`.
    pub fn has_future(&self, message_hash: &str) -> bool {
        self.inner
            .state
            .lock()
            .futures
            .get(message_hash)
            .map_or(false, Deferred::is_pending)
    }

    /// Message hashes with a pending wait.
    pub fn pending_hashes(&self) -> Vec<String> {
        let state = self.inner.state.lock();
        state
            .futures
            .iter()
            .filter(|(_, deferred)| deferred.is_pending())
            .map(|(hash, _)| hash.clone())
            .collect()
    }

    /// Settle the wait for `message_hash` with `value`. Returns `false` if
    /// nobody was waiting.
    pub fn resolve(&self, value: MarketEvent, message_hash: &str) -> bool {
        let deferred = self.inner.state.lock().futures.remove(message_hash);
        match deferred {
            Some(deferred) => deferred.resolve(value),
            None => false,
        }
    }

    /// Reject the wait for `message_hash`, queueing the error if nobody waits
    /// yet. Without a hash every pending wait is rejected. Returns how many
    /// waits were settled.
    pub fn reject(&self, error: StreamError, message_hash: Option<&str>) -> usize {
        match message_hash {
            Some(hash) => {
                let deferred = {
                    let mut state = self.inner.state.lock();
                    let deferred = state.futures.remove(hash);
                    if deferred.is_none() {
                        if state.rejections.len() < MAX_QUEUED_REJECTIONS
                            || state.rejections.contains_key(hash)
                        {
                            state.rejections.insert(hash.to_string(), error.clone());
                        } else {
                            tracing::debug!(
                                url = %redact_url(&self.inner.url),
                                message_hash = hash,
                                %error,
                                "rejection queue full, dropping error"
                            );
                        }
                    }
                    deferred
                };
                usize::from(deferred.map_or(false, |d| d.reject(error)))
            }
            None => {
                let pending: Vec<_> = self
                    .inner
                    .state
                    .lock()
                    .futures
                    .drain()
                    .map(|(_, deferred)| deferred)
                    .collect();
                pending
                    .into_iter()
                    .filter(|deferred| deferred.reject(error.clone()))
                    .count()
            }
        }
    }

    /// Reject the wait for `message_hash` only if someone is waiting; nothing
    /// is queued.
    pub fn reject_if_pending(&self, error: StreamError, message_hash: &str) -> bool {
        let deferred = self.inner.state.lock().futures.remove(message_hash);
        deferred.map_or(false, |d| d.reject(error))
    }

    /// Drop an error queued for `message_hash`. Returns whether one was held.
    pub fn discard_rejection(&self, message_hash: &str) -> bool {
        self.inner.state.lock().rejections.remove(message_hash).is_some()
    }

    /// Number of errors queued for hashes nobody awaits.
    pub fn queued_rejections(&self) -> usize {
        self.inner.state.lock().rejections.len()
    }

    // ── Subscriptions ──────────────────────────────────────────────────

    /// Record `subscription` under `subscribe_hash` unless one exists.
    /// Returns `true` if it was newly recorded.
    pub fn subscribe(&self, subscribe_hash: &str, subscription: Subscription) -> bool {
        let mut state = self.inner.state.lock();
        if state.subscriptions.contains_key(subscribe_hash) {
            return false;
        }
        state
            .subscriptions
            .insert(subscribe_hash.to_string(), subscription);
        true
    }

    pub fn subscription(&self, subscribe_hash: &str) -> Option<Subscription> {
        self.inner.state.lock().subscriptions.get(subscribe_hash).cloned()
    }

    /// Remove and return a subscription record.
    ///
    /// An error queued for the same hash is dropped with it.
    pub fn unsubscribe(&self, subscribe_hash: &str) -> Option<Subscription> {
        let mut state = self.inner.state.lock();
        state.rejections.remove(subscribe_hash);
        state.subscriptions.remove(subscribe_hash)
    }

    /// Remove every subscription owning `symbol`; returns their hashes.
    pub fn unsubscribe_symbol(&self, symbol: &str) -> Vec<String> {
        let mut state = self.inner.state.lock();
        let hashes: Vec<String> = state
            .subscriptions
            .iter()
            .filter(|(_, sub)| sub.symbol.as_deref() == Some(symbol))
            .map(|(hash, _)| hash.clone())
            .collect();
        for hash in &hashes {
            state.subscriptions.remove(hash);
        }
        hashes
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.state.lock().subscriptions.len()
    }

    /// Send the subscribe frame recorded under `subscribe_hash`, once per
    /// generation, after waiting on the throttler.
    pub async fn send_subscription(&self, subscribe_hash: &str) -> Result<(), StreamError> {
        let (frame, cost) = {
            let mut state = self.inner.state.lock();
            if state.status != ConnectionStatus::Connected {
                return Err(StreamError::network(&self.inner.url, "not connected"));
            }
            match state.subscriptions.get_mut(subscribe_hash) {
                Some(subscription) if !subscription.sent => {
                    subscription.sent = true;
                    (subscription.message.clone(), subscription.cost)
                }
                _ => return Ok(()),
            }
        };
        match frame {
            Some(frame) => {
                tracing::debug!(
                    url = %redact_url(&self.inner.url),
                    subscribe_hash,
                    "sending subscription"
                );
                self.send_throttled(frame, cost).await
            }
            None => Ok(()),
        }
    }

    // ── Connection ─────────────────────────────────────────────────────

    /// Open the connection after `backoff`, unless one is already opening or
    /// open. Returns the generation's `connected` wait.
    pub fn connect(&self, backoff: Duration) -> Deferred<()> {
        let (connected, generation, token) = {
            let mut state = self.inner.state.lock();
            if state.status != ConnectionStatus::Disconnected {
                if let Some(connected) = &state.connected {
                    return connected.clone();
                }
            }
            state.generation += 1;
            state.status = ConnectionStatus::Connecting;
            state.missed_pongs = 0;
            state.cancel = CancellationToken::new();
            let connected = Deferred::new();
            state.connected = Some(connected.clone());
            (connected, state.generation, state.cancel.clone())
        };

        tracing::debug!(
            url = %redact_url(&self.inner.url),
            generation,
            backoff_ms = backoff.as_millis() as u64,
            "connecting"
        );
        tokio::spawn(self.clone().establish(generation, backoff, token));
        connected
    }

    async fn establish(self, generation: u64, backoff: Duration, token: CancellationToken) {
        if !backoff.is_zero() {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
        }

        let timeout = self.inner.config.connection_timeout;
        let opened = tokio::select! {
            _ = token.cancelled() => return,
            opened = tokio::time::timeout(timeout, self.inner.transport.open(&self.inner.url)) => opened,
        };
        let (sink, stream) = match opened {
            Ok(Ok(pair)) => pair,
            Ok(Err(error)) => {
                self.fail(generation, error);
                return;
            }
            Err(_) => {
                let error = StreamError::timeout(
                    &self.inner.url,
                    format!("connection timeout after {}ms", timeout.as_millis()),
                );
                self.fail(generation, error);
                return;
            }
        };

        let connected = {
            let mut slot = self.inner.sink.lock().await;
            let connected = {
                let mut state = self.inner.state.lock();
                if state.generation != generation || token.is_cancelled() {
                    None
                } else {
                    state.status = ConnectionStatus::Connected;
                    state.failures = 0;
                    state.error = None;
                    state.connected.clone()
                }
            };
            match connected {
                Some(connected) => {
                    *slot = Some((generation, sink));
                    connected
                }
                None => {
                    // Closed while the handshake was in flight.
                    drop(slot);
                    let mut sink = sink;
                    let _ = sink.close().await;
                    return;
                }
            }
        };

        tracing::info!(url = %redact_url(&self.inner.url), generation, "connected");
        tokio::spawn(self.clone().receive_loop(stream, generation, token.clone()));
        if !self.inner.config.keepalive.is_zero() {
            tokio::spawn(self.clone().keepalive_loop(generation, token));
        }
        connected.resolve(());
    }

    async fn receive_loop(self, mut stream: Box<dyn FrameStream>, generation: u64, token: CancellationToken) {
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                next = stream.next_frame() => next,
            };
            match next {
                Some(Ok(Frame::Ping(payload))) => {
                    tracing::trace!(url = %redact_url(&self.inner.url), "answering ping");
                    if self.send_on(generation, Frame::Pong(payload)).await.is_err() {
                        return;
                    }
                }
                Some(Ok(Frame::Pong(_))) => self.on_pong(),
                Some(Ok(Frame::Close(reason))) => {
                    let reason = reason.unwrap_or_else(|| "no reason".to_string());
                    self.fail(
                        generation,
                        StreamError::network(&self.inner.url, format!("closed by remote: {reason}")),
                    );
                    return;
                }
                Some(Ok(frame)) => self.inner.handler.handle_message(&self, frame),
                Some(Err(error)) => {
                    self.fail(generation, error);
                    return;
                }
                None => {
                    self.fail(generation, StreamError::network(&self.inner.url, "stream closed"));
                    return;
                }
            }
        }
    }

    async fn keepalive_loop(self, generation: u64, token: CancellationToken) {
        let period = self.inner.config.keepalive;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let missed = {
                let mut state = self.inner.state.lock();
                if state.generation != generation {
                    return;
                }
                if state.missed_pongs >= self.inner.config.max_ping_pong_misses {
                    None
                } else {
                    state.missed_pongs += 1;
                    Some(state.missed_pongs)
                }
            };
            match missed {
                Some(missed) => {
                    tracing::trace!(url = %redact_url(&self.inner.url), missed, "sending keepalive ping");
                    let ping = self.inner.handler.ping_frame();
                    if self.send_on(generation, ping).await.is_err() {
                        return;
                    }
                }
                None => {
                    let error = StreamError::timeout(
                        &self.inner.url,
                        format!(
                            "no pong after {} keepalive pings",
                            self.inner.config.max_ping_pong_misses
                        ),
                    );
                    self.fail(generation, error);
                    return;
                }
            }
        }
    }

    /// Record liveness; protocol handlers call this for application-level
    /// pongs.
    pub fn on_pong(&self) {
        self.inner.state.lock().missed_pongs = 0;
    }

    /// End `generation` with `error`: reject every wait, drop the
    /// subscriptions and release the sink.
    fn fail(&self, generation: u64, error: StreamError) {
        let (connected, pending, dropped) = {
            let mut state = self.inner.state.lock();
            if state.generation != generation || state.status == ConnectionStatus::Disconnected {
                return;
            }
            state.status = ConnectionStatus::Disconnected;
            state.failures = state.failures.saturating_add(1);
            state.error = Some(error.clone());
            state.missed_pongs = 0;
            state.cancel.cancel();
            let dropped: Vec<_> = state.subscriptions.drain().collect();
            let pending: Vec<_> = state.futures.drain().map(|(_, d)| d).collect();
            (state.connected.take(), pending, dropped)
        };

        tracing::warn!(
            url = %redact_url(&self.inner.url),
            generation,
            error = %error,
            pending = pending.len(),
            subscriptions = dropped.len(),
            "connection lost"
        );
        if let Some(connected) = connected {
            connected.reject(error.clone());
        }
        for deferred in pending {
            deferred.reject(error.clone());
        }
        self.inner.handler.on_disconnect(self, &error, &dropped);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut slot = inner.sink.lock().await;
            if matches!(slot.as_ref(), Some((g, _)) if *g == generation) {
                if let Some((_, mut sink)) = slot.take() {
                    let _ = sink.close().await;
                }
            }
        });
    }

    // ── Sending ────────────────────────────────────────────────────────

    /// Write `frame` on the live connection.
    ///
    /// A write failure ends the generation, rejecting every pending wait.
    pub async fn send(&self, frame: Frame) -> Result<(), StreamError> {
        let generation = {
            let state = self.inner.state.lock();
            if state.status != ConnectionStatus::Connected {
                return Err(StreamError::network(&self.inner.url, "not connected"));
            }
            state.generation
        };
        self.send_on(generation, frame).await
    }

    /// [`send`](Self::send) after waiting for `cost` tokens.
    pub async fn send_throttled(&self, frame: Frame, cost: Option<f64>) -> Result<(), StreamError> {
        self.inner.throttler.throttle(cost).await;
        self.send(frame).await
    }

    async fn send_on(&self, generation: u64, frame: Frame) -> Result<(), StreamError> {
        let result = {
            let mut slot = self.inner.sink.lock().await;
            match slot.as_mut() {
                Some((g, sink)) if *g == generation => sink.send(frame).await,
                _ => Err(StreamError::network(&self.inner.url, "not connected")),
            }
        };
        if let Err(error) = &result {
            self.fail(generation, error.clone());
        }
        result
    }

    /// Close the connection and reject every pending wait with
    /// [`StreamError::ClosedByUser`]. Idempotent; a later
    /// [`connect`](Self::connect) opens a fresh generation.
    pub async fn close(&self) {
        let (connected, pending, dropped) = {
            let mut state = self.inner.state.lock();
            state.status = ConnectionStatus::Disconnected;
            state.cancel.cancel();
            state.failures = 0;
            state.missed_pongs = 0;
            state.error = None;
            state.rejections.clear();
            let dropped: Vec<_> = state.subscriptions.drain().collect();
            let pending: Vec<_> = state.futures.drain().map(|(_, d)| d).collect();
            (state.connected.take(), pending, dropped)
        };

        let rejected = pending
            .into_iter()
            .filter(|deferred| deferred.reject(StreamError::ClosedByUser))
            .count();
        if let Some(connected) = connected {
            connected.reject(StreamError::ClosedByUser);
        }
        if !dropped.is_empty() {
            self.inner
                .handler
                .on_disconnect(self, &StreamError::ClosedByUser, &dropped);
        }

        let sink = self.inner.sink.lock().await.take();
        if let Some((_, mut sink)) = sink {
            if let Err(error) = sink.close().await {
                tracing::debug!(url = %redact_url(&self.inner.url), error = %error, "close failed");
            }
        }
        tracing::info!(url = %redact_url(&self.inner.url), rejected, "connection closed");
    }
}

impl std::fmt::Debug for WsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsClient")
            .field("url", &redact_url(&self.inner.url))
            .field("status", &self.status())
            .finish()
    }
}
