#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff as _;
use chrono::{DateTime, Utc};
use futures::stream::SplitSink;
use futures::{SinkExt as _, StreamExt as _};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, interval_at, sleep, timeout};
use tokio_tungstenite::tungstenite::Message as Frame;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::{CancellationToken, DropGuard};
use url::Url;

use super::config::Config;
use super::error::WsError;
use super::handlers::{Event, Handlers, dispatch_loop};
use super::message::{Message, MessageRequest, parse_messages};
use super::queue::OutboundQueue;
use crate::Result;
use crate::error::Error;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Frame>;
type Reply = oneshot::Sender<Result<()>>;

/// Broadcast channel capacity for incoming messages.
const BROADCAST_CAPACITY: usize = 1024;

/// Tick period used when heartbeats are disabled; the branch is never polled then.
const IDLE_TICK: Duration = Duration::from_secs(3600);

/// Connection state tracking.
#[non_exhaustive]
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, strum_macros::Display,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// Not connected, nothing scheduled
    #[default]
    Disconnected,
    /// First attempt after an explicit connect
    Connecting,
    /// Socket is open
    Connected,
    /// Waiting for, or running, an automatic retry
    Reconnecting,
    /// Automatic retries are exhausted; only an explicit connect leaves this state
    Failed,
}

impl ConnectionState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// Point-in-time view of a connection, suitable for status indicators.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub state: ConnectionState,
    /// Reconnection attempts since the last successful connection
    pub reconnect_attempts: u32,
    /// Outbound messages waiting for a connection
    pub queued_messages: usize,
    pub is_connected: bool,
    /// Queued messages evicted because the queue was full
    pub dropped_messages: u64,
    /// Frames written to the socket, heartbeats included
    pub messages_sent: u64,
    /// Envelopes delivered to handlers and subscribers
    pub messages_received: u64,
    /// When the current connection opened
    pub connected_since: Option<DateTime<Utc>>,
}

/// Manages one logical WebSocket connection: lifecycle, reconnection, outbound queueing,
/// inbound dispatch and heartbeats.
///
/// - Messages sent while the connection is down are queued and flushed in order once it
///   comes back.
/// - Unexpected losses are retried with capped exponential backoff until the configured
///   attempt limit, after which the manager rests in [`ConnectionState::Failed`].
/// - [`disconnect`](Self::disconnect) cancels everything synchronously; nothing scheduled
///   before it can revive the connection afterwards.
///
/// Cloning yields another handle to the same connection. Background work stops when the
/// last handle is dropped. Must be created inside a Tokio runtime.
///
/// # Example
///
/// ```no_run
/// use catalog_realtime::ws::config::Config;
/// use catalog_realtime::ws::{ConnectionManager, Handlers, MessageRequest};
/// use serde_json::json;
///
/// # async fn example() -> catalog_realtime::Result<()> {
/// let manager = ConnectionManager::new(Config::builder().url("wss://example.com/live").build());
/// manager.set_handlers(Handlers::new().on_message(|message| println!("{message:?}")));
///
/// manager.connect().await?;
/// let sent = manager.send(MessageRequest::new("material.subscribe", json!({ "id": "m-1" })));
/// assert!(sent);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
    /// Cancels every background task once the last handle is gone
    _shutdown: Arc<DropGuard>,
}

/// State reachable from background tasks.
struct Shared {
    config: Config,
    inner: Mutex<Inner>,
    handlers: Arc<RwLock<Handlers>>,
    /// Watch channel sender for state changes
    state_tx: watch::Sender<ConnectionState>,
    /// Ordered events for the dispatcher task
    events_tx: mpsc::UnboundedSender<Event>,
    /// Broadcast sender for incoming messages
    broadcast_tx: broadcast::Sender<Message>,
    /// Parent of every session token
    shutdown: CancellationToken,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
}

struct Inner {
    state: ConnectionState,
    /// Identifies the attempt, timer or socket allowed to mutate state. Bumped for every new
    /// attempt and on disconnect; tasks holding an older value exit without side effects.
    generation: u64,
    attempts: u32,
    queue: OutboundQueue,
    backoff: ExponentialBackoff,
    /// Cancelled by `disconnect`; replaced on the next `connect`
    session: CancellationToken,
    /// Writer side of the live socket
    socket: Option<mpsc::UnboundedSender<Message>>,
    connected_since: Option<DateTime<Utc>>,
}

impl ConnectionManager {
    /// Create a disconnected manager. Nothing happens on the network until
    /// [`connect`](Self::connect) is called.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let handlers = Arc::new(RwLock::new(Handlers::default()));
        let shutdown = CancellationToken::new();

        tokio::spawn(dispatch_loop(Arc::clone(&handlers), events_rx));

        let inner = Inner {
            state: ConnectionState::Disconnected,
            generation: 0,
            attempts: 0,
            queue: OutboundQueue::new(config.message_queue_limit),
            backoff: (&config.reconnect).into(),
            session: shutdown.child_token(),
            socket: None,
            connected_since: None,
        };

        Self {
            _shutdown: Arc::new(shutdown.clone().drop_guard()),
            shared: Arc::new(Shared {
                config,
                inner: Mutex::new(inner),
                handlers,
                state_tx,
                events_tx,
                broadcast_tx,
                shutdown,
                messages_sent: AtomicU64::new(0),
                messages_received: AtomicU64::new(0),
            }),
        }
    }

    /// Open the connection.
    ///
    /// Returns immediately if the manager is already connected or working on it. From
    /// [`Disconnected`](ConnectionState::Disconnected) or [`Failed`](ConnectionState::Failed)
    /// this starts a new session with a fresh attempt counter and resolves once the socket
    /// is open.
    ///
    /// # Errors
    ///
    /// - [`Kind::Configuration`](crate::error::Kind::Configuration) if the URL is missing or
    ///   invalid, or a heartbeat duration is zero. State is left untouched.
    /// - [`Kind::WebSocket`](crate::error::Kind::WebSocket) if this attempt fails. Automatic
    ///   reconnection still proceeds in the background when enabled.
    /// - [`WsError::Cancelled`] if [`disconnect`](Self::disconnect) interrupts the attempt.
    pub async fn connect(&self) -> Result<()> {
        let endpoint = self.shared.config.validate()?;

        let reply = {
            let mut inner = self.shared.lock();
            match inner.state {
                ConnectionState::Connected
                | ConnectionState::Connecting
                | ConnectionState::Reconnecting => return Ok(()),
                ConnectionState::Disconnected | ConnectionState::Failed => {}
            }

            inner.attempts = 0;
            inner.backoff.reset();
            inner.session = self.shared.shutdown.child_token();
            self.shared
                .transition(&mut inner, ConnectionState::Connecting);

            let (reply_tx, reply_rx) = oneshot::channel();
            self.shared.start_attempt(&mut inner, endpoint, Some(reply_tx));
            reply_rx
        };

        reply.await.map_err(|_e| WsError::Cancelled)?
    }

    /// Close the connection and forget all pending work.
    ///
    /// Cancels any scheduled retry, closes the live socket without triggering reconnection,
    /// discards queued messages and resets the attempt counter. Safe to call repeatedly.
    pub fn disconnect(&self) {
        let mut inner = self.shared.lock();
        let was_connected = inner.state.is_connected();

        inner.session.cancel();
        inner.generation = inner.generation.wrapping_add(1);
        inner.socket = None;
        inner.queue.clear();
        inner.attempts = 0;
        inner.backoff.reset();
        inner.connected_since = None;
        self.shared
            .transition(&mut inner, ConnectionState::Disconnected);

        if was_connected {
            self.shared.emit(Event::Close);
        }
    }

    /// Send a message, or queue it until the connection is back.
    ///
    /// Returns `true` if the manager was connected and the message went to the socket,
    /// `false` if it was queued. Queued messages are flushed in order on the next successful
    /// connection; when the queue is full the oldest entry is dropped.
    pub fn send(&self, request: MessageRequest) -> bool {
        let mut message = Message::stamp(request);
        let mut inner = self.shared.lock();

        if inner.state.is_connected()
            && let Some(socket) = &inner.socket
        {
            match socket.send(message) {
                Ok(()) => return true,
                // Writer already exited, the loss handler will pick the queue up
                Err(mpsc::error::SendError(unsent)) => message = unsent,
            }
        }

        if let Some(evicted) = inner.queue.push(message) {
            #[cfg(feature = "tracing")]
            tracing::debug!(
                id = %evicted.id,
                kind = %evicted.kind,
                "Outbound queue full, dropped oldest message"
            );
            #[cfg(not(feature = "tracing"))]
            let _ = &evicted;
        }

        false
    }

    /// Serialize `payload` and [`send`](Self::send) it.
    pub fn send_json<K: Into<String>, P: Serialize>(&self, kind: K, payload: &P) -> Result<bool> {
        let payload = serde_json::to_value(payload)?;
        Ok(self.send(MessageRequest::new(kind, payload)))
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    #[must_use]
    pub fn stats(&self) -> Stats {
        let inner = self.shared.lock();
        Stats {
            state: inner.state,
            reconnect_attempts: inner.attempts,
            queued_messages: inner.queue.len(),
            is_connected: inner.state.is_connected(),
            dropped_messages: inner.queue.dropped(),
            messages_sent: self.shared.messages_sent.load(Ordering::Relaxed),
            messages_received: self.shared.messages_received.load(Ordering::Relaxed),
            connected_since: inner.connected_since,
        }
    }

    /// Replace the registered callbacks.
    pub fn set_handlers(&self, handlers: Handlers) {
        *self
            .shared
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner) = handlers;
    }

    /// Subscribe to incoming messages.
    ///
    /// Each call returns a new independent receiver, in addition to the
    /// [`on_message`](Handlers::on_message) callback.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.shared.broadcast_tx.subscribe()
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("url", &self.shared.config.url)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        // No transition leaves `Inner` half-updated across a panic point
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, inner: &mut Inner, state: ConnectionState) {
        #[cfg(feature = "tracing")]
        if inner.state != state {
            tracing::debug!(from = %inner.state, to = %state, "Connection state changed");
        }

        inner.state = state;
        self.state_tx.send_replace(state);
    }

    fn emit(&self, event: Event) {
        _ = self.events_tx.send(event);
    }

    /// Spawn a socket-open attempt owned by a new generation.
    fn start_attempt(self: &Arc<Self>, inner: &mut Inner, endpoint: Url, reply: Option<Reply>) {
        inner.generation = inner.generation.wrapping_add(1);
        let generation = inner.generation;
        let session = inner.session.clone();
        let shared = Arc::clone(self);

        tokio::spawn(async move {
            shared
                .run_attempt(generation, endpoint, session, reply)
                .await;
        });
    }

    async fn run_attempt(
        self: Arc<Self>,
        generation: u64,
        endpoint: Url,
        session: CancellationToken,
        reply: Option<Reply>,
    ) {
        #[cfg(feature = "tracing")]
        tracing::debug!(%endpoint, generation, "Opening WebSocket connection");

        let opened = tokio::select! {
            () = session.cancelled() => {
                if let Some(reply) = reply {
                    _ = reply.send(Err(WsError::Cancelled.into()));
                }
                return;
            }
            result = timeout(self.config.connect_timeout, connect_async(endpoint.as_str())) => {
                match result {
                    Ok(Ok((stream, _response))) => Ok(stream),
                    Ok(Err(e)) => Err(Error::from(e)),
                    Err(_elapsed) => Err(Error::from(WsError::Timeout)),
                }
            }
        };

        match opened {
            Ok(stream) => self.on_open(generation, endpoint, stream, session, reply),
            Err(error) => self.on_attempt_failed(generation, endpoint, error, reply),
        }
    }

    fn on_open(
        self: &Arc<Self>,
        generation: u64,
        endpoint: Url,
        stream: WsStream,
        session: CancellationToken,
        reply: Option<Reply>,
    ) {
        let (socket_tx, socket_rx) = mpsc::unbounded_channel();

        {
            let mut inner = self.lock();
            if inner.generation != generation {
                drop(inner);
                if let Some(reply) = reply {
                    _ = reply.send(Err(WsError::Cancelled.into()));
                }
                return;
            }

            inner.attempts = 0;
            inner.backoff.reset();
            inner.connected_since = Some(Utc::now());

            // Queued messages go ahead of anything sent once the lock is released
            let flushed = inner.queue.len();
            for message in inner.queue.drain() {
                _ = socket_tx.send(message);
            }
            inner.socket = Some(socket_tx);

            self.transition(&mut inner, ConnectionState::Connected);
            self.emit(Event::Open);

            #[cfg(feature = "tracing")]
            tracing::info!(%endpoint, flushed, "WebSocket connected");
            #[cfg(not(feature = "tracing"))]
            let _ = flushed;

            let shared = Arc::clone(self);
            tokio::spawn(async move {
                shared
                    .run_connection(generation, endpoint, stream, socket_rx, session)
                    .await;
            });
        }

        if let Some(reply) = reply {
            _ = reply.send(Ok(()));
        }
    }

    fn on_attempt_failed(
        self: &Arc<Self>,
        generation: u64,
        endpoint: Url,
        error: Error,
        reply: Option<Reply>,
    ) {
        #[cfg(feature = "tracing")]
        tracing::warn!(%endpoint, error = %error, "Unable to connect");

        let mut inner = self.lock();
        if inner.generation != generation {
            drop(inner);
            if let Some(reply) = reply {
                _ = reply.send(Err(error));
            }
            return;
        }

        // The explicit `connect` that started this attempt reports its own failure
        match reply {
            Some(reply) => {
                _ = reply.send(Err(error));
            }
            None => self.emit(Event::Error(error)),
        }

        self.schedule_reconnect(&mut inner, endpoint, true);
    }

    /// Handle an active WebSocket connection until it is lost or the session is cancelled.
    async fn run_connection(
        self: Arc<Self>,
        generation: u64,
        endpoint: Url,
        stream: WsStream,
        mut socket_rx: mpsc::UnboundedReceiver<Message>,
        session: CancellationToken,
    ) {
        let (mut write, mut read) = stream.split();

        let heartbeat = self.config.heartbeat;
        let period = heartbeat.map_or(IDLE_TICK, |h| h.interval);
        let mut ticker = interval_at(Instant::now() + period, period);
        let mut last_seen = Instant::now();
        let mut unsent = None;

        let loss: Option<Error> = loop {
            tokio::select! {
                () = session.cancelled() => {
                    // Caller-initiated close, `disconnect` has already updated state
                    _ = write.send(Frame::Close(None)).await;
                    return;
                }

                // Handle incoming frames
                frame = read.next() => {
                    last_seen = Instant::now();
                    match frame {
                        Some(Ok(Frame::Text(text))) => {
                            #[cfg(feature = "tracing")]
                            tracing::trace!(text = %text.as_str(), "Received WebSocket text message");

                            self.deliver(text.as_bytes(), &session);
                        }
                        Some(Ok(Frame::Close(_))) => break None,
                        None => break Some(WsError::ConnectionClosed.into()),
                        Some(Err(e)) => break Some(e.into()),
                        Some(Ok(_)) => {
                            // Binary frames are not part of the protocol; control frames
                            // only count as liveness.
                        }
                    }
                }

                // Handle outgoing messages from `send` and the queue flush
                Some(message) = socket_rx.recv() => {
                    if let Err(e) = self.write_message(&mut write, &message).await {
                        unsent = Some(message);
                        break Some(e);
                    }
                }

                _ = ticker.tick(), if heartbeat.is_some() => {
                    if let Some(heartbeat) = heartbeat
                        && last_seen.elapsed() >= heartbeat.timeout
                    {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(
                            "Heartbeat timeout: no traffic received within {:?}",
                            heartbeat.timeout
                        );
                        break Some(WsError::Timeout.into());
                    }

                    if let Err(e) = self.write_message(&mut write, &Message::heartbeat()).await {
                        break Some(e);
                    }
                }
            }
        };

        self.on_connection_lost(generation, endpoint, loss, socket_rx, unsent);
    }

    async fn write_message(&self, write: &mut WsSink, message: &Message) -> Result<()> {
        let text = serde_json::to_string(message)?;
        write.send(Frame::Text(text.into())).await?;
        self.messages_sent.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "tracing")]
        tracing::trace!(id = %message.id, kind = %message.kind, "Sent WebSocket message");

        Ok(())
    }

    fn deliver(&self, bytes: &[u8], session: &CancellationToken) {
        match parse_messages(bytes) {
            Ok(messages) => {
                for message in messages {
                    if message.is_pong() || session.is_cancelled() {
                        continue;
                    }

                    self.messages_received.fetch_add(1, Ordering::Relaxed);
                    _ = self.broadcast_tx.send(message.clone());
                    self.emit(Event::Message(message));
                }
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %e, "Failed to parse WebSocket message");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
            }
        }
    }

    fn on_connection_lost(
        self: &Arc<Self>,
        generation: u64,
        endpoint: Url,
        loss: Option<Error>,
        mut socket_rx: mpsc::UnboundedReceiver<Message>,
        unsent: Option<Message>,
    ) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }

        // Anything the writer accepted but never wrote is older than what is queued now
        socket_rx.close();
        let mut leftovers: Vec<Message> = unsent.into_iter().collect();
        while let Ok(message) = socket_rx.try_recv() {
            leftovers.push(message);
        }
        let requeued = leftovers.len();
        let evicted = inner.queue.requeue_front(leftovers);

        inner.socket = None;
        inner.connected_since = None;

        #[cfg(feature = "tracing")]
        tracing::warn!(
            %endpoint,
            error = ?loss,
            requeued,
            evicted = evicted.len(),
            "WebSocket connection lost"
        );
        #[cfg(not(feature = "tracing"))]
        let _ = (requeued, &evicted);

        if let Some(error) = loss {
            self.emit(Event::Error(error));
        }
        self.emit(Event::Close);

        self.schedule_reconnect(&mut inner, endpoint, false);
    }

    /// Decide what follows an unexpected loss or a failed attempt.
    fn schedule_reconnect(self: &Arc<Self>, inner: &mut Inner, endpoint: Url, open_failed: bool) {
        let reconnect = &self.config.reconnect;

        if !reconnect.enabled {
            if open_failed {
                self.transition(inner, ConnectionState::Failed);
                self.emit(Event::ReconnectFailed);
            } else {
                self.transition(inner, ConnectionState::Disconnected);
            }
            return;
        }

        if !reconnect.allows_attempt(inner.attempts) {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                attempts = inner.attempts,
                "Reconnection attempts exhausted, giving up"
            );

            self.transition(inner, ConnectionState::Failed);
            self.emit(Event::Error(
                WsError::ReconnectExhausted {
                    attempts: inner.attempts,
                }
                .into(),
            ));
            self.emit(Event::ReconnectFailed);
            return;
        }

        inner.attempts = inner.attempts.saturating_add(1);
        let attempt = inner.attempts;
        let delay = inner
            .backoff
            .next_backoff()
            .unwrap_or(reconnect.max_backoff)
            .min(reconnect.max_backoff);

        // Retire whatever generation led here so only the timer below may continue
        inner.generation = inner.generation.wrapping_add(1);
        let generation = inner.generation;
        let session = inner.session.clone();
        self.transition(inner, ConnectionState::Reconnecting);

        #[cfg(feature = "tracing")]
        tracing::debug!(attempt, ?delay, "Scheduling reconnection");

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                () = session.cancelled() => {}
                () = sleep(delay) => shared.fire_reconnect(generation, attempt, endpoint),
            }
        });
    }

    fn fire_reconnect(self: &Arc<Self>, generation: u64, attempt: u32, endpoint: Url) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(attempt, "Attempting reconnection");

        self.emit(Event::Reconnect(attempt));
        self.start_attempt(&mut inner, endpoint, None);
    }
}
