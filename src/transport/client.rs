//! Reconnecting relay client
//!
//! One persistent WebSocket to the relay, driven by a background task that
//! reconnects forever with capped exponential backoff. Everything the rest of
//! the daemon sends goes through an outbound queue, so callers never block on
//! the socket and nothing queued is lost while offline.

use super::frame::{Ack, Frame, RpcEnvelope, RPC_REGISTER_EVENT, RPC_UNREGISTER_EVENT};
use super::http::TokenHandle;
use super::rpc::{scoped_method, RpcHandlerRegistry};
use super::ConnectionState;
use crate::config::RelayConfig;
use crate::crypto::{ScopeId, ScopeRegistry};
use crate::error::{Error, Result};
use crate::retry::Backoff;
use futures::stream::{SplitSink, SplitStream};
use futures::{Sink, SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex, Notify, RwLock};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type EventHandler = Arc<dyn Fn(Value) + Send + Sync>;
type ReconnectListener = Arc<dyn Fn() + Send + Sync>;

/// Header carrying the client-type tag
pub const CLIENT_TYPE_HEADER: &str = "x-client-type";

enum Control {
    Reconnect,
    Close,
}

enum ConnectionEnd {
    Closed,
    Reconnect,
    Dropped(String),
}

struct Inner {
    config: RelayConfig,
    client_type: String,
    token: TokenHandle,
    scopes: Arc<ScopeRegistry>,
    rpc: Arc<RpcHandlerRegistry>,
    state_tx: watch::Sender<ConnectionState>,
    outbound_tx: mpsc::UnboundedSender<Frame>,
    /// Frames enqueued but not yet written to a socket
    queued: AtomicUsize,
    drained: Notify,
    pending: Mutex<HashMap<u64, oneshot::Sender<Ack>>>,
    next_id: AtomicU64,
    subscribers: RwLock<HashMap<String, EventHandler>>,
    reconnect_listeners: RwLock<Vec<ReconnectListener>>,
    control_tx: mpsc::UnboundedSender<Control>,
    closed: AtomicBool,
}

/// Handle to the relay connection; cheap to clone
#[derive(Clone)]
pub struct RelayClient {
    inner: Arc<Inner>,
}

impl RelayClient {
    /// Start the client and its background connection task
    pub fn start(config: RelayConfig, client_type: &str, scopes: Arc<ScopeRegistry>) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        let inner = Arc::new(Inner {
            token: Arc::new(RwLock::new(config.token.clone())),
            rpc: Arc::new(RpcHandlerRegistry::new(scopes.clone())),
            config,
            client_type: client_type.to_string(),
            scopes,
            state_tx,
            outbound_tx,
            queued: AtomicUsize::new(0),
            drained: Notify::new(),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            subscribers: RwLock::new(HashMap::new()),
            reconnect_listeners: RwLock::new(Vec::new()),
            control_tx,
            closed: AtomicBool::new(false),
        });

        tokio::spawn(connection_loop(inner.clone(), outbound_rx, control_rx));

        Self { inner }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.inner.state_tx.borrow().clone()
    }

    /// Subscribe to connection state changes
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Wait until the client is connected
    pub async fn wait_connected(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.watch_state();
        let wait = async {
            loop {
                if *rx.borrow_and_update() == ConnectionState::Connected {
                    return Ok(());
                }
                if rx.changed().await.is_err() {
                    return Err(Error::Transport("Relay client stopped".to_string()));
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::Timeout("waiting for relay connection".to_string()))?
    }

    /// Shared bearer credential (for HTTP requests to the same relay)
    pub fn token_handle(&self) -> TokenHandle {
        self.inner.token.clone()
    }

    /// Scope registry used for sealing payloads
    pub fn scopes(&self) -> &Arc<ScopeRegistry> {
        &self.inner.scopes
    }

    /// Encrypted RPC call to the peer, acknowledged with a single ack
    pub async fn call(&self, method: &str, params: &Value, scope: &ScopeId) -> Result<Value> {
        let enc = self.inner.scopes.resolve(scope).await?;
        let sealed = enc.encrypt(params)?;
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(id, tx);

        let envelope = RpcEnvelope {
            id,
            method: scoped_method(scope, method),
            params: sealed,
        };
        if let Err(e) = self.inner.enqueue(Frame::Call(envelope)) {
            self.inner.pending.lock().await.remove(&id);
            return Err(e);
        }

        let timeout = Duration::from_secs(self.inner.config.call_timeout_secs);
        let ack = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(ack)) => ack,
            Ok(Err(_)) => return Err(Error::Transport(format!("Call {} abandoned", method))),
            Err(_) => {
                self.inner.pending.lock().await.remove(&id);
                return Err(Error::Timeout(format!(
                    "{} not acknowledged within {}s",
                    method,
                    timeout.as_secs()
                )));
            }
        };

        let sealed_result = ack.into_result()?;
        enc.decrypt(&sealed_result)
    }

    /// Fire-and-forget event; buffered while offline
    pub fn emit(&self, event: &str, data: Value) -> Result<()> {
        self.inner.enqueue(Frame::Event {
            event: event.to_string(),
            data,
        })
    }

    /// Fire-and-forget event that is dropped unless currently connected
    pub fn emit_volatile(&self, event: &str, data: Value) -> bool {
        if self.state() != ConnectionState::Connected {
            return false;
        }
        self.emit(event, data).is_ok()
    }

    /// Register the handler for an event name, replacing any previous one.
    ///
    /// Returns whether a handler was replaced.
    pub async fn subscribe<F>(&self, event: &str, handler: F) -> bool
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.inner
            .subscribers
            .write()
            .await
            .insert(event.to_string(), Arc::new(handler))
            .is_some()
    }

    /// Remove the handler for an event name
    pub async fn unsubscribe(&self, event: &str) -> bool {
        self.inner.subscribers.write().await.remove(event).is_some()
    }

    /// Listener fired after a fresh (non-recovered) reconnection
    pub async fn on_reconnect<F>(&self, listener: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner
            .reconnect_listeners
            .write()
            .await
            .push(Arc::new(listener));
    }

    /// Register a host RPC method and announce it if already connected
    pub async fn register_rpc<F, Fut>(&self, scope: &ScopeId, method: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let full = self.inner.rpc.register(scope, method, handler).await;
        if self.state() == ConnectionState::Connected {
            if let Err(e) = self.emit(RPC_REGISTER_EVENT, serde_json::json!({ "method": full })) {
                tracing::warn!(method = %full, "Failed to announce RPC method: {}", e);
            }
        }
    }

    /// Remove a host RPC method and withdraw it from the relay
    pub async fn unregister_rpc(&self, scope: &ScopeId, method: &str) -> bool {
        let removed = self.inner.rpc.unregister(scope, method).await;
        if removed && self.state() == ConnectionState::Connected {
            let full = scoped_method(scope, method);
            let _ = self.emit(RPC_UNREGISTER_EVENT, serde_json::json!({ "method": full }));
        }
        removed
    }

    /// Withdraw every method registered on a scope; returns how many
    pub async fn unregister_scope(&self, scope: &ScopeId) -> usize {
        let mut removed = 0;
        for method in self.inner.rpc.methods_in(scope).await {
            if self.unregister_rpc(scope, &method).await {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::debug!(scope = %scope, removed, "Withdrew scope RPC methods");
        }
        removed
    }

    /// Replace the bearer credential.
    ///
    /// A changed credential forces an immediate reconnect; an unchanged one is
    /// a no-op. Returns whether the credential changed.
    pub async fn update_token(&self, token: &str) -> bool {
        {
            let mut current = self.inner.token.write().await;
            if *current == token {
                return false;
            }
            *current = token.to_string();
        }
        tracing::info!("Relay credential rotated");
        if self.state() == ConnectionState::Connected {
            let _ = self.inner.control_tx.send(Control::Reconnect);
        }
        true
    }

    /// Wait until every queued frame has been written to the socket
    pub async fn flush(&self, timeout: Duration) -> Result<()> {
        let wait = async {
            loop {
                let notified = self.inner.drained.notified();
                if self.inner.queued.load(Ordering::SeqCst) == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::Timeout("flushing relay queue".to_string()))
    }

    /// Stop reconnecting and close the socket
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            let _ = self.inner.control_tx.send(Control::Close);
        }
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state.clone());
        if previous != state {
            tracing::debug!(from = ?previous, to = ?state, "Relay connection state changed");
        }
    }

    fn enqueue(&self, frame: Frame) -> Result<()> {
        self.queued.fetch_add(1, Ordering::SeqCst);
        if self.outbound_tx.send(frame).is_err() {
            self.mark_sent();
            return Err(Error::Transport("Relay client is closed".to_string()));
        }
        Ok(())
    }

    fn mark_sent(&self) {
        if self.queued.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }

    async fn fail_pending(&self, reason: &str) {
        let drained: Vec<(u64, oneshot::Sender<Ack>)> =
            self.pending.lock().await.drain().collect();
        for (id, tx) in drained {
            let _ = tx.send(Ack::failure(id, reason));
        }
    }

    async fn notify_reconnected(&self) {
        let listeners = self.reconnect_listeners.read().await.clone();
        tracing::info!(listeners = listeners.len(), "Fresh reconnection, re-syncing");
        for listener in listeners {
            listener();
        }
    }

    async fn handle_text(self: &Arc<Self>, text: &str) {
        let frame = match Frame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("{}", e);
                return;
            }
        };

        match frame {
            Frame::Ack(ack) => {
                if let Some(tx) = self.pending.lock().await.remove(&ack.id) {
                    let _ = tx.send(ack);
                } else {
                    tracing::debug!(id = ack.id, "Ack for unknown or expired call");
                }
            }
            Frame::Event { event, data } => {
                let handler = self.subscribers.read().await.get(&event).cloned();
                match handler {
                    Some(handler) => handler(data),
                    None => tracing::trace!(event = %event, "No subscriber for event"),
                }
            }
            Frame::Request(envelope) => {
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    let ack = inner
                        .rpc
                        .dispatch(envelope.id, &envelope.method, &envelope.params)
                        .await;
                    if let Err(e) = inner.enqueue(Frame::Response(ack)) {
                        tracing::warn!(method = %envelope.method, "Failed to queue RPC response: {}", e);
                    }
                });
            }
            Frame::Welcome { .. } => tracing::debug!("Ignoring late welcome frame"),
            Frame::Call(_) | Frame::Response(_) => {
                tracing::warn!("Relay sent a frame meant for the other direction")
            }
        }
    }
}

/// Derive the socket URL from the relay base URL
pub fn websocket_url(base: &str) -> Result<String> {
    let trimmed = base.trim().trim_end_matches('/');
    let ws = if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if trimmed.starts_with("ws://") || trimmed.starts_with("wss://") {
        trimmed.to_string()
    } else {
        return Err(Error::Config(format!("Unsupported relay URL: {}", base)));
    };
    Ok(format!("{}/v1/updates", ws))
}

async fn open_socket(inner: &Inner) -> Result<WsStream> {
    let url = websocket_url(&inner.config.url)?;
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| Error::Transport(format!("Invalid relay request: {}", e)))?;

    let token = inner.token.read().await.clone();
    let headers = request.headers_mut();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| Error::Transport(format!("Invalid credential: {}", e)))?,
    );
    headers.insert(
        CLIENT_TYPE_HEADER,
        HeaderValue::from_str(&inner.client_type)
            .map_err(|e| Error::Transport(format!("Invalid client type: {}", e)))?,
    );

    let handshake = Duration::from_secs(inner.config.handshake_timeout_secs.max(1));
    let (ws, _response) = tokio::time::timeout(handshake, tokio_tungstenite::connect_async(request))
        .await
        .map_err(|_| Error::Timeout("relay handshake".to_string()))?
        .map_err(|e| Error::Transport(e.to_string()))?;
    Ok(ws)
}

async fn send_frame(sink: &mut WsSink, frame: &Frame) -> Result<()> {
    let text = frame.to_text()?;
    sink.send(Message::Text(text))
        .await
        .map_err(|e| Error::Transport(e.to_string()))
}

/// Write one dequeued frame. A frame the socket refused is kept in `held`
/// and goes out first on the next connection; calls are dropped instead since
/// their callers were already failed with the connection.
async fn deliver<S>(
    sink: &mut S,
    inner: &Inner,
    held: &mut Option<Frame>,
    frame: Frame,
) -> std::result::Result<(), String>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let text = match frame.to_text() {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!("Dropping unserializable frame: {}", e);
            inner.mark_sent();
            return Ok(());
        }
    };
    match sink.send(Message::Text(text)).await {
        Ok(()) => {
            inner.mark_sent();
            Ok(())
        }
        Err(e) => {
            if matches!(frame, Frame::Call(_)) {
                inner.mark_sent();
            } else {
                *held = Some(frame);
            }
            Err(e.to_string())
        }
    }
}

async fn connection_loop(
    inner: Arc<Inner>,
    mut outbound_rx: mpsc::UnboundedReceiver<Frame>,
    mut control_rx: mpsc::UnboundedReceiver<Control>,
) {
    let backoff = Backoff::from_millis(
        inner.config.reconnect_base_delay_ms,
        inner.config.reconnect_max_delay_ms,
    );
    let mut attempt: u32 = 0;
    let mut has_connected = false;
    let mut held: Option<Frame> = None;

    loop {
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }
        inner.set_state(ConnectionState::Connecting);

        match open_socket(&inner).await {
            Ok(ws) => {
                let end = run_connection(
                    &inner,
                    ws,
                    &mut outbound_rx,
                    &mut control_rx,
                    &mut has_connected,
                    &mut held,
                )
                .await;
                inner.fail_pending("Connection lost").await;
                inner.set_state(ConnectionState::Disconnected);
                match end {
                    ConnectionEnd::Closed => break,
                    ConnectionEnd::Reconnect => {
                        attempt = 0;
                        continue;
                    }
                    ConnectionEnd::Dropped(reason) => {
                        tracing::warn!(reason = %reason, "Relay connection dropped");
                        attempt = 0;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(attempt, "Relay connection failed: {}", e);
                inner.set_state(ConnectionState::Error(e.to_string()));
            }
        }

        let delay = backoff.delay(attempt);
        attempt = attempt.saturating_add(1);
        tracing::debug!(delay_ms = delay.as_millis() as u64, "Reconnecting to relay");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            control = control_rx.recv() => match control {
                Some(Control::Reconnect) => attempt = 0,
                Some(Control::Close) | None => break,
            },
        }
    }

    if held.take().is_some() {
        inner.mark_sent();
    }
    inner.set_state(ConnectionState::Disconnected);
    tracing::info!("Relay client stopped");
}

async fn run_connection(
    inner: &Arc<Inner>,
    ws: WsStream,
    outbound_rx: &mut mpsc::UnboundedReceiver<Frame>,
    control_rx: &mut mpsc::UnboundedReceiver<Control>,
    has_connected: &mut bool,
    held: &mut Option<Frame>,
) -> ConnectionEnd {
    let (mut sink, mut stream): (WsSink, SplitStream<WsStream>) = ws.split();

    // The relay opens with a welcome frame; anything else means a fresh session.
    let handshake = Duration::from_secs(inner.config.handshake_timeout_secs.max(1));
    let (recovered, leftover) = match tokio::time::timeout(handshake, stream.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => match Frame::parse(&text) {
            Ok(Frame::Welcome { recovered }) => (recovered, None),
            _ => (false, Some(text)),
        },
        Ok(Some(Ok(_))) | Err(_) => (false, None),
        Ok(Some(Err(e))) => return ConnectionEnd::Dropped(e.to_string()),
        Ok(None) => return ConnectionEnd::Dropped("closed during handshake".to_string()),
    };

    inner.set_state(ConnectionState::Connected);
    tracing::info!(recovered, "Connected to relay");

    if !recovered {
        for method in inner.rpc.methods().await {
            let frame = Frame::Event {
                event: RPC_REGISTER_EVENT.to_string(),
                data: serde_json::json!({ "method": method }),
            };
            if let Err(e) = send_frame(&mut sink, &frame).await {
                return ConnectionEnd::Dropped(e.to_string());
            }
        }
        if *has_connected {
            inner.notify_reconnected().await;
        }
    }
    *has_connected = true;

    if let Some(text) = leftover {
        inner.handle_text(&text).await;
    }

    if let Some(frame) = held.take() {
        if let Err(e) = deliver(&mut sink, inner, held, frame).await {
            return ConnectionEnd::Dropped(e);
        }
    }

    loop {
        tokio::select! {
            frame = outbound_rx.recv() => {
                let Some(frame) = frame else {
                    let _ = sink.close().await;
                    return ConnectionEnd::Closed;
                };
                if let Err(e) = deliver(&mut sink, inner, held, frame).await {
                    return ConnectionEnd::Dropped(e);
                }
            }
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => inner.handle_text(&text).await,
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(e) = sink.send(Message::Pong(payload)).await {
                        return ConnectionEnd::Dropped(e.to_string());
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    return ConnectionEnd::Dropped("closed by relay".to_string());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return ConnectionEnd::Dropped(e.to_string()),
            },
            control = control_rx.recv() => {
                let _ = sink.close().await;
                return match control {
                    Some(Control::Reconnect) => ConnectionEnd::Reconnect,
                    Some(Control::Close) | None => ConnectionEnd::Closed,
                };
            }
        }
    }
}
