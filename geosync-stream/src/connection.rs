//! WebSocket connection state machine.
//!
//! State changes go through [`Shared::transition`], which checks both the
//! expected current state and the transition table. The socket itself is
//! driven by a spawned supervisor task; the public handle only flips state,
//! queues outbound frames and cancels the session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use geosync_core::{ConnectionError, EventBus, ListenerId, StreamConfig};
use geosync_retry::Retrier;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::event::{close_reason, StreamEvent, StreamEventKind, StreamMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Outbound = mpsc::UnboundedReceiver<Message>;

const CLIENT_DISCONNECT: &str = "Client disconnect";
const ABNORMAL_CLOSURE: u16 = 1006;
const NO_STATUS: u16 = 1005;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: Self) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connecting, Reconnecting)
                | (Connected, Disconnected)
                | (Connected, Reconnecting)
                | (Reconnecting, Connecting)
                | (Reconnecting, Disconnected)
        )
    }
}

enum SessionEnd {
    Intentional,
    Dropped { code: Option<u16>, reason: String },
}

impl SessionEnd {
    fn abnormal() -> Self {
        Self::Dropped {
            code: Some(ABNORMAL_CLOSURE),
            reason: close_reason(ABNORMAL_CLOSURE).to_string(),
        }
    }
}

struct Shared {
    config: StreamConfig,
    backoff: Retrier,
    state: Mutex<ConnectionState>,
    /// Set by `disconnect`, cleared by `connect`.
    intentional: AtomicBool,
    session: Mutex<Option<CancellationToken>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    events: EventBus<StreamEvent>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let mut state = self.state.lock();
        if *state != from {
            debug!(current = ?*state, ?from, ?to, "Stale state transition skipped");
            return false;
        }
        if !from.can_transition_to(to) {
            warn!(?from, ?to, "Illegal state transition rejected");
            return false;
        }
        *state = to;
        debug!(?from, ?to, "Connection state changed");
        true
    }

    /// Force `Disconnected`, returning the previous state.
    fn settle_disconnected(&self) -> ConnectionState {
        std::mem::replace(&mut *self.state.lock(), ConnectionState::Disconnected)
    }

    fn emit(&self, event: StreamEvent) {
        self.events.emit(&event);
    }

    fn emit_error(&self, message: impl Into<String>) {
        if self.intentional.load(Ordering::SeqCst) {
            debug!("Suppressing transport error after client disconnect");
            return;
        }
        self.emit(StreamEvent::Error {
            message: message.into(),
        });
    }

    fn install_outbound(&self) -> Outbound {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.outbound.lock() = Some(tx);
        rx
    }

    fn drop_outbound(&self) {
        self.outbound.lock().take();
    }
}

/// Owns the `Connecting` state of one `connect()` call. Unless completed, it
/// returns the connection to `Disconnected` and retires the session when
/// dropped, whether the open failed or the caller dropped the future.
struct PendingOpen<'a> {
    shared: &'a Shared,
    session: &'a CancellationToken,
    armed: bool,
}

impl PendingOpen<'_> {
    fn complete(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingOpen<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut slot = self.shared.session.lock();
        // A cancelled session was already retired by `disconnect` or a newer
        // `connect`, which now own the state.
        if self.session.is_cancelled() {
            return;
        }
        self.session.cancel();
        slot.take();
        drop(slot);
        if self
            .shared
            .transition(ConnectionState::Connecting, ConnectionState::Disconnected)
        {
            debug!(url = %self.shared.config.url, "Abandoned stream open");
        }
    }
}

/// One logical streaming connection.
///
/// At most one socket is open at a time. A socket that drops is replaced by
/// a fresh one when reconnection is configured; nothing from the old socket
/// carries over except the registered listeners.
pub struct StreamConnection {
    shared: Arc<Shared>,
}

impl StreamConnection {
    pub fn new(config: StreamConfig) -> Self {
        let backoff = Retrier::new(config.backoff.clone());
        Self {
            shared: Arc::new(Shared {
                config,
                backoff,
                state: Mutex::new(ConnectionState::Disconnected),
                intentional: AtomicBool::new(false),
                session: Mutex::new(None),
                outbound: Mutex::new(None),
                events: EventBus::new(),
            }),
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Subscribe to one kind of event.
    pub fn on<F>(&self, kind: StreamEventKind, handler: F) -> ListenerId
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        self.shared.events.on(move |event: &StreamEvent| {
            if event.kind() == kind {
                handler(event);
            }
        })
    }

    /// Subscribe to every event.
    pub fn on_any<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        self.shared.events.on(handler)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.shared.events.off(id)
    }

    /// Open the connection. Resolves once the socket is open, or fails
    /// exactly once if it never opens; a failed open does not schedule a
    /// reconnect.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        {
            let mut state = self.shared.state.lock();
            if *state != ConnectionState::Disconnected {
                return Err(ConnectionError::AlreadyExists);
            }
            *state = ConnectionState::Connecting;
        }
        self.shared.intentional.store(false, Ordering::SeqCst);

        let session = CancellationToken::new();
        if let Some(previous) = self.shared.session.lock().replace(session.clone()) {
            previous.cancel();
        }
        let pending = PendingOpen {
            shared: &self.shared,
            session: &session,
            armed: true,
        };

        let url = &self.shared.config.url;
        info!(url = %url, "Opening stream connection");

        let opened = tokio::select! {
            biased;
            _ = session.cancelled() => Err(ConnectionError::Handshake {
                reason: "disconnected before the connection opened".to_string(),
            }),
            result = open(&self.shared.config) => result,
        };
        let ws = match opened {
            Ok(ws) => ws,
            Err(err) => {
                warn!(url = %url, error = %err, "Stream connection failed to open");
                return Err(err);
            }
        };

        let outbound = self.shared.install_outbound();
        if !self
            .shared
            .transition(ConnectionState::Connecting, ConnectionState::Connected)
        {
            self.shared.drop_outbound();
            return Err(ConnectionError::Handshake {
                reason: "disconnected before the connection opened".to_string(),
            });
        }
        pending.complete();

        info!(url = %url, "Stream connected");
        self.shared.emit(StreamEvent::Connected);
        tokio::spawn(supervise(Arc::clone(&self.shared), ws, outbound, session));
        Ok(())
    }

    /// Close the connection on purpose. No reconnect follows, and late
    /// transport errors are not reported.
    pub fn disconnect(&self) {
        self.shared.intentional.store(true, Ordering::SeqCst);
        if let Some(session) = self.shared.session.lock().take() {
            session.cancel();
        }
        self.shared.drop_outbound();

        if self.shared.settle_disconnected() == ConnectionState::Disconnected {
            return;
        }
        info!(url = %self.shared.config.url, "Stream disconnected by client");
        self.shared.emit(StreamEvent::Disconnected {
            reason: CLIENT_DISCONNECT.to_string(),
            code: Some(u16::from(CloseCode::Normal)),
        });
    }

    /// Serialize `data` as JSON and queue it as a text frame.
    pub fn send<T: Serialize + ?Sized>(&self, data: &T) -> Result<(), ConnectionError> {
        self.ensure_connected()?;
        let text = serde_json::to_string(data).map_err(|e| ConnectionError::Serialize {
            reason: e.to_string(),
        })?;
        self.send_text(text)
    }

    /// Queue a raw text frame.
    pub fn send_text(&self, text: impl Into<String>) -> Result<(), ConnectionError> {
        self.ensure_connected()?;
        let outbound = self.shared.outbound.lock();
        let sender = outbound.as_ref().ok_or(ConnectionError::NotConnected)?;
        sender
            .send(Message::Text(text.into()))
            .map_err(|_| ConnectionError::NotConnected)
    }

    fn ensure_connected(&self) -> Result<(), ConnectionError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ConnectionError::NotConnected)
        }
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        self.shared.intentional.store(true, Ordering::SeqCst);
        if let Some(session) = self.shared.session.lock().take() {
            session.cancel();
        }
    }
}

impl std::fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConnection")
            .field("url", &self.shared.config.url)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

async fn open(config: &StreamConfig) -> Result<WsStream, ConnectionError> {
    let invalid = |reason: String| ConnectionError::InvalidUrl {
        url: config.url.clone(),
        reason,
    };
    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| invalid(e.to_string()))?;
    if !config.protocols.is_empty() {
        let value =
            HeaderValue::from_str(&config.protocols.join(", ")).map_err(|e| invalid(e.to_string()))?;
        request.headers_mut().insert("Sec-WebSocket-Protocol", value);
    }

    let (stream, _response) = connect_async(request)
        .await
        .map_err(|e| ConnectionError::Handshake {
            reason: e.to_string(),
        })?;
    Ok(stream)
}

/// Drive sessions until an intentional close, a drop without reconnect, or
/// reconnect exhaustion.
async fn supervise(
    shared: Arc<Shared>,
    mut ws: WsStream,
    mut outbound: Outbound,
    session: CancellationToken,
) {
    loop {
        let (code, reason) = match run_session(&shared, ws, outbound, &session).await {
            SessionEnd::Intentional => return,
            SessionEnd::Dropped { code, reason } => (code, reason),
        };
        shared.drop_outbound();
        if session.is_cancelled() {
            return;
        }

        let reconnect = shared.config.reconnect;
        let next = if reconnect {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Disconnected
        };
        if !shared.transition(ConnectionState::Connected, next) {
            return;
        }
        warn!(url = %shared.config.url, ?code, reason = %reason, "Stream closed unexpectedly");
        shared.emit(StreamEvent::Disconnected { reason, code });

        if !reconnect {
            return;
        }
        match reconnect_with_backoff(&shared, &session).await {
            Some((stream, rx)) => {
                ws = stream;
                outbound = rx;
            }
            None => return,
        }
    }
}

async fn run_session(
    shared: &Shared,
    ws: WsStream,
    mut outbound: Outbound,
    session: &CancellationToken,
) -> SessionEnd {
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            biased;
            _ = session.cancelled() => {
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: CLIENT_DISCONNECT.into(),
                };
                if let Err(err) = sink.send(Message::Close(Some(frame))).await {
                    debug!(error = %err, "Close frame not delivered");
                }
                return SessionEnd::Intentional;
            }
            Some(message) = outbound.recv() => {
                if let Err(err) = sink.send(message).await {
                    shared.emit_error(err.to_string());
                    return SessionEnd::abnormal();
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => deliver(shared, text),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => deliver(shared, text),
                    Err(_) => debug!("Dropping non UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => return closed_by_peer(frame),
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    if session.is_cancelled() {
                        return SessionEnd::Intentional;
                    }
                    shared.emit_error(err.to_string());
                    return SessionEnd::abnormal();
                }
                None => return SessionEnd::abnormal(),
            },
        }
    }
}

fn deliver(shared: &Shared, text: String) {
    let message = StreamMessage::parse(text);
    debug!(structured = message.as_json().is_some(), "Inbound message");
    shared.emit(StreamEvent::Message(message));
}

fn closed_by_peer(frame: Option<CloseFrame<'_>>) -> SessionEnd {
    match frame {
        Some(frame) => {
            let code = u16::from(frame.code);
            let reason = if frame.reason.is_empty() {
                close_reason(code).to_string()
            } else {
                frame.reason.into_owned()
            };
            SessionEnd::Dropped {
                code: Some(code),
                reason,
            }
        }
        None => SessionEnd::Dropped {
            code: Some(NO_STATUS),
            reason: close_reason(NO_STATUS).to_string(),
        },
    }
}

/// Reopen with backoff. Returns the new socket, or `None` once the session
/// is cancelled or attempts run out.
async fn reconnect_with_backoff(
    shared: &Shared,
    session: &CancellationToken,
) -> Option<(WsStream, Outbound)> {
    let url = &shared.config.url;
    let max_attempts = shared.backoff.config().max_retries;

    for attempt in 1..=max_attempts {
        let delay_ms = shared.backoff.calculate_delay(attempt);
        info!(url = %url, attempt, delay_ms, "Scheduling reconnect");
        shared.emit(StreamEvent::Reconnecting { attempt, delay_ms });

        tokio::select! {
            biased;
            _ = session.cancelled() => return None,
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
        }
        if !shared.transition(ConnectionState::Reconnecting, ConnectionState::Connecting) {
            return None;
        }

        let opened = tokio::select! {
            biased;
            _ = session.cancelled() => return None,
            result = open(&shared.config) => result,
        };
        match opened {
            Ok(ws) => {
                let outbound = shared.install_outbound();
                if !shared.transition(ConnectionState::Connecting, ConnectionState::Connected) {
                    shared.drop_outbound();
                    return None;
                }
                info!(url = %url, attempt, "Stream reconnected");
                shared.emit(StreamEvent::Connected);
                return Some((ws, outbound));
            }
            Err(err) => {
                warn!(url = %url, attempt, error = %err, "Reconnect attempt failed");
                shared.emit_error(err.to_string());
                if !shared.transition(ConnectionState::Connecting, ConnectionState::Reconnecting) {
                    return None;
                }
            }
        }
    }

    if shared.transition(ConnectionState::Reconnecting, ConnectionState::Disconnected) {
        let err = ConnectionError::ReconnectExhausted {
            attempts: max_attempts,
        };
        error!(url = %url, error = %err, "Giving up on stream");
        shared.emit_error(err.to_string());
    }
    None
}
