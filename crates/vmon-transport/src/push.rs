//! Transport Manager: owns the push channel session.
//!
//! One session at a time. Each (re)connect attempt runs in its own task with
//! a fresh generation number and cancellation token; events from an older
//! generation are dropped, so a replaced connection is never read again.
//! Failures are logged and answered with the reconnect inhibit cycle, never
//! returned to callers.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use vmon_core::{ClientEvent, InboundMessage, ReconnectGate};

use crate::error::TransportError;

/// A connect attempt still pending after this long counts as failed.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Text frames received on an open push channel.
pub type PushStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// Opens push channel connections. Enables fake injection for testing.
pub trait PushConnector: Send + Sync + 'static {
    fn connect(&self) -> impl Future<Output = Result<PushStream, TransportError>> + Send;
}

/// WebSocket push channel at `ws://<host>/msg`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn for_host(host: &str) -> Self {
        Self::new(format!("ws://{host}/msg"))
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl PushConnector for WsConnector {
    async fn connect(&self) -> Result<PushStream, TransportError> {
        let (ws, _response) = tokio_tungstenite::connect_async(self.url.as_str()).await?;
        tracing::info!(url = %self.url, "push channel connected");

        let frames = ws.filter_map(|msg| async move {
            match msg {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Close(frame)) => {
                    tracing::debug!(?frame, "push channel close frame");
                    None
                }
                Ok(_) => None,
                Err(e) => Some(Err(TransportError::from(e))),
            }
        });
        Ok(Box::pin(frames))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Connecting,
    Open,
}

/// Raw session lifecycle, tagged with the session generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened { session: u64 },
    Frame { session: u64, text: String },
    Closed { session: u64, reason: String },
}

impl TransportEvent {
    pub fn session(&self) -> u64 {
        match self {
            Self::Opened { session } | Self::Frame { session, .. } | Self::Closed { session, .. } => {
                *session
            }
        }
    }
}

/// Running session task. Dropping it cancels the task.
#[derive(Debug)]
struct SessionHandle {
    cancel: CancellationToken,
    _task: JoinHandle<()>,
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub struct TransportManager<C> {
    connector: Arc<C>,
    gate: ReconnectGate,
    state: SessionState,
    generation: u64,
    session: Option<SessionHandle>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
}

impl<C: PushConnector> TransportManager<C> {
    /// Returns the manager and the receiver the client loop reads events from.
    pub fn new(
        connector: C,
        inhibit_cycles: u32,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let manager = Self {
            connector: Arc::new(connector),
            gate: ReconnectGate::new(inhibit_cycles),
            state: SessionState::Closed,
            generation: 0,
            session: None,
            events_tx,
        };
        (manager, events_rx)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn gate(&self) -> &ReconnectGate {
        &self.gate
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Called once per scheduler tick. Starts a new session when the current
    /// one is closed and the inhibit cycle allows it. Returns whether an
    /// attempt was started.
    pub fn ensure_connected(&mut self) -> bool {
        if self.state != SessionState::Closed {
            return false;
        }
        if !self.gate.on_tick() {
            tracing::debug!(remaining = self.gate.remaining(), "push reconnect inhibited");
            return false;
        }

        self.session = None;
        self.generation += 1;
        let session = self.generation;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_session(
            Arc::clone(&self.connector),
            session,
            self.events_tx.clone(),
            cancel.clone(),
        ));
        self.session = Some(SessionHandle {
            cancel,
            _task: task,
        });
        self.state = SessionState::Connecting;
        tracing::debug!(session, "push session connecting");
        true
    }

    /// Fold a session event into the manager state; returns what the client
    /// loop should react to.
    pub fn handle(&mut self, event: TransportEvent) -> Option<ClientEvent> {
        if event.session() != self.generation || self.session.is_none() {
            tracing::debug!(session = event.session(), current = self.generation, "stale push event dropped");
            return None;
        }

        match event {
            TransportEvent::Opened { session } => {
                self.state = SessionState::Open;
                tracing::debug!(session, "push session open");
                None
            }
            TransportEvent::Frame { text, .. } => match InboundMessage::parse(&text) {
                Ok(msg) => Some(msg.into()),
                Err(e) => {
                    tracing::debug!("ignoring push frame: {e}");
                    None
                }
            },
            TransportEvent::Closed { session, reason } => {
                tracing::warn!(session, "push channel closed: {reason}");
                self.session = None;
                self.state = SessionState::Closed;
                self.gate.on_failure();
                Some(ClientEvent::ConnectionClosed)
            }
        }
    }

    /// Cancel the live session, if any.
    pub fn shutdown(&mut self) {
        if self.session.take().is_some() {
            tracing::debug!(session = self.generation, "push session shut down");
        }
        self.state = SessionState::Closed;
    }
}

async fn run_session<C: PushConnector>(
    connector: Arc<C>,
    session: u64,
    tx: mpsc::UnboundedSender<TransportEvent>,
    cancel: CancellationToken,
) {
    let connected = tokio::select! {
        () = cancel.cancelled() => return,
        result = tokio::time::timeout(CONNECT_TIMEOUT, connector.connect()) => {
            result.unwrap_or_else(|_| {
                Err(TransportError::Unavailable(format!(
                    "no handshake within {}s",
                    CONNECT_TIMEOUT.as_secs()
                )))
            })
        }
    };
    let mut frames = match connected {
        Ok(frames) => frames,
        Err(e) => {
            let _ = tx.send(TransportEvent::Closed {
                session,
                reason: e.to_string(),
            });
            return;
        }
    };
    if tx.send(TransportEvent::Opened { session }).is_err() {
        return;
    }

    let reason = loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            frame = frames.next() => match frame {
                Some(Ok(text)) => {
                    if tx.send(TransportEvent::Frame { session, text }).is_err() {
                        return;
                    }
                }
                Some(Err(e)) => break e.to_string(),
                None => break "connection closed by device".to_string(),
            },
        }
    };
    let _ = tx.send(TransportEvent::Closed { session, reason });
}
