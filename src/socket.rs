//! Persistent push socket.
//!
//! A [`SocketConnector`] turns a credential plus key material into a live
//! [`SocketSession`]. The session yields decrypted messages and one closure
//! signal. Transports usually notice a drop in more than one place (a close
//! frame and the stream ending, say); all of them go through a single
//! [`CloseNotifier`], so the consumer sees exactly one closure per session.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::MaybeTlsStream;

use crate::keys::PrivateEce;
use crate::protocol::PushMessage;
use crate::store::Acg;

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Messages buffered between the transport and the supervisor's pump.
pub const MESSAGE_CHANNEL_CAPACITY: usize = 256;

pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `disconnect()` was called on our side.
    LocalDisconnect,
    /// The backend or the network ended the session.
    Remote(String),
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LocalDisconnect => f.write_str("disconnected locally"),
            Self::Remote(detail) => write!(f, "closed remotely: {}", detail),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("invalid socket endpoint {0}: {1}")]
    InvalidEndpoint(String, String),
    #[error("socket handshake failed: {0}")]
    Handshake(#[source] tokio_tungstenite::tungstenite::Error),
    #[error("socket connect failed: {0}")]
    Other(String),
}

/// Everything a connector needs to open an authenticated session.
#[derive(Debug, Clone)]
pub struct SocketParams {
    pub acg: Acg,
    pub ece: PrivateEce,
}

#[async_trait]
pub trait SocketConnector: Send + Sync {
    /// Suspends until the transport is ready or fails.
    async fn connect(&self, params: SocketParams) -> Result<SocketSession, SocketError>;
}

/// Fires the closure signal at most once, no matter how many places report it.
#[derive(Clone)]
pub struct CloseNotifier {
    tx: Arc<Mutex<Option<oneshot::Sender<CloseReason>>>>,
}

impl CloseNotifier {
    /// Returns true if this call delivered the signal.
    pub fn notify(&self, reason: CloseReason) -> bool {
        match self.tx.lock().take() {
            Some(tx) => {
                let _ = tx.send(reason);
                true
            }
            None => false,
        }
    }

    pub fn is_fired(&self) -> bool {
        self.tx.lock().is_none()
    }
}

/// Handle that tears a session down.
#[derive(Debug, Clone)]
pub struct SocketHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl SocketHandle {
    /// Ask the transport to close. Idempotent.
    pub fn disconnect(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// A live session as handed to the supervisor.
pub struct SocketSession {
    pub handle: SocketHandle,
    pub messages: mpsc::Receiver<PushMessage>,
    pub closed: oneshot::Receiver<CloseReason>,
}

/// The transport's side of a [`SocketSession`].
pub struct SessionDriver {
    pub messages: mpsc::Sender<PushMessage>,
    pub closer: CloseNotifier,
    pub shutdown_rx: watch::Receiver<bool>,
}

impl SocketSession {
    /// Create a connected pair: the session for the consumer, the driver for
    /// the transport task.
    pub fn channel(capacity: usize) -> (SocketSession, SessionDriver) {
        let (msg_tx, msg_rx) = mpsc::channel(capacity);
        let (close_tx, close_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let session = SocketSession {
            handle: SocketHandle { shutdown_tx },
            messages: msg_rx,
            closed: close_rx,
        };
        let driver = SessionDriver {
            messages: msg_tx,
            closer: CloseNotifier {
                tx: Arc::new(Mutex::new(Some(close_tx))),
            },
            shutdown_rx,
        };
        (session, driver)
    }
}

/// Connects to a push relay over WebSocket.
///
/// The relay authenticates with `Authorization: AidLogin {id}:{securityToken}`
/// and delivers each message as a JSON text frame that it has already
/// decrypted, so the private half of the key material never leaves this
/// process.
pub struct WsConnector {
    endpoint: String,
    ping_interval: Duration,
}

impl WsConnector {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ping_interval: DEFAULT_PING_INTERVAL,
        }
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }
}

#[async_trait]
impl SocketConnector for WsConnector {
    async fn connect(&self, params: SocketParams) -> Result<SocketSession, SocketError> {
        let mut request = self
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| SocketError::InvalidEndpoint(self.endpoint.clone(), e.to_string()))?;
        let auth = format!("AidLogin {}:{}", params.acg.id, params.acg.security_token);
        let auth = HeaderValue::from_str(&auth)
            .map_err(|e| SocketError::Other(format!("bad auth header: {}", e)))?;
        request.headers_mut().insert(AUTHORIZATION, auth);

        let (ws_stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(SocketError::Handshake)?;
        tracing::info!(endpoint = %self.endpoint, "push socket connected");

        let (session, driver) = SocketSession::channel(MESSAGE_CHANNEL_CAPACITY);
        tokio::spawn(run_connection(ws_stream, driver, self.ping_interval));
        Ok(session)
    }
}

async fn run_connection(ws_stream: WsStream, mut driver: SessionDriver, ping_every: Duration) {
    let (mut sink, mut stream) = ws_stream.split();
    let mut ping_interval = tokio::time::interval(ping_every);
    ping_interval.tick().await; // Skip the first immediate tick.

    let reason = loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<PushMessage>(text.as_str()) {
                            Ok(message) => {
                                if driver.messages.send(message).await.is_err() {
                                    // Consumer went away; nothing left to deliver to.
                                    let _ = sink.send(Message::Close(None)).await;
                                    break CloseReason::LocalDisconnect;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "dropping undecodable push frame");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sink.send(Message::Pong(data)).await.is_err() {
                            break CloseReason::Remote("transport closed".into());
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let detail = frame
                            .map(|f| format!("connection closed by backend ({})", f.code))
                            .unwrap_or_else(|| "connection closed by backend".into());
                        driver.closer.notify(CloseReason::Remote(detail));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break CloseReason::Remote(format!("transport error: {}", e)),
                    None => break CloseReason::Remote("transport closed".into()),
                }
            }
            _ = ping_interval.tick() => {
                if sink.send(Message::Ping(vec![].into())).await.is_err() {
                    break CloseReason::Remote("transport closed".into());
                }
            }
            _ = driver.shutdown_rx.changed() => {
                let _ = sink.send(Message::Close(None)).await;
                break CloseReason::LocalDisconnect;
            }
        }
    };

    // A close frame may already have fired the signal; this is then a no-op.
    if driver.closer.notify(reason.clone()) {
        tracing::debug!(%reason, "push socket closed");
    }
}
