//! WebSocket transport with automatic reconnect.
//!
//! A supervisor task owns the socket. It reconnects with exponential backoff
//! until it connects, hits a permanent error (bad URL, 401/403), exhausts
//! the configured attempts or is told to stop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Transport, TransportEvent};
use crate::config::TransportFileConfig;
use crate::error::TransportError;
use crate::protocol::{ClientFrame, decode_server_frame, encode_client_frame};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max_delay: Duration,
    /// Consecutive failed connects before giving up. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: None,
        }
    }
}

impl BackoffPolicy {
    pub fn from_file(config: &TransportFileConfig) -> Self {
        Self {
            base: Duration::from_millis(config.reconnect_base_ms),
            max_delay: Duration::from_secs(config.reconnect_max_secs),
            max_attempts: (config.max_reconnect_attempts > 0).then_some(config.max_reconnect_attempts),
        }
    }

    /// Delay before the next connect after `attempt` consecutive failures.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base
            .saturating_mul(1 << attempt.min(6))
            .min(self.max_delay)
    }
}

pub struct WsTransport {
    url: String,
    backoff: BackoffPolicy,
    session: Mutex<Option<Session>>,
}

struct Session {
    outbound: mpsc::UnboundedSender<String>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl WsTransport {
    pub fn new(url: impl Into<String>, backoff: BackoffPolicy) -> Self {
        Self {
            url: url.into(),
            backoff,
            session: Mutex::new(None),
        }
    }

    pub fn from_file(config: &TransportFileConfig) -> Result<Self, TransportError> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| TransportError::WebSocket("no transport url configured".to_string()))?;
        Ok(Self::new(url, BackoffPolicy::from_file(config)))
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Transport for WsTransport {
    fn connect(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError> {
        let mut session = self.session.lock();
        if let Some(existing) = session.as_ref() {
            return Err(if existing.cancel.is_cancelled() {
                TransportError::Closed
            } else {
                TransportError::AlreadyConnected
            });
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        tokio::spawn(supervise(
            self.url.clone(),
            self.backoff.clone(),
            events_tx,
            outbound_rx,
            connected.clone(),
            cancel.clone(),
        ));

        *session = Some(Session {
            outbound: outbound_tx,
            connected,
            cancel,
        });
        Ok(events_rx)
    }

    fn send(&self, frame: ClientFrame) -> Result<(), TransportError> {
        let session = self.session.lock();
        let Some(session) = session.as_ref() else {
            return Err(TransportError::NotConnected);
        };
        if session.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        if !session.connected.load(Ordering::Acquire) {
            return Err(TransportError::NotConnected);
        }
        let text = encode_client_frame(&frame)?;
        session
            .outbound
            .send(text)
            .map_err(|_| TransportError::Closed)
    }

    fn disconnect(&self) {
        if let Some(session) = self.session.lock().as_ref() {
            session.connected.store(false, Ordering::Release);
            session.cancel.cancel();
        }
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().as_ref() {
            session.cancel.cancel();
        }
    }
}

async fn supervise(
    url: String,
    backoff: BackoffPolicy,
    events: mpsc::UnboundedSender<TransportEvent>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let mut attempt = 0u32;
    loop {
        let _ = events.send(TransportEvent::Connecting);
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = tokio_tungstenite::connect_async(url.as_str()) => result,
        };

        match result {
            Ok((ws, _response)) => {
                attempt = 0;
                // Frames queued for a previous connection are stale.
                while outbound.try_recv().is_ok() {}
                connected.store(true, Ordering::Release);
                info!(url = %url, "websocket connected");
                let _ = events.send(TransportEvent::Connected);

                let reason = run_session(ws, &events, &mut outbound, &cancel).await;
                connected.store(false, Ordering::Release);
                if cancel.is_cancelled() {
                    break;
                }
                warn!(url = %url, reason = %reason, "websocket connection lost, will reconnect");
                let _ = events.send(TransportEvent::Disconnected {
                    reason: Some(reason),
                });
            }
            Err(e) => {
                if is_permanent(&e) {
                    warn!(url = %url, error = %e, "websocket connect failed permanently");
                    let _ = events.send(TransportEvent::Failed {
                        reason: e.to_string(),
                    });
                    break;
                }
                attempt += 1;
                if backoff.max_attempts.is_some_and(|max| attempt >= max) {
                    warn!(url = %url, attempt, error = %e, "giving up on websocket connect");
                    let _ = events.send(TransportEvent::Failed {
                        reason: format!("gave up after {attempt} attempts: {e}"),
                    });
                    break;
                }
                warn!(url = %url, attempt, error = %e, "websocket connect failed");
            }
        }

        let delay = backoff.delay(attempt);
        debug!(delay_ms = delay.as_millis() as u64, attempt, "reconnect scheduled");
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    debug!(url = %url, "websocket supervisor stopped");
}

/// Pump one live connection. Returns why it ended.
async fn run_session(
    ws: WsStream,
    events: &mpsc::UnboundedSender<TransportEvent>,
    outbound: &mut mpsc::UnboundedReceiver<String>,
    cancel: &CancellationToken,
) -> String {
    let (mut write, mut read) = ws.split();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return "closed by client".to_string();
            }
            text = outbound.recv() => match text {
                Some(text) => {
                    if let Err(e) = write.send(Message::Text(text.into())).await {
                        return format!("send failed: {e}");
                    }
                }
                None => return "outbound queue closed".to_string(),
            },
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Some(frame) = decode_server_frame(text.as_str()) {
                        let _ = events.send(TransportEvent::Frame(frame));
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    return frame
                        .map(|f| f.reason.as_str().to_string())
                        .filter(|reason| !reason.is_empty())
                        .unwrap_or_else(|| "closed by server".to_string());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return e.to_string(),
                None => return "stream ended".to_string(),
            },
        }
    }
}

/// Errors that retrying cannot fix.
fn is_permanent(err: &tungstenite::Error) -> bool {
    match err {
        tungstenite::Error::Url(_) | tungstenite::Error::HttpFormat(_) => true,
        tungstenite::Error::Http(response) => matches!(response.status().as_u16(), 401 | 403),
        _ => false,
    }
}
