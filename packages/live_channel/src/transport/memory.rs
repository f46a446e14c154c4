//! In-process transport.
//!
//! [`pair`] returns the client half (a [`Transport`]) and a [`MemoryServer`]
//! that plays the server: it decides when the connection is up, pushes
//! frames, and reads whatever the client sent.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{Transport, TransportEvent};
use crate::error::TransportError;
use crate::protocol::{ClientFrame, ServerFrame};

struct Shared {
    events_tx: Option<mpsc::UnboundedSender<TransportEvent>>,
    events_rx: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    frames_tx: mpsc::UnboundedSender<ClientFrame>,
    connected: bool,
    closed: bool,
}

/// Client half of an in-process connection.
#[derive(Clone)]
pub struct MemoryTransport {
    shared: Arc<Mutex<Shared>>,
}

/// Server half of an in-process connection.
pub struct MemoryServer {
    shared: Arc<Mutex<Shared>>,
    frames_rx: mpsc::UnboundedReceiver<ClientFrame>,
}

pub fn pair() -> (MemoryTransport, MemoryServer) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (frames_tx, frames_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Mutex::new(Shared {
        events_tx: Some(events_tx),
        events_rx: Some(events_rx),
        frames_tx,
        connected: false,
        closed: false,
    }));
    (
        MemoryTransport {
            shared: shared.clone(),
        },
        MemoryServer { shared, frames_rx },
    )
}

impl MemoryTransport {
    pub fn is_connected(&self) -> bool {
        self.shared.lock().connected
    }
}

impl Transport for MemoryTransport {
    fn connect(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError> {
        let mut shared = self.shared.lock();
        if shared.closed {
            return Err(TransportError::Closed);
        }
        let rx = shared
            .events_rx
            .take()
            .ok_or(TransportError::AlreadyConnected)?;
        if let Some(tx) = &shared.events_tx {
            let _ = tx.send(TransportEvent::Connecting);
        }
        Ok(rx)
    }

    fn send(&self, frame: ClientFrame) -> Result<(), TransportError> {
        let shared = self.shared.lock();
        if shared.closed {
            return Err(TransportError::Closed);
        }
        if !shared.connected {
            return Err(TransportError::NotConnected);
        }
        shared
            .frames_tx
            .send(frame)
            .map_err(|_| TransportError::Closed)
    }

    fn disconnect(&self) {
        let mut shared = self.shared.lock();
        shared.closed = true;
        shared.connected = false;
        // Dropping the sender ends the owner's event stream.
        shared.events_tx = None;
    }
}

impl MemoryServer {
    /// Bring the connection up.
    pub fn accept(&self) -> bool {
        let mut shared = self.shared.lock();
        if shared.closed {
            return false;
        }
        shared.connected = true;
        emit(&shared, TransportEvent::Connected)
    }

    /// Drop the connection without closing the transport; the client sees
    /// `Disconnected` and waits for the next [`accept`](Self::accept).
    pub fn drop_connection(&self) -> bool {
        let mut shared = self.shared.lock();
        shared.connected = false;
        emit(
            &shared,
            TransportEvent::Disconnected {
                reason: Some("connection dropped".to_string()),
            },
        )
    }

    /// Report a permanent failure. The transport is unusable afterwards.
    pub fn fail(&self, reason: &str) -> bool {
        let mut shared = self.shared.lock();
        shared.connected = false;
        let sent = emit(
            &shared,
            TransportEvent::Failed {
                reason: reason.to_string(),
            },
        );
        shared.closed = true;
        shared.events_tx = None;
        sent
    }

    /// Deliver a frame to the client.
    pub fn push(&self, frame: ServerFrame) -> bool {
        let shared = self.shared.lock();
        emit(&shared, TransportEvent::Frame(frame))
    }

    /// Next frame the client sent, waiting if none is queued.
    pub async fn next_frame(&mut self) -> Option<ClientFrame> {
        self.frames_rx.recv().await
    }

    pub fn try_next_frame(&mut self) -> Option<ClientFrame> {
        self.frames_rx.try_recv().ok()
    }

    /// Whether the client called `disconnect`.
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }
}

fn emit(shared: &Shared, event: TransportEvent) -> bool {
    match &shared.events_tx {
        Some(tx) => tx.send(event).is_ok(),
        None => false,
    }
}
