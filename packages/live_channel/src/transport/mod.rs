//! Physical connection to the live server.
//!
//! - `memory`: in-process transport and its server-side handle
//! - `websocket`: tokio-tungstenite client with reconnect/backoff

pub mod memory;
pub mod websocket;

use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::protocol::{ClientFrame, ServerFrame};

pub use memory::{MemoryServer, MemoryTransport};
pub use websocket::{BackoffPolicy, WsTransport};

/// Everything a transport reports back to its owner, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connecting,
    Connected,
    /// The connection dropped; the transport will try again.
    Disconnected { reason: Option<String> },
    /// The transport gave up. No further events follow.
    Failed { reason: String },
    Frame(ServerFrame),
}

/// A duplex connection owned exclusively by the multiplexer.
///
/// `connect` hands over the event receiver once; all later connection state
/// changes (including reconnects) arrive on it.
pub trait Transport: Send + Sync + 'static {
    fn connect(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError>;

    /// Queue a frame on the live connection.
    fn send(&self, frame: ClientFrame) -> Result<(), TransportError>;

    /// Close the connection and stop reconnecting.
    fn disconnect(&self);
}
