//! Error types and stable error codes.

use crate::event::ChannelState;
use crate::protocol::RejectReason;

/// Errors produced by the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,

    #[error("transport is already connected")]
    AlreadyConnected,

    #[error("transport is closed")]
    Closed,

    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("websocket error: {0}")]
    WebSocket(String),
}

/// Errors surfaced to callers of channel, registry and multiplexer operations.
///
/// Network and server conditions never reach stream observers through this
/// type: they are converted into `Status` events. These values are returned
/// only from the awaited operations (`subscribe`, `publish`, presence fetch).
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("invalid channel identifier {id:?}: {reason}")]
    InvalidIdentifier { id: String, reason: String },

    #[error("channel {0} is already initialized")]
    AlreadyInitialized(String),

    #[error("channel {id} is not connected (state: {state:?})")]
    NotConnected { id: String, state: ChannelState },

    #[error("a subscribe request for channel {0} is already in flight")]
    SubscribeInFlight(String),

    #[error("subscribe to {id} rejected ({reason:?}): {message}")]
    Rejected {
        id: String,
        reason: RejectReason,
        message: String,
    },

    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("request {0} timed out")]
    Timeout(u64),

    #[error("connection lost before a reply arrived")]
    ConnectionLost,

    #[error("transport failed permanently: {0}")]
    TransportFailed(String),

    #[error("multiplexer is shut down")]
    ShutDown,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ChannelError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::InvalidIdentifier { .. } => "invalid_identifier",
            Self::AlreadyInitialized(_) => "already_initialized",
            Self::NotConnected { .. } => "not_connected",
            Self::SubscribeInFlight(_) => "subscribe_in_flight",
            Self::Rejected { .. } => "rejected",
            Self::RequestFailed(_) => "request_failed",
            Self::Timeout(_) => "timeout",
            Self::ConnectionLost => "connection_lost",
            Self::TransportFailed(_) => "transport_failed",
            Self::ShutDown => "shut_down",
            Self::Transport(_) => "transport",
        }
    }

    /// Whether the condition ends the channel's lifetime.
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::InvalidIdentifier { .. } | Self::TransportFailed(_) | Self::ShutDown => true,
            Self::Rejected { reason, .. } => reason.is_terminal(),
            _ => false,
        }
    }
}
