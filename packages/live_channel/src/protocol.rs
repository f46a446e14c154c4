//! Frame vocabulary exchanged with the live server.
//!
//! Every frame is a JSON object tagged by `type`. Requests carry a
//! client-chosen `request_id` that the matching reply echoes back; pushes
//! carry the `channel` id they belong to.

use serde::{Deserialize, Serialize};

/// Frames sent from the client to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe {
        request_id: u64,
        channel: String,
    },
    /// Fire-and-forget; the server does not reply.
    Unsubscribe { channel: String },
    Publish {
        request_id: u64,
        channel: String,
        data: serde_json::Value,
    },
    Presence {
        request_id: u64,
        channel: String,
    },
}

impl ClientFrame {
    pub fn channel(&self) -> &str {
        match self {
            Self::Subscribe { channel, .. }
            | Self::Unsubscribe { channel }
            | Self::Publish { channel, .. }
            | Self::Presence { channel, .. } => channel,
        }
    }

    pub fn request_id(&self) -> Option<u64> {
        match self {
            Self::Subscribe { request_id, .. }
            | Self::Publish { request_id, .. }
            | Self::Presence { request_id, .. } => Some(*request_id),
            Self::Unsubscribe { .. } => None,
        }
    }
}

/// Why the server refused a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Unauthorized,
    NotFound,
    /// Temporary server-side condition; retried on the next connect.
    Unavailable,
}

impl RejectReason {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Unauthorized | Self::NotFound)
    }
}

/// Frames sent from the server to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    // -- replies --
    SubscribeOk {
        request_id: u64,
        channel: String,
        #[serde(default)]
        has_presence: bool,
        #[serde(default)]
        can_publish: bool,
    },
    SubscribeRejected {
        request_id: u64,
        channel: String,
        reason: RejectReason,
        #[serde(default)]
        message: String,
    },
    PublishAck {
        request_id: u64,
        #[serde(default)]
        result: serde_json::Value,
    },
    PresenceReply {
        request_id: u64,
        #[serde(default)]
        users: Vec<String>,
    },
    RequestFailed {
        request_id: u64,
        message: String,
    },

    // -- channel pushes --
    Publication {
        channel: String,
        data: serde_json::Value,
    },
    Subscribed {
        channel: String,
    },
    SubscribeError {
        channel: String,
        message: String,
    },
    Unsubscribed {
        channel: String,
    },
    Join {
        channel: String,
        user: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        info: Option<serde_json::Value>,
    },
    Leave {
        channel: String,
        user: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        info: Option<serde_json::Value>,
    },
}

impl ServerFrame {
    /// The request this frame replies to, if it is a reply.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Self::SubscribeOk { request_id, .. }
            | Self::SubscribeRejected { request_id, .. }
            | Self::PublishAck { request_id, .. }
            | Self::PresenceReply { request_id, .. }
            | Self::RequestFailed { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }

    /// The channel this frame addresses, if any.
    pub fn channel(&self) -> Option<&str> {
        match self {
            Self::SubscribeOk { channel, .. }
            | Self::SubscribeRejected { channel, .. }
            | Self::Publication { channel, .. }
            | Self::Subscribed { channel }
            | Self::SubscribeError { channel, .. }
            | Self::Unsubscribed { channel }
            | Self::Join { channel, .. }
            | Self::Leave { channel, .. } => Some(channel),
            Self::PublishAck { .. } | Self::PresenceReply { .. } | Self::RequestFailed { .. } => {
                None
            }
        }
    }
}

pub fn encode_client_frame(frame: &ClientFrame) -> serde_json::Result<String> {
    serde_json::to_string(frame)
}

/// Decode one inbound text frame. Malformed or unknown frames are logged and
/// skipped rather than treated as a connection error.
pub fn decode_server_frame(text: &str) -> Option<ServerFrame> {
    match serde_json::from_str(text) {
        Ok(frame) => Some(frame),
        Err(e) => {
            let frame_type = serde_json::from_str::<serde_json::Value>(text)
                .ok()
                .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_string))
                .unwrap_or_else(|| "unknown".to_string());
            tracing::warn!(
                frame_type = %frame_type,
                error = %e,
                "unknown or malformed server frame, skipping"
            );
            None
        }
    }
}
