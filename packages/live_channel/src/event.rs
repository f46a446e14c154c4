//! The event vocabulary observers of a channel stream switch on.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a single channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    /// Created, subscribe not yet acknowledged.
    Pending,
    Connected,
    /// Transport dropped or server unsubscribed; eligible for resubscribe.
    Disconnected,
    /// Terminal: closed by its owner or by a fatal error.
    Shutdown,
    /// Terminal: the identifier was malformed, no I/O was attempted.
    Invalid,
}

impl ChannelState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Shutdown | Self::Invalid)
    }
}

/// Point-in-time status of a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelStatus {
    pub id: String,
    pub state: ChannelState,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChannelStatus {
    pub fn new(id: impl Into<String>, state: ChannelState) -> Self {
        Self {
            id: id.into(),
            state,
            timestamp: Utc::now(),
            error: None,
        }
    }

    /// Move to `state`, refreshing the timestamp.
    pub(crate) fn transition(&mut self, state: ChannelState) {
        self.state = state;
        self.timestamp = Utc::now();
    }
}

/// One event on a channel stream.
///
/// Serialized with a `type` tag of `status`, `message`, `join` or `leave`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChannelEvent {
    Status(ChannelStatus),
    Message {
        message: serde_json::Value,
    },
    Join {
        user: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        info: Option<serde_json::Value>,
    },
    Leave {
        user: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        info: Option<serde_json::Value>,
    },
}

impl ChannelEvent {
    pub fn as_status(&self) -> Option<&ChannelStatus> {
        match self {
            Self::Status(status) => Some(status),
            _ => None,
        }
    }
}

/// Users currently present on a channel, sorted and de-duplicated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceSet {
    pub users: Vec<String>,
}

impl PresenceSet {
    pub fn from_users(users: impl IntoIterator<Item = String>) -> Self {
        let users: BTreeSet<String> = users.into_iter().collect();
        Self {
            users: users.into_iter().collect(),
        }
    }

    pub fn contains(&self, user: &str) -> bool {
        self.users.binary_search_by(|u| u.as_str().cmp(user)).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(ChannelState::Shutdown.is_terminal());
        assert!(ChannelState::Invalid.is_terminal());
        assert!(!ChannelState::Disconnected.is_terminal());
        assert!(!ChannelState::Pending.is_terminal());
    }

    #[test]
    fn event_tags_are_stable() {
        let status = ChannelEvent::Status(ChannelStatus::new("a/b/c", ChannelState::Connected));
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["state"], "connected");
        assert!(json.get("error").is_none());

        let msg = ChannelEvent::Message {
            message: serde_json::json!({"value": 7}),
        };
        assert_eq!(serde_json::to_value(&msg).unwrap()["type"], "message");

        let join = ChannelEvent::Join {
            user: "alice".into(),
            info: None,
        };
        let json = serde_json::to_value(&join).unwrap();
        assert_eq!(json["type"], "join");
        assert_eq!(json["user"], "alice");

        let leave = ChannelEvent::Leave {
            user: "alice".into(),
            info: None,
        };
        assert_eq!(serde_json::to_value(&leave).unwrap()["type"], "leave");
    }

    #[test]
    fn status_with_error_serializes_error() {
        let mut status = ChannelStatus::new("a/b/c", ChannelState::Pending);
        status.error = Some("boom".into());
        let json = serde_json::to_value(ChannelEvent::Status(status)).unwrap();
        assert_eq!(json["error"], "boom");
    }

    #[test]
    fn presence_set_sorts_and_dedups() {
        let set = PresenceSet::from_users(["bob".to_string(), "alice".into(), "bob".into()]);
        assert_eq!(set.users, vec!["alice", "bob"]);
        assert!(set.contains("bob"));
        assert!(!set.contains("carol"));
    }
}
