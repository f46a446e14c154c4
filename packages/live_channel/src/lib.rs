//! Live Channel - many logical channels over one streaming connection
//!
//! Consumers ask the [`ChannelRegistry`] for a channel by
//! `scope/namespace/path`. The registry keeps at most one live [`Channel`]
//! per id; every observer of that id shares its subscription. The
//! [`Multiplexer`] owns the single [`Transport`], correlates replies with
//! requests, routes pushes to channels and resubscribes them after a
//! reconnect.
//!
//! # Example
//!
//! ```no_run
//! use live_channel::{ChannelIdentifier, LiveClient, MuxOptions, WsTransport, BackoffPolicy};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let transport = WsTransport::new("ws://localhost:3000/api/live/ws", BackoffPolicy::default());
//!     let client = LiveClient::start(Arc::new(transport), MuxOptions::default()).unwrap();
//!
//!     let id: ChannelIdentifier = "grafana/dashboard/42".parse().unwrap();
//!     let channel = client.channel(&id);
//!     let mut events = channel.stream();
//!     while let Some(event) = events.recv().await {
//!         println!("{event:?}");
//!     }
//! }
//! ```

pub mod channel;
pub mod client;
pub mod config;
mod dispatch;
pub mod error;
pub mod event;
pub mod identifier;
pub mod metrics;
pub mod mux;
pub mod protocol;
pub mod registry;
pub mod transport;

pub use channel::{Channel, ChannelConfig, ChannelStream, MessageProcessor, Presence, Publisher};
pub use client::LiveClient;
pub use config::{ChannelsFileConfig, FileConfig, TransportFileConfig, load_config};
pub use error::{ChannelError, TransportError};
pub use event::{ChannelEvent, ChannelState, ChannelStatus, PresenceSet};
pub use identifier::ChannelIdentifier;
pub use metrics::MetricsSnapshot;
pub use mux::{ConnectionState, Multiplexer, MuxOptions};
pub use protocol::{ClientFrame, RejectReason, ServerFrame};
pub use registry::ChannelRegistry;
pub use transport::{BackoffPolicy, MemoryServer, MemoryTransport, Transport, TransportEvent, WsTransport};
