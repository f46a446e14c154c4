//! A single logical subscription and its multicast event stream.

use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::dispatch::Dispatcher;
use crate::error::ChannelError;
use crate::event::{ChannelEvent, ChannelState, ChannelStatus, PresenceSet};
use crate::identifier::ChannelIdentifier;
use crate::protocol::{ClientFrame, ServerFrame};

/// Transforms the raw payload of a publication before it reaches observers.
pub type MessageProcessor = Arc<dyn Fn(serde_json::Value) -> serde_json::Value + Send + Sync>;

/// Capabilities negotiated with the server on the first successful subscribe.
#[derive(Clone, Default)]
pub struct ChannelConfig {
    pub has_presence: bool,
    pub can_publish: bool,
    pub process_message: Option<MessageProcessor>,
}

impl ChannelConfig {
    fn process(&self, raw: serde_json::Value) -> serde_json::Value {
        match &self.process_message {
            Some(process) => process(raw),
            None => raw,
        }
    }
}

impl fmt::Debug for ChannelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelConfig")
            .field("has_presence", &self.has_presence)
            .field("can_publish", &self.can_publish)
            .field("process_message", &self.process_message.is_some())
            .finish()
    }
}

/// Transport-level sub-events, already demultiplexed to this channel.
#[derive(Debug, Clone)]
pub(crate) enum ChannelFrame {
    Publication(serde_json::Value),
    SubscribeError(String),
    SubscribeSuccess,
    /// Server unsubscribed us, or the transport dropped.
    Unsubscribe,
    Join {
        user: String,
        info: Option<serde_json::Value>,
    },
    Leave {
        user: String,
        info: Option<serde_json::Value>,
    },
}

type ShutdownHook = Box<dyn FnOnce(&Channel) + Send>;

/// Handle to one logical channel. Cloning is cheap; all clones share state.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    id: ChannelIdentifier,
    opened: DateTime<Utc>,
    /// Position in the registry's open order.
    open_seq: u64,
    /// `None` for invalid channels, which never touch the transport.
    dispatcher: Option<Dispatcher>,
    config: OnceLock<ChannelConfig>,
    shared: Mutex<Shared>,
}

struct Shared {
    status: ChannelStatus,
    listeners: Vec<mpsc::UnboundedSender<ChannelEvent>>,
    on_shutdown: Option<ShutdownHook>,
    subscribing: bool,
}

impl Channel {
    pub(crate) fn new(id: ChannelIdentifier, open_seq: u64, dispatcher: Dispatcher) -> Self {
        Self::build(id, open_seq, Some(dispatcher), ChannelState::Pending, None)
    }

    /// A channel that failed validation. Its stream yields one `Invalid`
    /// status and completes.
    pub(crate) fn invalid(id: ChannelIdentifier, reason: String) -> Self {
        Self::build(id, 0, None, ChannelState::Invalid, Some(reason))
    }

    fn build(
        id: ChannelIdentifier,
        open_seq: u64,
        dispatcher: Option<Dispatcher>,
        state: ChannelState,
        error: Option<String>,
    ) -> Self {
        let mut status = ChannelStatus::new(id.id(), state);
        status.error = error;
        Self {
            inner: Arc::new(ChannelInner {
                opened: status.timestamp,
                id,
                open_seq,
                dispatcher,
                config: OnceLock::new(),
                shared: Mutex::new(Shared {
                    status,
                    listeners: Vec::new(),
                    on_shutdown: None,
                    subscribing: false,
                }),
            }),
        }
    }

    pub fn id(&self) -> &ChannelIdentifier {
        &self.inner.id
    }

    pub fn opened(&self) -> DateTime<Utc> {
        self.inner.opened
    }

    pub fn status(&self) -> ChannelStatus {
        self.inner.shared.lock().status.clone()
    }

    pub fn state(&self) -> ChannelState {
        self.inner.shared.lock().status.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Negotiated capabilities, once the first subscribe succeeded.
    pub fn config(&self) -> Option<&ChannelConfig> {
        self.inner.config.get()
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.config.get().is_some()
    }

    pub fn has_presence(&self) -> bool {
        self.config().is_some_and(|c| c.has_presence)
    }

    pub fn can_publish(&self) -> bool {
        self.config().is_some_and(|c| c.can_publish)
    }

    /// Whether both handles refer to the same channel instance.
    pub fn ptr_eq(&self, other: &Channel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Attach a new observer.
    ///
    /// The first event is always the current status. A terminal channel
    /// yields that status and then completes.
    pub fn stream(&self) -> ChannelStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut shared = self.inner.shared.lock();
        let _ = tx.send(ChannelEvent::Status(shared.status.clone()));
        if !shared.status.state.is_terminal() {
            shared.listeners.push(tx);
        }
        ChannelStream { rx }
    }

    /// Presence capability, present only when the server negotiated it.
    pub fn presence(&self) -> Option<Presence> {
        (self.has_presence() && self.inner.dispatcher.is_some()).then(|| Presence {
            channel: self.clone(),
        })
    }

    /// Publish capability, present only when the server granted write access.
    pub fn publisher(&self) -> Option<Publisher> {
        (self.can_publish() && self.inner.dispatcher.is_some()).then(|| Publisher {
            channel: self.clone(),
        })
    }

    /// Tear the channel down. Idempotent.
    ///
    /// Emits one final `Shutdown` status, completes every stream, sends a
    /// best-effort unsubscribe and runs the owner's shutdown hook once.
    pub fn disconnect(&self) {
        let hook = {
            let mut shared = self.inner.shared.lock();
            if shared.status.state.is_terminal() {
                return;
            }
            shared.status.transition(ChannelState::Shutdown);
            emit_status(&mut shared);
            shared.listeners.clear();
            shared.subscribing = false;
            shared.on_shutdown.take()
        };

        if let Some(dispatcher) = &self.inner.dispatcher {
            dispatcher.unsubscribe(self.inner.id.id());
        }
        debug!(channel = %self.inner.id, "channel shut down");

        if let Some(hook) = hook {
            hook(self);
        }
    }

    /// Record `message` as the channel error, emit it, then shut down.
    pub fn shutdown_with_error(&self, message: impl Into<String>) {
        {
            let mut shared = self.inner.shared.lock();
            if shared.status.state.is_terminal() {
                return;
            }
            shared.status.error = Some(message.into());
            shared.status.timestamp = Utc::now();
            emit_status(&mut shared);
        }
        self.disconnect();
    }

    /// Install negotiated capabilities. Succeeds at most once per instance.
    pub(crate) fn initialize(&self, config: ChannelConfig) -> Result<(), ChannelError> {
        self.inner
            .config
            .set(config)
            .map_err(|_| ChannelError::AlreadyInitialized(self.inner.id.id().to_string()))
    }

    /// Apply one demultiplexed transport sub-event.
    pub(crate) fn handle(&self, frame: ChannelFrame) {
        // Run the processor outside the lock.
        let frame = match frame {
            ChannelFrame::Publication(data) => ChannelFrame::Publication(match self.config() {
                Some(config) => config.process(data),
                None => data,
            }),
            other => other,
        };

        let mut shared = self.inner.shared.lock();
        if shared.status.state.is_terminal() {
            trace!(channel = %self.inner.id, "frame for closed channel dropped");
            return;
        }

        match frame {
            ChannelFrame::Publication(message) => {
                emit(&mut shared, ChannelEvent::Message { message });
                // Data flowing again means the channel is healthy.
                if shared.status.error.take().is_some() {
                    shared.status.timestamp = Utc::now();
                    emit_status(&mut shared);
                }
            }
            ChannelFrame::SubscribeError(message) => {
                shared.status.error = Some(message);
                shared.status.timestamp = Utc::now();
                emit_status(&mut shared);
            }
            ChannelFrame::SubscribeSuccess => {
                shared.status.transition(ChannelState::Connected);
                shared.status.error = None;
                emit_status(&mut shared);
            }
            ChannelFrame::Unsubscribe => {
                shared.status.transition(ChannelState::Disconnected);
                emit_status(&mut shared);
            }
            ChannelFrame::Join { user, info } => {
                if self.has_presence() {
                    emit(&mut shared, ChannelEvent::Join { user, info });
                } else {
                    trace!(channel = %self.inner.id, "join on channel without presence dropped");
                }
            }
            ChannelFrame::Leave { user, info } => {
                if self.has_presence() {
                    emit(&mut shared, ChannelEvent::Leave { user, info });
                } else {
                    trace!(channel = %self.inner.id, "leave on channel without presence dropped");
                }
            }
        }
    }

    pub(crate) fn set_shutdown_hook(&self, hook: impl FnOnce(&Channel) + Send + 'static) {
        self.inner.shared.lock().on_shutdown = Some(Box::new(hook));
    }

    /// Claim the single in-flight subscribe slot. False if one is already
    /// outstanding or the channel is closed.
    pub(crate) fn begin_subscribe(&self) -> bool {
        let mut shared = self.inner.shared.lock();
        if shared.subscribing || shared.status.state.is_terminal() {
            return false;
        }
        shared.subscribing = true;
        true
    }

    pub(crate) fn end_subscribe(&self) {
        self.inner.shared.lock().subscribing = false;
    }

    pub(crate) fn open_seq(&self) -> u64 {
        self.inner.open_seq
    }

    fn dispatcher(&self) -> Result<&Dispatcher, ChannelError> {
        self.inner
            .dispatcher
            .as_ref()
            .ok_or_else(|| ChannelError::NotConnected {
                id: self.inner.id.id().to_string(),
                state: self.state(),
            })
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id.id())
            .field("state", &self.state())
            .field("config", &self.config())
            .finish()
    }
}

/// Deliver to every attached observer, forgetting the ones that detached.
fn emit(shared: &mut Shared, event: ChannelEvent) {
    shared.listeners.retain(|tx| tx.send(event.clone()).is_ok());
}

fn emit_status(shared: &mut Shared) {
    let status = shared.status.clone();
    emit(shared, ChannelEvent::Status(status));
}

/// One observer's view of a channel's events.
///
/// Dropping it detaches this observer only; the channel and its other
/// observers are unaffected.
pub struct ChannelStream {
    rx: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl ChannelStream {
    /// Next event, or `None` once the channel has shut down.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.rx.recv().await
    }

    /// Next already-delivered event, without waiting.
    pub fn try_recv(&mut self) -> Option<ChannelEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for ChannelStream {
    type Item = ChannelEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Point-in-time presence queries for a presence-capable channel.
///
/// Nothing is cached: every [`fetch`](Self::fetch) asks the server.
#[derive(Clone)]
pub struct Presence {
    channel: Channel,
}

impl Presence {
    pub async fn fetch(&self) -> Result<PresenceSet, ChannelError> {
        let state = self.channel.state();
        if state != ChannelState::Connected {
            return Err(ChannelError::NotConnected {
                id: self.channel.id().id().to_string(),
                state,
            });
        }

        let channel = self.channel.id().id().to_string();
        let reply = self
            .channel
            .dispatcher()?
            .request(|request_id| ClientFrame::Presence {
                request_id,
                channel,
            })
            .await?;

        match reply {
            ServerFrame::PresenceReply { users, .. } => Ok(PresenceSet::from_users(users)),
            other => Err(ChannelError::RequestFailed(format!(
                "unexpected presence reply: {other:?}"
            ))),
        }
    }
}

/// Write access to a channel whose negotiated config allows publishing.
#[derive(Clone)]
pub struct Publisher {
    channel: Channel,
}

impl Publisher {
    /// Publish `data` and wait for the server's acknowledgement.
    pub async fn publish(&self, data: serde_json::Value) -> Result<serde_json::Value, ChannelError> {
        let state = self.channel.state();
        if state.is_terminal() {
            return Err(ChannelError::NotConnected {
                id: self.channel.id().id().to_string(),
                state,
            });
        }

        let channel = self.channel.id().id().to_string();
        let reply = self
            .channel
            .dispatcher()?
            .request(|request_id| ClientFrame::Publish {
                request_id,
                channel,
                data,
            })
            .await?;

        match reply {
            ServerFrame::PublishAck { result, .. } => Ok(result),
            other => Err(ChannelError::RequestFailed(format!(
                "unexpected publish reply: {other:?}"
            ))),
        }
    }
}
