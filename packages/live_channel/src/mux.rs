//! Connection multiplexer.
//!
//! Owns the one transport, correlates replies with requests and routes
//! channel pushes to the tracked [`Channel`]s. All inbound events are
//! applied by a single routing task, so a channel sees its frames in the
//! order the transport delivered them.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

use crate::channel::{Channel, ChannelConfig, ChannelFrame, MessageProcessor};
use crate::config::ChannelsFileConfig;
use crate::dispatch::{Dispatcher, PendingRequest};
use crate::error::{ChannelError, TransportError};
use crate::event::ChannelState;
use crate::metrics::{MetricsSnapshot, MuxMetrics};
use crate::protocol::ServerFrame;
use crate::registry::ChannelTable;
use crate::transport::{Transport, TransportEvent};

/// Health of the shared connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The transport gave up. Terminal.
    Failed,
}

#[derive(Clone)]
pub struct MuxOptions {
    pub request_timeout: Duration,
    /// Message processors keyed by channel scope.
    processors: HashMap<String, MessageProcessor>,
}

impl Default for MuxOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            processors: HashMap::new(),
        }
    }
}

impl MuxOptions {
    pub fn from_file(config: &ChannelsFileConfig) -> Self {
        Self::default().with_request_timeout(config.request_timeout())
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Transform publications on every channel of `scope` before delivery.
    pub fn with_processor(
        mut self,
        scope: impl Into<String>,
        process: impl Fn(serde_json::Value) -> serde_json::Value + Send + Sync + 'static,
    ) -> Self {
        self.processors.insert(scope.into(), Arc::new(process));
        self
    }
}

impl fmt::Debug for MuxOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut scopes: Vec<&String> = self.processors.keys().collect();
        scopes.sort();
        f.debug_struct("MuxOptions")
            .field("request_timeout", &self.request_timeout)
            .field("processors", &scopes)
            .finish()
    }
}

#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<MuxInner>,
}

struct MuxInner {
    dispatcher: Dispatcher,
    table: ChannelTable,
    processors: HashMap<String, MessageProcessor>,
    state_tx: watch::Sender<ConnectionState>,
    /// Reason the transport gave up, once it has.
    failure: Mutex<Option<String>>,
    metrics: MuxMetrics,
    cancel: CancellationToken,
}

type SubscribeReceiver = oneshot::Receiver<Result<(), ChannelError>>;

impl Multiplexer {
    /// Connect `transport` and spawn the routing task.
    ///
    /// Must be called from within a tokio runtime. The task runs until
    /// [`shutdown`](Self::shutdown), until the transport fails, or until
    /// the last handle is dropped.
    pub fn start(transport: Arc<dyn Transport>, options: MuxOptions) -> Result<Self, TransportError> {
        let events = transport.connect()?;
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let mux = Self {
            inner: Arc::new(MuxInner {
                dispatcher: Dispatcher::new(transport, options.request_timeout),
                table: ChannelTable::default(),
                processors: options.processors,
                state_tx,
                failure: Mutex::new(None),
                metrics: MuxMetrics::new(),
                cancel: CancellationToken::new(),
            }),
        };

        let session = uuid::Uuid::new_v4();
        info!(session = %session, "multiplexer started");
        let router = Arc::downgrade(&mux.inner);
        let cancel = mux.inner.cancel.clone();
        tokio::spawn(route(router, cancel, events).instrument(info_span!("live_mux", session = %session)));
        Ok(mux)
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Receiver that observes every connection state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Why the transport failed, if it has.
    pub fn failure_reason(&self) -> Option<String> {
        self.inner.failure.lock().clone()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Subscribe `channel` and wait for the server's answer.
    ///
    /// Only one subscribe per channel may be outstanding; a second call
    /// while one is in flight returns [`ChannelError::SubscribeInFlight`].
    pub async fn subscribe(&self, channel: &Channel) -> Result<(), ChannelError> {
        let (request_id, rx) = self.start_subscribe(channel)?;
        self.finish_subscribe(channel, request_id, rx).await
    }

    /// Shut `channel` down and tell the server.
    pub fn unsubscribe(&self, channel: &Channel) {
        channel.disconnect();
    }

    /// Shut every channel down and close the transport. Idempotent.
    pub fn shutdown(&self) {
        if let Some(count) = self.inner.close() {
            info!(channels = count, "multiplexer shut down");
        }
    }

    pub(crate) fn table(&self) -> &ChannelTable {
        &self.inner.table
    }

    pub(crate) fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    // -- routing task --

    /// Apply one transport event. Returns false once routing must stop.
    fn apply_event(&self, event: Option<TransportEvent>, ever_connected: &mut bool) -> bool {
        match event {
            Some(TransportEvent::Connecting) => {
                debug!("transport connecting");
                self.set_state(ConnectionState::Connecting);
            }
            Some(TransportEvent::Connected) => {
                let reconnect = std::mem::replace(ever_connected, true);
                if reconnect {
                    self.inner.metrics.reconnected();
                    info!("transport reconnected");
                } else {
                    info!("transport connected");
                }
                self.set_state(ConnectionState::Connected);
                self.subscribe_all(reconnect);
            }
            Some(TransportEvent::Disconnected { reason }) => self.on_disconnected(reason),
            Some(TransportEvent::Failed { reason }) => {
                self.on_failed(reason);
                return false;
            }
            Some(TransportEvent::Frame(frame)) => self.on_frame(frame),
            None => {
                if !self.inner.cancel.is_cancelled() {
                    self.on_failed("transport event stream closed".to_string());
                }
                return false;
            }
        }
        true
    }

    fn set_state(&self, state: ConnectionState) {
        // After shutdown only `Disconnected` may be published.
        if self.inner.cancel.is_cancelled() && state != ConnectionState::Disconnected {
            return;
        }
        let previous = self.inner.state_tx.send_replace(state);
        if previous != state {
            trace!(from = ?previous, to = ?state, "connection state changed");
        }
    }

    /// Subscribe every tracked channel that is not live, in open order.
    fn subscribe_all(&self, reconnect: bool) {
        for channel in self.inner.table.snapshot() {
            if channel.is_terminal() || channel.state() == ChannelState::Connected {
                continue;
            }
            if reconnect {
                self.inner.metrics.resubscribed();
            }
            self.request_subscribe(&channel);
        }
    }

    fn on_disconnected(&self, reason: Option<String>) {
        warn!(reason = reason.as_deref().unwrap_or("unknown"), "transport disconnected");
        self.set_state(ConnectionState::Disconnected);
        for pending in self.inner.dispatcher.drain() {
            pending.fail(ChannelError::ConnectionLost);
        }
        for channel in self.inner.table.snapshot() {
            channel.handle(ChannelFrame::Unsubscribe);
        }
    }

    fn on_failed(&self, reason: String) {
        error!(reason = %reason, "transport failed permanently");
        *self.inner.failure.lock() = Some(reason.clone());
        self.set_state(ConnectionState::Failed);
        for pending in self.inner.dispatcher.drain() {
            pending.fail(ChannelError::TransportFailed(reason.clone()));
        }
        let channels = self.inner.table.drain();
        for channel in channels {
            channel.shutdown_with_error(reason.clone());
        }
    }

    fn on_frame(&self, frame: ServerFrame) {
        match frame.request_id() {
            Some(request_id) => self.on_reply(request_id, frame),
            None => self.route_frame(frame),
        }
    }

    fn on_reply(&self, request_id: u64, frame: ServerFrame) {
        let Some(pending) = self.inner.dispatcher.take(request_id) else {
            // A subscribe that timed out locally may still succeed remotely.
            if let ServerFrame::SubscribeOk {
                channel,
                has_presence,
                can_publish,
                ..
            } = &frame
            {
                if let Some(tracked) = self.inner.table.get(channel) {
                    if !tracked.is_terminal() {
                        debug!(channel = %channel, request_id, "late subscribe reply applied");
                        self.apply_subscribe_ok(&tracked, *has_presence, *can_publish);
                        return;
                    }
                }
            }
            trace!(request_id, "reply for unknown request dropped");
            self.inner.metrics.frame_dropped();
            return;
        };

        match pending {
            PendingRequest::Subscribe { channel, done } => {
                channel.end_subscribe();
                let result = self.apply_subscribe_reply(&channel, frame);
                let _ = done.send(result);
            }
            PendingRequest::Reply(tx) => {
                let result = match frame {
                    ServerFrame::RequestFailed { message, .. } => {
                        Err(ChannelError::RequestFailed(message))
                    }
                    other => Ok(other),
                };
                let _ = tx.send(result);
            }
        }
    }

    fn apply_subscribe_reply(&self, channel: &Channel, frame: ServerFrame) -> Result<(), ChannelError> {
        let id = channel.id().id().to_string();
        match frame {
            ServerFrame::SubscribeOk {
                has_presence,
                can_publish,
                ..
            } => {
                self.apply_subscribe_ok(channel, has_presence, can_publish);
                Ok(())
            }
            ServerFrame::SubscribeRejected {
                reason, message, ..
            } => {
                self.inner.metrics.subscribe_failed();
                let message = if message.is_empty() {
                    format!("subscribe rejected: {reason:?}")
                } else {
                    message
                };
                warn!(channel = %id, reason = ?reason, message = %message, "subscribe rejected");
                if reason.is_terminal() {
                    channel.shutdown_with_error(message.clone());
                } else {
                    channel.handle(ChannelFrame::SubscribeError(message.clone()));
                }
                Err(ChannelError::Rejected {
                    id,
                    reason,
                    message,
                })
            }
            ServerFrame::RequestFailed { message, .. } => {
                self.inner.metrics.subscribe_failed();
                warn!(channel = %id, message = %message, "subscribe failed");
                channel.handle(ChannelFrame::SubscribeError(message.clone()));
                Err(ChannelError::RequestFailed(message))
            }
            other => {
                self.inner.metrics.subscribe_failed();
                let err = ChannelError::RequestFailed(format!("unexpected subscribe reply: {other:?}"));
                warn!(channel = %id, error = %err, "subscribe failed");
                channel.handle(ChannelFrame::SubscribeError(err.to_string()));
                Err(err)
            }
        }
    }

    /// Initialize on the first success; later successes keep the original
    /// configuration.
    fn apply_subscribe_ok(&self, channel: &Channel, has_presence: bool, can_publish: bool) {
        match channel.config() {
            Some(existing) => {
                if existing.has_presence != has_presence || existing.can_publish != can_publish {
                    warn!(
                        channel = %channel.id(),
                        has_presence,
                        can_publish,
                        "server changed channel capabilities, keeping the original"
                    );
                }
            }
            None => {
                let config = ChannelConfig {
                    has_presence,
                    can_publish,
                    process_message: self.inner.processors.get(channel.id().scope()).cloned(),
                };
                if let Err(e) = channel.initialize(config) {
                    debug!(channel = %channel.id(), error = %e, "channel already initialized");
                }
            }
        }
        channel.handle(ChannelFrame::SubscribeSuccess);
        debug!(channel = %channel.id(), has_presence, can_publish, "subscribed");
    }

    fn route_frame(&self, frame: ServerFrame) {
        let Some(id) = frame.channel().map(str::to_string) else {
            self.inner.metrics.frame_dropped();
            return;
        };
        let Some(channel) = self.inner.table.get(&id) else {
            trace!(channel = %id, "frame for untracked channel dropped");
            self.inner.metrics.frame_dropped();
            return;
        };

        let sub = match frame {
            ServerFrame::Publication { data, .. } => ChannelFrame::Publication(data),
            ServerFrame::Subscribed { .. } => {
                // Capabilities arrive only with a subscribe reply.
                if !channel.is_initialized() {
                    trace!(channel = %id, "subscribed push before negotiation dropped");
                    self.inner.metrics.frame_dropped();
                    return;
                }
                ChannelFrame::SubscribeSuccess
            }
            ServerFrame::SubscribeError { message, .. } => ChannelFrame::SubscribeError(message),
            ServerFrame::Unsubscribed { .. } => ChannelFrame::Unsubscribe,
            ServerFrame::Join { user, info, .. } => ChannelFrame::Join { user, info },
            ServerFrame::Leave { user, info, .. } => ChannelFrame::Leave { user, info },
            _ => {
                self.inner.metrics.frame_dropped();
                return;
            }
        };
        channel.handle(sub);
        self.inner.metrics.frame_routed();
    }

    // -- subscribe plumbing --

    fn start_subscribe(&self, channel: &Channel) -> Result<(u64, SubscribeReceiver), ChannelError> {
        if self.inner.cancel.is_cancelled() {
            return Err(ChannelError::ShutDown);
        }
        match self.connection_state() {
            ConnectionState::Connected => {}
            ConnectionState::Failed => {
                return Err(ChannelError::TransportFailed(
                    self.failure_reason().unwrap_or_default(),
                ));
            }
            ConnectionState::Disconnected | ConnectionState::Connecting => {
                return Err(ChannelError::Transport(TransportError::NotConnected));
            }
        }

        let state = channel.state();
        if state.is_terminal() {
            return Err(ChannelError::NotConnected {
                id: channel.id().id().to_string(),
                state,
            });
        }
        if !channel.begin_subscribe() {
            return Err(ChannelError::SubscribeInFlight(channel.id().id().to_string()));
        }

        self.inner.metrics.subscribe_attempted();
        debug!(channel = %channel.id(), "subscribing");
        self.inner
            .dispatcher
            .send_subscribe(channel)
            .inspect_err(|_| channel.end_subscribe())
    }

    async fn finish_subscribe(
        &self,
        channel: &Channel,
        request_id: u64,
        rx: SubscribeReceiver,
    ) -> Result<(), ChannelError> {
        match tokio::time::timeout(self.inner.dispatcher.request_timeout(), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ChannelError::ConnectionLost),
            Err(_) => {
                if let Some(pending) = self.inner.dispatcher.take(request_id) {
                    self.inner.metrics.subscribe_failed();
                    warn!(channel = %channel.id(), request_id, "subscribe timed out");
                    channel.handle(ChannelFrame::SubscribeError(
                        ChannelError::Timeout(request_id).to_string(),
                    ));
                    pending.fail(ChannelError::Timeout(request_id));
                }
                Err(ChannelError::Timeout(request_id))
            }
        }
    }

    /// Subscribe `channel` without waiting for the answer. While the
    /// transport is down the attempt is deferred to the next connect.
    pub(crate) fn request_subscribe(&self, channel: &Channel) {
        match self.start_subscribe(channel) {
            Ok((request_id, rx)) => {
                let mux = self.clone();
                let channel = channel.clone();
                tokio::spawn(async move {
                    if let Err(e) = mux.finish_subscribe(&channel, request_id, rx).await {
                        debug!(channel = %channel.id(), error = %e, "background subscribe ended");
                    }
                });
            }
            Err(ChannelError::Transport(TransportError::NotConnected)) => {
                debug!(channel = %channel.id(), "subscribe deferred until connected");
            }
            Err(ChannelError::SubscribeInFlight(_)) => {}
            Err(ChannelError::TransportFailed(reason)) => channel.shutdown_with_error(reason),
            Err(e @ ChannelError::ShutDown) => channel.shutdown_with_error(e.to_string()),
            Err(e) => {
                warn!(channel = %channel.id(), error = %e, "subscribe not sent");
                channel.handle(ChannelFrame::SubscribeError(e.to_string()));
            }
        }
    }
}

/// Routing loop. Holds only a weak reference so dropping the last
/// [`Multiplexer`] handle ends it.
async fn route(
    mux: Weak<MuxInner>,
    cancel: CancellationToken,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    let mut ever_connected = false;
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        let Some(inner) = mux.upgrade() else {
            break;
        };
        if !(Multiplexer { inner }).apply_event(event, &mut ever_connected) {
            break;
        }
    }
    debug!("routing task stopped");
}

impl MuxInner {
    /// Shut every channel down and close the transport. `None` if already
    /// closed, otherwise the number of channels that were tracked.
    fn close(&self) -> Option<usize> {
        if self.cancel.is_cancelled() {
            return None;
        }
        self.cancel.cancel();

        for pending in self.dispatcher.drain() {
            pending.fail(ChannelError::ConnectionLost);
        }
        // Unsubscribes go out while the connection is still up.
        let channels = self.table.drain();
        let count = channels.len();
        for channel in channels {
            channel.disconnect();
        }
        self.dispatcher.transport().disconnect();
        self.state_tx.send_replace(ConnectionState::Disconnected);
        Some(count)
    }
}

impl Drop for MuxInner {
    fn drop(&mut self) {
        if let Some(count) = self.close() {
            debug!(channels = count, "last multiplexer handle dropped");
        }
    }
}

impl fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexer")
            .field("state", &self.connection_state())
            .field("channels", &self.inner.table.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::ChannelIdentifier;
    use crate::protocol::{ClientFrame, RejectReason};
    use crate::registry::ChannelRegistry;
    use crate::transport::{MemoryServer, memory};
    use tokio::time::timeout;

    const TEST_TIMEOUT: Duration = Duration::from_secs(2);

    async fn wait_state(mux: &Multiplexer, want: ConnectionState) {
        let mut rx = mux.watch_state();
        timeout(TEST_TIMEOUT, rx.wait_for(|s| *s == want))
            .await
            .unwrap()
            .unwrap();
    }

    async fn wait_channel(channel: &Channel, want: ChannelState) {
        timeout(TEST_TIMEOUT, async {
            while channel.state() != want {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();
    }

    async fn started(options: MuxOptions) -> (Multiplexer, ChannelRegistry, MemoryServer) {
        let (transport, server) = memory::pair();
        let mux = Multiplexer::start(Arc::new(transport), options).unwrap();
        server.accept();
        wait_state(&mux, ConnectionState::Connected).await;
        let registry = ChannelRegistry::new(mux.clone());
        (mux, registry, server)
    }

    async fn next_subscribe(server: &mut MemoryServer) -> (u64, String) {
        match timeout(TEST_TIMEOUT, server.next_frame()).await.unwrap() {
            Some(ClientFrame::Subscribe {
                request_id,
                channel,
            }) => (request_id, channel),
            other => panic!("expected subscribe, got {other:?}"),
        }
    }

    fn ok(request_id: u64, channel: String, has_presence: bool) -> ServerFrame {
        ServerFrame::SubscribeOk {
            request_id,
            channel,
            has_presence,
            can_publish: false,
        }
    }

    #[tokio::test]
    async fn processor_applies_per_scope() {
        let options = MuxOptions::default()
            .with_processor("plugin", |raw| serde_json::json!({ "plugin": raw }));
        let (_mux, registry, mut server) = started(options).await;

        let plugin = registry.get_channel(&ChannelIdentifier::new("plugin", "testdata", "random"));
        let (rid, id) = next_subscribe(&mut server).await;
        server.push(ok(rid, id.clone(), false));
        wait_channel(&plugin, ChannelState::Connected).await;

        let mut stream = plugin.stream();
        server.push(ServerFrame::Publication {
            channel: id,
            data: serde_json::json!(3),
        });
        let _status = stream.recv().await.unwrap();
        let message = timeout(TEST_TIMEOUT, stream.recv()).await.unwrap().unwrap();
        assert_eq!(
            message,
            crate::event::ChannelEvent::Message {
                message: serde_json::json!({"plugin": 3})
            }
        );
    }

    #[tokio::test]
    async fn subscribe_deferred_until_connected() {
        let (transport, mut server) = memory::pair();
        let mux = Multiplexer::start(Arc::new(transport), MuxOptions::default()).unwrap();
        let registry = ChannelRegistry::new(mux.clone());
        wait_state(&mux, ConnectionState::Connecting).await;

        let channel = registry.get_channel(&ChannelIdentifier::new("grafana", "dashboard", "1"));
        assert_eq!(channel.state(), ChannelState::Pending);
        assert!(server.try_next_frame().is_none());

        server.accept();
        let (_, id) = next_subscribe(&mut server).await;
        assert_eq!(id, "grafana/dashboard/1");
        assert_eq!(mux.metrics().resubscribes, 0);
    }

    #[tokio::test]
    async fn explicit_subscribe_in_flight_is_rejected() {
        let (mux, registry, mut server) = started(MuxOptions::default()).await;
        let channel = registry.get_channel(&ChannelIdentifier::new("grafana", "dashboard", "1"));
        let (rid, id) = next_subscribe(&mut server).await;

        let err = mux.subscribe(&channel).await.unwrap_err();
        assert!(matches!(err, ChannelError::SubscribeInFlight(_)));

        server.push(ok(rid, id, false));
        wait_channel(&channel, ChannelState::Connected).await;
    }

    #[tokio::test]
    async fn explicit_subscribe_reports_rejection() {
        let (mux, _registry, mut server) = started(MuxOptions::default()).await;
        let id = ChannelIdentifier::new("grafana", "dashboard", "1");
        // Track without the automatic subscribe.
        let dispatcher = mux.dispatcher().clone();
        let (channel, _) = mux
            .table()
            .get_or_insert_with(id.id(), |seq| Channel::new(id.clone(), seq, dispatcher));

        let m = mux.clone();
        let c = channel.clone();
        let task = tokio::spawn(async move { m.subscribe(&c).await });
        let (rid, ch) = next_subscribe(&mut server).await;
        server.push(ServerFrame::SubscribeRejected {
            request_id: rid,
            channel: ch,
            reason: RejectReason::Unavailable,
            message: String::new(),
        });

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            ChannelError::Rejected {
                reason: RejectReason::Unavailable,
                ..
            }
        ));
        assert!(!err.is_terminal());
        let status = channel.status();
        assert_eq!(status.state, ChannelState::Pending);
        assert_eq!(status.error.as_deref(), Some("subscribe rejected: Unavailable"));
        assert_eq!(mux.metrics().subscribe_failures, 1);
    }

    #[tokio::test]
    async fn subscribe_timeout_sets_error_and_late_reply_heals() {
        let options = MuxOptions::default().with_request_timeout(Duration::from_millis(30));
        let (mux, registry, mut server) = started(options).await;
        let channel = registry.get_channel(&ChannelIdentifier::new("grafana", "dashboard", "1"));
        let (rid, id) = next_subscribe(&mut server).await;

        timeout(TEST_TIMEOUT, async {
            while channel.status().error.is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(channel.state(), ChannelState::Pending);
        assert_eq!(mux.metrics().subscribe_failures, 1);

        server.push(ok(rid, id, true));
        wait_channel(&channel, ChannelState::Connected).await;
        assert!(channel.has_presence());
        assert_eq!(channel.status().error, None);
    }

    #[tokio::test]
    async fn untracked_frames_are_counted_and_dropped() {
        let (mux, _registry, server) = started(MuxOptions::default()).await;
        server.push(ServerFrame::Publication {
            channel: "grafana/dashboard/nobody".into(),
            data: serde_json::json!(1),
        });
        server.push(ServerFrame::PresenceReply {
            request_id: 999,
            users: vec![],
        });
        timeout(TEST_TIMEOUT, async {
            while mux.metrics().frames_dropped < 2 {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(mux.metrics().frames_routed, 0);
    }

    #[tokio::test]
    async fn subscribed_push_before_negotiation_ignored() {
        let (_mux, registry, mut server) = started(MuxOptions::default()).await;
        let channel = registry.get_channel(&ChannelIdentifier::new("grafana", "dashboard", "1"));
        let (rid, id) = next_subscribe(&mut server).await;

        server.push(ServerFrame::Subscribed { channel: id.clone() });
        server.push(ok(rid, id, false));
        let mut stream = channel.stream();
        wait_channel(&channel, ChannelState::Connected).await;

        // Pending replay, then exactly one Connected.
        let mut connected = 0;
        while let Some(event) = stream.try_recv() {
            if event.as_status().map(|s| s.state) == Some(ChannelState::Connected) {
                connected += 1;
            }
        }
        assert_eq!(connected, 1);
    }

    #[tokio::test]
    async fn failed_transport_rejects_new_channels() {
        let (mux, registry, server) = started(MuxOptions::default()).await;
        server.fail("server gone");
        wait_state(&mux, ConnectionState::Failed).await;
        assert_eq!(mux.failure_reason().as_deref(), Some("server gone"));

        let channel = registry.get_channel(&ChannelIdentifier::new("grafana", "dashboard", "1"));
        let status = channel.status();
        assert_eq!(status.state, ChannelState::Shutdown);
        assert_eq!(status.error.as_deref(), Some("server gone"));
        assert!(registry.is_empty());

        let err = mux.subscribe(&channel).await.unwrap_err();
        assert!(matches!(err, ChannelError::TransportFailed(_)));
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        let (mux, registry, mut server) = started(MuxOptions::default()).await;
        let a = registry.get_channel(&ChannelIdentifier::new("grafana", "dashboard", "a"));
        let b = registry.get_channel(&ChannelIdentifier::new("grafana", "dashboard", "b"));
        let _ = next_subscribe(&mut server).await;
        let _ = next_subscribe(&mut server).await;

        mux.shutdown();
        mux.shutdown();
        assert_eq!(a.state(), ChannelState::Shutdown);
        assert_eq!(b.state(), ChannelState::Shutdown);
        assert!(registry.is_empty());
        assert_eq!(mux.connection_state(), ConnectionState::Disconnected);
        assert!(server.is_closed());

        let mut unsubscribed = Vec::new();
        while let Some(frame) = server.try_next_frame() {
            if let ClientFrame::Unsubscribe { channel } = frame {
                unsubscribed.push(channel);
            }
        }
        assert_eq!(unsubscribed, vec!["grafana/dashboard/a", "grafana/dashboard/b"]);
    }

    #[tokio::test]
    async fn get_after_shutdown_returns_closed_channel() {
        let (mux, registry, mut server) = started(MuxOptions::default()).await;
        mux.shutdown();

        let channel = registry.get_channel(&ChannelIdentifier::new("grafana", "dashboard", "late"));
        assert_eq!(channel.state(), ChannelState::Shutdown);
        assert_eq!(channel.status().error.as_deref(), Some("multiplexer is shut down"));
        assert!(registry.is_empty());
        assert!(server.try_next_frame().is_none());

        let err = mux.subscribe(&channel).await.unwrap_err();
        assert!(matches!(err, ChannelError::ShutDown));
    }

    #[tokio::test]
    async fn dropping_last_handle_stops_routing_and_transport() {
        let (mux, registry, mut server) = started(MuxOptions::default()).await;
        let channel = registry.get_channel(&ChannelIdentifier::new("grafana", "dashboard", "a"));
        let (rid, id) = next_subscribe(&mut server).await;
        server.push(ok(rid, id.clone(), false));
        wait_channel(&channel, ChannelState::Connected).await;

        drop(registry);
        drop(mux);
        timeout(TEST_TIMEOUT, async {
            while !server.is_closed() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(channel.state(), ChannelState::Shutdown);
        assert!(!server.push(ServerFrame::Publication {
            channel: id,
            data: serde_json::json!(1),
        }));
    }

    #[test]
    fn options_from_file() {
        let options = MuxOptions::from_file(&ChannelsFileConfig {
            request_timeout_secs: 3,
        });
        assert_eq!(options.request_timeout, Duration::from_secs(3));
        assert!(format!("{options:?}").contains("request_timeout"));
    }
}
