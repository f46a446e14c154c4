//! Outbound half of the multiplexer: request ids and pending replies.
//!
//! Channels hold a `Dispatcher` so that publish, presence and unsubscribe go
//! through the multiplexer's connection without a reference back to the
//! registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::channel::Channel;
use crate::error::ChannelError;
use crate::protocol::{ClientFrame, ServerFrame};
use crate::transport::Transport;

pub(crate) type SubscribeDone = oneshot::Sender<Result<(), ChannelError>>;

/// A request waiting for its reply frame.
pub(crate) enum PendingRequest {
    /// Applied by the routing task itself so that the channel is initialized
    /// before any frame that follows the reply.
    Subscribe { channel: Channel, done: SubscribeDone },
    Reply(oneshot::Sender<Result<ServerFrame, ChannelError>>),
}

impl PendingRequest {
    /// Resolve with `err`, releasing a subscribing channel's in-flight flag.
    pub(crate) fn fail(self, err: ChannelError) {
        match self {
            PendingRequest::Subscribe { channel, done } => {
                channel.end_subscribe();
                let _ = done.send(Err(err));
            }
            PendingRequest::Reply(tx) => {
                let _ = tx.send(Err(err));
            }
        }
    }
}

#[derive(Clone)]
pub(crate) struct Dispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    next_request_id: AtomicU64,
    request_timeout: Duration,
}

impl Dispatcher {
    pub(crate) fn new(transport: Arc<dyn Transport>, request_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                pending: Mutex::new(HashMap::new()),
                next_request_id: AtomicU64::new(1),
                request_timeout,
            }),
        }
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    pub(crate) fn request_timeout(&self) -> Duration {
        self.inner.request_timeout
    }

    pub(crate) fn send(&self, frame: ClientFrame) -> Result<(), ChannelError> {
        self.inner.transport.send(frame).map_err(ChannelError::from)
    }

    /// Best-effort unsubscribe; local teardown never waits on it.
    pub(crate) fn unsubscribe(&self, channel: &str) {
        let frame = ClientFrame::Unsubscribe {
            channel: channel.to_string(),
        };
        if let Err(e) = self.send(frame) {
            debug!(channel = %channel, error = %e, "unsubscribe not sent");
        }
    }

    /// Register a pending subscribe for `channel` and send the frame.
    pub(crate) fn send_subscribe(
        &self,
        channel: &Channel,
    ) -> Result<(u64, oneshot::Receiver<Result<(), ChannelError>>), ChannelError> {
        let request_id = self.next_request_id();
        let (done, rx) = oneshot::channel();
        self.inner.pending.lock().insert(
            request_id,
            PendingRequest::Subscribe {
                channel: channel.clone(),
                done,
            },
        );

        let frame = ClientFrame::Subscribe {
            request_id,
            channel: channel.id().id().to_string(),
        };
        if let Err(e) = self.send(frame) {
            self.take(request_id);
            return Err(e);
        }
        Ok((request_id, rx))
    }

    /// Send a request and wait for its reply, bounded by the request timeout.
    pub(crate) async fn request(
        &self,
        build: impl FnOnce(u64) -> ClientFrame,
    ) -> Result<ServerFrame, ChannelError> {
        let request_id = self.next_request_id();
        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .insert(request_id, PendingRequest::Reply(tx));

        if let Err(e) = self.send(build(request_id)) {
            self.take(request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.inner.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ChannelError::ConnectionLost),
            Err(_) => {
                self.take(request_id);
                Err(ChannelError::Timeout(request_id))
            }
        }
    }

    pub(crate) fn take(&self, request_id: u64) -> Option<PendingRequest> {
        self.inner.pending.lock().remove(&request_id)
    }

    /// Remove every pending request, lowest id first.
    pub(crate) fn drain(&self) -> Vec<PendingRequest> {
        let mut drained: Vec<(u64, PendingRequest)> = self.inner.pending.lock().drain().collect();
        drained.sort_by_key(|(id, _)| *id);
        drained.into_iter().map(|(_, p)| p).collect()
    }

    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    fn next_request_id(&self) -> u64 {
        self.inner.next_request_id.fetch_add(1, Ordering::Relaxed)
    }
}
