//! Channel registry: at most one live `Channel` per identifier.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::channel::Channel;
use crate::identifier::ChannelIdentifier;
use crate::mux::Multiplexer;

/// Map of tracked channels shared by the registry and the multiplexer.
///
/// The lock is held only for lookups and inserts, never across an await.
#[derive(Clone, Default)]
pub(crate) struct ChannelTable {
    inner: Arc<Mutex<TableInner>>,
}

#[derive(Default)]
struct TableInner {
    channels: HashMap<String, Channel>,
    next_seq: u64,
}

#[derive(Clone)]
pub(crate) struct WeakTable(Weak<Mutex<TableInner>>);

impl WeakTable {
    pub(crate) fn upgrade(&self) -> Option<ChannelTable> {
        self.0.upgrade().map(|inner| ChannelTable { inner })
    }
}

impl ChannelTable {
    pub(crate) fn get(&self, id: &str) -> Option<Channel> {
        self.inner.lock().channels.get(id).cloned()
    }

    /// Return the live channel for `id`, or insert the one built by `make`.
    /// The boolean is true when a new channel was inserted.
    pub(crate) fn get_or_insert_with(
        &self,
        id: &str,
        make: impl FnOnce(u64) -> Channel,
    ) -> (Channel, bool) {
        let mut table = self.inner.lock();
        if let Some(existing) = table.channels.get(id) {
            // A channel mid-shutdown may not have run its removal hook yet.
            if !existing.is_terminal() {
                return (existing.clone(), false);
            }
        }
        table.next_seq += 1;
        let channel = make(table.next_seq);
        table.channels.insert(id.to_string(), channel.clone());
        (channel, true)
    }

    /// Remove `channel` if it is still the tracked instance for its id.
    pub(crate) fn remove_if_same(&self, channel: &Channel) -> bool {
        let mut table = self.inner.lock();
        let id = channel.id().id();
        match table.channels.get(id) {
            Some(tracked) if tracked.ptr_eq(channel) => {
                table.channels.remove(id);
                true
            }
            _ => false,
        }
    }

    /// Tracked channels in the order they were opened.
    pub(crate) fn snapshot(&self) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self.inner.lock().channels.values().cloned().collect();
        channels.sort_by_key(Channel::open_seq);
        channels
    }

    /// Remove every channel, returned in open order.
    pub(crate) fn drain(&self) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self
            .inner
            .lock()
            .channels
            .drain()
            .map(|(_, channel)| channel)
            .collect();
        channels.sort_by_key(Channel::open_seq);
        channels
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().channels.len()
    }

    pub(crate) fn downgrade(&self) -> WeakTable {
        WeakTable(Arc::downgrade(&self.inner))
    }
}

/// Consumer-facing entry point for obtaining channels.
#[derive(Clone)]
pub struct ChannelRegistry {
    mux: Multiplexer,
}

impl ChannelRegistry {
    pub fn new(mux: Multiplexer) -> Self {
        Self { mux }
    }

    /// Get the live channel for `id`, creating and subscribing it if needed.
    ///
    /// Concurrent callers for the same id share one instance and one
    /// subscribe request. A malformed id yields an `Invalid` channel that is
    /// not tracked and never touches the transport. Must be called from
    /// within a tokio runtime.
    pub fn get_channel(&self, id: &ChannelIdentifier) -> Channel {
        if let Err(e) = id.validate() {
            warn!(channel = %id, error = %e, "invalid channel identifier");
            return Channel::invalid(id.clone(), e.to_string());
        }

        let table = self.mux.table();
        let weak = table.downgrade();
        let dispatcher = self.mux.dispatcher().clone();
        let (channel, created) = table.get_or_insert_with(id.id(), |seq| {
            let channel = Channel::new(id.clone(), seq, dispatcher);
            channel.set_shutdown_hook(move |closed| {
                if let Some(table) = weak.upgrade() {
                    table.remove_if_same(closed);
                }
            });
            channel
        });

        if created {
            debug!(channel = %id, "channel opened");
            self.mux.request_subscribe(&channel);
        }
        channel
    }

    /// Lookup without creating.
    pub fn find(&self, id: &str) -> Option<Channel> {
        self.mux.table().get(id)
    }

    /// Stop tracking `channel`. Runs automatically when a channel shuts down,
    /// so a later [`get_channel`](Self::get_channel) builds a fresh instance.
    pub fn remove_channel(&self, channel: &Channel) -> bool {
        self.mux.table().remove_if_same(channel)
    }

    /// Tracked channels in open order.
    pub fn channels(&self) -> Vec<Channel> {
        self.mux.table().snapshot()
    }

    pub fn len(&self) -> usize {
        self.mux.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
