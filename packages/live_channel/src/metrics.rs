//! Multiplexer counters.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct MuxMetrics {
    /// Push frames delivered to a tracked channel
    frames_routed: AtomicU64,
    /// Frames for unknown channels or requests nobody is waiting on
    frames_dropped: AtomicU64,
    subscribe_attempts: AtomicU64,
    /// Subscribe attempts made because the transport came back
    resubscribes: AtomicU64,
    subscribe_failures: AtomicU64,
    reconnects: AtomicU64,
}

impl MuxMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frame_routed(&self) {
        self.frames_routed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscribe_attempted(&self) {
        self.subscribe_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn resubscribed(&self) {
        self.resubscribes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscribe_failed(&self) {
        self.subscribe_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconnected(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_routed: self.frames_routed.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            subscribe_attempts: self.subscribe_attempts.load(Ordering::Relaxed),
            resubscribes: self.resubscribes.load(Ordering::Relaxed),
            subscribe_failures: self.subscribe_failures.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Serializable point-in-time copy of [`MuxMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub frames_routed: u64,
    pub frames_dropped: u64,
    pub subscribe_attempts: u64,
    pub resubscribes: u64,
    pub subscribe_failures: u64,
    pub reconnects: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = MuxMetrics::new();
        metrics.frame_routed();
        metrics.frame_routed();
        metrics.frame_dropped();
        metrics.subscribe_attempted();
        metrics.resubscribed();
        metrics.reconnected();

        let snap = metrics.snapshot();
        assert_eq!(snap.frames_routed, 2);
        assert_eq!(snap.frames_dropped, 1);
        assert_eq!(snap.subscribe_attempts, 1);
        assert_eq!(snap.resubscribes, 1);
        assert_eq!(snap.subscribe_failures, 0);
        assert_eq!(snap.reconnects, 1);
    }

    #[test]
    fn snapshot_serializes() {
        let snap = MuxMetrics::new().snapshot();
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["frames_routed"], 0);
        assert_eq!(json["reconnects"], 0);
    }
}
