//! Channel metrics for observability
//!
//! Counters for connection churn and frame handling.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Channel-wide counters
#[derive(Debug, Default)]
pub struct ChannelMetrics {
    // Connection metrics
    /// Channels opened (transport reported open)
    pub channels_opened: AtomicU64,
    /// Transport-level errors observed
    pub transport_errors: AtomicU64,
    /// Reconnect timers actually scheduled (debounced errors excluded)
    pub reconnects_scheduled: AtomicU64,

    // Frame metrics
    /// Frames received on any channel
    pub frames_received: AtomicU64,
    /// Frames dropped because their payload could not be decoded
    pub frames_dropped: AtomicU64,
    /// Entity changes suppressed by the allow-list
    pub entity_events_filtered: AtomicU64,

    // Presence metrics
    /// Fallback presence fetches that failed
    pub fallback_fetch_failures: AtomicU64,
}

impl ChannelMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel_opened(&self) {
        self.channels_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transport_error(&self) {
        self.transport_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconnect_scheduled(&self) {
        self.reconnects_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn entity_event_filtered(&self) {
        self.entity_events_filtered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fallback_fetch_failed(&self) {
        self.fallback_fetch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            channels_opened: self.channels_opened.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            reconnects_scheduled: self.reconnects_scheduled.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            entity_events_filtered: self.entity_events_filtered.load(Ordering::Relaxed),
            fallback_fetch_failures: self.fallback_fetch_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub channels_opened: u64,
    pub transport_errors: u64,
    pub reconnects_scheduled: u64,
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub entity_events_filtered: u64,
    pub fallback_fetch_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let metrics = ChannelMetrics::new();
        metrics.channel_opened();
        metrics.frame_received();
        metrics.frame_received();
        metrics.frame_dropped();

        let snap = metrics.snapshot();
        assert_eq!(snap.channels_opened, 1);
        assert_eq!(snap.frames_received, 2);
        assert_eq!(snap.frames_dropped, 1);
        assert_eq!(snap.reconnects_scheduled, 0);
    }
}
