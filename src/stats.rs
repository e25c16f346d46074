//! Connection statistics.
//!
//! Counters are updated lock-free by the receive loop and the send path and
//! read through [`ConnectionStats`] snapshots. They reset on every successful
//! connect.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Point-in-time copy of a connection's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    /// Frames decoded with a valid checksum.
    pub frames_received: u64,
    /// Frames discarded as corrupt or malformed.
    pub frames_dropped: u64,
    /// Valid frames nobody was waiting for.
    pub frames_unrecognized: u64,
    /// Frames written to the device.
    pub frames_sent: u64,
    /// Bytes skipped while looking for a start-of-frame marker.
    pub bytes_discarded: u64,
}

/// Shared atomic counters behind [`ConnectionStats`].
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    frames_received: AtomicU64,
    frames_dropped: AtomicU64,
    frames_unrecognized: AtomicU64,
    frames_sent: AtomicU64,
    bytes_discarded: AtomicU64,
}

impl StatsCounters {
    #[inline]
    pub(crate) fn record_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_unrecognized(&self) {
        self.frames_unrecognized.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_discarded(&self, bytes: u64) {
        if bytes > 0 {
            self.bytes_discarded.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    pub(crate) fn reset(&self) {
        self.frames_received.store(0, Ordering::Relaxed);
        self.frames_dropped.store(0, Ordering::Relaxed);
        self.frames_unrecognized.store(0, Ordering::Relaxed);
        self.frames_sent.store(0, Ordering::Relaxed);
        self.bytes_discarded.store(0, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> ConnectionStats {
        ConnectionStats {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            frames_unrecognized: self.frames_unrecognized.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            bytes_discarded: self.bytes_discarded.load(Ordering::Relaxed),
        }
    }
}
