//! Per-frame counters.
//!
//! Counters are plain atomics so recording threads can bump them without a
//! lock. At every frame boundary the live counters are swapped into a
//! snapshot that stays readable for the whole next frame.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Counter values for one completed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameStatsSnapshot {
    pub draw_calls: u64,
    /// State binds elided because the same state was already bound.
    pub skipped_binds: u64,
    pub transient_bytes: u64,
    pub uploaded_bytes: u64,
}

#[derive(Debug, Default)]
pub struct FrameStats {
    draw_calls: AtomicU64,
    skipped_binds: AtomicU64,
    transient_bytes: AtomicU64,
    uploaded_bytes: AtomicU64,
    last_frame: Mutex<FrameStatsSnapshot>,
}

impl FrameStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_draw(&self) {
        self.draw_calls.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_skipped_bind(&self) {
        self.skipped_binds.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_transient(&self, bytes: u64) {
        self.transient_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_upload(&self, bytes: u64) {
        self.uploaded_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Values accumulated so far in the current frame.
    #[must_use]
    pub fn current(&self) -> FrameStatsSnapshot {
        FrameStatsSnapshot {
            draw_calls: self.draw_calls.load(Ordering::Relaxed),
            skipped_binds: self.skipped_binds.load(Ordering::Relaxed),
            transient_bytes: self.transient_bytes.load(Ordering::Relaxed),
            uploaded_bytes: self.uploaded_bytes.load(Ordering::Relaxed),
        }
    }

    /// Values of the last completed frame.
    #[must_use]
    pub fn last_frame(&self) -> FrameStatsSnapshot {
        *self.last_frame.lock()
    }

    /// Closes the current frame: publishes its values and zeroes the counters.
    pub fn end_frame(&self) -> FrameStatsSnapshot {
        let snapshot = FrameStatsSnapshot {
            draw_calls: self.draw_calls.swap(0, Ordering::Relaxed),
            skipped_binds: self.skipped_binds.swap(0, Ordering::Relaxed),
            transient_bytes: self.transient_bytes.swap(0, Ordering::Relaxed),
            uploaded_bytes: self.uploaded_bytes.swap(0, Ordering::Relaxed),
        };
        *self.last_frame.lock() = snapshot;
        snapshot
    }
}
