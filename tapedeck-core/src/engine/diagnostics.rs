use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Counters shared by the real-time callback, the worker and observers.
///
/// Every field is a relaxed atomic: callbacks only ever `fetch_add`, readers
/// take a [`DiagnosticsSnapshot`].
#[derive(Debug, Default)]
pub struct SessionDiagnostics {
    pub blocks_captured: AtomicU64,
    pub blocks_dropped: AtomicU64,
    pub blocks_written: AtomicU64,
    pub frames_written: AtomicU64,
    pub write_errors: AtomicU64,
    pub pool_misses: AtomicU64,
    pub frames_played: AtomicU64,
    pub silence_frames: AtomicU64,
}

impl SessionDiagnostics {
    pub fn reset(&self) {
        self.blocks_captured.store(0, Ordering::Relaxed);
        self.blocks_dropped.store(0, Ordering::Relaxed);
        self.blocks_written.store(0, Ordering::Relaxed);
        self.frames_written.store(0, Ordering::Relaxed);
        self.write_errors.store(0, Ordering::Relaxed);
        self.pool_misses.store(0, Ordering::Relaxed);
        self.frames_played.store(0, Ordering::Relaxed);
        self.silence_frames.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            blocks_captured: self.blocks_captured.load(Ordering::Relaxed),
            blocks_dropped: self.blocks_dropped.load(Ordering::Relaxed),
            blocks_written: self.blocks_written.load(Ordering::Relaxed),
            frames_written: self.frames_written.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            pool_misses: self.pool_misses.load(Ordering::Relaxed),
            frames_played: self.frames_played.load(Ordering::Relaxed),
            silence_frames: self.silence_frames.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    /// Blocks the capture callback accepted from the device.
    pub blocks_captured: u64,
    /// Blocks discarded because the handoff queue was full.
    pub blocks_dropped: u64,
    pub blocks_written: u64,
    pub frames_written: u64,
    pub write_errors: u64,
    /// Callback invocations that found the block pool empty and allocated.
    pub pool_misses: u64,
    pub frames_played: u64,
    pub silence_frames: u64,
}
