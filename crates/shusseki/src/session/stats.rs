//! Engine statistics

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Statistics snapshot (read from atomic counters)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub frames_captured: u64,
    pub read_errors: u64,
    pub last_frame_seq: u64,
    pub detection_cycles: u64,
    pub faces_detected: u64,
    pub faces_matched: u64,
    pub faces_unknown: u64,
    pub embedder_errors: u64,
    pub attendance_recorded: u64,
    pub duplicates_suppressed: u64,
    pub store_errors: u64,
    pub frames_published: u64,
    pub frames_dropped: u64,
}

/// Lock-free counters shared by every component of a controller.
///
/// Counters accumulate across sessions; `last_frame_seq` is reset when a new
/// capture session starts.
#[derive(Debug, Default)]
pub struct EngineCounters {
    pub(crate) frames_captured: AtomicU64,
    pub(crate) read_errors: AtomicU64,
    pub(crate) last_frame_seq: AtomicU64,
    pub(crate) detection_cycles: AtomicU64,
    pub(crate) faces_detected: AtomicU64,
    pub(crate) faces_matched: AtomicU64,
    pub(crate) faces_unknown: AtomicU64,
    pub(crate) embedder_errors: AtomicU64,
    pub(crate) attendance_recorded: AtomicU64,
    pub(crate) duplicates_suppressed: AtomicU64,
    pub(crate) store_errors: AtomicU64,
    pub(crate) frames_published: AtomicU64,
    pub(crate) frames_dropped: AtomicU64,
}

impl EngineCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read all atomics and return a plain EngineStats snapshot
    pub fn snapshot(&self) -> EngineStats {
        EngineStats {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            last_frame_seq: self.last_frame_seq.load(Ordering::Relaxed),
            detection_cycles: self.detection_cycles.load(Ordering::Relaxed),
            faces_detected: self.faces_detected.load(Ordering::Relaxed),
            faces_matched: self.faces_matched.load(Ordering::Relaxed),
            faces_unknown: self.faces_unknown.load(Ordering::Relaxed),
            embedder_errors: self.embedder_errors.load(Ordering::Relaxed),
            attendance_recorded: self.attendance_recorded.load(Ordering::Relaxed),
            duplicates_suppressed: self.duplicates_suppressed.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
            frames_published: self.frames_published.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
        }
    }
}
