//! Append and drop accounting
//!
//! Dropping a frame is the pipeline's normal response to back-pressure and
//! timing anomalies, not an error. Every drop is counted by reason so a
//! session can be audited after the fact, and a stall query flags sources
//! that have gone quiet. All fields are atomics; the struct is shared
//! freely across threads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Why a frame was dropped instead of appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Presentation time not strictly greater than the previous append.
    DuplicateTimestamp,
    /// Writer input reported not ready and the waiting policy said drop.
    WriterNotReady,
    /// Display time fell outside the active loop range.
    OutOfLoopRange,
    /// Pixel-buffer pool was exhausted.
    PoolExhausted,
    /// Wall-clock pacing fell behind schedule.
    BehindSchedule,
}

/// Counters for one pipeline session.
#[derive(Debug, Default)]
pub struct PipelineStats {
    frames_appended: AtomicU64,
    audio_samples_appended: AtomicU64,
    bytes_appended: AtomicU64,
    duplicate_timestamp_drops: AtomicU64,
    writer_not_ready_drops: AtomicU64,
    out_of_loop_range_drops: AtomicU64,
    pool_exhausted_drops: AtomicU64,
    behind_schedule_drops: AtomicU64,
    last_frame_micros: AtomicU64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn now_micros() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_micros() as u64
    }

    /// Record a successfully appended video frame.
    pub fn record_frame_appended(&self, bytes: usize) {
        self.frames_appended.fetch_add(1, Ordering::Relaxed);
        self.bytes_appended
            .fetch_add(bytes as u64, Ordering::Relaxed);
        self.last_frame_micros
            .store(Self::now_micros(), Ordering::Relaxed);
    }

    /// Record a successfully appended audio sample.
    pub fn record_audio_appended(&self, bytes: usize) {
        self.audio_samples_appended.fetch_add(1, Ordering::Relaxed);
        self.bytes_appended
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record a dropped frame with its reason.
    pub fn record_drop(&self, reason: DropReason) {
        let counter = match reason {
            DropReason::DuplicateTimestamp => &self.duplicate_timestamp_drops,
            DropReason::WriterNotReady => &self.writer_not_ready_drops,
            DropReason::OutOfLoopRange => &self.out_of_loop_range_drops,
            DropReason::PoolExhausted => &self.pool_exhausted_drops,
            DropReason::BehindSchedule => &self.behind_schedule_drops,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_appended(&self) -> u64 {
        self.frames_appended.load(Ordering::Relaxed)
    }

    pub fn audio_samples_appended(&self) -> u64 {
        self.audio_samples_appended.load(Ordering::Relaxed)
    }

    pub fn bytes_appended(&self) -> u64 {
        self.bytes_appended.load(Ordering::Relaxed)
    }

    pub fn drops(&self, reason: DropReason) -> u64 {
        let counter = match reason {
            DropReason::DuplicateTimestamp => &self.duplicate_timestamp_drops,
            DropReason::WriterNotReady => &self.writer_not_ready_drops,
            DropReason::OutOfLoopRange => &self.out_of_loop_range_drops,
            DropReason::PoolExhausted => &self.pool_exhausted_drops,
            DropReason::BehindSchedule => &self.behind_schedule_drops,
        };
        counter.load(Ordering::Relaxed)
    }

    pub fn total_drops(&self) -> u64 {
        self.duplicate_timestamp_drops.load(Ordering::Relaxed)
            + self.writer_not_ready_drops.load(Ordering::Relaxed)
            + self.out_of_loop_range_drops.load(Ordering::Relaxed)
            + self.pool_exhausted_drops.load(Ordering::Relaxed)
            + self.behind_schedule_drops.load(Ordering::Relaxed)
    }

    /// Drop rate as a percentage of frames seen.
    pub fn drop_rate(&self) -> f64 {
        let appended = self.frames_appended();
        let drops = self.total_drops();
        if appended + drops == 0 {
            return 0.0;
        }
        (drops as f64 / (appended + drops) as f64) * 100.0
    }

    /// Whether no frame has been appended for longer than `threshold`.
    pub fn is_stalled(&self, threshold: Duration) -> bool {
        let last = self.last_frame_micros.load(Ordering::Relaxed);
        if last == 0 {
            return false;
        }
        let elapsed = Self::now_micros().saturating_sub(last);
        elapsed > threshold.as_micros() as u64
    }

    pub fn summary(&self) -> StatsSummary {
        StatsSummary {
            frames_appended: self.frames_appended(),
            audio_samples_appended: self.audio_samples_appended(),
            bytes_appended: self.bytes_appended(),
            total_drops: self.total_drops(),
            drop_rate: self.drop_rate(),
        }
    }
}

/// Snapshot of a session's counters.
#[derive(Debug, Clone)]
pub struct StatsSummary {
    pub frames_appended: u64,
    pub audio_samples_appended: u64,
    pub bytes_appended: u64,
    pub total_drops: u64,
    pub drop_rate: f64,
}

impl std::fmt::Display for StatsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} frames, {} audio samples, {} bytes, {} drops ({:.2}%)",
            self.frames_appended,
            self.audio_samples_appended,
            self.bytes_appended,
            self.total_drops,
            self.drop_rate
        )
    }
}
