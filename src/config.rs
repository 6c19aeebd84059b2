//! Configuration surface for the pipeline components

use log::warn;
use std::time::Duration;

/// Thread scheduling request for the reader thread.
///
/// `Realtime` asks the OS for a time-constraint policy. Platforms without
/// that primitive get a logged warning and default scheduling; execution
/// continues either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingHint {
    Default,
    UserInitiated,
    Realtime {
        computation: Duration,
        period: Duration,
        constraint: Duration,
    },
}

impl SchedulingHint {
    /// The policy requested for realtime decode threads: 5 ms of
    /// computation inside a 5 ms constraint, no fixed period.
    pub fn realtime_decode() -> Self {
        SchedulingHint::Realtime {
            computation: Duration::from_millis(5),
            period: Duration::ZERO,
            constraint: Duration::from_millis(5),
        }
    }

    /// Apply the hint to the calling thread, best effort. Returns whether
    /// the requested policy took effect.
    pub fn apply_to_current_thread(&self) -> bool {
        match self {
            SchedulingHint::Default | SchedulingHint::UserInitiated => true,
            SchedulingHint::Realtime { computation, .. } => {
                warn!(
                    "time-constraint scheduling ({}us computation) unavailable on this platform, continuing with default policy",
                    computation.as_micros()
                );
                false
            }
        }
    }
}

/// Options governing the encoder sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordingOptions {
    /// Frames arrive from a live source. Live recordings drop frames when
    /// the writer is not ready instead of waiting.
    pub live_video: bool,
    /// Wait for writer readiness even when `live_video` is set.
    pub wait_until_ready: bool,
    /// Skip color-metadata propagation on appended buffers. Works around
    /// first-second brightness flicker observed on some devices.
    pub disable_pixel_buffer_attachments: bool,
    /// Lay the container out for streaming.
    pub optimize_for_network_use: bool,
}

impl RecordingOptions {
    /// The encoder-waiting policy: block on readiness unless this is an
    /// unwaited live recording.
    pub fn should_wait_for_encoding(&self) -> bool {
        !self.live_video || self.wait_until_ready
    }
}

impl Default for RecordingOptions {
    fn default() -> Self {
        Self {
            live_video: false,
            wait_until_ready: false,
            disable_pixel_buffer_attachments: false,
            optimize_for_network_use: false,
        }
    }
}

/// Options governing the decoded-frame source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputOptions {
    /// Pace delivery against the wall clock instead of as fast as
    /// downstream accepts.
    pub play_at_actual_speed: bool,
    /// Wall-clock scale factor for `play_at_actual_speed`.
    pub playrate: f64,
    /// Upper bound on delivered frames per second, if any.
    pub max_fps: Option<f64>,
    /// Restart from the beginning of the range at end of asset.
    pub loop_enabled: bool,
    /// Request realtime scheduling for the reader thread.
    pub use_realtime_threads: bool,
    /// Forward raw sample buffers straight to the synchronized output,
    /// bypassing framebuffer conversion.
    pub transcoding_only: bool,
}

impl Default for InputOptions {
    fn default() -> Self {
        Self {
            play_at_actual_speed: true,
            playrate: 1.0,
            max_fps: None,
            loop_enabled: false,
            use_realtime_threads: false,
            transcoding_only: false,
        }
    }
}

impl InputOptions {
    /// Scheduling hint the reader thread should run with.
    pub fn scheduling_hint(&self, synchronized: bool) -> SchedulingHint {
        if self.use_realtime_threads {
            SchedulingHint::realtime_decode()
        } else if synchronized {
            SchedulingHint::Default
        } else {
            SchedulingHint::UserInitiated
        }
    }
}

/// Options governing the pre-roll cache.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheOptions {
    /// How much trailing content the ring retains.
    pub cache_buffers_duration: Duration,
    /// Optional hard bound on retained video entries, for platforms whose
    /// capture stack recycles a small fixed buffer set.
    pub max_cached_buffers: Option<usize>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            cache_buffers_duration: Duration::from_secs(2),
            max_cached_buffers: None,
        }
    }
}

/// How the player treats reaching the end of its play range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopDiscipline {
    /// Delegate repetition to the engine's item looper.
    Looper,
    /// Observe the end time and seek back to the range start.
    SeekOnEnd,
}

/// Options governing the display-tap player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayerOptions {
    pub loop_discipline: LoopDiscipline,
    /// Fire due time observers on refresh ticks that produced no new
    /// pixel buffer.
    pub fire_observers_without_frames: bool,
}

impl Default for PlayerOptions {
    fn default() -> Self {
        Self {
            loop_discipline: LoopDiscipline::SeekOnEnd,
            fire_observers_without_frames: true,
        }
    }
}
