//! Pre-roll ring buffer
//!
//! Sits between the graph and the encoder sink and retains the most
//! recent span of content so a recording can start retroactively: when
//! writing begins at wall time `now`, the file starts at `now - D`.
//!
//! While caching, entries older than the newest timestamp minus the
//! configured duration are evicted from the front. When a writer is
//! attached, the retained entries drain in FIFO order under a per-cycle
//! time budget so a long backlog never starves the frame source feeding
//! this sink; whatever the budget cuts off is delivered as later frames
//! arrive.
//!
//! Invalid state transitions are programming errors and fail hard.

use log::{debug, info};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::CacheOptions;
use crate::error::{PipelineError, PipelineResult};
use crate::media::framebuffer::Framebuffer;
use crate::media::sample::{AudioSample, VideoSample};
use crate::media::time::MediaTime;
use crate::movie::output::{MovieOutput, WriterState};
use crate::movie::FramebufferSink;

/// GPU-side time the drain may consume per incoming frame, roughly one
/// 1/40 s display slot.
const DRAIN_BUDGET: Duration = Duration::from_millis(25);

/// Lifecycle of the pre-roll ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Unknown,
    Idle,
    Caching,
    Writing,
    Stopped,
}

impl CacheState {
    pub fn name(&self) -> &'static str {
        match self {
            CacheState::Unknown => "Unknown",
            CacheState::Idle => "Idle",
            CacheState::Caching => "Caching",
            CacheState::Writing => "Writing",
            CacheState::Stopped => "Stopped",
        }
    }

    pub fn can_transition_to(&self, target: &CacheState) -> bool {
        use CacheState::*;
        match (self, target) {
            (Unknown, Idle) => true,
            (Idle, Caching) => true,
            (Caching, Writing) => true,
            (Writing, Stopped) => true,
            (Stopped, Idle) => true,
            // Cancellation re-enters idle from either active state.
            (Caching, Idle) => true,
            (Writing, Idle) => true,
            (a, b) if a == b => true,
            _ => false,
        }
    }
}

/// Video entries keep whichever form they arrived in.
enum CachedVideo {
    Framebuffer(Framebuffer),
    Sample(VideoSample),
}

impl CachedVideo {
    fn pts(&self) -> Option<MediaTime> {
        match self {
            CachedVideo::Framebuffer(framebuffer) => framebuffer.timestamp(),
            CachedVideo::Sample(sample) => Some(sample.pts),
        }
    }

    fn release(self) {
        if let CachedVideo::Framebuffer(framebuffer) = self {
            framebuffer.unlock();
        }
    }
}

struct CacheCore {
    options: CacheOptions,
    state: Mutex<CacheState>,
    video: Mutex<VecDeque<CachedVideo>>,
    audio: Mutex<VecDeque<AudioSample>>,
    output: Mutex<Option<MovieOutput>>,
}

/// The pre-roll ring. Cloning shares the ring.
#[derive(Clone)]
pub struct MovieCache {
    core: Arc<CacheCore>,
}

impl MovieCache {
    pub fn new(options: CacheOptions) -> Self {
        Self {
            core: Arc::new(CacheCore {
                options,
                state: Mutex::new(CacheState::Idle),
                video: Mutex::new(VecDeque::new()),
                audio: Mutex::new(VecDeque::new()),
                output: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> CacheState {
        *self.core.state.lock().unwrap()
    }

    /// Oldest and newest retained video timestamps.
    pub fn retained_span(&self) -> Option<(MediaTime, MediaTime)> {
        let video = self.core.video.lock().unwrap();
        let oldest = video.front().and_then(CachedVideo::pts)?;
        let newest = video.back().and_then(CachedVideo::pts)?;
        Some((oldest, newest))
    }

    pub fn retained_count(&self) -> usize {
        self.core.video.lock().unwrap().len()
    }

    /// Begin retaining incoming content.
    pub fn start_caching(&self) {
        self.core.transition(CacheState::Caching);
        info!(
            "MovieCache: caching up to {:?} of pre-roll",
            self.core.options.cache_buffers_duration
        );
    }

    /// Attach a ready writer and begin draining the retained pre-roll.
    ///
    /// The output must already be in its `Writing` state.
    pub fn start_writing(&self, output: MovieOutput) -> PipelineResult<()> {
        if output.state() != WriterState::Writing {
            return Err(PipelineError::StartWritingFailed {
                reason: format!(
                    "attached output is {}, expected Writing",
                    output.state().name()
                ),
            });
        }
        self.core.transition(CacheState::Writing);
        *self.core.output.lock().unwrap() = Some(output);
        info!(
            "MovieCache: writing, {} retained entries to drain",
            self.retained_count()
        );
        self.core.drain_with_budget();
        Ok(())
    }

    /// Stop feeding the writer and return to idle. The backlog the drain
    /// budget deferred is flushed first (no frames follow to carry it);
    /// then the writer reference is released and the caches cleaned.
    pub fn stop_writing(&self) {
        self.core.transition(CacheState::Stopped);
        self.core.drain_all();
        *self.core.output.lock().unwrap() = None;
        self.core.clean_caches();
        self.core.transition(CacheState::Idle);
        info!("MovieCache: stopped");
    }

    /// Abandon caching or writing and return to idle.
    pub fn cancel_writing(&self) {
        self.core.transition(CacheState::Idle);
        *self.core.output.lock().unwrap() = None;
        self.core.clean_caches();
        info!("MovieCache: cancelled");
    }

    /// Cache or forward a raw video sample.
    pub fn process_video_buffer(&self, sample: VideoSample) {
        self.core.accept_video(CachedVideo::Sample(sample));
    }

    /// Cache or forward an audio sample.
    pub fn process_audio_buffer(&self, sample: AudioSample) {
        match self.state() {
            CacheState::Caching | CacheState::Writing => {
                self.core.audio.lock().unwrap().push_back(sample);
                self.core.evict_stale();
                if self.state() == CacheState::Writing {
                    self.core.drain_with_budget();
                }
            }
            _ => {}
        }
    }
}

impl FramebufferSink for MovieCache {
    fn new_framebuffer_available(&self, framebuffer: Framebuffer, _source_index: usize) {
        self.core.accept_video(CachedVideo::Framebuffer(framebuffer));
    }
}

impl CacheCore {
    /// Apply a state transition; anything outside the enumerated set is a
    /// caller bug.
    fn transition(&self, target: CacheState) {
        let mut state = self.state.lock().unwrap();
        assert!(
            state.can_transition_to(&target),
            "invalid cache transition: {} -> {}",
            state.name(),
            target.name()
        );
        *state = target;
    }

    fn accept_video(&self, entry: CachedVideo) {
        let state = *self.state.lock().unwrap();
        match state {
            CacheState::Caching => {
                self.video.lock().unwrap().push_back(entry);
                self.evict_stale();
            }
            CacheState::Writing => {
                self.video.lock().unwrap().push_back(entry);
                self.drain_with_budget();
            }
            _ => {
                debug!("MovieCache: video while {}, discarded", state.name());
                entry.release();
            }
        }
    }

    /// Age out entries older than the ring duration (and past the count
    /// ceiling, when one is configured).
    fn evict_stale(&self) {
        let horizon = self.options.cache_buffers_duration.as_secs_f64();
        {
            let mut video = self.video.lock().unwrap();
            let newest = video.back().and_then(CachedVideo::pts);
            if let Some(newest) = newest {
                let cutoff = newest.seconds() - horizon;
                while let Some(front) = video.front() {
                    let stale = front
                        .pts()
                        .map(|pts| pts.seconds() < cutoff)
                        .unwrap_or(true);
                    if !stale {
                        break;
                    }
                    if let Some(entry) = video.pop_front() {
                        entry.release();
                    }
                }
            }
            if let Some(limit) = self.options.max_cached_buffers {
                while video.len() > limit {
                    if let Some(entry) = video.pop_front() {
                        entry.release();
                    }
                }
            }
        }
        {
            let mut audio = self.audio.lock().unwrap();
            let newest = audio.back().map(|sample| sample.pts);
            if let Some(newest) = newest {
                let cutoff = newest.seconds() - horizon;
                while audio
                    .front()
                    .map(|sample| sample.pts.seconds() < cutoff)
                    .unwrap_or(false)
                {
                    audio.pop_front();
                }
            }
        }
    }

    /// Drain retained entries in FIFO order until the per-cycle budget is
    /// spent. At least one entry is processed per call so the backlog
    /// always makes progress; the rest rides along with later frames.
    fn drain_with_budget(&self) {
        let output = match self.output.lock().unwrap().clone() {
            Some(output) => output,
            None => return,
        };
        let started = Instant::now();
        loop {
            match self.pop_earliest() {
                Some(CachedItem::Video(CachedVideo::Framebuffer(framebuffer))) => {
                    // Our retained lock transfers to the sink.
                    output.new_framebuffer_available(framebuffer, 0);
                }
                Some(CachedItem::Video(CachedVideo::Sample(sample))) => {
                    output.process_video_buffer(sample, true);
                }
                Some(CachedItem::Audio(sample)) => {
                    output.process_audio_buffer(sample);
                }
                None => break,
            }
            if started.elapsed() >= DRAIN_BUDGET {
                debug!(
                    "MovieCache: drain budget spent, {} entries wait for the next frame",
                    self.video.lock().unwrap().len() + self.audio.lock().unwrap().len()
                );
                break;
            }
        }
    }

    /// Unbudgeted drain used when the stream is ending.
    fn drain_all(&self) {
        let output = match self.output.lock().unwrap().clone() {
            Some(output) => output,
            None => return,
        };
        while let Some(item) = self.pop_earliest() {
            match item {
                CachedItem::Video(CachedVideo::Framebuffer(framebuffer)) => {
                    output.new_framebuffer_available(framebuffer, 0);
                }
                CachedItem::Video(CachedVideo::Sample(sample)) => {
                    output.process_video_buffer(sample, true);
                }
                CachedItem::Audio(sample) => {
                    output.process_audio_buffer(sample);
                }
            }
        }
    }

    /// Take the earliest-timestamped head across both queues, preserving
    /// global FIFO across media kinds.
    fn pop_earliest(&self) -> Option<CachedItem> {
        let mut video = self.video.lock().unwrap();
        let mut audio = self.audio.lock().unwrap();
        let video_pts = video.front().and_then(CachedVideo::pts);
        let audio_pts = audio.front().map(|sample| sample.pts);
        match (video_pts, audio_pts) {
            (None, None) => None,
            (Some(_), None) => video.pop_front().map(CachedItem::Video),
            (None, Some(_)) => audio.pop_front().map(CachedItem::Audio),
            (Some(v), Some(a)) => {
                if a.compare(&v) == std::cmp::Ordering::Less {
                    audio.pop_front().map(CachedItem::Audio)
                } else {
                    video.pop_front().map(CachedItem::Video)
                }
            }
        }
    }

    fn clean_caches(&self) {
        let mut video = self.video.lock().unwrap();
        while let Some(entry) = video.pop_front() {
            entry.release();
        }
        self.audio.lock().unwrap().clear();
    }
}

enum CachedItem {
    Video(CachedVideo),
    Audio(AudioSample),
}

impl Drop for CacheCore {
    fn drop(&mut self) {
        // Retained framebuffer locks must drain even on teardown.
        self.clean_caches();
    }
}
