//! Encoder sink
//!
//! Consumes framebuffers from the graph (or raw video samples in
//! passthrough), converts them to the writer's pixel format, and appends
//! them to a container writer. One serial queue owns all writer work; the
//! writer's pixel-buffer pool is additionally guarded by a binary lock
//! because pool allocation and writer cancellation must never overlap.
//!
//! # Invariants
//!
//! - Appended video timestamps are strictly increasing; a frame whose
//!   timestamp does not advance is dropped silently (the backend aborts
//!   the whole file on duplicates).
//! - The first appended video frame's timestamp anchors the session;
//!   `start_session` happens exactly once per recording.
//! - Audio is queued on arrival and only flushed once the video anchor is
//!   known, so audio preceding the anchor gets edited out.
//! - Every framebuffer handed to the sink is unlocked exactly once, on
//!   every path.

use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::backend::writer::{AudioTrackSettings, ContainerWriter};
use crate::config::RecordingOptions;
use crate::error::{PipelineError, PipelineResult};
use crate::media::framebuffer::Framebuffer;
use crate::media::pixel::{ColorAttachments, PixelBuffer};
use crate::media::sample::{AudioSample, VideoSample};
use crate::media::time::MediaTime;
use crate::movie::convert::FramebufferGenerator;
use crate::movie::FramebufferSink;
use crate::runtime::context::PipelineContext;
use crate::runtime::gate::ReadinessGate;
use crate::runtime::queue::SerialQueue;
use crate::stats::{DropReason, PipelineStats};

/// Interval of the encoder-readiness poll.
const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Lifecycle of the encoder sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    Unknown,
    Idle,
    /// Pre-recording: frames are retained upstream, not appended.
    Caching,
    Writing,
    Finished,
    Canceled,
}

impl WriterState {
    pub fn name(&self) -> &'static str {
        match self {
            WriterState::Unknown => "Unknown",
            WriterState::Idle => "Idle",
            WriterState::Caching => "Caching",
            WriterState::Writing => "Writing",
            WriterState::Finished => "Finished",
            WriterState::Canceled => "Canceled",
        }
    }

    /// Whether moving to `target` is one of the enumerated transitions.
    pub fn can_transition_to(&self, target: &WriterState) -> bool {
        use WriterState::*;
        match (self, target) {
            (Unknown, Idle) => true,
            (Idle, Caching) => true,
            (Idle, Writing) => true,
            (Caching, Writing) => true,
            (Writing, Finished) => true,
            (Writing, Canceled) => true,
            (Caching, Canceled) => true,
            (a, b) if a == b => true,
            _ => false,
        }
    }
}

/// Unlocks a framebuffer exactly once, on scope exit or on demand.
struct FramebufferLease {
    framebuffer: Option<Framebuffer>,
}

impl FramebufferLease {
    fn new(framebuffer: Framebuffer) -> Self {
        Self {
            framebuffer: Some(framebuffer),
        }
    }

    fn get(&self) -> &Framebuffer {
        self.framebuffer.as_ref().expect("lease already released")
    }
}

impl Drop for FramebufferLease {
    fn drop(&mut self) {
        if let Some(framebuffer) = self.framebuffer.take() {
            framebuffer.unlock();
        }
    }
}

type WriterErrorHandler = Box<dyn Fn(&str) + Send>;
type VideoFilter = Box<dyn Fn(&mut PixelBuffer) + Send>;

struct OutputCore {
    options: RecordingOptions,
    queue: SerialQueue,
    writer: Mutex<Box<dyn ContainerWriter>>,
    /// Binary guard for the writer's pixel-buffer pool; held around pool
    /// pulls and writer cancellation.
    pool_guard: Mutex<()>,
    state: Mutex<WriterState>,
    readiness: Arc<ReadinessGate>,
    generator: FramebufferGenerator,
    audio_queue: Mutex<VecDeque<AudioSample>>,
    start_frame_time: Mutex<Option<MediaTime>>,
    previous_frame_time: Mutex<Option<MediaTime>>,
    last_appended_time: Mutex<Option<MediaTime>>,
    recorded_duration: Mutex<Option<MediaTime>>,
    video_encoding_finished: AtomicBool,
    audio_encoding_finished: AtomicBool,
    finish_video_requested: AtomicBool,
    finish_audio_requested: AtomicBool,
    attachments_applied: AtomicBool,
    video_filter: Mutex<Option<VideoFilter>>,
    on_writer_error: Mutex<Option<WriterErrorHandler>>,
    last_observed_error: Mutex<Option<String>>,
    stats: Arc<PipelineStats>,
}

/// The encoder sink. Cloning shares the same recording.
#[derive(Clone)]
pub struct MovieOutput {
    core: Arc<OutputCore>,
}

impl MovieOutput {
    pub fn new(
        writer: Box<dyn ContainerWriter>,
        context: Arc<PipelineContext>,
        options: RecordingOptions,
    ) -> Self {
        let core = OutputCore {
            options,
            queue: SerialQueue::new("reelflow-movie-writer"),
            writer: Mutex::new(writer),
            pool_guard: Mutex::new(()),
            state: Mutex::new(WriterState::Idle),
            readiness: Arc::new(ReadinessGate::new()),
            generator: FramebufferGenerator::new(context),
            audio_queue: Mutex::new(VecDeque::new()),
            start_frame_time: Mutex::new(None),
            previous_frame_time: Mutex::new(None),
            last_appended_time: Mutex::new(None),
            recorded_duration: Mutex::new(None),
            video_encoding_finished: AtomicBool::new(false),
            audio_encoding_finished: AtomicBool::new(false),
            finish_video_requested: AtomicBool::new(false),
            finish_audio_requested: AtomicBool::new(false),
            attachments_applied: AtomicBool::new(false),
            video_filter: Mutex::new(None),
            on_writer_error: Mutex::new(None),
            last_observed_error: Mutex::new(None),
            stats: Arc::new(PipelineStats::new()),
        };
        Self { core: Arc::new(core) }
    }

    pub fn state(&self) -> WriterState {
        *self.core.state.lock().unwrap()
    }

    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.core.stats
    }

    /// The back-pressure gate a synchronized source parks on.
    pub fn readiness(&self) -> Arc<ReadinessGate> {
        Arc::clone(&self.core.readiness)
    }

    /// Duration between the session anchor and the last appended frame.
    pub fn recorded_duration(&self) -> Option<MediaTime> {
        *self.core.recorded_duration.lock().unwrap()
    }

    /// Callback invoked whenever the writer backend reports a new error.
    /// Observed errors are forwarded, never auto-cancelled on.
    pub fn set_writer_error_handler(&self, handler: impl Fn(&str) + Send + 'static) {
        *self.core.on_writer_error.lock().unwrap() = Some(Box::new(handler));
    }

    /// CPU-side filter applied to passthrough video buffers (lookup-table
    /// grading and the like).
    pub fn set_video_filter(&self, filter: impl Fn(&mut PixelBuffer) + Send + 'static) {
        *self.core.video_filter.lock().unwrap() = Some(Box::new(filter));
    }

    /// Add the audio track. Only legal before writing begins.
    pub fn activate_audio_track(&self, settings: AudioTrackSettings) -> PipelineResult<()> {
        let state = self.state();
        if !matches!(state, WriterState::Idle | WriterState::Caching) {
            return Err(PipelineError::AudioTrackActivation);
        }
        self.core
            .writer
            .lock()
            .unwrap()
            .add_audio_track(settings)
            .map_err(|e| {
                // The backend refuses after its own start; surface as the
                // same activation error.
                debug!("audio track activation refused by backend: {}", e);
                PipelineError::AudioTrackActivation
            })
    }

    /// Enter the pre-recording state used with a cache in front of this
    /// output.
    pub fn begin_caching(&self) -> PipelineResult<()> {
        self.transition(WriterState::Caching)
    }

    /// Start the writer and enter `Writing`.
    ///
    /// Fails without changing state when the backend refuses to start or
    /// provides no pixel-buffer pool; the backend is cancelled in both
    /// cases.
    pub fn start_recording(&self) -> PipelineResult<()> {
        let core = Arc::clone(&self.core);
        self.core.queue.run_sync(move || {
            {
                let state = core.state.lock().unwrap();
                if !state.can_transition_to(&WriterState::Writing) {
                    return Err(PipelineError::InvalidTransition {
                        from: state.name(),
                        to: WriterState::Writing.name(),
                    });
                }
            }
            {
                let mut writer = core.writer.lock().unwrap();
                if let Err(e) = writer.start_writing() {
                    writer.cancel_writing();
                    return Err(PipelineError::StartWritingFailed {
                        reason: e.to_string(),
                    });
                }
                if writer.pixel_buffer_pool().is_none() {
                    writer.cancel_writing();
                    return Err(PipelineError::PixelBufferPoolUnavailable);
                }
            }
            *core.state.lock().unwrap() = WriterState::Writing;
            info!("MovieOutput: recording started");
            Ok(())
        })
    }

    /// Accept a processed framebuffer for encoding.
    ///
    /// The sink owns one lock on the framebuffer and releases it on every
    /// path.
    pub fn new_framebuffer_available(&self, framebuffer: Framebuffer, source_index: usize) {
        let core = Arc::clone(&self.core);
        self.core.queue.run_sync(move || {
            core.append_framebuffer(framebuffer, source_index);
        });
    }

    /// Append a raw video sample, bypassing the graph.
    ///
    /// Returns the sample when it was dropped and `invalidate_when_done`
    /// is false, so a caller that retains ownership semantics can reuse
    /// it. Appended or invalidated samples return `None`.
    pub fn process_video_buffer(
        &self,
        sample: VideoSample,
        invalidate_when_done: bool,
    ) -> Option<VideoSample> {
        let core = Arc::clone(&self.core);
        self.core
            .queue
            .run_sync(move || core.append_video_sample(sample, invalidate_when_done))
    }

    /// Queue an audio sample. Flushed once the video anchor is known.
    pub fn process_audio_buffer(&self, sample: AudioSample) {
        let core = Arc::clone(&self.core);
        self.core.queue.run_sync(move || {
            core.service_finish_requests();
            if core.audio_encoding_finished.load(Ordering::Acquire) {
                debug!("MovieOutput: audio after finish dropped");
                return;
            }
            core.audio_queue.lock().unwrap().push_back(sample);
            core.flush_audio_queue();
            core.update_readiness_gate();
        });
    }

    /// One-shot request from a synchronized source at end of stream; acted
    /// on at the writer's next processing turn.
    pub fn request_finish_video(&self) {
        self.core.finish_video_requested.store(true, Ordering::Release);
    }

    pub fn request_finish_audio(&self) {
        self.core.finish_audio_requested.store(true, Ordering::Release);
    }

    /// Whether the writer will currently accept a video sample.
    pub fn is_ready_for_video(&self) -> bool {
        self.core.writer.lock().unwrap().is_ready_for_video()
            && !self.core.video_encoding_finished.load(Ordering::Acquire)
    }

    /// Whether the writer will currently accept an audio sample.
    pub fn is_ready_for_audio(&self) -> bool {
        let writer = self.core.writer.lock().unwrap();
        writer.has_audio_track()
            && writer.is_ready_for_audio()
            && !self.core.audio_encoding_finished.load(Ordering::Acquire)
    }

    pub fn has_audio_track(&self) -> bool {
        self.core.writer.lock().unwrap().has_audio_track()
    }

    /// Recompute the back-pressure gate from current writer readiness.
    pub fn refresh_readiness(&self) {
        self.core.update_readiness_gate();
    }

    /// Finish the recording: mark inputs done, close the session at the
    /// last appended timestamp, and block until the container is complete.
    pub fn finish_recording(&self) -> PipelineResult<()> {
        let core = Arc::clone(&self.core);
        self.core.queue.run_sync(move || core.finish_recording())
    }

    /// `finish_recording` off the caller's thread, with a completion
    /// callback.
    pub fn finish_recording_with_completion(
        &self,
        completion: impl FnOnce(Option<PipelineError>) + Send + 'static,
    ) {
        let core = Arc::clone(&self.core);
        self.core.queue.enqueue(move || {
            completion(core.finish_recording().err());
        });
    }

    /// Abort the recording and discard the container.
    pub fn cancel_recording(&self) {
        let core = Arc::clone(&self.core);
        self.core.queue.run_sync(move || {
            core.video_encoding_finished.store(true, Ordering::Release);
            core.audio_encoding_finished.store(true, Ordering::Release);
            {
                // The pool is not thread-safe against cancellation.
                let _guard = core.pool_guard.lock().unwrap();
                core.writer.lock().unwrap().cancel_writing();
            }
            core.audio_queue.lock().unwrap().clear();
            let mut state = core.state.lock().unwrap();
            if state.can_transition_to(&WriterState::Canceled) {
                *state = WriterState::Canceled;
                info!("MovieOutput: recording cancelled");
            }
            core.update_readiness_gate();
        });
    }

    fn transition(&self, target: WriterState) -> PipelineResult<()> {
        let mut state = self.core.state.lock().unwrap();
        if !state.can_transition_to(&target) {
            return Err(PipelineError::InvalidTransition {
                from: state.name(),
                to: target.name(),
            });
        }
        *state = target;
        Ok(())
    }
}

impl FramebufferSink for MovieOutput {
    fn new_framebuffer_available(&self, framebuffer: Framebuffer, source_index: usize) {
        MovieOutput::new_framebuffer_available(self, framebuffer, source_index);
    }
}

impl OutputCore {
    /// Apply one-shot finish requests posted by a synchronized source.
    fn service_finish_requests(&self) {
        if self.finish_video_requested.swap(false, Ordering::AcqRel) {
            self.video_encoding_finished.store(true, Ordering::Release);
            self.writer.lock().unwrap().mark_video_finished();
            debug!("MovieOutput: video input marked finished");
        }
        if self.finish_audio_requested.swap(false, Ordering::AcqRel) {
            self.audio_encoding_finished.store(true, Ordering::Release);
            self.writer.lock().unwrap().mark_audio_finished();
            debug!("MovieOutput: audio input marked finished");
        }
    }

    fn append_framebuffer(&self, framebuffer: Framebuffer, source_index: usize) {
        let lease = FramebufferLease::new(framebuffer);
        self.service_finish_requests();
        if self.video_encoding_finished.load(Ordering::Acquire) {
            return;
        }
        if *self.state.lock().unwrap() != WriterState::Writing {
            debug!(
                "MovieOutput: framebuffer from source {} before writing, dropped",
                source_index
            );
            return;
        }
        let Some(pts) = lease.get().timestamp() else {
            warn!("MovieOutput: still-image framebuffer has no timestamp, dropped");
            return;
        };
        if !self.check_monotone(pts) {
            return;
        }
        if !self.wait_for_video_ready() {
            self.stats.record_drop(DropReason::WriterNotReady);
            warn!("MovieOutput: writer not ready, frame at {} dropped", pts);
            self.update_readiness_gate();
            return;
        }

        // Pull the target pixel buffer from the writer's pool under the
        // pool guard, then render the framebuffer into it.
        let pixels = {
            let _guard = self.pool_guard.lock().unwrap();
            let pool = self.writer.lock().unwrap().pixel_buffer_pool();
            let Some(pool) = pool else {
                self.stats.record_drop(DropReason::PoolExhausted);
                warn!("MovieOutput: no pixel buffer pool, frame at {} dropped", pts);
                return;
            };
            match self
                .generator
                .pixel_buffer_from_framebuffer(lease.get(), &pool)
            {
                Some(pixels) => pixels,
                None => {
                    self.stats.record_drop(DropReason::PoolExhausted);
                    debug!("MovieOutput: pool exhausted, frame at {} dropped", pts);
                    return;
                }
            }
        };
        self.append_pixels(pixels, pts);
        self.update_readiness_gate();
    }

    fn append_video_sample(
        &self,
        mut sample: VideoSample,
        invalidate_when_done: bool,
    ) -> Option<VideoSample> {
        let rejected = |mut sample: VideoSample| {
            if invalidate_when_done {
                sample.invalidate();
                None
            } else {
                Some(sample)
            }
        };

        self.service_finish_requests();
        if self.video_encoding_finished.load(Ordering::Acquire) {
            return rejected(sample);
        }
        if *self.state.lock().unwrap() != WriterState::Writing {
            debug!("MovieOutput: video sample before writing, dropped");
            return rejected(sample);
        }
        let pts = sample.pts;
        if !self.check_monotone(pts) {
            return rejected(sample);
        }
        if !self.wait_for_video_ready() {
            self.stats.record_drop(DropReason::WriterNotReady);
            warn!("MovieOutput: writer not ready, sample at {} dropped", pts);
            self.update_readiness_gate();
            return rejected(sample);
        }
        if let Some(filter) = self.video_filter.lock().unwrap().as_ref() {
            filter(&mut sample.pixels);
        }
        self.append_pixels(sample.pixels, pts);
        self.update_readiness_gate();
        None
    }

    /// Shared tail of both video paths: attachments, session anchor,
    /// append, audio flush.
    fn append_pixels(&self, mut pixels: PixelBuffer, pts: MediaTime) {
        if !self.options.disable_pixel_buffer_attachments
            && !self.attachments_applied.swap(true, Ordering::AcqRel)
        {
            pixels.set_attachments(ColorAttachments::default());
        }
        {
            let mut anchor = self.start_frame_time.lock().unwrap();
            if anchor.is_none() {
                self.writer.lock().unwrap().start_session(pts);
                *anchor = Some(pts);
                info!("MovieOutput: session anchored at {}", pts);
            }
        }
        let byte_len = pixels.data().len();
        let result = self.writer.lock().unwrap().append_video(pixels, pts);
        match result {
            Ok(()) => {
                *self.previous_frame_time.lock().unwrap() = Some(pts);
                *self.last_appended_time.lock().unwrap() = Some(pts);
                self.stats.record_frame_appended(byte_len);
                self.flush_audio_queue();
            }
            Err(e) => {
                error!("MovieOutput: video append failed at {}: {}", pts, e);
                self.observe_writer_error();
            }
        }
    }

    /// Strictly-increasing timestamp guard shared by both video paths.
    fn check_monotone(&self, pts: MediaTime) -> bool {
        let previous = *self.previous_frame_time.lock().unwrap();
        if let Some(previous) = previous {
            if pts.compare(&previous) != std::cmp::Ordering::Greater {
                self.stats.record_drop(DropReason::DuplicateTimestamp);
                debug!(
                    "MovieOutput: timestamp {} not after {}, frame dropped",
                    pts, previous
                );
                return false;
            }
        }
        true
    }

    /// Readiness wait for the video input under the encoder-waiting
    /// policy. Returns whether the frame may be appended.
    fn wait_for_video_ready(&self) -> bool {
        loop {
            if self.writer.lock().unwrap().is_ready_for_video() {
                return true;
            }
            if !self.options.should_wait_for_encoding() {
                return false;
            }
            if self.video_encoding_finished.load(Ordering::Acquire) {
                return false;
            }
            debug!("MovieOutput: polling for video readiness");
            thread::sleep(READINESS_POLL_INTERVAL);
        }
    }

    fn wait_for_audio_ready(&self) -> bool {
        loop {
            if self.writer.lock().unwrap().is_ready_for_audio() {
                return true;
            }
            if !self.options.should_wait_for_encoding() {
                return false;
            }
            if self.audio_encoding_finished.load(Ordering::Acquire) {
                return false;
            }
            debug!("MovieOutput: polling for audio readiness");
            thread::sleep(READINESS_POLL_INTERVAL);
        }
    }

    /// Append queued audio once the video anchor exists. Samples before
    /// the anchor are edited out by design.
    fn flush_audio_queue(&self) {
        let Some(anchor) = *self.start_frame_time.lock().unwrap() else {
            return;
        };
        if !self.writer.lock().unwrap().has_audio_track() {
            self.audio_queue.lock().unwrap().clear();
            return;
        }
        loop {
            let sample = self.audio_queue.lock().unwrap().pop_front();
            let Some(sample) = sample else { break };
            if sample.pts.compare(&anchor) == std::cmp::Ordering::Less {
                debug!("MovieOutput: audio at {} precedes anchor, edited out", sample.pts);
                continue;
            }
            if !self.wait_for_audio_ready() {
                self.stats.record_drop(DropReason::WriterNotReady);
                warn!("MovieOutput: audio writer not ready, sample at {} dropped", sample.pts);
                continue;
            }
            let byte_len = sample.data.len();
            match self.writer.lock().unwrap().append_audio(sample) {
                Ok(()) => self.stats.record_audio_appended(byte_len),
                Err(e) => {
                    error!("MovieOutput: audio append failed: {}", e);
                    self.observe_writer_error();
                }
            }
        }
    }

    fn finish_recording(&self) -> PipelineResult<()> {
        {
            let state = self.state.lock().unwrap();
            if !state.can_transition_to(&WriterState::Finished) {
                return Err(PipelineError::InvalidTransition {
                    from: state.name(),
                    to: WriterState::Finished.name(),
                });
            }
        }
        // Drain whatever audio the anchor already admits, then close both
        // inputs.
        self.flush_audio_queue();
        self.video_encoding_finished.store(true, Ordering::Release);
        self.audio_encoding_finished.store(true, Ordering::Release);
        {
            let mut writer = self.writer.lock().unwrap();
            writer.mark_video_finished();
            if writer.has_audio_track() {
                writer.mark_audio_finished();
            }
            if let Some(last) = *self.last_appended_time.lock().unwrap() {
                writer.end_session(last);
            }
        }
        if let (Some(start), Some(last)) = (
            *self.start_frame_time.lock().unwrap(),
            *self.last_appended_time.lock().unwrap(),
        ) {
            *self.recorded_duration.lock().unwrap() = Some(last - start);
        }
        let result = self.writer.lock().unwrap().finish_writing();
        *self.state.lock().unwrap() = WriterState::Finished;
        self.update_readiness_gate();
        match result {
            Ok(()) => {
                info!("MovieOutput: finished ({})", self.stats.summary());
                Ok(())
            }
            Err(e) => {
                self.observe_writer_error();
                Err(PipelineError::Backend(e))
            }
        }
    }

    /// Either input ready unblocks the source; both full block it.
    fn update_readiness_gate(&self) {
        let (video_ready, audio_ready, has_audio) = {
            let writer = self.writer.lock().unwrap();
            (
                writer.is_ready_for_video(),
                writer.is_ready_for_audio(),
                writer.has_audio_track(),
            )
        };
        let finished = self.video_encoding_finished.load(Ordering::Acquire);
        let ready_any = video_ready || (has_audio && audio_ready);
        self.readiness.set_should_wait(!finished && !ready_any);
    }

    /// The writer-error observation: forward new backend errors to the
    /// delegate without cancelling.
    fn observe_writer_error(&self) {
        let current = self.writer.lock().unwrap().error();
        let Some(current) = current else { return };
        let mut last = self.last_observed_error.lock().unwrap();
        if last.as_deref() != Some(current.as_str()) {
            *last = Some(current.clone());
            drop(last);
            if let Some(handler) = self.on_writer_error.lock().unwrap().as_ref() {
                handler(&current);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryMovieWriter;
    use crate::backend::writer::{ContainerSettings, VideoTrackSettings, WriterBackendStatus};
    use crate::media::framebuffer::{TextureSize, TimingStyle};
    use crate::media::orientation::Orientation;
    use bytes::Bytes;

    fn make_output(
        context: &Arc<PipelineContext>,
        options: RecordingOptions,
        width: u32,
        height: u32,
    ) -> (MovieOutput, MemoryMovieWriter) {
        let writer = MemoryMovieWriter::new(ContainerSettings::new(
            "/tmp/output-test.mov",
            VideoTrackSettings::new(width, height),
        ));
        let handle = writer.clone();
        let output = MovieOutput::new(Box::new(writer), Arc::clone(context), options);
        (output, handle)
    }

    fn push_frame(context: &Arc<PipelineContext>, output: &MovieOutput, pts: MediaTime) {
        let framebuffer = context.framebuffer_pool().fetch(
            TextureSize::new(64, 48),
            Orientation::Portrait,
            TimingStyle::VideoFrame(pts),
        );
        framebuffer.lock(); // consumer's lock
        output.new_framebuffer_available(framebuffer.clone(), 0);
        framebuffer.unlock(); // producer's working lock
    }

    #[test]
    fn test_state_machine_closure() {
        use WriterState::*;
        let states = [Unknown, Idle, Caching, Writing, Finished, Canceled];
        let allowed = [
            (Unknown, Idle),
            (Idle, Caching),
            (Idle, Writing),
            (Caching, Writing),
            (Writing, Finished),
            (Writing, Canceled),
            (Caching, Canceled),
        ];
        for from in states {
            for to in states {
                let expected = from == to || allowed.contains(&(from, to));
                assert_eq!(
                    from.can_transition_to(&to),
                    expected,
                    "{} -> {}",
                    from.name(),
                    to.name()
                );
            }
        }
    }

    #[test]
    fn test_record_three_seconds_live_then_finish() {
        // Feed 90 frames at 30 fps into a live recording and finish.
        let _ = env_logger::builder().is_test(true).try_init();
        let directory = tempfile::tempdir().unwrap();
        let context = PipelineContext::new();
        let options = RecordingOptions {
            live_video: true,
            ..Default::default()
        };
        let writer = MemoryMovieWriter::new(ContainerSettings::new(
            directory.path().join("s1.mov"),
            VideoTrackSettings::new(64, 48),
        ));
        let handle = writer.clone();
        let output = MovieOutput::new(Box::new(writer), Arc::clone(&context), options);
        assert!(handle.settings().url.ends_with("s1.mov"));
        output.start_recording().unwrap();

        for i in 0..90 {
            push_frame(&context, &output, MediaTime::new(i, 30));
        }
        output.finish_recording().unwrap();

        let frames = handle.video_frames();
        assert_eq!(frames.len(), 90);
        assert_eq!(frames[0].pts, MediaTime::new(0, 30));
        assert_eq!(frames[89].pts, MediaTime::new(89, 30));
        assert_eq!(
            output.recorded_duration().unwrap().compare(&MediaTime::new(89, 30)),
            std::cmp::Ordering::Equal
        );
        assert_eq!(handle.session_starts(), vec![MediaTime::new(0, 30)]);
        assert_eq!(handle.session_end(), Some(MediaTime::new(89, 30)));
        assert_eq!(handle.status(), WriterBackendStatus::Completed);
        assert!(handle.error().is_none());
        // Frame-ownership balance: every framebuffer lock drained.
        assert_eq!(context.framebuffer_pool().live_count(), 0);
        assert_eq!(output.stats().total_drops(), 0);
    }

    #[test]
    fn test_duplicate_timestamp_is_dropped_silently() {
        let context = PipelineContext::new();
        let (output, handle) = make_output(&context, RecordingOptions::default(), 64, 48);
        output.start_recording().unwrap();

        for pts in [
            MediaTime::new(0, 30),
            MediaTime::new(1, 30),
            MediaTime::new(1, 30),
            MediaTime::new(2, 30),
        ] {
            push_frame(&context, &output, pts);
        }
        output.finish_recording().unwrap();

        assert_eq!(handle.video_frames().len(), 3);
        assert_eq!(output.stats().drops(DropReason::DuplicateTimestamp), 1);
        assert!(handle.error().is_none());
        assert_eq!(context.framebuffer_pool().live_count(), 0);
    }

    #[test]
    fn test_session_anchored_once_at_first_frame() {
        let context = PipelineContext::new();
        let (output, handle) = make_output(&context, RecordingOptions::default(), 64, 48);
        output.start_recording().unwrap();
        push_frame(&context, &output, MediaTime::new(5, 30));
        push_frame(&context, &output, MediaTime::new(6, 30));
        output.finish_recording().unwrap();
        assert_eq!(handle.session_starts(), vec![MediaTime::new(5, 30)]);
    }

    #[test]
    fn test_audio_held_until_video_anchor() {
        let context = PipelineContext::new();
        let (output, handle) = make_output(&context, RecordingOptions::default(), 64, 48);
        output
            .activate_audio_track(AudioTrackSettings::default())
            .unwrap();
        output.start_recording().unwrap();

        // Audio arrives first: one sample before the eventual anchor, one
        // after.
        let early = AudioSample::new(Bytes::from_static(&[0; 8]), MediaTime::new(1, 30), 44_100, 2);
        let kept = AudioSample::new(Bytes::from_static(&[0; 8]), MediaTime::new(4, 30), 44_100, 2);
        output.process_audio_buffer(early);
        output.process_audio_buffer(kept);
        assert!(handle.audio_samples().is_empty());

        push_frame(&context, &output, MediaTime::new(3, 30));
        let audio = handle.audio_samples();
        assert_eq!(audio.len(), 1);
        // First appended audio is not earlier than the first video frame.
        assert_ne!(
            audio[0].pts.compare(&handle.video_frames()[0].pts),
            std::cmp::Ordering::Less
        );
        output.finish_recording().unwrap();
    }

    #[test]
    fn test_live_mode_drops_when_not_ready() {
        let context = PipelineContext::new();
        let options = RecordingOptions {
            live_video: true,
            ..Default::default()
        };
        let (output, handle) = make_output(&context, options, 64, 48);
        handle.set_intermittent_readiness(2); // every 2nd poll not ready
        output.start_recording().unwrap();

        for i in 0..6 {
            push_frame(&context, &output, MediaTime::new(i, 30));
        }
        output.finish_recording().unwrap();

        let appended = handle.video_frames().len() as u64;
        let dropped = output.stats().drops(DropReason::WriterNotReady);
        assert_eq!(appended + dropped, 6);
        assert!(dropped >= 1, "expected at least one not-ready drop");
        assert_eq!(context.framebuffer_pool().live_count(), 0);
    }

    #[test]
    fn test_start_refusal_reports_nested_reason() {
        let context = PipelineContext::new();
        let (output, handle) = make_output(&context, RecordingOptions::default(), 64, 48);
        handle.refuse_start("file already exists");
        let error = output.start_recording().unwrap_err();
        match error {
            PipelineError::StartWritingFailed { reason } => {
                assert!(reason.contains("file already exists"));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(output.state(), WriterState::Idle);
    }

    #[test]
    fn test_missing_pool_fails_start() {
        let context = PipelineContext::new();
        let (output, handle) = make_output(&context, RecordingOptions::default(), 64, 48);
        handle.withhold_pool();
        assert!(matches!(
            output.start_recording(),
            Err(PipelineError::PixelBufferPoolUnavailable)
        ));
    }

    #[test]
    fn test_audio_activation_after_start_is_rejected() {
        let context = PipelineContext::new();
        let (output, _handle) = make_output(&context, RecordingOptions::default(), 64, 48);
        output.start_recording().unwrap();
        assert!(matches!(
            output.activate_audio_track(AudioTrackSettings::default()),
            Err(PipelineError::AudioTrackActivation)
        ));
    }

    #[test]
    fn test_cancel_discards_recording() {
        let context = PipelineContext::new();
        let (output, handle) = make_output(&context, RecordingOptions::default(), 64, 48);
        output.start_recording().unwrap();
        push_frame(&context, &output, MediaTime::new(0, 30));
        output.cancel_recording();

        assert_eq!(output.state(), WriterState::Canceled);
        assert_eq!(handle.status(), WriterBackendStatus::Cancelled);
        assert!(handle.video_frames().is_empty());
        // Frames after cancel are dropped without touching the writer.
        push_frame(&context, &output, MediaTime::new(1, 30));
        assert!(handle.video_frames().is_empty());
        assert_eq!(context.framebuffer_pool().live_count(), 0);
    }

    #[test]
    fn test_attachments_applied_once_unless_disabled() {
        let context = PipelineContext::new();
        let (output, handle) = make_output(&context, RecordingOptions::default(), 64, 48);
        output.start_recording().unwrap();
        push_frame(&context, &output, MediaTime::new(0, 30));
        push_frame(&context, &output, MediaTime::new(1, 30));
        output.finish_recording().unwrap();
        let frames = handle.video_frames();
        assert!(frames[0].had_attachments);
        assert!(!frames[1].had_attachments);

        let context = PipelineContext::new();
        let options = RecordingOptions {
            disable_pixel_buffer_attachments: true,
            ..Default::default()
        };
        let (output, handle) = make_output(&context, options, 64, 48);
        output.start_recording().unwrap();
        push_frame(&context, &output, MediaTime::new(0, 30));
        output.finish_recording().unwrap();
        assert!(!handle.video_frames()[0].had_attachments);
    }

    #[test]
    fn test_writer_error_forwarded_to_delegate() {
        let context = PipelineContext::new();
        let (output, handle) = make_output(&context, RecordingOptions::default(), 64, 48);
        let observed: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&observed);
        output.set_writer_error_handler(move |message| {
            sink.lock().unwrap().push(message.to_string());
        });
        output.start_recording().unwrap();

        // Drive the backend into failure under the filter's nose: append
        // directly so the duplicate reaches the backend.
        push_frame(&context, &output, MediaTime::new(1, 30));
        {
            let pool = handle.pool_handle().unwrap();
            let mut backend: Box<dyn ContainerWriter> = Box::new(handle.clone());
            let _ = backend.append_video(pool.take().unwrap(), MediaTime::new(1, 30));
        }
        // Next append observes the backend error and forwards it.
        push_frame(&context, &output, MediaTime::new(2, 30));
        let seen = observed.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].contains("not after"));
    }

    #[test]
    fn test_passthrough_sample_returned_on_drop() {
        let context = PipelineContext::new();
        let (output, _handle) = make_output(&context, RecordingOptions::default(), 64, 48);
        // Not started: sample is rejected. With invalidate_when_done false
        // the caller gets it back.
        let sample = VideoSample::new(
            crate::media::pixel::PixelBuffer::alloc(64, 48, crate::media::pixel::PixelFormat::Bgra32),
            MediaTime::new(0, 30),
        );
        let returned = output.process_video_buffer(sample, false);
        assert!(returned.is_some());

        let sample = VideoSample::new(
            crate::media::pixel::PixelBuffer::alloc(64, 48, crate::media::pixel::PixelFormat::Bgra32),
            MediaTime::new(0, 30),
        );
        assert!(output.process_video_buffer(sample, true).is_none());
    }
}
