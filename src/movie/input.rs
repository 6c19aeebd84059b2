//! Decoded-frame source
//!
//! Drives an asset reader on a dedicated thread and delivers decoded
//! video as framebuffers (audio as samples) to its targets. Exactly one
//! pacing mode is active per session:
//!
//! - wall-clock pacing against an absolute timer (`play_at_actual_speed`,
//!   scaled by `playrate`, frames behind schedule are dropped),
//! - synchronized to a writer's readiness (back-pressure through the
//!   output's gate; looping and wall-clock pacing are disabled),
//! - unpaced, as fast as downstream accepts, optionally bounded by
//!   `max_fps`.
//!
//! Completion, progress, and finish callbacks are invoked from the reader
//! thread.

use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::backend::reader::{AssetSource, ReadRange, ReaderStatus};
use crate::config::InputOptions;
use crate::error::{PipelineError, PipelineResult};
use crate::media::orientation::Orientation;
use crate::media::sample::{MediaKind, SampleBuffer, VideoSample};
use crate::media::time::MediaTime;
use crate::movie::convert::FramebufferGenerator;
use crate::movie::output::MovieOutput;
use crate::movie::FramebufferSink;
use crate::runtime::context::PipelineContext;
use crate::runtime::gate::ReadinessGate;
use crate::runtime::stop::StopSignal;
use crate::stats::{DropReason, PipelineStats};

/// How often blocked waits re-check cancellation and writer readiness.
const BACKPRESSURE_RECHECK: Duration = Duration::from_millis(10);

/// Pacing slack before a frame counts as behind schedule.
const PACING_GRACE: Duration = Duration::from_millis(1);

type CompletionHandler = Box<dyn FnOnce(Option<PipelineError>) + Send>;
type ProgressHandler = Box<dyn Fn(f64) + Send>;
type FinishHandler = Box<dyn Fn() + Send>;

struct InputCore {
    source: Arc<dyn AssetSource>,
    options: Mutex<InputOptions>,
    generator: FramebufferGenerator,
    targets: Mutex<Vec<Arc<dyn FramebufferSink>>>,
    audio_target: Mutex<Option<MovieOutput>>,
    sync_output: Mutex<Option<MovieOutput>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stop: Mutex<StopSignal>,
    pause_requested: AtomicBool,
    reading_gate: ReadinessGate,
    running: AtomicBool,
    resume_time: Mutex<MediaTime>,
    current_time: Mutex<MediaTime>,
    completion: Mutex<Option<CompletionHandler>>,
    progress: Mutex<Option<ProgressHandler>>,
    on_finish: Mutex<Option<FinishHandler>>,
    stats: Arc<PipelineStats>,
}

/// Decoded-frame source. Cloning shares the same input.
#[derive(Clone)]
pub struct MovieInput {
    core: Arc<InputCore>,
}

impl MovieInput {
    pub fn new(
        source: Arc<dyn AssetSource>,
        context: Arc<PipelineContext>,
        options: InputOptions,
    ) -> Self {
        Self {
            core: Arc::new(InputCore {
                source,
                options: Mutex::new(options),
                generator: FramebufferGenerator::new(context),
                targets: Mutex::new(Vec::new()),
                audio_target: Mutex::new(None),
                sync_output: Mutex::new(None),
                worker: Mutex::new(None),
                stop: Mutex::new(StopSignal::new()),
                pause_requested: AtomicBool::new(false),
                reading_gate: ReadinessGate::new(),
                running: AtomicBool::new(false),
                resume_time: Mutex::new(MediaTime::zero()),
                current_time: Mutex::new(MediaTime::zero()),
                completion: Mutex::new(None),
                progress: Mutex::new(None),
                on_finish: Mutex::new(None),
                stats: Arc::new(PipelineStats::new()),
            }),
        }
    }

    /// Attach a framebuffer consumer.
    pub fn add_target(&self, target: Arc<dyn FramebufferSink>) {
        self.core.targets.lock().unwrap().push(target);
    }

    /// Route decoded audio to an output. Activates the output's default
    /// audio track.
    pub fn set_audio_encoding_target(&self, output: MovieOutput) -> PipelineResult<()> {
        output.activate_audio_track(Default::default())?;
        *self.core.audio_target.lock().unwrap() = Some(output);
        Ok(())
    }

    /// Pace reading against this output's encoder readiness instead of
    /// the wall clock. Disables looping and wall-clock pacing for
    /// subsequent sessions.
    pub fn set_synchronized_movie_output(&self, output: MovieOutput) {
        *self.core.sync_output.lock().unwrap() = Some(output);
    }

    pub fn options(&self) -> InputOptions {
        *self.core.options.lock().unwrap()
    }

    pub fn set_options(&self, options: InputOptions) {
        *self.core.options.lock().unwrap() = options;
    }

    /// Sample time of the most recently delivered sample.
    pub fn current_time(&self) -> MediaTime {
        *self.core.current_time.lock().unwrap()
    }

    /// Where `start` resumes after a pause.
    pub fn resume_point(&self) -> MediaTime {
        *self.core.resume_time.lock().unwrap()
    }

    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.core.stats
    }

    pub fn set_completion_handler(
        &self,
        completion: impl FnOnce(Option<PipelineError>) + Send + 'static,
    ) {
        *self.core.completion.lock().unwrap() = Some(Box::new(completion));
    }

    pub fn set_progress_handler(&self, progress: impl Fn(f64) + Send + 'static) {
        *self.core.progress.lock().unwrap() = Some(Box::new(progress));
    }

    /// Delegate notified when the asset finishes without error.
    pub fn set_finish_handler(&self, handler: impl Fn() + Send + 'static) {
        *self.core.on_finish.lock().unwrap() = Some(Box::new(handler));
    }

    /// Begin or resume reading. With `is_trimming`, `(at_time, duration)`
    /// select a sub-range of the asset; otherwise `at_time` is a resume
    /// point. A no-op when a session is already running.
    pub fn start(&self, at_time: MediaTime, duration: Option<MediaTime>, is_trimming: bool) {
        if self.core.running.swap(true, Ordering::AcqRel) {
            debug!("MovieInput: start ignored, session already running");
            return;
        }
        *self.core.stop.lock().unwrap() = StopSignal::new();
        self.core.pause_requested.store(false, Ordering::Release);

        let core = Arc::clone(&self.core);
        let worker = thread::Builder::new()
            .name("reelflow-movie-input".into())
            .spawn(move || InputCore::run_session(core, at_time, duration, is_trimming))
            .expect("failed to spawn movie input thread");
        *self.core.worker.lock().unwrap() = Some(worker);
    }

    /// Stop reading and remember the current sample time as the next
    /// resume point. No callbacks fire.
    pub fn pause(&self) {
        self.core.pause_requested.store(true, Ordering::Release);
        // Unpark a paused-without-cancel thread so it can observe the
        // request.
        self.core.reading_gate.set_should_wait(false);
    }

    /// Hold the reader in place without tearing the thread down.
    pub fn pause_without_cancel(&self) {
        self.core.reading_gate.set_should_wait(true);
    }

    /// Release a `pause_without_cancel` hold.
    pub fn resume(&self) {
        self.core.reading_gate.set_should_wait(false);
    }

    /// Terminate the session. The pending completion handler (if any)
    /// fires with a cancellation error; nothing else is called back.
    pub fn cancel(&self) {
        self.core.stop.lock().unwrap().cancel();
        self.core.reading_gate.set_should_wait(false);
    }

    /// Whether a reader session is active.
    pub fn is_running(&self) -> bool {
        self.core.running.load(Ordering::Acquire)
    }

    /// Block until the current session's thread has exited.
    pub fn wait_until_stopped(&self) {
        let worker = self.core.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            let _ = worker.join();
        }
    }
}

enum SessionExit {
    Finished(Option<PipelineError>),
    Paused,
}

impl InputCore {
    fn run_session(
        core: Arc<InputCore>,
        at_time: MediaTime,
        duration: Option<MediaTime>,
        is_trimming: bool,
    ) {
        let options = *core.options.lock().unwrap();
        let sync_output = core.sync_output.lock().unwrap().clone();
        let synchronized = sync_output.is_some();
        options.scheduling_hint(synchronized).apply_to_current_thread();
        // A synchronized session is paced by the writer alone.
        let effective_loop = options.loop_enabled && !synchronized;
        let stop = core.stop.lock().unwrap().clone();

        let mut start_at = at_time;
        let exit = loop {
            let range = if is_trimming {
                ReadRange {
                    start: start_at,
                    duration,
                }
            } else {
                ReadRange::from_start(start_at)
            };
            match core.run_one_pass(&options, sync_output.as_ref(), &stop, range) {
                PassOutcome::EndOfAsset => {
                    if stop.cancelled() {
                        break SessionExit::Finished(Some(PipelineError::Cancelled));
                    }
                    if let Some(output) = &sync_output {
                        // One-shot flags, read at the writer's next turn.
                        output.request_finish_video();
                        if core.audio_target.lock().unwrap().is_some() {
                            output.request_finish_audio();
                        }
                        output.refresh_readiness();
                        break SessionExit::Finished(None);
                    }
                    if effective_loop {
                        start_at = if is_trimming { at_time } else { MediaTime::zero() };
                        *core.current_time.lock().unwrap() = start_at;
                        info!("MovieInput: looping back to {}", start_at);
                        continue;
                    }
                    break SessionExit::Finished(None);
                }
                PassOutcome::Cancelled => {
                    break SessionExit::Finished(Some(PipelineError::Cancelled));
                }
                PassOutcome::Paused => break SessionExit::Paused,
                PassOutcome::Failed(error) => break SessionExit::Finished(Some(error)),
            }
        };

        match exit {
            SessionExit::Finished(error) => {
                if error.is_none() {
                    if let Some(handler) = core.on_finish.lock().unwrap().as_ref() {
                        handler();
                    }
                }
                let completion = core.completion.lock().unwrap().take();
                if let Some(completion) = completion {
                    completion(error);
                } else if let Some(error) = error {
                    warn!("MovieInput: session ended with {}", error);
                }
            }
            SessionExit::Paused => {
                debug!("MovieInput: paused at {}", core.current_time.lock().unwrap());
            }
        }
        core.running.store(false, Ordering::Release);
    }

    fn run_one_pass(
        &self,
        options: &InputOptions,
        sync_output: Option<&MovieOutput>,
        stop: &StopSignal,
        range: ReadRange,
    ) -> PassOutcome {
        let mut reader = match self.source.make_reader(range) {
            Ok(reader) => reader,
            Err(error) => return PassOutcome::Failed(error),
        };
        if let Err(error) = reader.start_reading() {
            return PassOutcome::Failed(error);
        }
        info!("MovieInput: reading from {}", range.start);

        let asset_duration = self.source.duration();
        let mut pacing: Option<PacingClock> = None;
        let mut last_delivery: Option<Instant> = None;

        loop {
            if stop.cancelled() {
                reader.cancel_reading();
                return PassOutcome::Cancelled;
            }
            if self.pause_requested.swap(false, Ordering::AcqRel) {
                *self.resume_time.lock().unwrap() = *self.current_time.lock().unwrap();
                reader.cancel_reading();
                return PassOutcome::Paused;
            }
            // The reading lock: held while paused-without-cancel.
            while self.reading_gate.should_wait()
                && !stop.cancelled()
                && !self.pause_requested.load(Ordering::Acquire)
            {
                self.reading_gate
                    .wait_while_blocked(stop, BACKPRESSURE_RECHECK);
            }
            if stop.cancelled() || self.pause_requested.load(Ordering::Acquire) {
                continue;
            }

            let mut pulled_any = false;
            if let Some(output) = sync_output {
                // Synchronized back-pressure: park while both writer
                // inputs are full, re-checking readiness each interval.
                let gate = output.readiness();
                while gate.should_wait() && !stop.cancelled() {
                    gate.wait_while_blocked(stop, BACKPRESSURE_RECHECK);
                    output.refresh_readiness();
                }
                if stop.cancelled() {
                    continue;
                }
                if output.is_ready_for_video() {
                    if let Some(SampleBuffer::Video(sample)) =
                        reader.copy_next_sample(MediaKind::Video)
                    {
                        self.deliver_video(sample, options, sync_output, asset_duration);
                        pulled_any = true;
                    }
                }
                let audio_target = self.audio_target.lock().unwrap().clone();
                if let Some(audio_output) = audio_target {
                    if reader.has_track(MediaKind::Audio) && audio_output.is_ready_for_audio() {
                        if let Some(SampleBuffer::Audio(sample)) =
                            reader.copy_next_sample(MediaKind::Audio)
                        {
                            audio_output.process_audio_buffer(sample);
                            pulled_any = true;
                        }
                    }
                }
                output.refresh_readiness();
            } else {
                if let Some(SampleBuffer::Video(sample)) =
                    reader.copy_next_sample(MediaKind::Video)
                {
                    let pts = sample.pts;
                    let deliver = if options.play_at_actual_speed {
                        let clock = pacing.get_or_insert_with(|| PacingClock::new(pts));
                        clock.wait_until_due(pts, options.playrate, stop)
                    } else {
                        true
                    };
                    if deliver {
                        if let (Some(max_fps), Some(last)) = (options.max_fps, last_delivery) {
                            let min_interval = Duration::from_secs_f64(1.0 / max_fps.max(1.0));
                            let since = last.elapsed();
                            if since < min_interval {
                                thread::sleep(min_interval - since);
                            }
                        }
                        self.deliver_video(sample, options, sync_output, asset_duration);
                        last_delivery = Some(Instant::now());
                    } else {
                        self.stats.record_drop(DropReason::BehindSchedule);
                        debug!("MovieInput: behind schedule, frame at {} dropped", pts);
                    }
                    pulled_any = true;
                }
                let audio_target = self.audio_target.lock().unwrap().clone();
                if let Some(audio_output) = audio_target {
                    if reader.has_track(MediaKind::Audio) {
                        if let Some(SampleBuffer::Audio(sample)) =
                            reader.copy_next_sample(MediaKind::Audio)
                        {
                            audio_output.process_audio_buffer(sample);
                            pulled_any = true;
                        }
                    }
                }
            }

            match reader.status() {
                ReaderStatus::Reading => {
                    if !pulled_any {
                        // Writer accepted nothing this turn; yield briefly
                        // instead of spinning.
                        thread::sleep(Duration::from_millis(1));
                    }
                }
                ReaderStatus::Completed => {
                    info!("MovieInput: end of asset");
                    return PassOutcome::EndOfAsset;
                }
                ReaderStatus::Failed => {
                    let message = reader.error().unwrap_or_else(|| "unknown".into());
                    return PassOutcome::Failed(PipelineError::ReaderFailed(message));
                }
                ReaderStatus::Cancelled => return PassOutcome::Cancelled,
                ReaderStatus::Idle => unreachable!("reader polled before start"),
            }
        }
    }

    fn deliver_video(
        &self,
        sample: VideoSample,
        options: &InputOptions,
        sync_output: Option<&MovieOutput>,
        asset_duration: MediaTime,
    ) {
        let pts = sample.pts;
        *self.current_time.lock().unwrap() = pts;
        if let Some(progress) = self.progress.lock().unwrap().as_ref() {
            let total = asset_duration.seconds();
            if total > 0.0 {
                progress((pts.seconds() / total).clamp(0.0, 1.0));
            }
        }

        if options.transcoding_only {
            if let Some(output) = sync_output {
                output.process_video_buffer(sample, true);
                return;
            }
            debug!("MovieInput: transcoding_only without synchronized output, frame dropped");
            return;
        }

        let framebuffer =
            match self
                .generator
                .framebuffer_from_yuv(sample.pixels, pts, Orientation::Portrait)
            {
                Ok(framebuffer) => framebuffer,
                Err(error) => {
                    warn!("MovieInput: conversion failed at {}: {}", pts, error);
                    return;
                }
            };
        let targets = self.targets.lock().unwrap().clone();
        for (index, target) in targets.iter().enumerate() {
            framebuffer.lock();
            target.new_framebuffer_available(framebuffer.clone(), index);
        }
        framebuffer.unlock();
    }
}

enum PassOutcome {
    EndOfAsset,
    Cancelled,
    Paused,
    Failed(PipelineError),
}

/// Wall-clock pacing against an absolute timer, anchored at the first
/// delivered frame.
struct PacingClock {
    epoch: Instant,
    first_pts: MediaTime,
}

impl PacingClock {
    fn new(first_pts: MediaTime) -> Self {
        Self {
            epoch: Instant::now(),
            first_pts,
        }
    }

    /// Wait until `pts` is due. Returns `false` when the frame is already
    /// behind schedule and should be dropped.
    fn wait_until_due(&self, pts: MediaTime, playrate: f64, stop: &StopSignal) -> bool {
        let media_offset = (pts - self.first_pts).seconds();
        let rate = if playrate > 0.0 { playrate } else { 1.0 };
        let deadline = self.epoch + Duration::from_secs_f64(media_offset / rate);

        let now = Instant::now();
        if now > deadline + PACING_GRACE {
            return false;
        }
        while Instant::now() < deadline {
            if stop.cancelled() {
                return false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining > Duration::from_micros(500) {
                thread::sleep(remaining - Duration::from_micros(300));
            } else {
                std::hint::spin_loop();
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{MemoryAsset, MemoryAudioTrack, MemoryMovieWriter};
    use crate::backend::writer::{ContainerSettings, VideoTrackSettings};
    use crate::config::RecordingOptions;
    use crate::media::framebuffer::Framebuffer;
    use crate::media::pixel::PixelFormat;

    struct CountingSink {
        frames: Mutex<Vec<MediaTime>>,
    }

    impl CountingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                frames: Mutex::new(Vec::new()),
            })
        }

        fn timestamps(&self) -> Vec<MediaTime> {
            self.frames.lock().unwrap().clone()
        }
    }

    impl FramebufferSink for CountingSink {
        fn new_framebuffer_available(&self, framebuffer: Framebuffer, _source_index: usize) {
            if let Some(pts) = framebuffer.timestamp() {
                self.frames.lock().unwrap().push(pts);
            }
            framebuffer.unlock();
        }
    }

    fn unpaced_options() -> InputOptions {
        InputOptions {
            play_at_actual_speed: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_unpaced_delivery_reaches_all_targets() {
        let context = PipelineContext::new();
        let asset = Arc::new(MemoryAsset::video(8, 8, 30, 20));
        let input = MovieInput::new(asset, Arc::clone(&context), unpaced_options());
        let sink = CountingSink::new();
        input.add_target(sink.clone());

        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        input.set_completion_handler(move |error| {
            assert!(error.is_none());
            flag.store(true, Ordering::Release);
        });

        input.start(MediaTime::zero(), None, false);
        input.wait_until_stopped();

        assert!(finished.load(Ordering::Acquire));
        let timestamps = sink.timestamps();
        assert_eq!(timestamps.len(), 20);
        assert_eq!(timestamps[0], MediaTime::new(0, 30));
        assert_eq!(timestamps[19], MediaTime::new(19, 30));
        assert_eq!(context.framebuffer_pool().live_count(), 0);
    }

    #[test]
    fn test_start_is_idempotent_while_running() {
        let context = PipelineContext::new();
        // Wall-clock paced so the session stays alive long enough.
        let asset = Arc::new(MemoryAsset::video(8, 8, 30, 30));
        let input = MovieInput::new(asset, context, InputOptions::default());
        let sink = CountingSink::new();
        input.add_target(sink.clone());

        input.start(MediaTime::zero(), None, false);
        input.start(MediaTime::zero(), None, false); // ignored
        input.wait_until_stopped();

        assert_eq!(sink.timestamps().len(), 30);
    }

    #[test]
    fn test_trimmed_range_reads_sub_asset() {
        let context = PipelineContext::new();
        let asset = Arc::new(MemoryAsset::video(8, 8, 30, 60));
        let input = MovieInput::new(asset, context, unpaced_options());
        let sink = CountingSink::new();
        input.add_target(sink.clone());

        input.start(
            MediaTime::new(30, 30),
            Some(MediaTime::new(15, 30)),
            true,
        );
        input.wait_until_stopped();

        let timestamps = sink.timestamps();
        assert_eq!(timestamps.len(), 15);
        assert_eq!(timestamps[0], MediaTime::new(30, 30));
    }

    #[test]
    fn test_loop_restarts_until_cancelled() {
        let context = PipelineContext::new();
        let asset = Arc::new(MemoryAsset::video(8, 8, 30, 5));
        let mut options = unpaced_options();
        options.loop_enabled = true;
        let input = MovieInput::new(asset, context, options);
        let sink = CountingSink::new();
        input.add_target(sink.clone());

        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        input.set_completion_handler(move |error| {
            assert!(matches!(error, Some(PipelineError::Cancelled)));
            flag.store(true, Ordering::Release);
        });

        input.start(MediaTime::zero(), None, false);
        // Let it loop a few times, then cancel.
        while sink.timestamps().len() < 12 {
            thread::sleep(Duration::from_millis(1));
        }
        input.cancel();
        input.wait_until_stopped();

        assert!(cancelled.load(Ordering::Acquire));
        assert!(sink.timestamps().len() >= 12);
    }

    #[test]
    fn test_pause_without_cancel_holds_delivery() {
        let context = PipelineContext::new();
        let asset = Arc::new(MemoryAsset::video(8, 8, 30, 2000));
        let input = MovieInput::new(asset, context, unpaced_options());
        let sink = CountingSink::new();
        input.add_target(sink.clone());

        input.pause_without_cancel();
        input.start(MediaTime::zero(), None, false);
        thread::sleep(Duration::from_millis(40));
        let while_held = sink.timestamps().len();
        assert!(while_held <= 1, "delivered {} while held", while_held);

        input.resume();
        input.wait_until_stopped();
        assert_eq!(sink.timestamps().len(), 2000);
    }

    #[test]
    fn test_reader_failure_reaches_completion() {
        let context = PipelineContext::new();
        let asset = Arc::new(MemoryAsset::video(8, 8, 30, 50).failing_after(10));
        let input = MovieInput::new(asset, context, unpaced_options());
        let sink = CountingSink::new();
        input.add_target(sink.clone());

        let failed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&failed);
        input.set_completion_handler(move |error| {
            assert!(matches!(error, Some(PipelineError::ReaderFailed(_))));
            flag.store(true, Ordering::Release);
        });

        input.start(MediaTime::zero(), None, false);
        input.wait_until_stopped();
        assert!(failed.load(Ordering::Acquire));
        assert_eq!(sink.timestamps().len(), 10);
    }

    #[test]
    fn test_synchronized_transcode_appends_every_frame() {
        // 300 input frames through a writer with intermittent readiness:
        // every frame must append exactly once and the reader must have
        // parked on the gate at least once.
        let _ = env_logger::builder().is_test(true).try_init();
        let context = PipelineContext::new();
        let asset = Arc::new(MemoryAsset::video(16, 16, 30, 300));

        let writer = MemoryMovieWriter::new(ContainerSettings::new(
            "/tmp/sync-transcode.mov",
            VideoTrackSettings::new(16, 16),
        ));
        writer.set_intermittent_readiness(40);
        let handle = writer.clone();
        let output = MovieOutput::new(
            Box::new(writer),
            Arc::clone(&context),
            RecordingOptions::default(),
        );
        output.start_recording().unwrap();

        let mut options = unpaced_options();
        options.loop_enabled = true; // must be ignored while synchronized
        let input = MovieInput::new(asset, Arc::clone(&context), options);
        input.set_synchronized_movie_output(output.clone());
        input.add_target(Arc::new(output.clone()));

        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        input.set_completion_handler(move |error| {
            assert!(error.is_none());
            flag.store(true, Ordering::Release);
        });

        input.start(MediaTime::zero(), None, false);
        input.wait_until_stopped();
        assert!(done.load(Ordering::Acquire));

        output.finish_recording().unwrap();
        let frames = handle.video_frames();
        assert_eq!(frames.len(), 300);
        // Strictly monotone appended timestamps.
        for pair in frames.windows(2) {
            assert_eq!(
                pair[1].pts.compare(&pair[0].pts),
                std::cmp::Ordering::Greater
            );
        }
        // Input and output cover the same span within one frame.
        let input_duration = 300.0 / 30.0;
        let output_duration = output.recorded_duration().unwrap().seconds()
            + 1.0 / 30.0; // duration counts frame starts
        assert!((output_duration - input_duration).abs() <= 1.0 / 30.0);
        assert!(
            output.readiness().times_blocked() >= 1,
            "reader never parked on the readiness gate"
        );
        assert_eq!(context.framebuffer_pool().live_count(), 0);
    }

    #[test]
    fn test_transcoding_only_bypasses_conversion() {
        let context = PipelineContext::new();
        let asset = Arc::new(MemoryAsset::video(16, 16, 30, 12));
        let writer = MemoryMovieWriter::new(ContainerSettings::new(
            "/tmp/passthrough.mov",
            VideoTrackSettings::new(16, 16),
        ));
        let handle = writer.clone();
        let output = MovieOutput::new(
            Box::new(writer),
            Arc::clone(&context),
            RecordingOptions::default(),
        );
        output.start_recording().unwrap();

        let mut options = unpaced_options();
        options.transcoding_only = true;
        let input = MovieInput::new(asset, Arc::clone(&context), options);
        input.set_synchronized_movie_output(output.clone());

        input.start(MediaTime::zero(), None, false);
        input.wait_until_stopped();
        output.finish_recording().unwrap();

        let frames = handle.video_frames();
        assert_eq!(frames.len(), 12);
        // Passthrough keeps the decoder's planar layout.
        assert_eq!(
            frames[0].byte_len,
            PixelFormat::YCbCr420Bi.byte_len(16, 16)
        );
        // No framebuffers were produced at all.
        assert_eq!(context.framebuffer_pool().live_count(), 0);
        assert_eq!(context.framebuffer_pool().idle_count(), 0);
    }

    #[test]
    fn test_audio_routed_to_encoding_target() {
        let context = PipelineContext::new();
        let asset = Arc::new(
            MemoryAsset::video(16, 16, 30, 30).with_audio(MemoryAudioTrack::default()),
        );
        let writer = MemoryMovieWriter::new(ContainerSettings::new(
            "/tmp/audio-routed.mov",
            VideoTrackSettings::new(16, 16),
        ));
        let handle = writer.clone();
        let output = MovieOutput::new(
            Box::new(writer),
            Arc::clone(&context),
            RecordingOptions::default(),
        );

        let input = MovieInput::new(asset, Arc::clone(&context), unpaced_options());
        input.set_synchronized_movie_output(output.clone());
        // Audio must be activated before the writer starts.
        input.set_audio_encoding_target(output.clone()).unwrap();
        input.add_target(Arc::new(output.clone()));
        output.start_recording().unwrap();

        input.start(MediaTime::zero(), None, false);
        input.wait_until_stopped();
        output.finish_recording().unwrap();

        assert_eq!(handle.video_frames().len(), 30);
        assert!(!handle.audio_samples().is_empty());
        // Session anchor property: no audio precedes the first video pts.
        let anchor = handle.video_frames()[0].pts;
        for sample in handle.audio_samples() {
            assert_ne!(sample.pts.compare(&anchor), std::cmp::Ordering::Less);
        }
    }

    #[test]
    fn test_wall_clock_pacing_spaces_frames() {
        let context = PipelineContext::new();
        // 10 frames at 100 fps: one frame every 10 ms.
        let asset = Arc::new(MemoryAsset::video(8, 8, 100, 10));
        let input = MovieInput::new(asset, context, InputOptions::default());
        let sink = CountingSink::new();
        input.add_target(sink.clone());

        let started = Instant::now();
        input.start(MediaTime::zero(), None, false);
        input.wait_until_stopped();
        let elapsed = started.elapsed();

        // 10 frames spanning 90 ms of media time must take at least that
        // long to deliver.
        assert!(
            elapsed >= Duration::from_millis(80),
            "paced session finished in {:?}",
            elapsed
        );
        assert_eq!(sink.timestamps().len(), 10);
    }
}
