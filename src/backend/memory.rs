//! In-memory reference backends
//!
//! A scripted asset source and a recording container writer that live
//! entirely in memory. They serve the same role the generic fallback
//! capture backend serves in a capture stack: a deterministic,
//! dependency-free implementation for hosts without native media FFI, and
//! the workhorse behind the pipeline's own tests.

use anyhow::{anyhow, Result};
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{PipelineError, PipelineResult};
use crate::media::pixel::{PixelBuffer, PixelBufferPool, PixelFormat};
use crate::media::sample::{AudioSample, MediaKind, SampleBuffer, VideoSample};
use crate::media::time::MediaTime;

use super::reader::{AssetReader, AssetSource, ReadRange, ReaderStatus};
use super::writer::{
    AudioTrackSettings, ContainerSettings, ContainerWriter, WriterBackendStatus,
};

// ── Asset source ────────────────────────────────────────────────

/// Description of a synthetic audio track.
#[derive(Debug, Clone)]
pub struct MemoryAudioTrack {
    pub sample_rate: u32,
    pub channels: u16,
    /// Frames of audio per decoded chunk.
    pub samples_per_chunk: u32,
}

impl Default for MemoryAudioTrack {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            channels: 2,
            samples_per_chunk: 1024,
        }
    }
}

/// A synthetic stored asset: `frame_count` video frames at a fixed frame
/// duration, with an optional audio track covering the same span.
pub struct MemoryAsset {
    width: u32,
    height: u32,
    frame_duration: MediaTime,
    frame_count: u64,
    audio: Option<MemoryAudioTrack>,
    /// Fail video decoding after this many samples (error injection).
    fail_video_after: Option<u64>,
    /// Refuse to construct readers (error injection).
    refuse_readers: bool,
}

impl MemoryAsset {
    /// A video-only asset of `frame_count` frames at `fps`.
    pub fn video(width: u32, height: u32, fps: i32, frame_count: u64) -> Self {
        Self {
            width,
            height,
            frame_duration: MediaTime::new(1, fps),
            frame_count,
            audio: None,
            fail_video_after: None,
            refuse_readers: false,
        }
    }

    pub fn with_audio(mut self, audio: MemoryAudioTrack) -> Self {
        self.audio = Some(audio);
        self
    }

    pub fn failing_after(mut self, samples: u64) -> Self {
        self.fail_video_after = Some(samples);
        self
    }

    pub fn refusing_readers(mut self) -> Self {
        self.refuse_readers = true;
        self
    }

    pub fn frame_duration(&self) -> MediaTime {
        self.frame_duration
    }
}

impl AssetSource for MemoryAsset {
    fn duration(&self) -> MediaTime {
        MediaTime::new(
            self.frame_duration.value * self.frame_count as i64,
            self.frame_duration.timescale,
        )
    }

    fn make_reader(&self, range: ReadRange) -> PipelineResult<Box<dyn AssetReader>> {
        if self.refuse_readers {
            return Err(PipelineError::ReaderCreation(
                "asset is not readable".into(),
            ));
        }
        // First frame whose timestamp is not before the range start. The
        // quotient is nudged before ceiling so an exact frame boundary is
        // not pushed to the next frame by float error.
        let start_seconds = range.start.seconds().max(0.0);
        let frame_seconds = self.frame_duration.seconds();
        let first_frame = ((start_seconds / frame_seconds) - 1e-9).ceil().max(0.0) as u64;

        let end_frame = match range.duration {
            Some(duration) => {
                let end_seconds = start_seconds + duration.seconds();
                ((end_seconds / frame_seconds).round() as u64).min(self.frame_count)
            }
            None => self.frame_count,
        };

        let audio_chunks = self.audio.as_ref().map(|track| {
            let chunk_seconds = track.samples_per_chunk as f64 / track.sample_rate as f64;
            let span = (end_frame.saturating_sub(first_frame)) as f64 * frame_seconds;
            let count = (span / chunk_seconds).ceil() as u64;
            (track.clone(), count)
        });

        Ok(Box::new(MemoryAssetReader {
            width: self.width,
            height: self.height,
            frame_duration: self.frame_duration,
            next_frame: first_frame,
            end_frame,
            range_start_seconds: first_frame as f64 * frame_seconds,
            audio: audio_chunks,
            next_audio_chunk: 0,
            status: ReaderStatus::Idle,
            error: None,
            fail_video_after: self.fail_video_after,
            video_samples_out: 0,
        }))
    }
}

/// One reading pass over a [`MemoryAsset`].
pub struct MemoryAssetReader {
    width: u32,
    height: u32,
    frame_duration: MediaTime,
    next_frame: u64,
    end_frame: u64,
    range_start_seconds: f64,
    audio: Option<(MemoryAudioTrack, u64)>,
    next_audio_chunk: u64,
    status: ReaderStatus,
    error: Option<String>,
    fail_video_after: Option<u64>,
    video_samples_out: u64,
}

impl MemoryAssetReader {
    fn synthesize_frame(&self, index: u64) -> PixelBuffer {
        let mut pixels = PixelBuffer::alloc(self.width, self.height, PixelFormat::YCbCr420Bi);
        let luma_len = self.width as usize * self.height as usize;
        let data = pixels.data_mut();
        // Deterministic content: luma encodes the frame index, chroma is
        // neutral gray.
        data[..luma_len].fill((index % 251) as u8);
        data[luma_len..].fill(128);
        pixels
    }

    fn finished(&self) -> bool {
        let video_done = self.next_frame >= self.end_frame;
        let audio_done = self
            .audio
            .as_ref()
            .map(|(_, count)| self.next_audio_chunk >= *count)
            .unwrap_or(true);
        video_done && audio_done
    }
}

impl AssetReader for MemoryAssetReader {
    fn start_reading(&mut self) -> PipelineResult<()> {
        if self.status != ReaderStatus::Idle {
            return Err(PipelineError::ReaderFailed(
                "reader already started".into(),
            ));
        }
        self.status = ReaderStatus::Reading;
        Ok(())
    }

    fn copy_next_sample(&mut self, kind: MediaKind) -> Option<SampleBuffer> {
        if self.status != ReaderStatus::Reading {
            return None;
        }
        match kind {
            MediaKind::Video => {
                if let Some(limit) = self.fail_video_after {
                    if self.video_samples_out >= limit {
                        self.status = ReaderStatus::Failed;
                        self.error = Some("synthetic decode failure".into());
                        return None;
                    }
                }
                if self.next_frame >= self.end_frame {
                    if self.finished() {
                        self.status = ReaderStatus::Completed;
                    }
                    return None;
                }
                let index = self.next_frame;
                self.next_frame += 1;
                self.video_samples_out += 1;
                let pts = MediaTime::new(
                    self.frame_duration.value * index as i64,
                    self.frame_duration.timescale,
                );
                let sample = VideoSample::new(self.synthesize_frame(index), pts);
                if self.finished() {
                    self.status = ReaderStatus::Completed;
                }
                Some(SampleBuffer::Video(sample))
            }
            MediaKind::Audio => {
                let (track, chunk_count) = self.audio.as_ref()?;
                if self.next_audio_chunk >= *chunk_count {
                    if self.finished() {
                        self.status = ReaderStatus::Completed;
                    }
                    return None;
                }
                let chunk = self.next_audio_chunk;
                self.next_audio_chunk += 1;
                let chunk_seconds = track.samples_per_chunk as f64 / track.sample_rate as f64;
                let pts = MediaTime::from_seconds(
                    self.range_start_seconds + chunk as f64 * chunk_seconds,
                    track.sample_rate as i32,
                );
                let bytes_per_frame = track.channels as usize * 2; // 16-bit
                let data = Bytes::from(vec![
                    0u8;
                    track.samples_per_chunk as usize * bytes_per_frame
                ]);
                let sample = AudioSample::new(data, pts, track.sample_rate, track.channels);
                if self.finished() {
                    self.status = ReaderStatus::Completed;
                }
                Some(SampleBuffer::Audio(sample))
            }
        }
    }

    fn cancel_reading(&mut self) {
        if self.status == ReaderStatus::Reading || self.status == ReaderStatus::Idle {
            self.status = ReaderStatus::Cancelled;
        }
    }

    fn status(&self) -> ReaderStatus {
        self.status
    }

    fn error(&self) -> Option<String> {
        self.error.clone()
    }

    fn has_track(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Video => true,
            MediaKind::Audio => self.audio.is_some(),
        }
    }
}

// ── Container writer ────────────────────────────────────────────

/// A video frame as the memory container stores it: metadata only, the
/// pixel storage goes straight back to its pool.
#[derive(Debug, Clone)]
pub struct RecordedVideoFrame {
    pub pts: MediaTime,
    pub byte_len: usize,
    pub luma_probe: u8,
    pub had_attachments: bool,
}

#[derive(Debug, Clone)]
pub struct RecordedAudioSample {
    pub pts: MediaTime,
    pub byte_len: usize,
}

#[derive(Debug, Default)]
struct MemWriterInner {
    status: WriterBackendStatus,
    error: Option<String>,
    video_frames: Vec<RecordedVideoFrame>,
    audio_samples: Vec<RecordedAudioSample>,
    session_starts: Vec<MediaTime>,
    session_end: Option<MediaTime>,
    last_video_pts: Option<MediaTime>,
    audio_track: Option<AudioTrackSettings>,
    video_finished: bool,
    audio_finished: bool,
    pool: Option<Arc<PixelBufferPool>>,
}

struct MemWriterState {
    settings: ContainerSettings,
    inner: Mutex<MemWriterInner>,
    readiness_polls: AtomicU64,
    /// Report not-ready on every Nth readiness poll (0 = always ready).
    not_ready_every: AtomicU64,
    /// Refuse `start_writing` (error injection).
    refuse_start: Mutex<Option<String>>,
    /// Report no pixel-buffer pool even after a successful start.
    withhold_pool: Mutex<bool>,
    pool_capacity: usize,
}

/// Memory-backed [`ContainerWriter`].
///
/// Clones share the same recording; keep one clone as an inspection
/// handle while the pipeline owns the other.
#[derive(Clone)]
pub struct MemoryMovieWriter {
    state: Arc<MemWriterState>,
}

impl MemoryMovieWriter {
    pub fn new(settings: ContainerSettings) -> Self {
        Self {
            state: Arc::new(MemWriterState {
                settings,
                inner: Mutex::new(MemWriterInner::default()),
                readiness_polls: AtomicU64::new(0),
                not_ready_every: AtomicU64::new(0),
                refuse_start: Mutex::new(None),
                withhold_pool: Mutex::new(false),
                pool_capacity: 16,
            }),
        }
    }

    /// Report not-ready on every `every`-th readiness poll, exercising the
    /// back-pressure paths.
    pub fn set_intermittent_readiness(&self, every: u64) {
        self.state.not_ready_every.store(every, Ordering::Relaxed);
    }

    /// Make the next `start_writing` fail with `reason`.
    pub fn refuse_start(&self, reason: impl Into<String>) {
        *self.state.refuse_start.lock().unwrap() = Some(reason.into());
    }

    /// Report no pixel-buffer pool even after a successful start.
    pub fn withhold_pool(&self) {
        *self.state.withhold_pool.lock().unwrap() = true;
    }

    pub fn video_frames(&self) -> Vec<RecordedVideoFrame> {
        self.state.inner.lock().unwrap().video_frames.clone()
    }

    pub fn audio_samples(&self) -> Vec<RecordedAudioSample> {
        self.state.inner.lock().unwrap().audio_samples.clone()
    }

    pub fn session_starts(&self) -> Vec<MediaTime> {
        self.state.inner.lock().unwrap().session_starts.clone()
    }

    pub fn session_end(&self) -> Option<MediaTime> {
        self.state.inner.lock().unwrap().session_end
    }

    pub fn settings(&self) -> &ContainerSettings {
        &self.state.settings
    }

    pub fn pool_handle(&self) -> Option<Arc<PixelBufferPool>> {
        self.state.inner.lock().unwrap().pool.clone()
    }

    fn check_ready(&self, finished: bool) -> bool {
        if finished {
            return false;
        }
        let every = self.state.not_ready_every.load(Ordering::Relaxed);
        if every == 0 {
            return true;
        }
        let poll = self.state.readiness_polls.fetch_add(1, Ordering::Relaxed) + 1;
        poll % every != 0
    }
}

impl ContainerWriter for MemoryMovieWriter {
    fn add_audio_track(&mut self, settings: AudioTrackSettings) -> Result<()> {
        let mut inner = self.state.inner.lock().unwrap();
        if inner.status != WriterBackendStatus::Unknown {
            return Err(anyhow!("audio track added after writing began"));
        }
        inner.audio_track = Some(settings);
        Ok(())
    }

    fn start_writing(&mut self) -> Result<()> {
        if let Some(reason) = self.state.refuse_start.lock().unwrap().take() {
            let mut inner = self.state.inner.lock().unwrap();
            inner.status = WriterBackendStatus::Failed;
            inner.error = Some(reason.clone());
            return Err(anyhow!(reason));
        }
        let mut inner = self.state.inner.lock().unwrap();
        if inner.status != WriterBackendStatus::Unknown {
            return Err(anyhow!("writer already started"));
        }
        inner.status = WriterBackendStatus::Writing;
        if !*self.state.withhold_pool.lock().unwrap() {
            let video = &self.state.settings.video;
            inner.pool = Some(PixelBufferPool::new(
                video.width,
                video.height,
                video.pixel_format,
                self.state.pool_capacity,
            ));
        }
        Ok(())
    }

    fn start_session(&mut self, at: MediaTime) {
        self.state.inner.lock().unwrap().session_starts.push(at);
    }

    fn is_ready_for_video(&self) -> bool {
        let finished = self.state.inner.lock().unwrap().video_finished;
        self.check_ready(finished)
    }

    fn is_ready_for_audio(&self) -> bool {
        let inner = self.state.inner.lock().unwrap();
        let blocked = inner.audio_finished || inner.audio_track.is_none();
        drop(inner);
        self.check_ready(blocked)
    }

    fn append_video(&mut self, pixels: PixelBuffer, at: MediaTime) -> Result<()> {
        let mut inner = self.state.inner.lock().unwrap();
        if inner.status != WriterBackendStatus::Writing {
            return Err(anyhow!("append outside writing state"));
        }
        if inner.session_starts.is_empty() {
            return Err(anyhow!("append before session start"));
        }
        if let Some(last) = inner.last_video_pts {
            // A real muxer aborts the whole file on a non-increasing
            // timestamp; reproduce that so the filter above it is tested.
            if at.compare(&last) != std::cmp::Ordering::Greater {
                inner.status = WriterBackendStatus::Failed;
                inner.error = Some(format!(
                    "video timestamp {} not after previous {}",
                    at, last
                ));
                return Err(anyhow!("non-increasing video timestamp"));
            }
        }
        inner.last_video_pts = Some(at);
        inner.video_frames.push(RecordedVideoFrame {
            pts: at,
            byte_len: pixels.data().len(),
            luma_probe: pixels.data().first().copied().unwrap_or(0),
            had_attachments: pixels.attachments().is_some(),
        });
        Ok(())
    }

    fn append_audio(&mut self, sample: AudioSample) -> Result<()> {
        let mut inner = self.state.inner.lock().unwrap();
        if inner.status != WriterBackendStatus::Writing {
            return Err(anyhow!("append outside writing state"));
        }
        if inner.audio_track.is_none() {
            return Err(anyhow!("no audio track configured"));
        }
        inner.audio_samples.push(RecordedAudioSample {
            pts: sample.pts,
            byte_len: sample.data.len(),
        });
        Ok(())
    }

    fn mark_video_finished(&mut self) {
        self.state.inner.lock().unwrap().video_finished = true;
    }

    fn mark_audio_finished(&mut self) {
        self.state.inner.lock().unwrap().audio_finished = true;
    }

    fn end_session(&mut self, at: MediaTime) {
        self.state.inner.lock().unwrap().session_end = Some(at);
    }

    fn finish_writing(&mut self) -> Result<()> {
        let mut inner = self.state.inner.lock().unwrap();
        match inner.status {
            WriterBackendStatus::Writing => {
                inner.status = WriterBackendStatus::Completed;
                inner.pool = None;
                Ok(())
            }
            WriterBackendStatus::Failed => Err(anyhow!(
                "finish after failure: {}",
                inner.error.clone().unwrap_or_default()
            )),
            _ => Err(anyhow!("finish outside writing state")),
        }
    }

    fn cancel_writing(&mut self) {
        let mut inner = self.state.inner.lock().unwrap();
        inner.status = WriterBackendStatus::Cancelled;
        inner.pool = None;
        inner.video_frames.clear();
        inner.audio_samples.clear();
    }

    fn status(&self) -> WriterBackendStatus {
        self.state.inner.lock().unwrap().status
    }

    fn error(&self) -> Option<String> {
        self.state.inner.lock().unwrap().error.clone()
    }

    fn pixel_buffer_pool(&self) -> Option<Arc<PixelBufferPool>> {
        self.state.inner.lock().unwrap().pool.clone()
    }

    fn has_audio_track(&self) -> bool {
        self.state.inner.lock().unwrap().audio_track.is_some()
    }
}
