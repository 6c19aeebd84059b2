//! Container writer abstraction
//!
//! The host platform supplies the muxer/encoder. The pipeline drives it
//! through this trait: track setup, a write session anchored at the first
//! video timestamp, per-input readiness, and finalization. Backend errors
//! are surfaced as `anyhow` values so a host wrapper can nest its native
//! error unchanged.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::media::pixel::{PixelBuffer, PixelBufferPool, PixelFormat};
use crate::media::sample::AudioSample;
use crate::media::time::MediaTime;

/// Video compression the container should apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    H264,
    Hevc,
}

/// Audio compression the container should apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    Aac,
    LinearPcm,
}

/// Settings for the container's video track.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoTrackSettings {
    pub width: u32,
    pub height: u32,
    pub codec: VideoCodec,
    /// Pixel format the writer ingests; the pool allocates this.
    pub pixel_format: PixelFormat,
}

impl VideoTrackSettings {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            codec: VideoCodec::H264,
            pixel_format: PixelFormat::Bgra32,
        }
    }
}

/// Settings for the container's audio track.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioTrackSettings {
    pub sample_rate: u32,
    pub channels: u16,
    pub codec: AudioCodec,
}

impl Default for AudioTrackSettings {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            channels: 2,
            codec: AudioCodec::Aac,
        }
    }
}

/// Where and how the container is produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSettings {
    pub url: PathBuf,
    pub video: VideoTrackSettings,
    pub optimize_for_network_use: bool,
    /// Movie fragment spacing; containers that do not fragment ignore it.
    pub fragment_interval: Duration,
}

impl ContainerSettings {
    pub fn new(url: impl Into<PathBuf>, video: VideoTrackSettings) -> Self {
        Self {
            url: url.into(),
            video,
            optimize_for_network_use: false,
            fragment_interval: Duration::from_secs(1),
        }
    }
}

/// Lifecycle reported by the writer backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriterBackendStatus {
    #[default]
    Unknown,
    Writing,
    Completed,
    Failed,
    Cancelled,
}

/// One container being written.
///
/// Contract highlights:
/// - `start_session` is called exactly once per recording, with the first
///   video frame's timestamp; the backend edits out media before it.
/// - Appends with non-increasing video timestamps abort the backend; the
///   pipeline filters them beforehand.
/// - `is_ready_for_*` is the per-input readiness flag the encoder-waiting
///   policy polls.
/// - `finish_writing` blocks until the container is complete.
pub trait ContainerWriter: Send {
    fn add_audio_track(&mut self, settings: AudioTrackSettings) -> Result<()>;

    fn start_writing(&mut self) -> Result<()>;

    fn start_session(&mut self, at: MediaTime);

    fn is_ready_for_video(&self) -> bool;

    fn is_ready_for_audio(&self) -> bool;

    fn append_video(&mut self, pixels: PixelBuffer, at: MediaTime) -> Result<()>;

    fn append_audio(&mut self, sample: AudioSample) -> Result<()>;

    fn mark_video_finished(&mut self);

    fn mark_audio_finished(&mut self);

    fn end_session(&mut self, at: MediaTime);

    fn finish_writing(&mut self) -> Result<()>;

    fn cancel_writing(&mut self);

    fn status(&self) -> WriterBackendStatus;

    /// Failure description once `status` is `Failed`.
    fn error(&self) -> Option<String>;

    /// The adaptor's pixel-buffer pool. `None` until `start_writing`
    /// succeeds, and also when the output could not be prepared (file
    /// already exists, rejected attributes).
    fn pixel_buffer_pool(&self) -> Option<Arc<PixelBufferPool>>;

    fn has_audio_track(&self) -> bool;
}
