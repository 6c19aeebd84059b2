//! Sample buffers: timed video and audio payloads
//!
//! The decoder side of the pipeline produces opaque samples; instead of
//! downcasting at each hand-off, samples are a tagged union dispatched on
//! media kind. Ownership moves into the pipeline with the sample; a
//! per-call flag decides whether the payload is invalidated once appended.

use bytes::Bytes;
use std::fmt;

use super::pixel::PixelBuffer;
use super::time::MediaTime;

/// Kind of media a sample carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Video => write!(f, "video"),
            MediaKind::Audio => write!(f, "audio"),
        }
    }
}

/// One decoded video frame with its presentation time.
#[derive(Debug)]
pub struct VideoSample {
    pub pixels: PixelBuffer,
    pub pts: MediaTime,
}

impl VideoSample {
    pub fn new(pixels: PixelBuffer, pts: MediaTime) -> Self {
        Self { pixels, pts }
    }

    /// Drop the pixel payload now (pooled storage goes straight back).
    pub fn invalidate(&mut self) {
        self.pixels.invalidate();
    }
}

/// A run of decoded audio with its presentation time.
#[derive(Debug, Clone)]
pub struct AudioSample {
    pub data: Bytes,
    pub pts: MediaTime,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioSample {
    pub fn new(data: Bytes, pts: MediaTime, sample_rate: u32, channels: u16) -> Self {
        Self {
            data,
            pts,
            sample_rate,
            channels,
        }
    }

    pub fn invalidate(&mut self) {
        self.data = Bytes::new();
    }
}

/// Tagged sample union handed between reader, cache, and writer.
#[derive(Debug)]
pub enum SampleBuffer {
    Video(VideoSample),
    Audio(AudioSample),
}

impl SampleBuffer {
    pub fn kind(&self) -> MediaKind {
        match self {
            SampleBuffer::Video(_) => MediaKind::Video,
            SampleBuffer::Audio(_) => MediaKind::Audio,
        }
    }

    pub fn pts(&self) -> MediaTime {
        match self {
            SampleBuffer::Video(sample) => sample.pts,
            SampleBuffer::Audio(sample) => sample.pts,
        }
    }

    pub fn invalidate(&mut self) {
        match self {
            SampleBuffer::Video(sample) => sample.invalidate(),
            SampleBuffer::Audio(sample) => sample.invalidate(),
        }
    }
}
