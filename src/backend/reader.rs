//! Asset decoder abstraction
//!
//! The host platform supplies the actual demuxer/decoder. The pipeline
//! only needs a reader it can drive one sample at a time per track, plus a
//! source that can mint fresh readers for loop restarts and trims.

use crate::error::PipelineResult;
use crate::media::sample::{MediaKind, SampleBuffer};
use crate::media::time::MediaTime;

/// Lifecycle of one reading pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderStatus {
    /// Constructed, `start_reading` not yet called.
    Idle,
    Reading,
    /// Every track is exhausted.
    Completed,
    Failed,
    Cancelled,
}

/// The time span a reader covers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReadRange {
    pub start: MediaTime,
    /// `None` reads to the end of the asset.
    pub duration: Option<MediaTime>,
}

impl ReadRange {
    pub fn from_start(start: MediaTime) -> Self {
        Self {
            start,
            duration: None,
        }
    }

    pub fn trimmed(start: MediaTime, duration: MediaTime) -> Self {
        Self {
            start,
            duration: Some(duration),
        }
    }
}

/// One pass over an asset's tracks.
///
/// `copy_next_sample` blocks until a sample is decoded and returns `None`
/// at end of track (or after a failure or cancellation; consult `status`
/// to tell which).
pub trait AssetReader: Send {
    fn start_reading(&mut self) -> PipelineResult<()>;

    fn copy_next_sample(&mut self, kind: MediaKind) -> Option<SampleBuffer>;

    fn cancel_reading(&mut self);

    fn status(&self) -> ReaderStatus;

    /// Failure description once `status` is `Failed`.
    fn error(&self) -> Option<String>;

    fn has_track(&self, kind: MediaKind) -> bool;
}

/// A stored asset that can be opened for reading any number of times.
///
/// Looping re-creates the reader from the range start, so sources must be
/// shareable and cheap to reopen.
pub trait AssetSource: Send + Sync {
    fn duration(&self) -> MediaTime;

    fn make_reader(&self, range: ReadRange) -> PipelineResult<Box<dyn AssetReader>>;
}
