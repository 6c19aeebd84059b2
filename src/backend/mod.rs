//! Host-platform collaborator seams
//!
//! The pipeline never talks to a decoder, muxer, playback engine, or vsync
//! source directly; it drives the traits in this module. `memory` and
//! `sim` provide self-contained implementations for hosts without native
//! media FFI and for the test suite.

pub mod engine;
pub mod link;
pub mod memory;
pub mod reader;
pub mod sim;
pub mod writer;

pub use engine::{
    EndAction, EngineStatus, ItemId, ItemStatus, PlaybackEngine, PlayerEvent, PlayerItem,
    VideoTap,
};
pub use link::{DisplayLink, IntervalDisplayLink};
pub use memory::{MemoryAsset, MemoryAudioTrack, MemoryMovieWriter};
pub use reader::{AssetReader, AssetSource, ReadRange, ReaderStatus};
pub use sim::{SimEngineHandle, SimPlaybackEngine};
pub use writer::{
    AudioTrackSettings, ContainerSettings, ContainerWriter, VideoTrackSettings,
    WriterBackendStatus,
};
