//! reelflow: a synchronized media pipeline
//!
//! Decoded or tapped frames flow in one direction per session:
//!
//! ```text
//!  [Asset Decoder] ───► MovieInput ──►┐
//!  [Playback Engine] ─► MoviePlayer ──┤─► graph ─► MovieCache ─► MovieOutput ─► [Writer]
//!                                     │                      ▲
//!  [Audio Source] ────────────────────┴──────────────────────┘
//! ```
//!
//! The crate separates concerns between:
//! - Media contracts: rational time, lock-counted framebuffers, pooled
//!   pixel memory, tagged samples (`media`)
//! - Execution contexts: serial queues, stop signals, the back-pressure
//!   gate, the session context (`runtime`)
//! - Host collaborators: decoder, container writer, playback engine, and
//!   display-refresh seams with in-memory implementations (`backend`)
//! - The pipeline itself: input, player, output, cache, and the YUV/RGB
//!   converter (`movie`)
//!
//! Frame drops under back-pressure are accounted, not raised (`stats`);
//! real failures surface as typed errors (`error`).

pub mod backend;
pub mod config;
pub mod error;
pub mod media;
pub mod movie;
pub mod runtime;
pub mod stats;

pub use config::{
    CacheOptions, InputOptions, LoopDiscipline, PlayerOptions, RecordingOptions, SchedulingHint,
};
pub use error::{PipelineError, PipelineResult};
pub use media::{
    AudioSample, Framebuffer, FramebufferPool, MediaKind, MediaTime, MediaTimeRange, Orientation,
    PixelBuffer, PixelBufferPool, PixelFormat, SampleBuffer, TextureSize, TimingStyle, VideoSample,
};
pub use movie::{
    FramebufferGenerator, FramebufferSink, MovieCache, MovieInput, MovieOutput, MoviePlayer,
    SeekingInfo, WriterState,
};
pub use runtime::{PipelineContext, ReadinessGate, SerialQueue, StopSignal};
pub use stats::{DropReason, PipelineStats, StatsSummary};
