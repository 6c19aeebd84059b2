//! The synchronized media pipeline
//!
//! Four cooperating subsystems around the shared media contracts:
//!
//! - [`MovieInput`](input::MovieInput): decodes a stored asset on a
//!   dedicated thread and feeds the graph, paced by the wall clock or by
//!   writer readiness.
//! - [`MoviePlayer`](player::MoviePlayer): wraps a playback engine and
//!   taps pixel buffers on every display refresh.
//! - [`MovieOutput`](output::MovieOutput): converts processed frames to
//!   the writer's format and encodes them into a container.
//! - [`MovieCache`](cache::MovieCache): a time-bounded ring between the
//!   graph and the output enabling pre-roll capture.
//!
//! Sources deliver into anything implementing [`FramebufferSink`]; the
//! filter graph between sources and sinks is out of scope here, so the
//! sink seam is where it plugs in.

pub mod cache;
pub mod convert;
pub mod input;
pub mod output;
pub mod player;

use crate::media::framebuffer::Framebuffer;

/// A consumer of processed framebuffers.
///
/// The producer takes one framebuffer lock per delivery; the sink owns
/// exactly one unlock, on every path including errors and drops.
pub trait FramebufferSink: Send + Sync {
    fn new_framebuffer_available(&self, framebuffer: Framebuffer, source_index: usize);
}

pub use cache::{CacheState, MovieCache};
pub use convert::FramebufferGenerator;
pub use input::MovieInput;
pub use output::{MovieOutput, WriterState};
pub use player::{MoviePlayer, ObserverHandle, SeekingInfo};
