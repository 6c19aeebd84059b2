//! Shared media data model
//!
//! The contracts every pipeline component agrees on: rational time,
//! orientation tags, lock-counted framebuffers, pooled pixel memory, and
//! the tagged sample union.

pub mod framebuffer;
pub mod orientation;
pub mod pixel;
pub mod sample;
pub mod time;

pub use framebuffer::{Framebuffer, FramebufferPool, TextureSize, TimingStyle, UserInfoValue};
pub use orientation::{Orientation, Rotation};
pub use pixel::{ColorAttachments, PixelBuffer, PixelBufferPool, PixelFormat};
pub use sample::{AudioSample, MediaKind, SampleBuffer, VideoSample};
pub use time::{MediaTime, MediaTimeRange, TimeFlags, DEFAULT_TIMESCALE};
