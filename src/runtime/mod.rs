//! Execution contexts and synchronization primitives
//!
//! The pipeline runs across four kinds of contexts: the caller's control
//! thread, the shared image-processing queue, per-writer serial queues,
//! and dedicated reader threads. This module provides the queue type, the
//! stop signal and back-pressure gate those threads coordinate with, and
//! the session context that ties them together.

pub mod context;
pub mod gate;
pub mod queue;
pub mod stop;

pub use context::PipelineContext;
pub use gate::ReadinessGate;
pub use queue::SerialQueue;
pub use stop::StopSignal;
