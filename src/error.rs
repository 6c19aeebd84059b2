//! Pipeline error kinds

use thiserror::Error;

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Failures the pipeline surfaces to callers.
///
/// Transient per-frame conditions (duplicate timestamps, writer briefly
/// not ready, loop-range drops, pool exhaustion) are not errors; they are
/// counted in [`crate::stats::PipelineStats`] and the frame is dropped.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("writer refused to start: {reason}")]
    StartWritingFailed { reason: String },

    #[error("pixel buffer pool unavailable (output already exists, bad buffer attributes, or pool queried before the session started)")]
    PixelBufferPoolUnavailable,

    #[error("audio track can only be activated before writing begins")]
    AudioTrackActivation,

    #[error("cannot create asset reader: {0}")]
    ReaderCreation(String),

    #[error("asset reader failed: {0}")]
    ReaderFailed(String),

    #[error("invalid writer state transition: {from} -> {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages_are_stable() {
        let error = PipelineError::StartWritingFailed {
            reason: "disk full".into(),
        };
        assert!(error.to_string().contains("disk full"));

        let transition = PipelineError::InvalidTransition {
            from: "Idle",
            to: "Finished",
        };
        assert_eq!(
            transition.to_string(),
            "invalid writer state transition: Idle -> Finished"
        );
    }

    #[test]
    fn test_backend_preserves_source() {
        let base = std::io::Error::other("device lost");
        let error = PipelineError::Backend(anyhow::Error::new(base));
        assert!(error.to_string().contains("device lost"));
    }
}
