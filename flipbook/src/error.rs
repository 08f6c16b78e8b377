use thiserror::Error;

/// Result type for playback operations
pub type Result<T> = std::result::Result<T, FlipbookError>;

/// Errors that can occur in the playback engine. Background decode failures
/// are absorbed by the cache (logged and counted, slot left empty); the
/// variants here are the ones callers can actually observe.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FlipbookError {
    /// The source violates the frame-source contract. Construction fails
    /// fast on this; nothing else in the engine does.
    #[error("Invalid frame source: {0}")]
    InvalidFrameSource(String),

    #[error("Frame index {index} out of range (frame count {frame_count})")]
    IndexOutOfRange { index: u64, frame_count: u64 },

    #[error("Failed to decode frame {index}: {reason}")]
    DecodeFailed { index: u64, reason: String },
}
