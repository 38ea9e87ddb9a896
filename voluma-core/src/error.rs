//! Engine error types.

use thiserror::Error;

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, VolumaError>;

/// Errors produced by the playback engine.
///
/// `Aborted` is an internal control signal (seek, shutdown, video switch) and
/// is never surfaced to the user as an error.
#[derive(Debug, Error)]
pub enum VolumaError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected end of data while reading {0}")]
    Truncated(&'static str),

    #[error("unknown {kind} version {version}")]
    FormatVersion { kind: &'static str, version: u8 },

    #[error("unexpected chunk: {0}")]
    UnexpectedChunk(&'static str),

    #[error("the first frame of the video is not a keyframe")]
    MissingKeyframe,

    #[error("AV1 decode failed: {0}")]
    Av1Decode(String),

    #[error("zstd decode failed: {0}")]
    ZstdDecode(String),

    #[error("vertex weight data is malformed: {0}")]
    VertexWeights(&'static str),

    #[error("GPU upload failed: {0}")]
    GpuUpload(String),

    #[error("contract violation: {0}")]
    ContractViolation(&'static str),

    #[error("operation aborted")]
    Aborted,
}

impl VolumaError {
    /// Whether this error is the internal abort signal.
    pub fn is_aborted(&self) -> bool {
        matches!(self, VolumaError::Aborted)
    }
}
