//! Error types for nano-batch.

use std::fmt;

use thiserror::Error;

/// Result type alias for nano-batch operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for nano-batch.
#[derive(Error, Debug)]
pub enum Error {
    /// Enqueue after the scheduler was stopped.
    #[error("scheduler stopped")]
    SchedulerStopped,

    /// Not enough free (or evictable) KV cache blocks.
    #[error("KV cache exhausted: requested {requested} blocks, {available} available")]
    CacheExhausted { requested: usize, available: usize },

    /// No forward progress is possible for a stream.
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// An operation was attempted on a stream in a state that forbids it.
    #[error("stream {stream_id}: cannot {operation} in state {state}")]
    InvalidState {
        stream_id: u64,
        state: &'static str,
        operation: &'static str,
    },

    /// Invalid stream state transition.
    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition {
        from: &'static str,
        to: &'static str,
    },

    /// The compute collaborator failed for the whole round.
    #[error("compute error: {0}")]
    Compute(String),

    /// The engine shut down before the stream finished.
    #[error("engine stopped")]
    EngineStopped,

    /// Block accounting no longer adds up. Unrecoverable.
    #[error("KV cache corrupted: {0}")]
    CacheCorrupted(String),

    /// A stream asked for a LoRA adapter that is not loaded.
    #[error("LoRA adapter {0} not found")]
    AdapterNotFound(u64),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the engine loop must terminate on this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::CacheCorrupted(_))
    }

    /// Classify this error for reporting on a stream.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::SchedulerStopped => ErrorCode::SchedulerStopped,
            Self::CacheExhausted { .. } => ErrorCode::CacheExhausted,
            Self::ResourceUnavailable(_) => ErrorCode::ResourceUnavailable,
            Self::InvalidState { .. } | Self::InvalidStateTransition { .. } => {
                ErrorCode::InvalidState
            }
            Self::Compute(_) | Self::Tensor(_) => ErrorCode::Compute,
            Self::EngineStopped => ErrorCode::EngineStopped,
            Self::CacheCorrupted(_) => ErrorCode::CacheCorrupted,
            Self::AdapterNotFound(_) => ErrorCode::AdapterNotFound,
            Self::Config(_) | Self::Io(_) | Self::Json(_) => ErrorCode::Internal,
        }
    }
}

/// Error class recorded on an errored stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    SchedulerStopped,
    CacheExhausted,
    ResourceUnavailable,
    InvalidState,
    Compute,
    EngineStopped,
    CacheCorrupted,
    AdapterNotFound,
    Internal,
}

impl ErrorCode {
    /// Get the code name as a static string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SchedulerStopped => "SchedulerStopped",
            Self::CacheExhausted => "CacheExhausted",
            Self::ResourceUnavailable => "ResourceUnavailable",
            Self::InvalidState => "InvalidState",
            Self::Compute => "ComputeError",
            Self::EngineStopped => "EngineStopped",
            Self::CacheCorrupted => "CacheCorrupted",
            Self::AdapterNotFound => "AdapterNotFound",
            Self::Internal => "Internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal error observed by a caller through
/// [`StreamHandle::wait_finish`](crate::core::stream::Stream::wait_finish).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct StreamError {
    /// Error class.
    pub code: ErrorCode,
    /// Human-readable detail.
    pub message: String,
}

impl StreamError {
    /// Create a stream error.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<&Error> for StreamError {
    fn from(err: &Error) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

impl From<Error> for StreamError {
    fn from(err: Error) -> Self {
        Self::from(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_corruption_is_fatal() {
        assert!(Error::CacheCorrupted("x".into()).is_fatal());
        assert!(!Error::Compute("x".into()).is_fatal());
        assert!(!Error::CacheExhausted {
            requested: 2,
            available: 1
        }
        .is_fatal());
        assert!(!Error::EngineStopped.is_fatal());
    }

    #[test]
    fn test_stream_error_from_error() {
        let err = StreamError::from(Error::Compute("device lost".into()));
        assert_eq!(err.code, ErrorCode::Compute);
        assert_eq!(err.message, "compute error: device lost");
        assert_eq!(err.to_string(), "ComputeError: compute error: device lost");
    }
}
