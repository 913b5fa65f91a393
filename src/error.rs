//! Error types for screencast

use crate::types::StreamKind;
use thiserror::Error;

/// Result type alias for screencast operations
pub type Result<T> = std::result::Result<T, Error>;

/// screencast error type
#[derive(Error, Debug)]
pub enum Error {
    // Codec engine errors
    #[error("Engine configuration error: {0}")]
    EngineConfig(String),

    #[error("Engine state error: {0}")]
    EngineState(String),

    #[error("Codec protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Engine input stalled: {0}")]
    InputStalled(String),

    // Muxer errors
    #[error("Track already registered for {0} stream")]
    DuplicateTrack(StreamKind),

    #[error("Muxer not started")]
    NotStarted,

    #[error("Timestamp regression on {kind} track: {timestamp_us}us after {previous_us}us")]
    TimestampRegression {
        kind: StreamKind,
        timestamp_us: i64,
        previous_us: i64,
    },

    #[error("Streams still running: {0}")]
    StreamsIncomplete(String),

    #[error("Container error: {0}")]
    Container(String),

    // Session errors
    #[error("Insufficient storage: {available_mib} MiB available, {required_mib} MiB required")]
    InsufficientStorage { available_mib: u64, required_mib: u64 },

    #[error("A recording session is already active")]
    AlreadyRecording,

    #[error("No recording session is active")]
    NotRecording,

    #[error("Recording failed: {0}")]
    RecordingFailed(String),

    #[error("Timed out draining {0} stream")]
    DrainTimeout(StreamKind),

    #[error("Worker aborted")]
    Aborted,

    // Capture errors
    #[error("Capture error: {0}")]
    Capture(String),

    #[error("Audio capture error: {0}")]
    AudioCapture(String),

    #[cfg(feature = "pipewire")]
    #[error("PipeWire error: {0}")]
    PipeWire(String),

    #[cfg(feature = "ffmpeg")]
    #[error("FFmpeg error: {0}")]
    Ffmpeg(String),

    // General errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error is handled in place by the stage that hit it
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::NotStarted | Error::TimestampRegression { .. } | Error::InputStalled(_)
        )
    }

    /// Check if this error means a codec broke its contract
    pub fn is_engine_fault(&self) -> bool {
        matches!(self, Error::EngineState(_) | Error::ProtocolViolation(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(Error::NotStarted.is_recoverable());
        assert!(Error::TimestampRegression {
            kind: StreamKind::Audio,
            timestamp_us: 10,
            previous_us: 20,
        }
        .is_recoverable());
        assert!(!Error::AlreadyRecording.is_recoverable());
        assert!(!Error::ProtocolViolation("format changed twice".into()).is_recoverable());
    }

    #[test]
    fn test_storage_message() {
        let err = Error::InsufficientStorage {
            available_mib: 42,
            required_mib: 100,
        };
        assert_eq!(
            err.to_string(),
            "Insufficient storage: 42 MiB available, 100 MiB required"
        );
    }
}
