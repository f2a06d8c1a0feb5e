use std::time::Duration;
use thiserror::Error;

/// Fatal to the motion monitor instance; the host decides whether to restart.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SensorFailure {
    #[error("Sensor unavailable: {0}")]
    Unavailable(String),

    #[error("Motion sensor permission denied")]
    PermissionDenied,

    #[error("Sensor stream stalled for {0:?}")]
    StreamStalled(Duration),

    #[error("Sensor stream ended: {0}")]
    StreamEnded(String),
}

/// Failures of the audio verification window. Each one aborts the current cycle only.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Microphone permission denied")]
    PermissionDenied,

    #[error("Microphone unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Feature extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("Capture exceeded its window ({0:?})")]
    TimedOut(Duration),
}

/// Failures of the risk fusion call. A timeout is never read as "no emergency".
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("Risk evaluation timed out")]
    Timeout,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Server error: {message}")]
    ServerError { status: Option<u16>, message: String },
}

/// Errors surfaced by the host and coordinator handles
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MonitorError {
    #[error("Service already running")]
    AlreadyRunning,

    #[error("Service not running")]
    NotRunning,

    #[error("A detection cycle is already active")]
    CycleActive,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Sensor(#[from] SensorFailure),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for host and handle operations
pub type MonitorResult<T> = Result<T, MonitorError>;
