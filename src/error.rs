use std::time::Duration;

use thiserror::Error;

/// Errors raised by the device layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The device id does not exist or cannot run at the requested format.
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("device already stopped")]
    AlreadyStopped,

    #[error("device already started")]
    AlreadyStarted,

    /// The device went away or could not be recovered after an xrun.
    #[error("device fault: {0}")]
    Fault(String),
}

/// Ring buffer errors. Only the blocking policy can fail.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("ring buffer push timed out after {0:?}")]
    BufferTimeout(Duration),

    #[error("ring buffer consumer disconnected")]
    Disconnected,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("link closed: {0}")]
    Closed(String),

    #[error("receive timed out")]
    Timeout,

    #[error("malformed wire frame: {0}")]
    Malformed(String),

    /// Reconnect attempts exhausted the configured ceiling.
    #[error("transport fatal after {attempts} failed attempts: {last_error}")]
    TransportFatal { attempts: u32, last_error: String },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("stage `{stage}` took {elapsed:?}, frame period is {period:?}")]
    PipelineStageTimeout {
        stage: &'static str,
        elapsed: Duration,
        period: Duration,
    },

    #[error("codec error: {0}")]
    Codec(String),

    #[error("resampler error: {0}")]
    Resample(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("failed to parse `{0}` from build-time config")]
    Parse(&'static str),
}

/// Errors surfaced to the host by the session controller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("session already stopped")]
    AlreadyStopped,

    #[error("cannot {op} while session is {state}")]
    InvalidState { op: &'static str, state: String },

    #[error("session failed: {0}")]
    Failed(String),
}
