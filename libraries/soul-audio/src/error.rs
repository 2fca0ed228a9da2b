/// Audio-specific errors
use thiserror::Error;

/// Result type alias using `AudioError`
pub type Result<T> = std::result::Result<T, AudioError>;

/// Audio error types
#[derive(Error, Debug)]
pub enum AudioError {
    /// No usable audio backend (device missing, unsupported configuration)
    #[error("Audio backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Operation not valid in the current state (e.g. starting a source twice)
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The processing context has been closed
    #[error("Audio context is closed")]
    ContextClosed,

    /// No worklet processor registered under this name
    #[error("Unknown worklet processor: {0}")]
    UnknownProcessor(String),

    /// A worklet module failed to load
    #[error("Failed to load worklet module '{module}': {reason}")]
    ModuleLoad { module: String, reason: String },

    /// Decoding error
    #[error("Decode error: {0}")]
    DecodeError(String),

    /// Invalid audio buffer
    #[error("Invalid audio buffer: {0}")]
    InvalidBuffer(String),

    /// Resampling error
    #[error("Resampling error: {0}")]
    Resample(String),

    /// Output device error
    #[error("Device error: {0}")]
    Device(String),

    /// I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
