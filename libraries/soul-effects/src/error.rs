//! Error types for the effects engine.

use soul_audio::AudioError;
use soul_loudness::LoudnessError;
use thiserror::Error;

/// Errors raised by the effects session and its collaborators.
#[derive(Error, Debug)]
pub enum EffectsError {
    /// Render graph failure; `BackendUnavailable` is fatal to the session
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Loudness error: {0}")]
    Loudness(#[from] LoudnessError),

    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP request to the impulse response catalog failed
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Catalog answered with a non-success status
    #[error("Catalog error ({status}): {message}")]
    Catalog { status: u16, message: String },

    #[error("Invalid catalog URL: {0}")]
    InvalidUrl(String),

    /// Impulse response id that the catalog cannot serve
    #[error("Unknown impulse response: {0}")]
    UnknownImpulseResponse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Background task panicked or was cancelled
    #[error("Task failed: {0}")]
    Task(String),
}

impl From<url::ParseError> for EffectsError {
    fn from(e: url::ParseError) -> Self {
        Self::InvalidUrl(e.to_string())
    }
}

/// Result type for effects operations.
pub type Result<T> = std::result::Result<T, EffectsError>;
