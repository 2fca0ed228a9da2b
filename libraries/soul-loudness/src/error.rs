//! Error types for loudness measurement

use thiserror::Error;

/// Result type for loudness operations
pub type Result<T> = std::result::Result<T, LoudnessError>;

#[derive(Error, Debug)]
pub enum LoudnessError {
    /// Sample rate too low to hold a report interval
    #[error("Invalid sample rate: {0} Hz (must be between 1000 and 768000)")]
    InvalidSampleRate(u32),

    /// Gain law limits must be non-negative and finite
    #[error("Invalid gain limit: {0} dB")]
    InvalidGainLimit(f64),

    /// A message on the meter port was not a loudness report
    #[error("Unrecognized meter message: {0}")]
    InvalidMessage(#[from] serde_json::Error),
}
