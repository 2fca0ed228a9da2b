//! Momentary loudness measurement and normalization for Soul Player
//!
//! This crate provides:
//! - A streaming momentary loudness meter (K-weighting, 400 ms sliding
//!   window, a report every 100 ms) cheap enough to run per sample on the
//!   render thread
//! - The report message the meter posts to the control side
//! - The gain law that turns a loudness reading into a compensation gain
//!
//! # Architecture
//!
//! ```text
//! Render thread                          Control side
//! ┌─────────────┐    ┌───────────────┐   ┌──────────────┐    ┌────────────┐
//! │ Audio frame │ ─► │ K-weighting + │ ─►│ MeterMessage │ ─► │  GainLaw   │
//! └─────────────┘    │ sliding window│   └──────────────┘    └────────────┘
//!                    └───────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use soul_loudness::{GainLaw, MomentaryLoudnessMeter};
//!
//! let mut meter = MomentaryLoudnessMeter::new(48000)?;
//! let mut latest = None;
//! for n in 0..48000 {
//!     let s = (n as f32 * 0.05).sin() * 0.5;
//!     if let Some(lufs) = meter.push_frame(&[s, s]) {
//!         latest = Some(lufs);
//!     }
//! }
//!
//! let gain = GainLaw::default().gain(-14.0, latest.unwrap_or(-70.0));
//! assert!(gain > 0.0);
//! # Ok::<(), soul_loudness::LoudnessError>(())
//! ```

#![deny(unsafe_code)]

mod error;
mod gain;
mod kweighting;
mod message;
mod meter;

pub use error::{LoudnessError, Result};
pub use gain::{normalization_gain, GainLaw};
pub use kweighting::KWeighting;
pub use message::MeterMessage;
pub use meter::MomentaryLoudnessMeter;

/// Offset applied when converting K-weighted mean square to LUFS
pub const CALIBRATION_OFFSET_DB: f64 = 0.691;

/// Length of the momentary measurement window
pub const WINDOW_SECONDS: f64 = 0.4;

/// Time between two reports
pub const REPORT_INTERVAL_SECONDS: f64 = 0.1;

/// Default normalization target, common for streaming platforms
pub const DEFAULT_TARGET_LUFS: f64 = -14.0;

/// Reading assumed before the first report arrives
pub const SILENCE_LUFS: f64 = -70.0;

/// Largest boost the gain law applies
pub const DEFAULT_MAX_BOOST_DB: f64 = 6.0;

/// Largest cut the gain law applies
pub const DEFAULT_MAX_CUT_DB: f64 = 12.0;
