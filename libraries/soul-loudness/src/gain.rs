//! Loudness compensation gain law
//!
//! The correction toward the target is clamped asymmetrically: large cuts are
//! allowed, large boosts are not, which keeps quiet passages from pumping up
//! the noise floor.

use crate::error::{LoudnessError, Result};
use crate::{DEFAULT_MAX_BOOST_DB, DEFAULT_MAX_CUT_DB};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainLaw {
    max_boost_db: f64,
    max_cut_db: f64,
}

impl Default for GainLaw {
    fn default() -> Self {
        Self {
            max_boost_db: DEFAULT_MAX_BOOST_DB,
            max_cut_db: DEFAULT_MAX_CUT_DB,
        }
    }
}

impl GainLaw {
    /// Limits are magnitudes in dB
    pub fn new(max_boost_db: f64, max_cut_db: f64) -> Result<Self> {
        for limit in [max_boost_db, max_cut_db] {
            if !limit.is_finite() || limit < 0.0 {
                return Err(LoudnessError::InvalidGainLimit(limit));
            }
        }
        Ok(Self {
            max_boost_db,
            max_cut_db,
        })
    }

    pub fn max_boost_db(&self) -> f64 {
        self.max_boost_db
    }

    pub fn max_cut_db(&self) -> f64 {
        self.max_cut_db
    }

    /// Clamped correction in dB
    pub fn correction_db(&self, target_lufs: f64, momentary_lufs: f64) -> f64 {
        let error = target_lufs - momentary_lufs;
        if error.is_nan() {
            return 0.0;
        }
        error.clamp(-self.max_cut_db, self.max_boost_db)
    }

    /// Linear gain multiplier
    pub fn gain(&self, target_lufs: f64, momentary_lufs: f64) -> f64 {
        10.0_f64.powf(self.correction_db(target_lufs, momentary_lufs) / 20.0)
    }
}

/// One-shot form of [`GainLaw::gain`]
///
/// Negative limits are treated as zero.
pub fn normalization_gain(
    target_lufs: f64,
    momentary_lufs: f64,
    max_boost_db: f64,
    max_cut_db: f64,
) -> f64 {
    GainLaw {
        max_boost_db: max_boost_db.max(0.0),
        max_cut_db: max_cut_db.max(0.0),
    }
    .gain(target_lufs, momentary_lufs)
}
