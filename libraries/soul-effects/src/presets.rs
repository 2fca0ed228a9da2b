//! Algorithmic reverb presets

use crate::params::{EffectParameters, ReverbParams};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, warn};

/// Reverb preset identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReverbPreset {
    Room,
    #[default]
    Hall,
    Plate,
    Space,
    Studio,
    /// The user's own values, kept in the custom snapshot
    Custom,
}

impl ReverbPreset {
    pub const ALL: [Self; 6] = [
        Self::Room,
        Self::Hall,
        Self::Plate,
        Self::Space,
        Self::Studio,
        Self::Custom,
    ];

    pub fn id(self) -> &'static str {
        match self {
            Self::Room => "room",
            Self::Hall => "hall",
            Self::Plate => "plate",
            Self::Space => "space",
            Self::Studio => "studio",
            Self::Custom => "custom",
        }
    }

    /// Fixed values of a built-in preset; `None` for `Custom`
    pub fn builtin(self) -> Option<ReverbParams> {
        let params = match self {
            Self::Room => ReverbParams {
                decay: 0.42,
                damping: 9000.0,
                mix: 0.16,
                pre_delay: 0.008,
                modulation_rate: 0.4,
                modulation_depth: 0.00008,
            },
            Self::Hall => ReverbParams {
                decay: 0.62,
                damping: 6000.0,
                mix: 0.26,
                pre_delay: 0.018,
                modulation_rate: 0.5,
                modulation_depth: 0.0001,
            },
            Self::Plate => ReverbParams {
                decay: 0.72,
                damping: 11500.0,
                mix: 0.20,
                pre_delay: 0.008,
                modulation_rate: 0.6,
                modulation_depth: 0.00009,
            },
            Self::Space => ReverbParams {
                decay: 0.85,
                damping: 3800.0,
                mix: 0.32,
                pre_delay: 0.045,
                modulation_rate: 0.7,
                modulation_depth: 0.00012,
            },
            Self::Studio => ReverbParams {
                decay: 0.52,
                damping: 7500.0,
                mix: 0.14,
                pre_delay: 0.012,
                modulation_rate: 0.3,
                modulation_depth: 0.00006,
            },
            Self::Custom => return None,
        };
        Some(params)
    }

    /// Values this preset stands for, given the custom snapshot
    pub fn params(self, custom: &ReverbParams) -> ReverbParams {
        self.builtin().unwrap_or(*custom)
    }

    /// Parse an identifier, falling back to `Hall` for unknown ones
    pub fn from_id_or_hall(id: &str) -> Self {
        id.parse().unwrap_or_else(|_| {
            warn!(preset = id, "Unrecognized reverb preset, falling back to hall");
            Self::Hall
        })
    }
}

impl fmt::Display for ReverbPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Identifier that names no preset
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown reverb preset '{0}'")]
pub struct UnknownPreset(pub String);

impl FromStr for ReverbPreset {
    type Err = UnknownPreset;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|preset| preset.id() == s)
            .ok_or_else(|| UnknownPreset(s.to_string()))
    }
}

/// Select a preset and load its values into the live reverb parameters
///
/// The custom snapshot is read for `Custom` and never written.
pub fn apply_reverb_preset(params: &mut EffectParameters, preset: ReverbPreset) {
    params.reverb.preset = preset;
    params.reverb.params = preset.params(&params.reverb.custom);
    debug!(preset = %preset, "Reverb preset applied");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hall_literal_values() {
        let hall = ReverbPreset::Hall.builtin().unwrap();
        assert_eq!(hall.decay, 0.62);
        assert_eq!(hall.damping, 6000.0);
        assert_eq!(hall.mix, 0.26);
        assert_eq!(hall.pre_delay, 0.018);
        assert_eq!(hall.modulation_rate, 0.5);
        assert_eq!(hall.modulation_depth, 0.0001);
    }

    #[test]
    fn test_id_round_trip() {
        for preset in ReverbPreset::ALL {
            assert_eq!(preset.id().parse::<ReverbPreset>(), Ok(preset));
        }
    }

    #[test]
    fn test_unknown_id_error_message() {
        let err = "cathedral".parse::<ReverbPreset>().unwrap_err();
        assert_eq!(err, UnknownPreset("cathedral".to_string()));
        assert_eq!(err.to_string(), "unknown reverb preset 'cathedral'");
        let _: Box<dyn std::error::Error + Send + Sync> = Box::new(err);
    }

    #[test]
    fn test_unknown_id_falls_back_to_hall() {
        assert!("cathedral".parse::<ReverbPreset>().is_err());
        assert_eq!(ReverbPreset::from_id_or_hall("cathedral"), ReverbPreset::Hall);
        assert_eq!(ReverbPreset::from_id_or_hall("plate"), ReverbPreset::Plate);
    }

    #[test]
    fn test_custom_uses_snapshot() {
        let mut params = EffectParameters::default();
        params.reverb.custom.decay = 0.33;

        apply_reverb_preset(&mut params, ReverbPreset::Custom);
        assert_eq!(params.reverb.params.decay, 0.33);

        apply_reverb_preset(&mut params, ReverbPreset::Space);
        assert_eq!(params.reverb.params, ReverbPreset::Space.builtin().unwrap());
        assert_eq!(params.reverb.custom.decay, 0.33);
    }
}
