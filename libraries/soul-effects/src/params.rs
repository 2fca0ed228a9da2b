//! Effect parameter model
//!
//! [`EffectParameters`] is the complete user-facing state of the effect chain
//! plus a few transient fields (catalog listing, decoded impulse response,
//! last loudness reading, tier snapshot). One instance lives in the
//! [`ParameterStore`](crate::ParameterStore) of each session.

use crate::presets::ReverbPreset;
use crate::tier::{PerformanceTier, PriorSettings};
use serde::{Deserialize, Serialize};
use soul_audio::{AudioBuffer, BiquadFilterType};
use std::sync::Arc;

/// Fixed description of one equalizer band
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EqBand {
    pub frequency: f32,
    pub filter_type: BiquadFilterType,
    pub q: f32,
}

/// Equalizer bands, lowest first
pub const EQ_BANDS: [EqBand; 6] = [
    EqBand {
        frequency: 60.0,
        filter_type: BiquadFilterType::Lowshelf,
        q: 0.7,
    },
    EqBand {
        frequency: 170.0,
        filter_type: BiquadFilterType::Peaking,
        q: 1.0,
    },
    EqBand {
        frequency: 350.0,
        filter_type: BiquadFilterType::Peaking,
        q: 1.0,
    },
    EqBand {
        frequency: 1000.0,
        filter_type: BiquadFilterType::Peaking,
        q: 1.0,
    },
    EqBand {
        frequency: 3000.0,
        filter_type: BiquadFilterType::Peaking,
        q: 1.0,
    },
    EqBand {
        frequency: 8000.0,
        filter_type: BiquadFilterType::Highshelf,
        q: 0.7,
    },
];

pub const EQ_BAND_COUNT: usize = EQ_BANDS.len();

/// Convolution reverb state
#[derive(Debug, Clone, PartialEq)]
pub struct ConvolverSettings {
    pub enabled: bool,
    /// Wet share in [0, 1]
    pub mix: f64,
    pub selected_ir: Option<String>,
    /// Catalog listing from the last refresh
    pub available_irs: Vec<String>,
    /// Decoded impulse response, present once loaded
    pub impulse_buffer: Option<Arc<AudioBuffer>>,
}

impl Default for ConvolverSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            mix: 0.3,
            selected_ir: None,
            available_irs: Vec::new(),
            impulse_buffer: None,
        }
    }
}

/// Tunable values of the algorithmic reverb
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReverbParams {
    /// Comb feedback in [0, 1)
    pub decay: f64,
    /// Comb damping cutoff in Hz
    pub damping: f64,
    pub mix: f64,
    /// Seconds
    pub pre_delay: f64,
    /// Hz; 2.5 leaves the modulators at their base rates
    pub modulation_rate: f64,
    /// Seconds of delay-time swing
    pub modulation_depth: f64,
}

impl Default for ReverbParams {
    fn default() -> Self {
        Self {
            decay: 0.6,
            damping: 6000.0,
            mix: 0.2,
            pre_delay: 0.02,
            modulation_rate: 2.5,
            modulation_depth: 0.001,
        }
    }
}

/// Algorithmic reverb state
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ReverbSettings {
    pub enabled: bool,
    pub preset: ReverbPreset,
    /// Values driving the reverb right now
    pub params: ReverbParams,
    /// Last values the user tuned by hand
    pub custom: ReverbParams,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompressorParams {
    pub enabled: bool,
    pub threshold: f64,
    pub knee: f64,
    pub ratio: f64,
    pub attack: f64,
    pub release: f64,
}

impl Default for CompressorParams {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: -24.0,
            knee: 30.0,
            ratio: 12.0,
            attack: 0.003,
            release: 0.25,
        }
    }
}

/// Source position relative to the listener
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub const ORIGIN: Self = Self {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Overwrite only the axes present in `update`
    pub fn merged(self, update: PositionUpdate) -> Self {
        Self {
            x: update.x.unwrap_or(self.x),
            y: update.y.unwrap_or(self.y),
            z: update.z.unwrap_or(self.z),
        }
    }
}

/// Partial move of the source; absent axes keep their value
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PositionUpdate {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
}

impl From<Position> for PositionUpdate {
    fn from(position: Position) -> Self {
        Self {
            x: Some(position.x),
            y: Some(position.y),
            z: Some(position.z),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpatialSettings {
    pub enabled: bool,
    pub position: Position,
    pub automation_enabled: bool,
    /// Orbit angular rate in radians per second
    pub automation_rate: f64,
}

impl Default for SpatialSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            position: Position::ORIGIN,
            automation_enabled: false,
            automation_rate: 0.1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WidenerParams {
    pub enabled: bool,
    /// Wet share in [0, 1]
    pub amount: f64,
}

impl Default for WidenerParams {
    fn default() -> Self {
        Self {
            enabled: false,
            amount: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoudnessParams {
    pub enabled: bool,
    pub target_lufs: f64,
    /// Last meter reading; written by the meter feedback only
    pub momentary_lufs: f64,
}

impl Default for LoudnessParams {
    fn default() -> Self {
        Self {
            enabled: false,
            target_lufs: soul_loudness::DEFAULT_TARGET_LUFS,
            momentary_lufs: soul_loudness::SILENCE_LUFS,
        }
    }
}

/// Every parameter of the effect chain
#[derive(Debug, Clone, PartialEq)]
pub struct EffectParameters {
    /// Band gains in dB, index-aligned with [`EQ_BANDS`]
    pub eq_gains: Vec<f64>,
    pub convolver: ConvolverSettings,
    pub reverb: ReverbSettings,
    pub compressor: CompressorParams,
    pub spatial: SpatialSettings,
    pub widener: WidenerParams,
    pub loudness: LoudnessParams,
    pub tier: PerformanceTier,
    /// Values stashed when leaving the high tier
    pub prior: Option<PriorSettings>,
}

impl Default for EffectParameters {
    fn default() -> Self {
        Self {
            eq_gains: vec![0.0; EQ_BAND_COUNT],
            convolver: ConvolverSettings::default(),
            reverb: ReverbSettings::default(),
            compressor: CompressorParams::default(),
            spatial: SpatialSettings::default(),
            widener: WidenerParams::default(),
            loudness: LoudnessParams::default(),
            tier: PerformanceTier::default(),
            prior: None,
        }
    }
}

impl EffectParameters {
    /// Replace the band gains, truncating or zero-padding to the band count
    pub fn set_eq_gains(&mut self, gains: &[f64]) {
        self.eq_gains = gains
            .iter()
            .copied()
            .chain(std::iter::repeat(0.0))
            .take(EQ_BAND_COUNT)
            .collect();
    }

    /// Edit a reverb value as the user
    ///
    /// In the high tier the edit also lands in the custom snapshot and the
    /// preset becomes `Custom`.
    pub fn edit_reverb(&mut self, edit: impl Fn(&mut ReverbParams)) {
        if self.tier == PerformanceTier::High {
            self.reverb.preset = ReverbPreset::Custom;
            edit(&mut self.reverb.custom);
        }
        edit(&mut self.reverb.params);
    }
}
