//! Performance tiers
//!
//! Lower tiers force heavy effects off (or onto lighter settings) so the
//! chain fits a tighter CPU budget. Leaving the high tier stashes the user's
//! choices in a [`PriorSettings`] snapshot; returning restores them.
//!
//! A tier never writes the reverb preset id or the custom reverb snapshot.

use crate::params::{CompressorParams, EffectParameters, ReverbParams, ReverbSettings};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceTier {
    Low,
    Balanced,
    #[default]
    High,
}

/// User choices saved when leaving the high tier
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriorSettings {
    pub convolver_enabled: bool,
    pub spatial_enabled: bool,
    pub loudness_enabled: bool,
    pub automation_enabled: bool,
    pub reverb: ReverbSettings,
    pub compressor: CompressorParams,
}

impl PriorSettings {
    fn capture(params: &EffectParameters) -> Self {
        Self {
            convolver_enabled: params.convolver.enabled,
            spatial_enabled: params.spatial.enabled,
            loudness_enabled: params.loudness.enabled,
            automation_enabled: params.spatial.automation_enabled,
            reverb: params.reverb,
            compressor: params.compressor,
        }
    }

    fn restore(self, params: &mut EffectParameters) {
        params.convolver.enabled = self.convolver_enabled;
        params.spatial.enabled = self.spatial_enabled;
        params.loudness.enabled = self.loudness_enabled;
        params.spatial.automation_enabled = self.automation_enabled;
        params.reverb = ReverbSettings {
            custom: params.reverb.custom,
            ..self.reverb
        };
        params.compressor = self.compressor;
    }
}

/// Reverb values that render no tail
pub const LOW_TIER_REVERB: ReverbParams = ReverbParams {
    decay: 0.0,
    damping: 22000.0,
    mix: 0.0,
    pre_delay: 0.0,
    modulation_rate: 0.0,
    modulation_depth: 0.0,
};

/// Short, cheap reverb
pub const BALANCED_TIER_REVERB: ReverbParams = ReverbParams {
    decay: 0.3,
    damping: 10000.0,
    mix: 0.1,
    pre_delay: 0.01,
    modulation_rate: 0.1,
    modulation_depth: 0.00001,
};

/// Compressor values equivalent to pass-through
pub const LOW_TIER_COMPRESSOR: CompressorParams = CompressorParams {
    enabled: false,
    threshold: 0.0,
    knee: 0.0,
    ratio: 1.0,
    attack: 0.0,
    release: 0.0,
};

pub const BALANCED_TIER_COMPRESSOR: CompressorParams = CompressorParams {
    enabled: true,
    threshold: -18.0,
    knee: 10.0,
    ratio: 4.0,
    attack: 0.01,
    release: 0.5,
};

/// Move to `target`, returning false when already there
pub fn transition(params: &mut EffectParameters, target: PerformanceTier) -> bool {
    let from = params.tier;
    if from == target {
        debug!(tier = ?target, "Performance tier unchanged");
        return false;
    }

    if from == PerformanceTier::High {
        params.prior = Some(PriorSettings::capture(params));
    }

    match target {
        PerformanceTier::Low => {
            params.convolver.enabled = false;
            params.spatial.enabled = false;
            params.loudness.enabled = false;
            params.spatial.automation_enabled = false;
            params.reverb.enabled = false;
            params.reverb.params = LOW_TIER_REVERB;
            params.compressor = LOW_TIER_COMPRESSOR;
        }
        PerformanceTier::Balanced => {
            params.convolver.enabled = false;
            params.spatial.enabled = false;
            params.loudness.enabled = false;
            params.spatial.automation_enabled = false;
            params.reverb.enabled = true;
            params.reverb.params = BALANCED_TIER_REVERB;
            params.compressor = BALANCED_TIER_COMPRESSOR;
        }
        PerformanceTier::High => {
            if let Some(prior) = params.prior.take() {
                prior.restore(params);
            }
        }
    }

    params.tier = target;
    info!(from = ?from, to = ?target, "Performance tier changed");
    true
}
