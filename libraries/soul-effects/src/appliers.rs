//! Effect parameter appliers
//!
//! Each applier maps the current [`EffectParameters`] onto the nodes of an
//! [`EffectGraph`]. They hold no state and are always run together by
//! [`apply_all`], so the graph matches the store after every pass no matter
//! which field changed.
//!
//! Branches are switched with complementary gain ramps, never by
//! reconnecting nodes.

use crate::config::{EffectsConfig, MixSettings};
use crate::graph::{EffectGraph, MODULATION_REFERENCE_RATE};
use crate::params::{EffectParameters, Position};
use soul_audio::{AudioBuffer, AudioParam};
use std::sync::Arc;
use tracing::{error, trace};

/// Convert decibels to a linear gain
pub fn db_to_gain(db: f64) -> f64 {
    10.0_f64.powf(db / 20.0)
}

/// Ramp `param` from its value at `now` to `value` over `duration` seconds
///
/// Pending automation is dropped first, so repeated passes never stack ramps.
pub fn glide(param: &AudioParam, value: f64, now: f64, duration: f64) {
    let current = param.value_at(now);
    param.cancel_scheduled_values(now);
    param.set_value_at_time(current, now);
    if duration > 0.0 {
        param.linear_ramp_to_value_at_time(value as f32, now + duration);
    } else {
        param.set_value_at_time(value as f32, now);
    }
}

/// Jump `param` to `value` at `now`, dropping pending automation
pub fn set_now(param: &AudioParam, value: f64, now: f64) {
    param.cancel_scheduled_values(now);
    param.set_value_at_time(value as f32, now);
}

/// Boost of the convolver wet path in dB
///
/// Zero up to the threshold mix, then linear up to the configured maximum at
/// a mix of one.
pub fn convolver_boost_db(mix: f64, settings: &MixSettings) -> f64 {
    let mix = mix.clamp(0.0, 1.0);
    let threshold = settings.convolver_boost_threshold_mix;
    if mix <= threshold {
        return 0.0;
    }
    (mix - threshold) / (1.0 - threshold) * settings.convolver_boost_max_db
}

pub fn convolver_boost(mix: f64, settings: &MixSettings) -> f64 {
    db_to_gain(convolver_boost_db(mix, settings))
}

/// Wet gain of the spatializer path while enabled
pub fn spatial_wet_gain(settings: &MixSettings) -> f64 {
    db_to_gain(settings.spatial_wet_compensation_db)
}

/// `(wet, bypass)` gains of the widener for an amount in [0, 1]
pub fn widener_gains(amount: f64, settings: &MixSettings) -> (f64, f64) {
    let amount = amount.clamp(0.0, 1.0);
    (
        amount * (1.0 + settings.widener_wet_boost * amount),
        1.0 - amount,
    )
}

pub fn apply_eq(params: &EffectParameters, graph: &EffectGraph, now: f64) {
    for (i, filter) in graph.eq.iter().enumerate() {
        let gain_db = params.eq_gains.get(i).copied().unwrap_or(0.0);
        set_now(filter.gain(), gain_db, now);
    }
}

/// Make the convolver hold the buffer in the store; true when it holds one
fn sync_impulse_buffer(graph: &EffectGraph, wanted: Option<&Arc<AudioBuffer>>) -> bool {
    let current = graph.convolver.buffer();
    let same = match (&current, wanted) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    };
    if same {
        return current.is_some();
    }

    match graph.convolver.set_buffer(wanted.cloned()) {
        Ok(()) => wanted.is_some(),
        Err(e) => {
            error!(error = %e, "Failed to install impulse response");
            let _ = graph.convolver.set_buffer(None);
            false
        }
    }
}

pub fn apply_convolver(
    params: &EffectParameters,
    graph: &EffectGraph,
    now: f64,
    config: &EffectsConfig,
) {
    let settings = &params.convolver;
    let loaded = sync_impulse_buffer(graph, settings.impulse_buffer.as_ref());
    let fade = config.mix.crossfade();

    let (dry, wet, boost) = if settings.enabled && loaded {
        let mix = settings.mix.clamp(0.0, 1.0);
        (1.0 - mix, mix, convolver_boost(mix, &config.mix))
    } else {
        (1.0, 0.0, 1.0)
    };

    glide(graph.convolver_dry.gain(), dry, now, fade);
    glide(graph.convolver_wet.gain(), wet, now, fade);
    glide(graph.convolver_boost.gain(), boost, now, fade);
}

pub fn apply_reverb(
    params: &EffectParameters,
    graph: &EffectGraph,
    now: f64,
    config: &EffectsConfig,
) {
    let fade = config.mix.crossfade();
    let reverb = &params.reverb;

    if reverb.enabled {
        let p = &reverb.params;
        glide(graph.pre_delay.delay_time(), p.pre_delay, now, fade);
        glide(graph.reverb_output.gain(), p.mix, now, fade);
        for comb in &graph.combs {
            glide(comb.feedback.gain(), p.decay, now, fade);
            glide(comb.damping.frequency(), p.damping, now, fade);
        }
        let rate_scale = p.modulation_rate / MODULATION_REFERENCE_RATE;
        for modulator in &graph.modulators {
            let frequency = f64::from(modulator.base_frequency) * rate_scale;
            glide(modulator.lfo.frequency(), frequency, now, fade);
            glide(modulator.depth.gain(), p.modulation_depth, now, fade);
        }
    } else {
        glide(graph.reverb_output.gain(), 0.0, now, fade);
        for comb in &graph.combs {
            glide(comb.feedback.gain(), 0.0, now, fade);
        }
        for modulator in &graph.modulators {
            glide(modulator.depth.gain(), 0.0, now, fade);
        }
    }
}

pub fn apply_compressor(
    params: &EffectParameters,
    graph: &EffectGraph,
    now: f64,
    config: &EffectsConfig,
) {
    let fade = config.mix.crossfade();
    let c = &params.compressor;

    if c.enabled {
        let ramp = config.mix.compressor_ramp();
        let node = &graph.compressor;
        glide(node.threshold(), c.threshold, now, ramp);
        glide(node.knee(), c.knee, now, ramp);
        glide(node.ratio(), c.ratio, now, ramp);
        glide(node.attack(), c.attack, now, ramp);
        glide(node.release(), c.release, now, ramp);

        glide(graph.compressor_through.gain(), 1.0, now, fade);
        glide(graph.compressor_bypass.gain(), 0.0, now, fade);
    } else {
        glide(graph.compressor_through.gain(), 0.0, now, fade);
        glide(graph.compressor_bypass.gain(), 1.0, now, fade);
    }
}

/// Place the spatializer source right now
pub fn set_panner_position(graph: &EffectGraph, position: Position, now: f64) {
    set_now(graph.panner.position_x(), position.x, now);
    set_now(graph.panner.position_y(), position.y, now);
    set_now(graph.panner.position_z(), position.z, now);
}

pub fn apply_spatial(
    params: &EffectParameters,
    graph: &EffectGraph,
    now: f64,
    config: &EffectsConfig,
) {
    let spatial = &params.spatial;
    // The automation driver owns the position while it runs
    if !spatial.automation_enabled {
        set_panner_position(graph, spatial.position, now);
    }

    let (wet, bypass) = if spatial.enabled {
        (spatial_wet_gain(&config.mix), 0.0)
    } else {
        (0.0, 1.0)
    };
    let fade = config.mix.crossfade();
    glide(graph.spatial_wet.gain(), wet, now, fade);
    glide(graph.spatial_bypass.gain(), bypass, now, fade);
}

pub fn apply_widener(
    params: &EffectParameters,
    graph: &EffectGraph,
    now: f64,
    config: &EffectsConfig,
) {
    let (wet, bypass) = if params.widener.enabled {
        widener_gains(params.widener.amount, &config.mix)
    } else {
        (0.0, 1.0)
    };
    let fade = config.mix.crossfade();
    glide(graph.widener.wet.gain(), wet, now, fade);
    glide(graph.widener.bypass.gain(), bypass, now, fade);
}

/// Release the loudness gain to unity while normalization is off
///
/// While on, the meter feedback drives the gain.
pub fn apply_loudness(
    params: &EffectParameters,
    graph: &EffectGraph,
    now: f64,
    config: &EffectsConfig,
) {
    if !params.loudness.enabled {
        glide(
            graph.loudness_gain.gain(),
            1.0,
            now,
            config.loudness.release_ramp(),
        );
    }
}

/// Steer the loudness gain toward a correction computed from a meter reading
pub fn apply_loudness_correction(graph: &EffectGraph, gain: f64, now: f64, config: &EffectsConfig) {
    glide(
        graph.loudness_gain.gain(),
        gain,
        now,
        config.loudness.correction_ramp(),
    );
}

/// Run every applier against one snapshot
pub fn apply_all(params: &EffectParameters, graph: &EffectGraph, now: f64, config: &EffectsConfig) {
    apply_eq(params, graph, now);
    apply_convolver(params, graph, now, config);
    apply_reverb(params, graph, now, config);
    apply_compressor(params, graph, now, config);
    apply_spatial(params, graph, now, config);
    apply_widener(params, graph, now, config);
    apply_loudness(params, graph, now, config);
    trace!(time = now, "Applied effect parameters");
}

#[cfg(test)]
mod tests {
    use super::*;
    use soul_audio::{AudioContext, ContextOptions, SilentMedia};

    fn mix() -> MixSettings {
        EffectsConfig::default().mix
    }

    fn setup() -> (AudioContext, EffectGraph, EffectsConfig) {
        let ctx = AudioContext::new(ContextOptions::default()).unwrap();
        let config = EffectsConfig::default();
        let graph = EffectGraph::build(
            &ctx,
            Arc::new(SilentMedia::new()),
            1.0,
            &EffectParameters::default(),
            &config,
        )
        .unwrap();
        (ctx, graph, config)
    }

    fn settled(param: &AudioParam) -> f32 {
        param.value_at(10.0)
    }

    #[test]
    fn test_convolver_boost_curve() {
        let mix = mix();
        assert_eq!(convolver_boost_db(0.0, &mix), 0.0);
        assert_eq!(convolver_boost_db(0.3, &mix), 0.0);
        assert!((convolver_boost_db(0.65, &mix) - 3.0).abs() < 1e-9);
        assert!((convolver_boost_db(1.0, &mix) - 6.0).abs() < 1e-9);
        assert!((convolver_boost_db(2.0, &mix) - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_widener_gains() {
        let mix = mix();
        assert_eq!(widener_gains(0.0, &mix), (0.0, 1.0));
        let (wet, bypass) = widener_gains(1.0, &mix);
        assert!((wet - 1.25).abs() < 1e-12);
        assert_eq!(bypass, 0.0);
    }

    #[test]
    fn test_glide_anchors_at_current_value() {
        let (_ctx, graph, _) = setup();
        let param = graph.reverb_output.gain();
        glide(param, 1.0, 0.0, 0.1);

        assert_eq!(param.value_at(0.0), 0.0);
        assert!((param.value_at(0.05) - 0.5).abs() < 1e-3);
        assert_eq!(param.value_at(0.1), 1.0);
    }

    #[test]
    fn test_convolver_without_buffer_stays_dry() {
        let (_ctx, graph, config) = setup();
        let mut params = EffectParameters::default();
        params.convolver.enabled = true;
        params.convolver.mix = 0.5;

        apply_convolver(&params, &graph, 0.0, &config);
        assert_eq!(settled(graph.convolver_dry.gain()), 1.0);
        assert_eq!(settled(graph.convolver_wet.gain()), 0.0);
        assert_eq!(settled(graph.convolver_boost.gain()), 1.0);
    }

    #[test]
    fn test_convolver_with_buffer_mixes() {
        let (_ctx, graph, config) = setup();
        let mut params = EffectParameters::default();
        params.convolver.enabled = true;
        params.convolver.mix = 0.5;
        params.convolver.impulse_buffer =
            Some(Arc::new(AudioBuffer::new(48000, vec![vec![1.0, 0.5], vec![1.0, 0.5]]).unwrap()));

        apply_convolver(&params, &graph, 0.0, &config);
        assert_eq!(settled(graph.convolver_dry.gain()), 0.5);
        assert_eq!(settled(graph.convolver_wet.gain()), 0.5);
        let boost = convolver_boost(0.5, &config.mix) as f32;
        assert!((settled(graph.convolver_boost.gain()) - boost).abs() < 1e-6);
        assert!(graph.convolver.buffer().is_some());

        params.convolver.impulse_buffer = None;
        apply_convolver(&params, &graph, 0.0, &config);
        assert!(graph.convolver.buffer().is_none());
    }

    #[test]
    fn test_reverb_disable_kills_feedback() {
        let (_ctx, graph, config) = setup();
        let mut params = EffectParameters::default();
        params.reverb.enabled = true;
        apply_reverb(&params, &graph, 0.0, &config);
        assert!(graph
            .combs
            .iter()
            .all(|c| (settled(c.feedback.gain()) - 0.6).abs() < 1e-6));
        assert!((settled(graph.modulators[0].lfo.frequency()) - 2.1).abs() < 1e-6);

        params.reverb.enabled = false;
        apply_reverb(&params, &graph, 0.0, &config);
        assert!(graph.combs.iter().all(|c| settled(c.feedback.gain()) == 0.0));
        assert!(graph.modulators.iter().all(|m| settled(m.depth.gain()) == 0.0));
        assert_eq!(settled(graph.reverb_output.gain()), 0.0);
    }

    #[test]
    fn test_lfo_rate_scales_base_frequency() {
        let (_ctx, graph, config) = setup();
        let mut params = EffectParameters::default();
        params.reverb.enabled = true;
        params.reverb.params.modulation_rate = 1.25;

        apply_reverb(&params, &graph, 0.0, &config);
        assert!((settled(graph.modulators[3].lfo.frequency()) - 1.25).abs() < 1e-6);
    }

    #[test]
    fn test_spatial_position_ignored_under_automation() {
        let (_ctx, graph, config) = setup();
        let mut params = EffectParameters::default();
        params.spatial.position = Position::new(3.0, 0.0, 0.0);
        apply_spatial(&params, &graph, 0.0, &config);
        assert_eq!(settled(graph.panner.position_x()), 3.0);

        params.spatial.automation_enabled = true;
        params.spatial.position = Position::new(-3.0, 0.0, 0.0);
        apply_spatial(&params, &graph, 0.0, &config);
        assert_eq!(settled(graph.panner.position_x()), 3.0);
    }

    #[test]
    fn test_loudness_released_when_disabled() {
        let (_ctx, graph, config) = setup();
        apply_loudness_correction(&graph, 0.5, 0.0, &config);
        assert_eq!(settled(graph.loudness_gain.gain()), 0.5);

        let mut params = EffectParameters::default();
        params.loudness.enabled = true;
        apply_loudness(&params, &graph, 0.0, &config);
        assert_eq!(settled(graph.loudness_gain.gain()), 0.5);

        params.loudness.enabled = false;
        apply_loudness(&params, &graph, 0.0, &config);
        assert_eq!(settled(graph.loudness_gain.gain()), 1.0);
    }
}
