//! Property tests for the complementary gain pairs of the effect chain
//!
//! Tests include:
//! - Dry and wet paths of every switchable branch sum to unity
//! - Pairs stay complementary part-way through a cross-fade
//! - Convolver boost curve is monotonic and bounded

use proptest::prelude::*;
use soul_audio::{AudioBuffer, AudioContext, AudioParam, ContextOptions, SilentMedia};
use soul_effects::appliers::{self, convolver_boost, convolver_boost_db};
use soul_effects::{EffectGraph, EffectParameters, EffectsConfig};
use std::sync::Arc;

const TOLERANCE: f64 = 1e-4;

fn setup(params: &EffectParameters) -> (AudioContext, EffectGraph, EffectsConfig) {
    let config = EffectsConfig::default();
    let ctx = AudioContext::new(ContextOptions::default()).unwrap();
    let graph = EffectGraph::build(&ctx, Arc::new(SilentMedia::new()), 1.0, params, &config)
        .unwrap();
    (ctx, graph, config)
}

fn impulse() -> Arc<AudioBuffer> {
    let mut channel = vec![0.0; 32];
    channel[0] = 1.0;
    Arc::new(AudioBuffer::new(48000, vec![channel.clone(), channel]).unwrap())
}

fn at(param: &AudioParam, time: f64) -> f64 {
    f64::from(param.value_at(time))
}

#[derive(Debug, Clone)]
struct Flags {
    convolver: bool,
    with_impulse: bool,
    convolver_mix: f64,
    compressor: bool,
    spatial: bool,
    widener: bool,
    widener_amount: f64,
}

fn flags() -> impl Strategy<Value = Flags> {
    (
        any::<bool>(),
        any::<bool>(),
        0.0..=1.0f64,
        any::<bool>(),
        any::<bool>(),
        any::<bool>(),
        0.0..=1.0f64,
    )
        .prop_map(
            |(convolver, with_impulse, convolver_mix, compressor, spatial, widener, widener_amount)| {
                Flags {
                    convolver,
                    with_impulse,
                    convolver_mix,
                    compressor,
                    spatial,
                    widener,
                    widener_amount,
                }
            },
        )
}

fn params_for(flags: &Flags, impulse: &Arc<AudioBuffer>) -> EffectParameters {
    let mut params = EffectParameters::default();
    params.convolver.enabled = flags.convolver;
    params.convolver.mix = flags.convolver_mix;
    if flags.with_impulse {
        params.convolver.impulse_buffer = Some(Arc::clone(impulse));
    }
    params.compressor.enabled = flags.compressor;
    params.spatial.enabled = flags.spatial;
    params.widener.enabled = flags.widener;
    params.widener.amount = flags.widener_amount;
    params
}

/// Every pair, normalized so that it should sum to one
fn pair_sums(graph: &EffectGraph, config: &EffectsConfig, time: f64) -> [(&'static str, f64); 4] {
    let spatial_wet = appliers::spatial_wet_gain(&config.mix);
    let widener_wet = at(graph.widener.wet.gain(), time);
    let widener_bypass = at(graph.widener.bypass.gain(), time);
    // Wet gain is amount * (1 + boost * amount); recover the amount
    let amount = 1.0 - widener_bypass;
    let widener_scale = 1.0 + config.mix.widener_wet_boost * amount;

    [
        (
            "convolver",
            at(graph.convolver_dry.gain(), time) + at(graph.convolver_wet.gain(), time),
        ),
        (
            "compressor",
            at(graph.compressor_through.gain(), time) + at(graph.compressor_bypass.gain(), time),
        ),
        (
            "spatial",
            at(graph.spatial_wet.gain(), time) / spatial_wet
                + at(graph.spatial_bypass.gain(), time),
        ),
        ("widener", widener_wet / widener_scale + widener_bypass),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_pairs_settle_complementary(first in flags(), second in flags()) {
        let impulse = impulse();
        let initial = params_for(&first, &impulse);
        let (ctx, graph, config) = setup(&initial);
        let now = ctx.current_time();

        appliers::apply_all(&initial, &graph, now, &config);
        appliers::apply_all(&params_for(&second, &impulse), &graph, now, &config);

        for (name, sum) in pair_sums(&graph, &config, now + 5.0) {
            prop_assert!((sum - 1.0).abs() < TOLERANCE, "{} pair sums to {}", name, sum);
        }
    }

    #[test]
    fn prop_convolver_wet_matches_mix(mix in 0.0..=1.0f64) {
        let impulse = impulse();
        let mut params = EffectParameters::default();
        params.convolver.enabled = true;
        params.convolver.mix = mix;
        params.convolver.impulse_buffer = Some(impulse);
        let (ctx, graph, config) = setup(&params);
        let now = ctx.current_time();

        appliers::apply_all(&params, &graph, now, &config);

        let wet = at(graph.convolver_wet.gain(), now + 5.0);
        let boost = at(graph.convolver_boost.gain(), now + 5.0);
        prop_assert!((wet - mix).abs() < TOLERANCE);
        prop_assert!((boost - convolver_boost(mix, &config.mix)).abs() < TOLERANCE);
    }

    #[test]
    fn prop_boost_monotonic_and_bounded(a in 0.0..=1.0f64, b in 0.0..=1.0f64) {
        let mix = EffectsConfig::default().mix;
        let (low, high) = if a <= b { (a, b) } else { (b, a) };

        let low_db = convolver_boost_db(low, &mix);
        let high_db = convolver_boost_db(high, &mix);

        prop_assert!(low_db <= high_db + 1e-12);
        prop_assert!(low_db >= 0.0);
        prop_assert!(high_db <= mix.convolver_boost_max_db + 1e-12);
    }
}

#[test]
fn test_compressor_pair_complementary_mid_fade() {
    let mut params = EffectParameters::default();
    params.compressor.enabled = false;
    let (ctx, graph, config) = setup(&params);
    let now = ctx.current_time();
    appliers::apply_all(&params, &graph, now, &config);

    params.compressor.enabled = true;
    appliers::apply_all(&params, &graph, now, &config);

    let fade = config.mix.crossfade();
    for step in 1..4 {
        let time = now + fade * f64::from(step) / 4.0;
        let through = at(graph.compressor_through.gain(), time);
        let bypass = at(graph.compressor_bypass.gain(), time);
        assert!((through + bypass - 1.0).abs() < TOLERANCE);
        assert!(through > 0.0 && bypass > 0.0);
    }
}

#[test]
fn test_enabled_convolver_without_impulse_stays_dry() {
    let mut params = EffectParameters::default();
    params.convolver.enabled = true;
    params.convolver.mix = 0.8;
    let (ctx, graph, config) = setup(&params);
    let now = ctx.current_time();

    appliers::apply_all(&params, &graph, now, &config);

    assert!((at(graph.convolver_dry.gain(), now + 5.0) - 1.0).abs() < TOLERANCE);
    assert!(at(graph.convolver_wet.gain(), now + 5.0).abs() < TOLERANCE);
    assert!((at(graph.convolver_boost.gain(), now + 5.0) - 1.0).abs() < TOLERANCE);
}
