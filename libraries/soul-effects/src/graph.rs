//! Fixed effect topology
//!
//! Building happens in two steps. [`LeafUnits::create`] makes every node in
//! a safe state: reverb feedback, modulation depth and every wet gain at
//! zero, every bypass at unity. [`LeafUnits::wire`] then connects them once
//! into the topology below and hands back an [`EffectGraph`]. A session holds
//! either a complete graph or none; nothing is reconnected afterwards.
//!
//! ```text
//! source ─► eq[0..6] ─┬─► convolver_dry ──────────────────────────────┐
//!                     ├─► convolver ─► convolver_wet ─► convolver_boost┤
//!                     └─► pre_delay ─┬─► comb[i] ─┬─► comb_merger ─► all_pass[0..4] ─► reverb_output ─┤
//!                                    └────────────┘                                                   │
//!   ┌─────────────────────────────────────────────────────────────────────────────────────────────────┘
//!   ▼
//! compressor_input ─┬─► compressor ─► compressor_through ─┬─► compressor_output
//!                   └─► compressor_bypass ────────────────┘
//!
//! compressor_output ─┬─► loudness_tap (meter attaches here)
//!                    ├─► panner ─► spatial_wet ─┬─► loudness_gain
//!                    └─► spatial_bypass ────────┘
//!
//! loudness_gain ─┬─► splitter ─► L/R delays ─► merger ─► widener_wet ─┬─► widener_output
//!                └─► widener_bypass ──────────────────────────────────┘
//!
//! widener_output ─► analyser ─► master ─► limiter ─► destination
//!
//! comb[i]:   delay ─► feedback ─► damping ─► delay      (output taken at delay)
//!            lfo[i] ─► depth[i] ─► delay.delay_time
//! ```

use crate::config::EffectsConfig;
use crate::error::Result;
use crate::params::{EffectParameters, EQ_BANDS};
use soul_audio::{
    AnalyserNode, AudioContext, AudioNode, BiquadFilterNode, BiquadFilterType,
    ChannelMergerNode, ChannelSplitterNode, ConvolverNode, DelayNode, DistanceModel,
    DynamicsCompressorNode, GainNode, MediaElement, MediaElementSourceNode, OscillatorNode,
    PannerNode, PanningModel,
};
use std::ops::Deref;
use std::sync::Arc;
use tracing::{debug, info};

/// Comb delay times in seconds
pub const COMB_DELAYS: [f64; 4] = [0.0297, 0.0371, 0.0411, 0.0437];

/// Longest comb delay, modulation included
pub const COMB_MAX_DELAY: f64 = 1.0;

/// Q of the comb damping low-pass
pub const COMB_DAMPING_Q: f32 = 0.7;

/// LFO rates at a modulation rate of [`MODULATION_REFERENCE_RATE`]
pub const LFO_BASE_FREQUENCIES: [f32; 4] = [2.1, 2.3, 1.9, 2.5];

/// Modulation rate that leaves the LFOs at their base frequencies
pub const MODULATION_REFERENCE_RATE: f64 = 2.5;

/// All-pass diffusion centre frequencies
pub const ALL_PASS_FREQUENCIES: [f32; 4] = [225.0, 556.0, 441.0, 341.0];

pub const PRE_DELAY_MAX: f64 = 0.5;

/// Analyser FFT size for the spectrum display
pub const ANALYSER_FFT_SIZE: usize = 256;

/// Settings of the output peak limiter
pub const LIMITER_THRESHOLD_DB: f32 = -0.5;
pub const LIMITER_KNEE_DB: f32 = 0.0;
pub const LIMITER_RATIO: f32 = 20.0;
pub const LIMITER_ATTACK: f32 = 0.001;
pub const LIMITER_RELEASE: f32 = 0.1;

/// One feedback comb of the algorithmic reverb
#[derive(Debug, Clone)]
pub struct CombLoop {
    pub delay: DelayNode,
    pub feedback: GainNode,
    pub damping: BiquadFilterNode,
}

/// Delay-time modulator of one comb
#[derive(Debug, Clone)]
pub struct Modulator {
    pub lfo: OscillatorNode,
    pub depth: GainNode,
    pub base_frequency: f32,
}

/// Stereo widening stage
#[derive(Debug, Clone)]
pub struct WidenerUnits {
    pub splitter: ChannelSplitterNode,
    pub left: DelayNode,
    pub right: DelayNode,
    pub merger: ChannelMergerNode,
    pub wet: GainNode,
    pub bypass: GainNode,
    pub output: GainNode,
}

/// Every node of the effect chain, created but not yet connected
#[derive(Debug, Clone)]
pub struct LeafUnits {
    pub source: MediaElementSourceNode,
    pub eq: Vec<BiquadFilterNode>,

    pub convolver: ConvolverNode,
    pub convolver_dry: GainNode,
    pub convolver_wet: GainNode,
    pub convolver_boost: GainNode,

    pub pre_delay: DelayNode,
    pub combs: Vec<CombLoop>,
    pub modulators: Vec<Modulator>,
    pub comb_merger: GainNode,
    pub all_pass: Vec<BiquadFilterNode>,
    pub reverb_output: GainNode,

    pub compressor_input: GainNode,
    pub compressor: DynamicsCompressorNode,
    pub compressor_through: GainNode,
    pub compressor_bypass: GainNode,
    pub compressor_output: GainNode,

    pub loudness_tap: GainNode,

    pub panner: PannerNode,
    pub spatial_wet: GainNode,
    pub spatial_bypass: GainNode,

    pub loudness_gain: GainNode,
    pub widener: WidenerUnits,

    pub analyser: AnalyserNode,
    pub master: GainNode,
    pub limiter: DynamicsCompressorNode,
}

fn gain(ctx: &AudioContext, value: f32) -> Result<GainNode> {
    let node = ctx.create_gain()?;
    node.gain().set_value(value);
    Ok(node)
}

impl LeafUnits {
    /// Create every node in its safe state
    ///
    /// EQ gains, compressor settings and panner position are seeded from
    /// `params`; nothing that can feed back or add wet signal starts open.
    pub fn create(
        ctx: &AudioContext,
        media: Arc<dyn MediaElement>,
        initial_volume: f32,
        params: &EffectParameters,
        config: &EffectsConfig,
    ) -> Result<Self> {
        // Cheap units
        let source = ctx.create_media_element_source(media)?;
        let master = gain(ctx, initial_volume)?;
        let analyser = ctx.create_analyser()?;
        analyser.set_fft_size(ANALYSER_FFT_SIZE)?;

        let eq = EQ_BANDS
            .iter()
            .enumerate()
            .map(|(i, band)| {
                let gain_db = params.eq_gains.get(i).copied().unwrap_or(0.0);
                let filter = ctx.create_biquad_filter()?;
                filter.set_filter_type(band.filter_type);
                filter.frequency().set_value(band.frequency);
                filter.Q().set_value(band.q);
                filter.gain().set_value(gain_db as f32);
                Ok(filter)
            })
            .collect::<Result<Vec<_>>>()?;

        // Convolution reverb, fully dry
        let convolver = ctx.create_convolver()?;
        let convolver_dry = gain(ctx, 1.0)?;
        let convolver_wet = gain(ctx, 0.0)?;
        let convolver_boost = gain(ctx, 1.0)?;

        // Algorithmic reverb, silent and without feedback
        let pre_delay = ctx.create_delay(PRE_DELAY_MAX)?;
        pre_delay
            .delay_time()
            .set_value(params.reverb.params.pre_delay as f32);

        let combs = COMB_DELAYS
            .iter()
            .map(|&time| {
                let delay = ctx.create_delay(COMB_MAX_DELAY)?;
                delay.delay_time().set_value(time as f32);
                let feedback = gain(ctx, 0.0)?;
                let damping = ctx.create_biquad_filter()?;
                damping.set_filter_type(BiquadFilterType::Lowpass);
                damping.Q().set_value(COMB_DAMPING_Q);
                damping
                    .frequency()
                    .set_value(params.reverb.params.damping as f32);
                Ok(CombLoop {
                    delay,
                    feedback,
                    damping,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let modulators = LFO_BASE_FREQUENCIES
            .iter()
            .map(|&base_frequency| {
                let lfo = ctx.create_oscillator()?;
                lfo.frequency().set_value(base_frequency);
                Ok(Modulator {
                    lfo,
                    depth: gain(ctx, 0.0)?,
                    base_frequency,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let comb_merger = gain(ctx, 1.0 / COMB_DELAYS.len() as f32)?;
        let all_pass = ALL_PASS_FREQUENCIES
            .iter()
            .map(|&frequency| {
                let filter = ctx.create_biquad_filter()?;
                filter.set_filter_type(BiquadFilterType::Allpass);
                filter.frequency().set_value(frequency);
                Ok(filter)
            })
            .collect::<Result<Vec<_>>>()?;
        let reverb_output = gain(ctx, 0.0)?;

        // Compressor, bypassed
        let compressor_input = gain(ctx, 1.0)?;
        let compressor = ctx.create_dynamics_compressor()?;
        compressor
            .threshold()
            .set_value(params.compressor.threshold as f32);
        compressor.knee().set_value(params.compressor.knee as f32);
        compressor.ratio().set_value(params.compressor.ratio as f32);
        compressor.attack().set_value(params.compressor.attack as f32);
        compressor.release().set_value(params.compressor.release as f32);
        let compressor_through = gain(ctx, 0.0)?;
        let compressor_bypass = gain(ctx, 1.0)?;
        let compressor_output = gain(ctx, 1.0)?;

        let loudness_tap = gain(ctx, 1.0)?;

        // Spatializer, bypassed
        let panner = ctx.create_panner()?;
        panner.set_panning_model(PanningModel::Hrtf);
        panner.set_distance_model(DistanceModel::Inverse);
        let position = params.spatial.position;
        panner.set_position(position.x as f32, position.y as f32, position.z as f32);
        panner.set_orientation(0.0, 0.0, -1.0);
        let spatial_wet = gain(ctx, 0.0)?;
        let spatial_bypass = gain(ctx, 1.0)?;

        let loudness_gain = gain(ctx, 1.0)?;

        // Widener, bypassed
        let left = ctx.create_delay(1.0)?;
        left
            .delay_time()
            .set_value((config.widener.left_delay_ms / 1000.0) as f32);
        let right = ctx.create_delay(1.0)?;
        right
            .delay_time()
            .set_value((config.widener.right_delay_ms / 1000.0) as f32);
        let widener = WidenerUnits {
            splitter: ctx.create_channel_splitter(2)?,
            left,
            right,
            merger: ctx.create_channel_merger(2)?,
            wet: gain(ctx, 0.0)?,
            bypass: gain(ctx, 1.0)?,
            output: gain(ctx, 1.0)?,
        };

        let limiter = ctx.create_dynamics_compressor()?;
        limiter.threshold().set_value(LIMITER_THRESHOLD_DB);
        limiter.knee().set_value(LIMITER_KNEE_DB);
        limiter.ratio().set_value(LIMITER_RATIO);
        limiter.attack().set_value(LIMITER_ATTACK);
        limiter.release().set_value(LIMITER_RELEASE);

        debug!(
            eq_bands = eq.len(),
            combs = combs.len(),
            "Created effect units in safe state"
        );

        Ok(Self {
            source,
            eq,
            convolver,
            convolver_dry,
            convolver_wet,
            convolver_boost,
            pre_delay,
            combs,
            modulators,
            comb_merger,
            all_pass,
            reverb_output,
            compressor_input,
            compressor,
            compressor_through,
            compressor_bypass,
            compressor_output,
            loudness_tap,
            panner,
            spatial_wet,
            spatial_bypass,
            loudness_gain,
            widener,
            analyser,
            master,
            limiter,
        })
    }

    /// Connect the fixed topology
    ///
    /// Fails as a whole; on error the units are dropped and no graph exists.
    pub fn wire(self, ctx: &AudioContext) -> Result<EffectGraph> {
        // Source through the EQ chain
        let mut eq_output: &dyn AudioNode = &self.source;
        for filter in &self.eq {
            eq_output.connect(filter)?;
            eq_output = filter;
        }

        eq_output.connect(&self.convolver_dry)?;
        eq_output.connect(&self.convolver)?;
        eq_output.connect(&self.pre_delay)?;

        // Algorithmic reverb
        self.pre_delay.connect(&self.comb_merger)?;
        for (comb, modulator) in self.combs.iter().zip(&self.modulators) {
            self.pre_delay.connect(&comb.delay)?;
            comb.delay.connect(&comb.feedback)?;
            comb.feedback.connect(&comb.damping)?;
            comb.damping.connect(&comb.delay)?;
            comb.delay.connect(&self.comb_merger)?;

            modulator.lfo.connect(&modulator.depth)?;
            modulator.depth.connect_param(comb.delay.delay_time())?;
        }
        let mut diffused: &dyn AudioNode = &self.comb_merger;
        for filter in &self.all_pass {
            diffused.connect(filter)?;
            diffused = filter;
        }
        diffused.connect(&self.reverb_output)?;

        // Convolution wet path
        self.convolver.connect(&self.convolver_wet)?;
        self.convolver_wet.connect(&self.convolver_boost)?;

        // Everything sums at the compressor stage
        self.convolver_dry.connect(&self.compressor_input)?;
        self.convolver_boost.connect(&self.compressor_input)?;
        self.reverb_output.connect(&self.compressor_input)?;

        self.compressor_input.connect(&self.compressor)?;
        self.compressor.connect(&self.compressor_through)?;
        self.compressor_through.connect(&self.compressor_output)?;
        self.compressor_input.connect(&self.compressor_bypass)?;
        self.compressor_bypass.connect(&self.compressor_output)?;

        self.compressor_output.connect(&self.loudness_tap)?;

        // Spatializer cross-fade
        self.compressor_output.connect(&self.panner)?;
        self.panner.connect(&self.spatial_wet)?;
        self.spatial_wet.connect(&self.loudness_gain)?;
        self.compressor_output.connect(&self.spatial_bypass)?;
        self.spatial_bypass.connect(&self.loudness_gain)?;

        // Widener cross-fade
        let w = &self.widener;
        self.loudness_gain.connect(&w.splitter)?;
        w.splitter.connect_at(&w.left, 0, 0)?;
        w.splitter.connect_at(&w.right, 1, 0)?;
        w.left.connect_at(&w.merger, 0, 0)?;
        w.right.connect_at(&w.merger, 0, 1)?;
        w.merger.connect(&w.wet)?;
        w.wet.connect(&w.output)?;
        self.loudness_gain.connect(&w.bypass)?;
        w.bypass.connect(&w.output)?;

        // Output
        w.output.connect(&self.analyser)?;
        self.analyser.connect(&self.master)?;
        self.master.connect(&self.limiter)?;
        self.limiter.connect(&ctx.destination())?;

        info!("Effect graph wired");
        Ok(EffectGraph { units: self })
    }
}

/// Fully wired effect chain
#[derive(Debug, Clone)]
pub struct EffectGraph {
    units: LeafUnits,
}

impl Deref for EffectGraph {
    type Target = LeafUnits;

    fn deref(&self) -> &LeafUnits {
        &self.units
    }
}

impl EffectGraph {
    /// Create and wire in one go
    pub fn build(
        ctx: &AudioContext,
        media: Arc<dyn MediaElement>,
        initial_volume: f32,
        params: &EffectParameters,
        config: &EffectsConfig,
    ) -> Result<Self> {
        LeafUnits::create(ctx, media, initial_volume, params, config)?.wire(ctx)
    }

    /// Start every reverb LFO
    ///
    /// Oscillators start once per lifetime; callers track whether this ran.
    pub fn start_modulators(&self) -> Result<()> {
        for modulator in &self.modulators {
            modulator.lfo.start()?;
        }
        debug!(count = self.modulators.len(), "Started reverb modulators");
        Ok(())
    }

    pub fn stop_modulators(&self) -> Result<()> {
        for modulator in &self.modulators {
            modulator.lfo.stop()?;
        }
        debug!("Stopped reverb modulators");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use soul_audio::{ContextOptions, SilentMedia};

    fn build() -> (AudioContext, EffectGraph) {
        let ctx = AudioContext::new(ContextOptions::default()).unwrap();
        let graph = EffectGraph::build(
            &ctx,
            Arc::new(SilentMedia::new()),
            0.8,
            &EffectParameters::default(),
            &EffectsConfig::default(),
        )
        .unwrap();
        (ctx, graph)
    }

    #[test]
    fn test_safe_initial_state() {
        let (_ctx, graph) = build();

        assert_eq!(graph.master.gain().value(), 0.8);
        assert_eq!(graph.convolver_dry.gain().value(), 1.0);
        assert_eq!(graph.convolver_wet.gain().value(), 0.0);
        assert_eq!(graph.convolver_boost.gain().value(), 1.0);
        assert_eq!(graph.reverb_output.gain().value(), 0.0);
        assert!(graph.combs.iter().all(|c| c.feedback.gain().value() == 0.0));
        assert!(graph.modulators.iter().all(|m| m.depth.gain().value() == 0.0));
        assert_eq!(graph.compressor_through.gain().value(), 0.0);
        assert_eq!(graph.compressor_bypass.gain().value(), 1.0);
        assert_eq!(graph.spatial_wet.gain().value(), 0.0);
        assert_eq!(graph.spatial_bypass.gain().value(), 1.0);
        assert_eq!(graph.loudness_gain.gain().value(), 1.0);
        assert_eq!(graph.widener.wet.gain().value(), 0.0);
        assert_eq!(graph.widener.bypass.gain().value(), 1.0);
        assert!(graph.convolver.buffer().is_none());
    }

    #[test]
    fn test_fixed_unit_settings() {
        let (_ctx, graph) = build();

        assert_eq!(graph.eq.len(), EQ_BANDS.len());
        assert_eq!(graph.eq[0].filter_type(), BiquadFilterType::Lowshelf);
        assert_eq!(graph.eq[5].filter_type(), BiquadFilterType::Highshelf);
        assert_eq!(graph.comb_merger.gain().value(), 0.25);
        assert_eq!(graph.analyser.fft_size(), ANALYSER_FFT_SIZE);
        assert_eq!(graph.limiter.threshold().value(), -0.5);
        assert_eq!(graph.limiter.ratio().value(), 20.0);
        assert_eq!(graph.panner.panning_model(), PanningModel::Hrtf);
        assert_eq!(graph.panner.orientation_z().value(), -1.0);
        assert!((graph.widener.right.delay_time().value() - 0.012).abs() < 1e-6);
    }

    #[test]
    fn test_renders_silence_without_runaway() {
        let (ctx, graph) = build();
        graph.start_modulators().unwrap();

        let samples = ctx.render(4800).unwrap();
        assert!(samples.iter().all(|s| s.is_finite() && s.abs() < 1e-6));
    }

    #[test]
    fn test_modulators_start_once() {
        let (_ctx, graph) = build();
        graph.start_modulators().unwrap();
        assert!(graph.start_modulators().is_err());
        assert!(graph.modulators.iter().all(|m| m.lfo.is_started()));
    }

    #[tokio::test]
    async fn test_wiring_fails_on_closed_context() {
        let ctx = AudioContext::new(ContextOptions::default()).unwrap();
        let units = LeafUnits::create(
            &ctx,
            Arc::new(SilentMedia::new()),
            1.0,
            &EffectParameters::default(),
            &EffectsConfig::default(),
        )
        .unwrap();

        ctx.close().await.unwrap();
        assert!(units.wire(&ctx).is_err());
    }
}
