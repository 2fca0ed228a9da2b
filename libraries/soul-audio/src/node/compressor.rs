use super::{AudioNode, NodeRef};
use crate::block::{AudioBlock, ChannelCountMode, RENDER_QUANTUM};
use crate::context::ContextShared;
use crate::error::Result;
use crate::param::{AudioParam, ParamSpec};
use crate::render::{ParamBlock, Processor, RenderScope};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

const NOISE_FLOOR_DB: f32 = -120.0;

/// Hold time of the peak detector
const PEAK_RELEASE_S: f32 = 0.05;

/// Share of the full-scale gain loss given back as makeup gain
const MAKEUP_EXPONENT: f32 = 0.6;

/// Stereo-linked feed-forward compressor with a soft knee
///
/// Threshold, knee, ratio, attack and release are sampled once per render
/// quantum. Makeup gain is derived from the curve so that a full-scale signal
/// loses only part of its level.
#[derive(Debug, Clone)]
pub struct DynamicsCompressorNode {
    node: NodeRef,
    threshold: AudioParam,
    knee: AudioParam,
    ratio: AudioParam,
    attack: AudioParam,
    release: AudioParam,
    reduction: Arc<AtomicU32>,
}

impl DynamicsCompressorNode {
    pub(crate) fn new(context: &Arc<ContextShared>) -> Result<Self> {
        let reduction = Arc::new(AtomicU32::new(0.0_f32.to_bits()));
        let (node, [threshold, knee, ratio, attack, release]) = context.register(
            Box::new(CompressorProcessor::new(Arc::clone(&reduction))),
            vec![ChannelCountMode::ClampedMax(2)],
            vec![1],
            [
                ParamSpec::new("threshold", -24.0, -100.0, 0.0),
                ParamSpec::new("knee", 30.0, 0.0, 40.0),
                ParamSpec::new("ratio", 12.0, 1.0, 20.0),
                ParamSpec::new("attack", 0.003, 0.0, 1.0),
                ParamSpec::new("release", 0.25, 0.0, 1.0),
            ],
        )?;
        Ok(Self {
            node,
            threshold,
            knee,
            ratio,
            attack,
            release,
            reduction,
        })
    }

    /// Threshold in dBFS
    pub fn threshold(&self) -> &AudioParam {
        &self.threshold
    }

    /// Soft knee width in dB
    pub fn knee(&self) -> &AudioParam {
        &self.knee
    }

    pub fn ratio(&self) -> &AudioParam {
        &self.ratio
    }

    /// Attack time in seconds
    pub fn attack(&self) -> &AudioParam {
        &self.attack
    }

    /// Release time in seconds
    pub fn release(&self) -> &AudioParam {
        &self.release
    }

    /// Current gain reduction in dB (zero or negative)
    pub fn reduction(&self) -> f32 {
        f32::from_bits(self.reduction.load(Ordering::Relaxed))
    }
}

impl AudioNode for DynamicsCompressorNode {
    fn node_ref(&self) -> &NodeRef {
        &self.node
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Curve {
    threshold: f32,
    knee: f32,
    ratio: f32,
}

impl Curve {
    /// Static output level for an input level, both in dB
    #[inline]
    fn output_level(self, input_db: f32) -> f32 {
        let Self {
            threshold,
            knee,
            ratio,
        } = self;
        if knee <= 0.0 {
            if input_db <= threshold {
                input_db
            } else {
                threshold + (input_db - threshold) / ratio
            }
        } else {
            let knee_start = threshold - knee / 2.0;
            let knee_end = threshold + knee / 2.0;
            if input_db <= knee_start {
                input_db
            } else if input_db >= knee_end {
                threshold + (input_db - threshold) / ratio
            } else {
                let x = input_db - knee_start;
                input_db - (1.0 - 1.0 / ratio) / (2.0 * knee) * x * x
            }
        }
    }

    #[inline]
    fn gain_reduction(self, input_db: f32) -> f32 {
        self.output_level(input_db) - input_db
    }

    fn makeup_gain(self) -> f32 {
        let full_scale_db = self.gain_reduction(0.0);
        db_to_linear(-full_scale_db * MAKEUP_EXPONENT)
    }
}

#[inline]
fn db_to_linear(db: f32) -> f32 {
    10.0_f32.powf(db / 20.0)
}

#[inline]
fn time_coeff(seconds: f32, sample_rate: f32) -> f32 {
    let samples = seconds * sample_rate;
    if samples <= 1.0 {
        0.0
    } else {
        (-1.0 / samples).exp()
    }
}

struct CompressorProcessor {
    peak_db: f32,
    reduction_db: f32,
    curve: Option<Curve>,
    makeup: f32,
    reported: Arc<AtomicU32>,
}

impl CompressorProcessor {
    fn new(reported: Arc<AtomicU32>) -> Self {
        Self {
            peak_db: NOISE_FLOOR_DB,
            reduction_db: 0.0,
            curve: None,
            makeup: 1.0,
            reported,
        }
    }
}

impl Processor for CompressorProcessor {
    fn process(
        &mut self,
        scope: &RenderScope,
        inputs: &[AudioBlock],
        outputs: &mut [AudioBlock],
        params: &ParamBlock<'_>,
    ) {
        let (Some(input), Some(output)) = (inputs.first(), outputs.first_mut()) else {
            return;
        };

        let curve = Curve {
            threshold: params.first(0),
            knee: params.first(1),
            ratio: params.first(2).max(1.0),
        };
        if self.curve != Some(curve) {
            self.makeup = curve.makeup_gain();
            self.curve = Some(curve);
        }
        let attack = time_coeff(params.first(3), scope.sample_rate);
        let release = time_coeff(params.first(4), scope.sample_rate);
        let peak_release = time_coeff(PEAK_RELEASE_S, scope.sample_rate);

        let channels = input.channel_count();
        output.set_channel_count(channels);

        for n in 0..RENDER_QUANTUM {
            let peak = (0..channels)
                .map(|ch| input.channel(ch)[n].abs())
                .fold(0.0_f32, f32::max);
            let input_db = if peak > 1e-6 {
                20.0 * peak.log10()
            } else {
                NOISE_FLOOR_DB
            };

            if input_db > self.peak_db {
                self.peak_db = input_db;
            } else {
                self.peak_db = peak_release * (self.peak_db - NOISE_FLOOR_DB) + NOISE_FLOOR_DB;
            }

            let target = curve.gain_reduction(self.peak_db);
            // More negative means more compression, which is the attack direction
            let coeff = if target < self.reduction_db {
                attack
            } else {
                release
            };
            self.reduction_db = coeff * self.reduction_db + (1.0 - coeff) * target;
            if self.reduction_db.abs() < 1e-10 {
                self.reduction_db = 0.0;
            }

            let gain = db_to_linear(self.reduction_db) * self.makeup;
            for ch in 0..channels {
                output.channel_mut(ch)[n] = input.channel(ch)[n] * gain;
            }
        }

        self.reported
            .store(self.reduction_db.to_bits(), Ordering::Relaxed);
    }
}
