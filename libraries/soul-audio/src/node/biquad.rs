/// Second-order IIR filter node
///
/// Coefficients follow the RBJ audio-EQ cookbook. Frequency, Q and gain are
/// read once per quantum; the active coefficients glide toward the new target
/// with exponential smoothing so that gain changes never click.
use super::{AudioNode, NodeMessage, NodeRef};
use crate::block::{AudioBlock, ChannelCountMode, MAX_CHANNELS};
use crate::context::ContextShared;
use crate::error::Result;
use crate::param::{AudioParam, ParamSpec};
use crate::render::{ParamBlock, Processor, RenderScope};
use std::sync::{Arc, Mutex, PoisonError};

/// Per-sample smoothing factor applied to coefficient changes
const SMOOTH_COEFF: f32 = 0.002;

/// Filter response shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BiquadFilterType {
    #[default]
    Lowpass,
    Highpass,
    Bandpass,
    Lowshelf,
    Highshelf,
    Peaking,
    Notch,
    Allpass,
}

/// Biquad filter handle
#[derive(Debug, Clone)]
pub struct BiquadFilterNode {
    node: NodeRef,
    frequency: AudioParam,
    q: AudioParam,
    gain: AudioParam,
    filter_type: Arc<Mutex<BiquadFilterType>>,
}

impl BiquadFilterNode {
    pub(crate) fn new(context: &Arc<ContextShared>) -> Result<Self> {
        let nyquist = context.sample_rate() as f32 / 2.0;
        let (node, [frequency, q, gain]) = context.register(
            Box::new(BiquadProcessor::new()),
            vec![ChannelCountMode::Max],
            vec![1],
            [
                ParamSpec::new("frequency", 350.0, 0.0, nyquist),
                ParamSpec::new("Q", 1.0, -770.0, 770.0),
                ParamSpec::new("gain", 0.0, -40.0, 40.0),
            ],
        )?;
        Ok(Self {
            node,
            frequency,
            q,
            gain,
            filter_type: Arc::new(Mutex::new(BiquadFilterType::default())),
        })
    }

    pub fn frequency(&self) -> &AudioParam {
        &self.frequency
    }

    #[allow(non_snake_case)]
    pub fn Q(&self) -> &AudioParam {
        &self.q
    }

    /// Gain in dB (shelf and peaking types only)
    pub fn gain(&self) -> &AudioParam {
        &self.gain
    }

    pub fn filter_type(&self) -> BiquadFilterType {
        *self
            .filter_type
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_filter_type(&self, filter_type: BiquadFilterType) {
        *self
            .filter_type
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = filter_type;
        self.node.send(NodeMessage::SetFilterType(filter_type));
    }
}

impl AudioNode for BiquadFilterNode {
    fn node_ref(&self) -> &NodeRef {
        &self.node
    }
}

/// Normalized coefficients (a0 == 1)
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Coefficients {
    pub b0: f32,
    pub b1: f32,
    pub b2: f32,
    pub a1: f32,
    pub a2: f32,
}

impl Coefficients {
    const IDENTITY: Self = Self {
        b0: 1.0,
        b1: 0.0,
        b2: 0.0,
        a1: 0.0,
        a2: 0.0,
    };

    /// Cookbook coefficients for a filter type
    ///
    /// Q is in dB for low-pass and high-pass and ignored by the shelves.
    pub(crate) fn compute(
        kind: BiquadFilterType,
        sample_rate: f32,
        frequency: f32,
        q: f32,
        gain_db: f32,
    ) -> Self {
        if sample_rate < 1.0 {
            return Self::IDENTITY;
        }

        // Keep clear of Nyquist where the bilinear transform misbehaves
        let freq = frequency.clamp(1.0, sample_rate * 0.45);
        let a = 10.0_f32.powf(gain_db / 40.0);
        let w0 = 2.0 * std::f32::consts::PI * freq / sample_rate;
        let (sin_w0, cos_w0) = w0.sin_cos();
        let q_lin = q.max(1e-4);
        let alpha_q = sin_w0 / (2.0 * q_lin);
        let alpha_q_db = sin_w0 / (2.0 * 10.0_f32.powf(q / 20.0));
        let alpha_s = sin_w0 / 2.0 * std::f32::consts::SQRT_2;
        let beta = 2.0 * a.sqrt() * alpha_s;

        let (b0, b1, b2, a0, a1, a2) = match kind {
            BiquadFilterType::Lowpass => (
                (1.0 - cos_w0) / 2.0,
                1.0 - cos_w0,
                (1.0 - cos_w0) / 2.0,
                1.0 + alpha_q_db,
                -2.0 * cos_w0,
                1.0 - alpha_q_db,
            ),
            BiquadFilterType::Highpass => (
                (1.0 + cos_w0) / 2.0,
                -(1.0 + cos_w0),
                (1.0 + cos_w0) / 2.0,
                1.0 + alpha_q_db,
                -2.0 * cos_w0,
                1.0 - alpha_q_db,
            ),
            BiquadFilterType::Bandpass => (
                alpha_q,
                0.0,
                -alpha_q,
                1.0 + alpha_q,
                -2.0 * cos_w0,
                1.0 - alpha_q,
            ),
            BiquadFilterType::Notch => (
                1.0,
                -2.0 * cos_w0,
                1.0,
                1.0 + alpha_q,
                -2.0 * cos_w0,
                1.0 - alpha_q,
            ),
            BiquadFilterType::Allpass => (
                1.0 - alpha_q,
                -2.0 * cos_w0,
                1.0 + alpha_q,
                1.0 + alpha_q,
                -2.0 * cos_w0,
                1.0 - alpha_q,
            ),
            BiquadFilterType::Peaking => (
                1.0 + alpha_q * a,
                -2.0 * cos_w0,
                1.0 - alpha_q * a,
                1.0 + alpha_q / a,
                -2.0 * cos_w0,
                1.0 - alpha_q / a,
            ),
            BiquadFilterType::Lowshelf => (
                a * ((a + 1.0) - (a - 1.0) * cos_w0 + beta),
                2.0 * a * ((a - 1.0) - (a + 1.0) * cos_w0),
                a * ((a + 1.0) - (a - 1.0) * cos_w0 - beta),
                (a + 1.0) + (a - 1.0) * cos_w0 + beta,
                -2.0 * ((a - 1.0) + (a + 1.0) * cos_w0),
                (a + 1.0) + (a - 1.0) * cos_w0 - beta,
            ),
            BiquadFilterType::Highshelf => (
                a * ((a + 1.0) + (a - 1.0) * cos_w0 + beta),
                -2.0 * a * ((a - 1.0) + (a + 1.0) * cos_w0),
                a * ((a + 1.0) + (a - 1.0) * cos_w0 - beta),
                (a + 1.0) - (a - 1.0) * cos_w0 + beta,
                2.0 * ((a - 1.0) - (a + 1.0) * cos_w0),
                (a + 1.0) - (a - 1.0) * cos_w0 - beta,
            ),
        };

        if a0.abs() < f32::EPSILON {
            return Self::IDENTITY;
        }

        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
        }
    }

    /// Magnitude response at `frequency`
    pub(crate) fn magnitude(&self, sample_rate: f32, frequency: f32) -> f32 {
        let w = 2.0 * std::f32::consts::PI * frequency / sample_rate;
        let (s1, c1) = w.sin_cos();
        let (s2, c2) = (2.0 * w).sin_cos();
        let num_re = self.b0 + self.b1 * c1 + self.b2 * c2;
        let num_im = -(self.b1 * s1 + self.b2 * s2);
        let den_re = 1.0 + self.a1 * c1 + self.a2 * c2;
        let den_im = -(self.a1 * s1 + self.a2 * s2);
        (num_re.hypot(num_im)) / den_re.hypot(den_im)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ChannelState {
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
}

struct BiquadProcessor {
    kind: BiquadFilterType,
    target: Coefficients,
    active: Coefficients,
    /// (frequency, q, gain, kind) the target was computed from
    computed_for: Option<(f32, f32, f32, BiquadFilterType)>,
    state: [ChannelState; MAX_CHANNELS],
}

impl BiquadProcessor {
    fn new() -> Self {
        Self {
            kind: BiquadFilterType::default(),
            target: Coefficients::IDENTITY,
            active: Coefficients::IDENTITY,
            computed_for: None,
            state: [ChannelState::default(); MAX_CHANNELS],
        }
    }

    #[inline]
    fn smooth(&mut self) {
        let t = self.target;
        let c = &mut self.active;
        c.b0 += SMOOTH_COEFF * (t.b0 - c.b0);
        c.b1 += SMOOTH_COEFF * (t.b1 - c.b1);
        c.b2 += SMOOTH_COEFF * (t.b2 - c.b2);
        c.a1 += SMOOTH_COEFF * (t.a1 - c.a1);
        c.a2 += SMOOTH_COEFF * (t.a2 - c.a2);
    }
}

impl Processor for BiquadProcessor {
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

        let key = (params.first(0), params.first(1), params.first(2), self.kind);
        if self.computed_for != Some(key) {
            self.target = Coefficients::compute(key.3, scope.sample_rate, key.0, key.1, key.2);
            // The first configuration applies immediately
            if self.computed_for.is_none() {
                self.active = self.target;
            }
            self.computed_for = Some(key);
        }

        let channels = input.channel_count();
        output.set_channel_count(channels);
        let settled = self.active == self.target;

        for n in 0..crate::block::RENDER_QUANTUM {
            if !settled {
                self.smooth();
            }
            let c = self.active;
            for ch in 0..channels {
                let x = input.channel(ch)[n];
                let s = &mut self.state[ch];
                let mut y = c.b0 * x + c.b1 * s.x1 + c.b2 * s.x2 - c.a1 * s.y1 - c.a2 * s.y2;
                // Flush denormals
                if y.abs() < 1e-15 {
                    y = 0.0;
                }
                s.x2 = s.x1;
                s.x1 = x;
                s.y2 = s.y1;
                s.y1 = y;
                output.channel_mut(ch)[n] = y;
            }
        }
    }

    fn handle_message(&mut self, message: NodeMessage) {
        if let NodeMessage::SetFilterType(kind) = message {
            self.kind = kind;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: f32 = 48000.0;

    #[test]
    fn flat_peaking_is_identity() {
        let c = Coefficients::compute(BiquadFilterType::Peaking, SR, 1000.0, 1.0, 0.0);
        assert!((c.magnitude(SR, 1000.0) - 1.0).abs() < 1e-4);
        assert!((c.magnitude(SR, 100.0) - 1.0).abs() < 1e-4);
    }

    #[test]
    fn peaking_boost_hits_gain_at_center() {
        let c = Coefficients::compute(BiquadFilterType::Peaking, SR, 1000.0, 1.0, 6.0);
        let db = 20.0 * c.magnitude(SR, 1000.0).log10();
        assert!((db - 6.0).abs() < 0.1, "got {db} dB");
    }

    #[test]
    fn lowshelf_boosts_lows_only() {
        let c = Coefficients::compute(BiquadFilterType::Lowshelf, SR, 60.0, 0.7, 6.0);
        let low = 20.0 * c.magnitude(SR, 10.0).log10();
        let high = 20.0 * c.magnitude(SR, 5000.0).log10();
        assert!((low - 6.0).abs() < 0.5);
        assert!(high.abs() < 0.5);
    }

    #[test]
    fn lowpass_attenuates_above_cutoff() {
        let c = Coefficients::compute(BiquadFilterType::Lowpass, SR, 1000.0, 0.7, 0.0);
        assert!(c.magnitude(SR, 100.0) > 0.95);
        assert!(c.magnitude(SR, 10000.0) < 0.05);
    }

    #[test]
    fn allpass_is_flat() {
        let c = Coefficients::compute(BiquadFilterType::Allpass, SR, 556.0, 1.0, 0.0);
        for f in [50.0, 556.0, 5000.0] {
            assert!((c.magnitude(SR, f) - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn zero_sample_rate_yields_identity() {
        let c = Coefficients::compute(BiquadFilterType::Highshelf, 0.0, 8000.0, 0.7, 6.0);
        assert_eq!(c, Coefficients::IDENTITY);
    }
}
