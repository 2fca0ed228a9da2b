//! Positional panner
//!
//! The listener sits at the origin facing −Z with +Y up. Sources are placed
//! with the position params; the node derives azimuth and distance once per
//! render quantum and interpolates its ear gains across the quantum.

use super::{AudioNode, NodeMessage, NodeRef};
use crate::block::{AudioBlock, ChannelCountMode, RENDER_QUANTUM};
use crate::context::ContextShared;
use crate::error::Result;
use crate::param::{AudioParam, ParamSpec};
use crate::render::{ParamBlock, Processor, RenderScope};
use std::f32::consts::{FRAC_PI_2, PI};
use std::sync::{Arc, Mutex, PoisonError};

const REF_DISTANCE: f32 = 1.0;
const MAX_DISTANCE: f32 = 10_000.0;
const ROLLOFF_FACTOR: f32 = 1.0;

/// Largest interaural time difference, roughly a 8.75 cm head radius
const MAX_ITD_S: f32 = 0.00066;
const ITD_LINE: usize = 64;

/// Far-ear cutoff when the source is fully to one side
const SHADOW_CUTOFF_HZ: f32 = 1800.0;
const OPEN_CUTOFF_HZ: f32 = 20_000.0;
/// Extra darkening for sources behind the listener
const BEHIND_CUTOFF_HZ: f32 = 6000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PanningModel {
    EqualPower,
    /// Approximate head model: interaural delay, head shadow and front/back
    /// darkening on top of equal-power gains
    #[default]
    Hrtf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistanceModel {
    Linear,
    #[default]
    Inverse,
    Exponential,
}

impl DistanceModel {
    /// Attenuation for a source `distance` units from the listener
    pub fn gain(self, distance: f32) -> f32 {
        match self {
            Self::Linear => {
                let d = distance.clamp(REF_DISTANCE, MAX_DISTANCE);
                1.0 - ROLLOFF_FACTOR * (d - REF_DISTANCE) / (MAX_DISTANCE - REF_DISTANCE)
            }
            Self::Inverse => {
                let d = distance.max(REF_DISTANCE);
                REF_DISTANCE / (REF_DISTANCE + ROLLOFF_FACTOR * (d - REF_DISTANCE))
            }
            Self::Exponential => {
                let d = distance.max(REF_DISTANCE);
                (d / REF_DISTANCE).powf(-ROLLOFF_FACTOR)
            }
        }
    }
}

/// Places a source in 3D space around a fixed listener
#[derive(Debug, Clone)]
pub struct PannerNode {
    node: NodeRef,
    position_x: AudioParam,
    position_y: AudioParam,
    position_z: AudioParam,
    orientation_x: AudioParam,
    orientation_y: AudioParam,
    orientation_z: AudioParam,
    models: Arc<Mutex<(PanningModel, DistanceModel)>>,
}

impl PannerNode {
    pub(crate) fn new(context: &Arc<ContextShared>) -> Result<Self> {
        let (node, [px, py, pz, ox, oy, oz]) = context.register(
            Box::new(PannerProcessor::new(context.sample_rate())),
            vec![ChannelCountMode::ClampedMax(2)],
            vec![2],
            [
                ParamSpec::unbounded("positionX", 0.0),
                ParamSpec::unbounded("positionY", 0.0),
                ParamSpec::unbounded("positionZ", 0.0),
                ParamSpec::unbounded("orientationX", 1.0),
                ParamSpec::unbounded("orientationY", 0.0),
                ParamSpec::unbounded("orientationZ", 0.0),
            ],
        )?;
        Ok(Self {
            node,
            position_x: px,
            position_y: py,
            position_z: pz,
            orientation_x: ox,
            orientation_y: oy,
            orientation_z: oz,
            models: Arc::new(Mutex::new((PanningModel::default(), DistanceModel::default()))),
        })
    }

    pub fn position_x(&self) -> &AudioParam {
        &self.position_x
    }

    pub fn position_y(&self) -> &AudioParam {
        &self.position_y
    }

    pub fn position_z(&self) -> &AudioParam {
        &self.position_z
    }

    /// Source orientation; only meaningful with sound cones, which this
    /// panner does not model
    pub fn orientation_x(&self) -> &AudioParam {
        &self.orientation_x
    }

    pub fn orientation_y(&self) -> &AudioParam {
        &self.orientation_y
    }

    pub fn orientation_z(&self) -> &AudioParam {
        &self.orientation_z
    }

    /// Move the source immediately
    pub fn set_position(&self, x: f32, y: f32, z: f32) {
        self.position_x.set_value(x);
        self.position_y.set_value(y);
        self.position_z.set_value(z);
    }

    /// Point the source, immediately
    pub fn set_orientation(&self, x: f32, y: f32, z: f32) {
        self.orientation_x.set_value(x);
        self.orientation_y.set_value(y);
        self.orientation_z.set_value(z);
    }

    pub fn panning_model(&self) -> PanningModel {
        self.models.lock().unwrap_or_else(PoisonError::into_inner).0
    }

    pub fn set_panning_model(&self, model: PanningModel) {
        self.models.lock().unwrap_or_else(PoisonError::into_inner).0 = model;
        self.node.send(NodeMessage::SetPanningModel(model));
    }

    pub fn distance_model(&self) -> DistanceModel {
        self.models.lock().unwrap_or_else(PoisonError::into_inner).1
    }

    pub fn set_distance_model(&self, model: DistanceModel) {
        self.models.lock().unwrap_or_else(PoisonError::into_inner).1 = model;
        self.node.send(NodeMessage::SetDistanceModel(model));
    }
}

impl AudioNode for PannerNode {
    fn node_ref(&self) -> &NodeRef {
        &self.node
    }
}

/// Azimuth in degrees (positive to the right, 0 straight ahead, ±180 behind)
/// and distance of a source relative to the listener
fn azimuth_and_distance(x: f32, y: f32, z: f32) -> (f32, f32) {
    let distance = (x * x + y * y + z * z).sqrt();
    let horizontal = (x * x + z * z).sqrt();
    if horizontal < 1e-6 {
        return (0.0, distance);
    }
    // Right = +X, forward = −Z
    let azimuth = x.atan2(-z).to_degrees();
    (azimuth, distance)
}

/// Equal-power ear gains for a mono source at `azimuth` degrees
fn equal_power_gains(azimuth: f32) -> (f32, f32) {
    // Fold the rear half onto the front
    let folded = if azimuth < -90.0 {
        -180.0 - azimuth
    } else if azimuth > 90.0 {
        180.0 - azimuth
    } else {
        azimuth
    };
    let x = (folded + 90.0) / 180.0;
    ((x * FRAC_PI_2).cos(), (x * FRAC_PI_2).sin())
}

#[derive(Debug, Clone, Copy, Default)]
struct OnePole {
    state: f32,
}

impl OnePole {
    #[inline]
    fn process(&mut self, x: f32, coeff: f32) -> f32 {
        self.state += coeff * (x - self.state);
        if self.state.abs() < 1e-20 {
            self.state = 0.0;
        }
        self.state
    }
}

fn lowpass_coeff(cutoff: f32, sample_rate: f32) -> f32 {
    1.0 - (-2.0 * PI * cutoff.min(sample_rate * 0.45) / sample_rate).exp()
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct EarState {
    left: f32,
    right: f32,
    left_delay: f32,
    right_delay: f32,
    left_lp: f32,
    right_lp: f32,
}

struct PannerProcessor {
    sample_rate: f32,
    panning: PanningModel,
    distance: DistanceModel,
    previous: Option<EarState>,
    lines: [[f32; ITD_LINE]; 2],
    line_pos: usize,
    filters: [OnePole; 2],
}

impl PannerProcessor {
    fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate: sample_rate as f32,
            panning: PanningModel::default(),
            distance: DistanceModel::default(),
            previous: None,
            lines: [[0.0; ITD_LINE]; 2],
            line_pos: 0,
            filters: [OnePole::default(); 2],
        }
    }

    fn target(&self, azimuth: f32, distance: f32) -> EarState {
        let (gl, gr) = equal_power_gains(azimuth);
        let dist_gain = self.distance.gain(distance);
        let open = lowpass_coeff(OPEN_CUTOFF_HZ, self.sample_rate);
        let mut state = EarState {
            left: gl * dist_gain,
            right: gr * dist_gain,
            left_delay: 0.0,
            right_delay: 0.0,
            left_lp: open,
            right_lp: open,
        };
        if self.panning == PanningModel::Hrtf {
            let side = azimuth.to_radians().sin();
            let itd = (MAX_ITD_S * side.abs() * self.sample_rate).min((ITD_LINE - 2) as f32);
            let behind = (azimuth.abs() - 90.0).max(0.0) / 90.0;
            let near_cutoff = OPEN_CUTOFF_HZ + (BEHIND_CUTOFF_HZ - OPEN_CUTOFF_HZ) * behind;
            let far_cutoff = near_cutoff + (SHADOW_CUTOFF_HZ - near_cutoff) * side.abs();
            let near = lowpass_coeff(near_cutoff, self.sample_rate);
            let far = lowpass_coeff(far_cutoff, self.sample_rate);
            if side >= 0.0 {
                state.left_delay = itd;
                state.left_lp = far;
                state.right_lp = near;
            } else {
                state.right_delay = itd;
                state.right_lp = far;
                state.left_lp = near;
            }
        }
        state
    }

    #[inline]
    fn delayed(&self, ear: usize, delay: f32) -> f32 {
        let whole = delay.floor();
        let frac = delay - whole;
        let i0 = (self.line_pos + ITD_LINE - whole as usize) % ITD_LINE;
        let i1 = (i0 + ITD_LINE - 1) % ITD_LINE;
        self.lines[ear][i0] * (1.0 - frac) + self.lines[ear][i1] * frac
    }
}

impl Processor for PannerProcessor {
    fn process(
        &mut self,
        _scope: &RenderScope,
        inputs: &[AudioBlock],
        outputs: &mut [AudioBlock],
        params: &ParamBlock<'_>,
    ) {
        let (Some(input), Some(output)) = (inputs.first(), outputs.first_mut()) else {
            return;
        };
        let (azimuth, distance) =
            azimuth_and_distance(params.first(0), params.first(1), params.first(2));
        let target = self.target(azimuth, distance);
        let start = self.previous.unwrap_or(target);
        self.previous = Some(target);

        output.set_channel_count(2);
        let stereo = input.channel_count() > 1;
        let step = 1.0 / RENDER_QUANTUM as f32;

        for n in 0..RENDER_QUANTUM {
            let t = (n + 1) as f32 * step;
            let lerp = |a: f32, b: f32| a + (b - a) * t;
            let gl = lerp(start.left, target.left);
            let gr = lerp(start.right, target.right);

            let (l, r) = match self.panning {
                PanningModel::EqualPower if stereo => {
                    // Stereo sources keep both channels and lean toward one side
                    let (sl, sr) = (input.channel(0)[n], input.channel(1)[n]);
                    let folded = equal_power_gains(azimuth);
                    let dist = self.distance.gain(distance);
                    if azimuth <= 0.0 {
                        ((sl + sr * folded.0) * dist, sr * folded.1 * dist)
                    } else {
                        (sl * folded.0 * dist, (sr + sl * folded.1) * dist)
                    }
                }
                PanningModel::EqualPower => {
                    let s = input.channel(0)[n];
                    (s * gl, s * gr)
                }
                PanningModel::Hrtf => {
                    let s = input.mono_sample(n);
                    self.lines[0][self.line_pos] = s * gl;
                    self.lines[1][self.line_pos] = s * gr;
                    let l = self.delayed(0, lerp(start.left_delay, target.left_delay));
                    let r = self.delayed(1, lerp(start.right_delay, target.right_delay));
                    self.line_pos = (self.line_pos + 1) % ITD_LINE;
                    let l = self.filters[0].process(l, lerp(start.left_lp, target.left_lp));
                    let r = self.filters[1].process(r, lerp(start.right_lp, target.right_lp));
                    (l, r)
                }
            };
            output.channel_mut(0)[n] = l;
            output.channel_mut(1)[n] = r;
        }
    }

    fn handle_message(&mut self, message: NodeMessage) {
        match message {
            NodeMessage::SetPanningModel(model) => {
                self.panning = model;
                self.previous = None;
            }
            NodeMessage::SetDistanceModel(model) => self.distance = model,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::ParamSlot;

    fn render(processor: &mut PannerProcessor, position: [f32; 3], quanta: usize) -> AudioBlock {
        let slots: Vec<Option<ParamSlot>> = position
            .iter()
            .chain([1.0, 0.0, 0.0].iter())
            .map(|&v| Some(ParamSlot::constant(v)))
            .collect();
        let ids = [0usize, 1, 2, 3, 4, 5];
        let params = ParamBlock::for_test(&ids, &slots);
        let scope = RenderScope {
            sample_rate: 48000.0,
            frame: 0,
            time: 0.0,
        };
        let mut input = AudioBlock::new(1);
        input.channel_mut(0).fill(0.5);
        let mut outputs = [AudioBlock::new(2)];
        for _ in 0..quanta {
            processor.process(&scope, std::slice::from_ref(&input), &mut outputs, &params);
        }
        outputs[0].clone()
    }

    #[test]
    fn azimuth_follows_listener_axes() {
        assert!((azimuth_and_distance(0.0, 0.0, -1.0).0).abs() < 1e-4);
        assert!((azimuth_and_distance(1.0, 0.0, 0.0).0 - 90.0).abs() < 1e-4);
        assert!((azimuth_and_distance(-1.0, 0.0, 0.0).0 + 90.0).abs() < 1e-4);
        assert!((azimuth_and_distance(0.0, 0.0, 2.0).0.abs() - 180.0).abs() < 1e-4);
        assert!((azimuth_and_distance(3.0, 0.0, 4.0).1 - 5.0).abs() < 1e-5);
    }

    #[test]
    fn equal_power_center_is_balanced() {
        let (l, r) = equal_power_gains(0.0);
        assert!((l - r).abs() < 1e-6);
        assert!((l * l + r * r - 1.0).abs() < 1e-5);
    }

    #[test]
    fn inverse_distance_rolloff() {
        assert_eq!(DistanceModel::Inverse.gain(0.0), 1.0);
        assert!((DistanceModel::Inverse.gain(8.0) - 0.125).abs() < 1e-6);
        assert!((DistanceModel::Exponential.gain(2.0) - 0.5).abs() < 1e-6);
        assert!(DistanceModel::Linear.gain(MAX_DISTANCE) < 1e-6);
    }

    #[test]
    fn source_on_the_right_is_louder_right() {
        let mut p = PannerProcessor::new(48000);
        p.handle_message(NodeMessage::SetPanningModel(PanningModel::EqualPower));
        let out = render(&mut p, [4.0, 0.0, 0.0], 2);
        assert!(out.channel(1)[100] > out.channel(0)[100] * 10.0);
    }

    #[test]
    fn hrtf_delays_the_far_ear() {
        let mut p = PannerProcessor::new(48000);
        let out = render(&mut p, [-1.0, 0.0, -1.0], 1);
        // Left ear hears the onset first
        assert!(out.channel(0)[2].abs() > 0.0);
        assert_eq!(out.channel(1)[2], 0.0);
    }
}
