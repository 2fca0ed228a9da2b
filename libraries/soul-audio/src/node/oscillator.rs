use super::{AudioNode, NodeMessage, NodeRef};
use crate::block::{AudioBlock, RENDER_QUANTUM};
use crate::context::ContextShared;
use crate::error::{AudioError, Result};
use crate::param::{AudioParam, ParamSpec};
use crate::render::{ParamBlock, Processor, RenderScope};
use std::f32::consts::TAU;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OscillatorType {
    #[default]
    Sine,
    Square,
    Sawtooth,
    Triangle,
}

impl OscillatorType {
    /// One sample at `phase` in [0, 1)
    #[inline]
    fn sample(self, phase: f32) -> f32 {
        match self {
            Self::Sine => (phase * TAU).sin(),
            Self::Square => {
                if phase < 0.5 {
                    1.0
                } else {
                    -1.0
                }
            }
            Self::Sawtooth => 2.0 * phase - 1.0,
            Self::Triangle => 1.0 - 4.0 * (phase - 0.5).abs(),
        }
    }
}

/// Periodic waveform source, mostly used as a modulation LFO
///
/// Can be started once and stopped once.
#[derive(Debug, Clone)]
pub struct OscillatorNode {
    node: NodeRef,
    frequency: AudioParam,
    kind: Arc<Mutex<OscillatorType>>,
    started: Arc<AtomicBool>,
}

impl OscillatorNode {
    pub(crate) fn new(context: &Arc<ContextShared>) -> Result<Self> {
        let nyquist = context.sample_rate() as f32 / 2.0;
        let (node, [frequency]) = context.register(
            Box::new(OscillatorProcessor::default()),
            Vec::new(),
            vec![1],
            [ParamSpec::new("frequency", 440.0, -nyquist, nyquist)],
        )?;
        Ok(Self {
            node,
            frequency,
            kind: Arc::new(Mutex::new(OscillatorType::default())),
            started: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Frequency in Hz
    pub fn frequency(&self) -> &AudioParam {
        &self.frequency
    }

    pub fn oscillator_type(&self) -> OscillatorType {
        *self.kind.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_oscillator_type(&self, kind: OscillatorType) {
        *self.kind.lock().unwrap_or_else(PoisonError::into_inner) = kind;
        self.node.send(NodeMessage::SetOscillatorType(kind));
    }

    pub fn start(&self) -> Result<()> {
        self.start_at(0.0)
    }

    /// Start at context time `when`; a time in the past starts immediately
    pub fn start_at(&self, when: f64) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(AudioError::InvalidState("oscillator already started".into()));
        }
        self.node.send(NodeMessage::Start(when.max(0.0)));
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        self.stop_at(0.0)
    }

    pub fn stop_at(&self, when: f64) -> Result<()> {
        if !self.started.load(Ordering::Acquire) {
            return Err(AudioError::InvalidState("oscillator not started".into()));
        }
        self.node.send(NodeMessage::Stop(when.max(0.0)));
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }
}

impl AudioNode for OscillatorNode {
    fn node_ref(&self) -> &NodeRef {
        &self.node
    }
}

#[derive(Default)]
struct OscillatorProcessor {
    kind: OscillatorType,
    phase: f32,
    start: Option<f64>,
    stop: Option<f64>,
}

impl Processor for OscillatorProcessor {
    fn process(
        &mut self,
        scope: &RenderScope,
        _inputs: &[AudioBlock],
        outputs: &mut [AudioBlock],
        params: &ParamBlock<'_>,
    ) {
        let Some(output) = outputs.first_mut() else {
            return;
        };
        output.set_channel_count(1);
        let frequency = params.values(0);
        let dt = 1.0 / f64::from(scope.sample_rate);
        let out = output.channel_mut(0);

        for (n, o) in out.iter_mut().enumerate().take(RENDER_QUANTUM) {
            let t = scope.time + n as f64 * dt;
            let playing = self.start.is_some_and(|s| t >= s) && self.stop.map_or(true, |s| t < s);
            if !playing {
                *o = 0.0;
                continue;
            }
            *o = self.kind.sample(self.phase);
            self.phase += frequency[n] / scope.sample_rate;
            self.phase -= self.phase.floor();
        }
    }

    fn handle_message(&mut self, message: NodeMessage) {
        match message {
            NodeMessage::Start(when) => self.start = Some(when),
            NodeMessage::Stop(when) => self.stop = Some(when),
            NodeMessage::SetOscillatorType(kind) => self.kind = kind,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::ParamSlot;

    fn render(processor: &mut OscillatorProcessor, time: f64, frequency: f32) -> AudioBlock {
        let slots = vec![Some(ParamSlot::constant(frequency))];
        let ids = [0usize];
        let params = ParamBlock::for_test(&ids, &slots);
        let scope = RenderScope {
            sample_rate: 48000.0,
            frame: 0,
            time,
        };
        let mut outputs = [AudioBlock::new(1)];
        processor.process(&scope, &[], &mut outputs, &params);
        outputs[0].clone()
    }

    #[test]
    fn silent_until_started() {
        let mut p = OscillatorProcessor::default();
        assert!(render(&mut p, 0.0, 1000.0).is_silent());

        p.handle_message(NodeMessage::Start(0.0));
        assert!(!render(&mut p, 0.0, 1000.0).is_silent());
    }

    #[test]
    fn stop_silences_afterwards() {
        let mut p = OscillatorProcessor::default();
        p.handle_message(NodeMessage::Start(0.0));
        p.handle_message(NodeMessage::Stop(0.001));
        let out = render(&mut p, 0.0, 1000.0);
        // 0.001 s is 48 frames
        assert!(out.channel(0)[47] != 0.0 || out.channel(0)[46] != 0.0);
        assert!(out.channel(0)[48..].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn waveforms_stay_in_range() {
        for kind in [
            OscillatorType::Sine,
            OscillatorType::Square,
            OscillatorType::Sawtooth,
            OscillatorType::Triangle,
        ] {
            for i in 0..100 {
                let s = kind.sample(i as f32 / 100.0);
                assert!((-1.0..=1.0).contains(&s), "{kind:?} at {i}");
            }
        }
    }
}
