use super::{AudioNode, NodeRef};
use crate::block::{AudioBlock, ChannelCountMode, RENDER_QUANTUM};
use crate::context::ContextShared;
use crate::error::{AudioError, Result};
use crate::param::{AudioParam, ParamSpec};
use crate::render::{ParamBlock, Processor, RenderScope};
use std::sync::Arc;

/// Channels a delay line keeps history for
const DELAY_CHANNELS: usize = 2;

/// Variable delay line
///
/// When the node sits on a feedback cycle the renderer turns it into a
/// cycle breaker and its delay can no longer go below one render quantum.
#[derive(Debug, Clone)]
pub struct DelayNode {
    node: NodeRef,
    delay_time: AudioParam,
    max_delay_time: f64,
}

impl DelayNode {
    pub(crate) fn new(context: &Arc<ContextShared>, max_delay_time: f64) -> Result<Self> {
        if !(max_delay_time > 0.0 && max_delay_time < 180.0) {
            return Err(AudioError::InvalidState(format!(
                "max delay time {max_delay_time} s out of range"
            )));
        }
        let sample_rate = context.sample_rate();
        let (node, [delay_time]) = context.register(
            Box::new(DelayProcessor::new(sample_rate, max_delay_time)),
            vec![ChannelCountMode::ClampedMax(DELAY_CHANNELS)],
            vec![1],
            [ParamSpec::new("delayTime", 0.0, 0.0, max_delay_time as f32)],
        )?;
        Ok(Self {
            node,
            delay_time,
            max_delay_time,
        })
    }

    /// Delay in seconds
    pub fn delay_time(&self) -> &AudioParam {
        &self.delay_time
    }

    pub fn max_delay_time(&self) -> f64 {
        self.max_delay_time
    }
}

impl AudioNode for DelayNode {
    fn node_ref(&self) -> &NodeRef {
        &self.node
    }
}

struct DelayProcessor {
    lines: [Vec<f32>; DELAY_CHANNELS],
    /// Ring position of frame 0 of the current quantum
    write_pos: usize,
    max_frames: f32,
    channels: usize,
    cycle_breaker: bool,
}

impl DelayProcessor {
    fn new(sample_rate: u32, max_delay_time: f64) -> Self {
        let max_frames = (max_delay_time * f64::from(sample_rate)).ceil() as usize;
        // Room for the longest delay plus one quantum of writes ahead of the reader
        let len = max_frames + RENDER_QUANTUM * 2 + 2;
        Self {
            lines: [vec![0.0; len], vec![0.0; len]],
            write_pos: 0,
            max_frames: max_frames as f32,
            channels: 1,
            cycle_breaker: false,
        }
    }

    fn len(&self) -> usize {
        self.lines[0].len()
    }

    /// Linear-interpolated read `delay` frames behind absolute ring index `at`
    #[inline]
    fn read(&self, ch: usize, at: usize, delay: f32) -> f32 {
        let len = self.len();
        let whole = delay.floor();
        let frac = delay - whole;
        let back = whole as usize;
        let i0 = (at + len - back % len) % len;
        let i1 = (i0 + len - 1) % len;
        let line = &self.lines[ch];
        line[i0] * (1.0 - frac) + line[i1] * frac
    }

    fn write_block(&mut self, input: &AudioBlock) {
        let len = self.len();
        self.channels = input.channel_count().min(DELAY_CHANNELS);
        for ch in 0..DELAY_CHANNELS {
            let src = input.channel(ch.min(self.channels - 1));
            for (n, &s) in src.iter().enumerate() {
                self.lines[ch][(self.write_pos + n) % len] = s;
            }
        }
    }
}

impl Processor for DelayProcessor {
    fn process(
        &mut self,
        scope: &RenderScope,
        inputs: &[AudioBlock],
        outputs: &mut [AudioBlock],
        params: &ParamBlock<'_>,
    ) {
        let Some(output) = outputs.first_mut() else {
            return;
        };
        let delay_times = params.values(0);
        let min_frames = if self.cycle_breaker {
            RENDER_QUANTUM as f32
        } else {
            0.0
        };

        if !self.cycle_breaker {
            if let Some(input) = inputs.first() {
                self.write_block(input);
            }
        }

        let len = self.len();
        output.set_channel_count(self.channels);
        for n in 0..RENDER_QUANTUM {
            let delay = (delay_times[n] * scope.sample_rate).clamp(min_frames, self.max_frames);
            let at = (self.write_pos + n) % len;
            for ch in 0..self.channels {
                output.channel_mut(ch)[n] = self.read(ch, at, delay);
            }
        }

        if !self.cycle_breaker {
            self.write_pos = (self.write_pos + RENDER_QUANTUM) % len;
        }
    }

    fn set_cycle_breaker(&mut self, in_cycle: bool) -> bool {
        self.cycle_breaker = in_cycle;
        true
    }

    fn deferred_input(&mut self, inputs: &[AudioBlock]) {
        if let Some(input) = inputs.first() {
            self.write_block(input);
        }
        self.write_pos = (self.write_pos + RENDER_QUANTUM) % self.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::ParamSlot;

    fn run(processor: &mut DelayProcessor, input: &AudioBlock, delay_s: f32) -> AudioBlock {
        let scope = RenderScope {
            sample_rate: 48000.0,
            frame: 0,
            time: 0.0,
        };
        let slots = vec![Some(ParamSlot::constant(delay_s))];
        let ids = [0usize];
        let params = ParamBlock::for_test(&ids, &slots);
        let mut outputs = [AudioBlock::new(1)];
        processor.process(&scope, std::slice::from_ref(input), &mut outputs, &params);
        outputs[0].clone()
    }

    #[test]
    fn zero_delay_passes_through() {
        let mut p = DelayProcessor::new(48000, 1.0);
        let mut input = AudioBlock::new(1);
        input.channel_mut(0)[5] = 1.0;

        let out = run(&mut p, &input, 0.0);
        assert_eq!(out.channel(0)[5], 1.0);
    }

    #[test]
    fn impulse_reappears_after_delay() {
        let mut p = DelayProcessor::new(48000, 1.0);
        let mut input = AudioBlock::new(1);
        input.channel_mut(0)[0] = 1.0;
        // 10 frames at 48 kHz
        let delay = 10.0 / 48000.0;

        let out = run(&mut p, &input, delay);
        assert!((out.channel(0)[10] - 1.0).abs() < 1e-4);
        assert!(out.channel(0)[9].abs() < 1e-4);
    }

    #[test]
    fn cycle_breaker_reads_before_writing() {
        let mut p = DelayProcessor::new(48000, 1.0);
        assert!(p.set_cycle_breaker(true));
        let mut input = AudioBlock::new(1);
        input.channel_mut(0)[0] = 1.0;

        // Requested delay below one quantum is clamped to 128 frames
        let first = run(&mut p, &AudioBlock::new(1), 0.0);
        assert!(first.is_silent());
        p.deferred_input(std::slice::from_ref(&input));

        let second = run(&mut p, &AudioBlock::new(1), 0.0);
        assert!((second.channel(0)[0] - 1.0).abs() < 1e-4);
    }
}
