//! Convolution node for impulse-response reverb
//!
//! Uses uniformly partitioned overlap-save convolution: the impulse response
//! is cut into quantum-sized partitions whose spectra are computed once on the
//! control thread, and each render quantum costs one forward FFT, one complex
//! multiply-accumulate per partition and one inverse FFT per channel.
//!
//! Without an impulse response the node outputs silence.

use super::{AudioNode, NodeMessage, NodeRef};
use crate::block::{AudioBlock, ChannelCountMode, RENDER_QUANTUM};
use crate::buffer::AudioBuffer;
use crate::context::ContextShared;
use crate::error::{AudioError, Result};
use crate::render::{ParamBlock, Processor, RenderScope};
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// FFT length: one quantum of history plus one quantum of new input
const FFT_SIZE: usize = RENDER_QUANTUM * 2;

/// Output channels the convolver produces at most
const CONVOLVER_CHANNELS: usize = 2;

// Loudness calibration applied when normalizing impulse responses
const GAIN_CALIBRATION_DB: f32 = -58.0;
const GAIN_CALIBRATION_SAMPLE_RATE: f32 = 44100.0;
const MIN_POWER: f32 = 0.000125;

/// Convolver handle
#[derive(Debug, Clone)]
pub struct ConvolverNode {
    node: NodeRef,
    sample_rate: u32,
    buffer: Arc<Mutex<Option<Arc<AudioBuffer>>>>,
    normalize: Arc<AtomicBool>,
}

impl ConvolverNode {
    pub(crate) fn new(context: &Arc<ContextShared>) -> Result<Self> {
        let (node, []) = context.register(
            Box::new(ConvolverProcessor { kernel: None }),
            vec![ChannelCountMode::ClampedMax(CONVOLVER_CHANNELS)],
            vec![CONVOLVER_CHANNELS],
            [],
        )?;
        Ok(Self {
            node,
            sample_rate: context.sample_rate(),
            buffer: Arc::new(Mutex::new(None)),
            normalize: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn buffer(&self) -> Option<Arc<AudioBuffer>> {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Install an impulse response, or remove it with `None`
    ///
    /// The buffer must be mono or stereo and at the context's sample rate.
    pub fn set_buffer(&self, buffer: Option<Arc<AudioBuffer>>) -> Result<()> {
        let kernel = match &buffer {
            Some(ir) => {
                if ir.sample_rate() != self.sample_rate {
                    return Err(AudioError::InvalidBuffer(format!(
                        "impulse response at {} Hz in a {} Hz context",
                        ir.sample_rate(),
                        self.sample_rate
                    )));
                }
                Some(Box::new(ConvolutionKernel::new(
                    ir,
                    self.normalize.load(Ordering::Relaxed),
                )?))
            }
            None => None,
        };

        *self.buffer.lock().unwrap_or_else(PoisonError::into_inner) = buffer;
        self.node.send(NodeMessage::SetKernel(kernel));
        Ok(())
    }

    pub fn normalize(&self) -> bool {
        self.normalize.load(Ordering::Relaxed)
    }

    /// Applies to buffers installed afterwards
    pub fn set_normalize(&self, normalize: bool) {
        self.normalize.store(normalize, Ordering::Relaxed);
    }
}

impl AudioNode for ConvolverNode {
    fn node_ref(&self) -> &NodeRef {
        &self.node
    }
}

/// Prepared impulse response plus the running convolution state
pub(crate) struct ConvolutionKernel {
    /// Partition spectra per impulse-response channel
    partitions: Vec<Vec<Vec<Complex<f32>>>>,
    fft: Arc<dyn Fft<f32>>,
    ifft: Arc<dyn Fft<f32>>,
    scale: f32,
    history: [[f32; RENDER_QUANTUM]; CONVOLVER_CHANNELS],
    /// Frequency-domain delay line of past input spectra, per output channel
    fdl: [Vec<Vec<Complex<f32>>>; CONVOLVER_CHANNELS],
    fdl_pos: usize,
    work: Vec<Complex<f32>>,
    acc: Vec<Complex<f32>>,
    fft_scratch: Vec<Complex<f32>>,
}

impl ConvolutionKernel {
    pub(crate) fn new(ir: &AudioBuffer, normalize: bool) -> Result<Self> {
        let channels = ir.number_of_channels();
        if channels == 0 || channels > 2 {
            return Err(AudioError::InvalidBuffer(format!(
                "impulse response must be mono or stereo, got {channels} channels"
            )));
        }
        let length = ir.length();
        if length == 0 {
            return Err(AudioError::InvalidBuffer("empty impulse response".into()));
        }

        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(FFT_SIZE);
        let ifft = planner.plan_fft_inverse(FFT_SIZE);
        let scratch_len = fft
            .get_inplace_scratch_len()
            .max(ifft.get_inplace_scratch_len());
        let mut fft_scratch = vec![Complex::new(0.0, 0.0); scratch_len];

        let count = length.div_ceil(RENDER_QUANTUM);
        let partitions: Vec<Vec<Vec<Complex<f32>>>> = (0..channels)
            .map(|ch| {
                let samples = ir.channel(ch);
                samples
                    .chunks(RENDER_QUANTUM)
                    .map(|chunk| {
                        let mut spectrum = vec![Complex::new(0.0, 0.0); FFT_SIZE];
                        for (slot, &s) in spectrum.iter_mut().zip(chunk) {
                            *slot = Complex::new(s, 0.0);
                        }
                        fft.process_with_scratch(&mut spectrum, &mut fft_scratch);
                        spectrum
                    })
                    .collect()
            })
            .collect();

        let scale = if normalize {
            normalization_scale(ir)
        } else {
            1.0
        };

        debug!(
            channels,
            frames = length,
            partitions = count,
            scale,
            "Prepared convolution kernel"
        );

        let empty_fdl = || vec![vec![Complex::new(0.0, 0.0); FFT_SIZE]; count];
        Ok(Self {
            partitions,
            fft,
            ifft,
            scale: scale / FFT_SIZE as f32,
            history: [[0.0; RENDER_QUANTUM]; CONVOLVER_CHANNELS],
            fdl: [empty_fdl(), empty_fdl()],
            fdl_pos: 0,
            work: vec![Complex::new(0.0, 0.0); FFT_SIZE],
            acc: vec![Complex::new(0.0, 0.0); FFT_SIZE],
            fft_scratch,
        })
    }

    fn process(&mut self, input: &AudioBlock, output: &mut AudioBlock) {
        let in_channels = input.channel_count().min(CONVOLVER_CHANNELS);
        let out_channels = in_channels.max(self.partitions.len()).min(CONVOLVER_CHANNELS);
        let count = self.partitions[0].len();
        output.set_channel_count(out_channels);

        for ch in 0..out_channels {
            let x = input.channel(ch.min(in_channels - 1));
            let ir = &self.partitions[ch.min(self.partitions.len() - 1)];

            for i in 0..RENDER_QUANTUM {
                self.work[i] = Complex::new(self.history[ch][i], 0.0);
                self.work[RENDER_QUANTUM + i] = Complex::new(x[i], 0.0);
            }
            self.history[ch].copy_from_slice(x);
            self.fft
                .process_with_scratch(&mut self.work, &mut self.fft_scratch);
            self.fdl[ch][self.fdl_pos].copy_from_slice(&self.work);

            self.acc.fill(Complex::new(0.0, 0.0));
            for (p, h) in ir.iter().enumerate() {
                let past = &self.fdl[ch][(self.fdl_pos + count - p) % count];
                for ((a, x), h) in self.acc.iter_mut().zip(past.iter()).zip(h.iter()) {
                    *a += x * h;
                }
            }
            self.ifft
                .process_with_scratch(&mut self.acc, &mut self.fft_scratch);

            let out = output.channel_mut(ch);
            for (o, y) in out.iter_mut().zip(&self.acc[RENDER_QUANTUM..]) {
                *o = y.re * self.scale;
            }
        }

        self.fdl_pos = (self.fdl_pos + 1) % count;
    }
}

/// Gain that brings impulse responses of different energy to a common level
fn normalization_scale(ir: &AudioBuffer) -> f32 {
    let channels = ir.number_of_channels();
    let length = ir.length();
    let energy: f32 = (0..channels)
        .map(|ch| ir.channel(ch).iter().map(|s| s * s).sum::<f32>())
        .sum();
    let mut power = (energy / (channels * length) as f32).sqrt();
    if !power.is_finite() || power < MIN_POWER {
        power = MIN_POWER;
    }
    let mut scale = 1.0 / power;
    scale *= 10.0_f32.powf(GAIN_CALIBRATION_DB * 0.05);
    scale *= GAIN_CALIBRATION_SAMPLE_RATE / ir.sample_rate() as f32;
    scale
}

struct ConvolverProcessor {
    kernel: Option<Box<ConvolutionKernel>>,
}

impl Processor for ConvolverProcessor {
    fn process(
        &mut self,
        _scope: &RenderScope,
        inputs: &[AudioBlock],
        outputs: &mut [AudioBlock],
        _params: &ParamBlock<'_>,
    ) {
        let (Some(input), Some(output)) = (inputs.first(), outputs.first_mut()) else {
            return;
        };
        match self.kernel.as_mut() {
            Some(kernel) => kernel.process(input, output),
            None => {
                output.set_channel_count(CONVOLVER_CHANNELS);
                output.silence();
            }
        }
    }

    fn handle_message(&mut self, message: NodeMessage) {
        if let NodeMessage::SetKernel(kernel) = message {
            self.kernel = kernel;
        }
    }
}
