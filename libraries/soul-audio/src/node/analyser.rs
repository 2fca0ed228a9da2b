//! Spectrum analyser tap
//!
//! The render side copies the down-mixed input into a shared ring (skipping
//! the copy when the control side holds the lock) and passes audio through
//! unchanged. Windowing, FFT and smoothing happen on the caller's thread.

use super::{AudioNode, NodeRef};
use crate::block::{AudioBlock, ChannelCountMode};
use crate::context::ContextShared;
use crate::error::{AudioError, Result};
use crate::render::{ParamBlock, Processor, RenderScope};
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::f32::consts::TAU;
use std::sync::{Arc, Mutex, PoisonError};

pub const DEFAULT_FFT_SIZE: usize = 256;
const MIN_FFT_SIZE: usize = 32;
const MAX_FFT_SIZE: usize = 32768;

const DEFAULT_SMOOTHING: f32 = 0.8;
const DEFAULT_MIN_DB: f32 = -100.0;
const DEFAULT_MAX_DB: f32 = -30.0;

/// Most recent input samples, sized for the largest FFT
struct Ring {
    samples: Vec<f32>,
    pos: usize,
}

impl Ring {
    fn push(&mut self, frames: &[f32]) {
        let len = self.samples.len();
        for &s in frames {
            self.samples[self.pos] = s;
            self.pos = (self.pos + 1) % len;
        }
    }

    /// Copy the newest `out.len()` samples, oldest first
    fn latest(&self, out: &mut [f32]) {
        let len = self.samples.len();
        let start = (self.pos + len - out.len()) % len;
        for (i, o) in out.iter_mut().enumerate() {
            *o = self.samples[(start + i) % len];
        }
    }
}

struct Spectrum {
    fft_size: usize,
    fft: Arc<dyn Fft<f32>>,
    buffer: Vec<Complex<f32>>,
    window: Vec<f32>,
    time: Vec<f32>,
    /// Smoothed magnitudes carried between calls
    smoothed: Vec<f32>,
    smoothing: f32,
    min_db: f32,
    max_db: f32,
}

impl Spectrum {
    fn new(fft_size: usize) -> Self {
        let fft = FftPlanner::new().plan_fft_forward(fft_size);
        // Blackman window
        let alpha = 0.16_f32;
        let (a0, a1, a2) = ((1.0 - alpha) / 2.0, 0.5, alpha / 2.0);
        let window = (0..fft_size)
            .map(|i| {
                let x = i as f32 / fft_size as f32;
                a0 - a1 * (TAU * x).cos() + a2 * (2.0 * TAU * x).cos()
            })
            .collect();
        Self {
            fft_size,
            fft,
            buffer: vec![Complex::new(0.0, 0.0); fft_size],
            window,
            time: vec![0.0; fft_size],
            smoothed: vec![0.0; fft_size / 2],
            smoothing: DEFAULT_SMOOTHING,
            min_db: DEFAULT_MIN_DB,
            max_db: DEFAULT_MAX_DB,
        }
    }

    fn analyse(&mut self, ring: &Ring) {
        ring.latest(&mut self.time);
        for ((b, &s), &w) in self.buffer.iter_mut().zip(&self.time).zip(&self.window) {
            *b = Complex::new(s * w, 0.0);
        }
        self.fft.process(&mut self.buffer);
        let scale = 1.0 / self.fft_size as f32;
        for (smoothed, bin) in self.smoothed.iter_mut().zip(&self.buffer) {
            let magnitude = bin.norm() * scale;
            *smoothed = self.smoothing * *smoothed + (1.0 - self.smoothing) * magnitude;
            if !smoothed.is_finite() {
                *smoothed = 0.0;
            }
        }
    }
}

/// Real-time spectrum and waveform tap
#[derive(Clone)]
pub struct AnalyserNode {
    node: NodeRef,
    ring: Arc<Mutex<Ring>>,
    spectrum: Arc<Mutex<Spectrum>>,
}

impl std::fmt::Debug for AnalyserNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalyserNode")
            .field("node", &self.node)
            .field("fft_size", &self.fft_size())
            .finish()
    }
}

impl AnalyserNode {
    pub(crate) fn new(context: &Arc<ContextShared>) -> Result<Self> {
        let ring = Arc::new(Mutex::new(Ring {
            samples: vec![0.0; MAX_FFT_SIZE],
            pos: 0,
        }));
        let (node, []) = context.register(
            Box::new(AnalyserProcessor {
                ring: Arc::clone(&ring),
            }),
            vec![ChannelCountMode::Max],
            vec![1],
            [],
        )?;
        Ok(Self {
            node,
            ring,
            spectrum: Arc::new(Mutex::new(Spectrum::new(DEFAULT_FFT_SIZE))),
        })
    }

    pub fn fft_size(&self) -> usize {
        self.spectrum
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .fft_size
    }

    /// Power of two between 32 and 32768
    pub fn set_fft_size(&self, fft_size: usize) -> Result<()> {
        if !fft_size.is_power_of_two() || !(MIN_FFT_SIZE..=MAX_FFT_SIZE).contains(&fft_size) {
            return Err(AudioError::InvalidState(format!(
                "fft size {fft_size} is not a power of two in {MIN_FFT_SIZE}..={MAX_FFT_SIZE}"
            )));
        }
        let mut spectrum = self.spectrum.lock().unwrap_or_else(PoisonError::into_inner);
        let (smoothing, min_db, max_db) = (spectrum.smoothing, spectrum.min_db, spectrum.max_db);
        *spectrum = Spectrum::new(fft_size);
        spectrum.smoothing = smoothing;
        spectrum.min_db = min_db;
        spectrum.max_db = max_db;
        Ok(())
    }

    pub fn frequency_bin_count(&self) -> usize {
        self.fft_size() / 2
    }

    pub fn smoothing_time_constant(&self) -> f32 {
        self.spectrum
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .smoothing
    }

    pub fn set_smoothing_time_constant(&self, value: f32) {
        self.spectrum
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .smoothing = value.clamp(0.0, 1.0);
    }

    /// Decibel range mapped onto 0..=255 by [`Self::get_byte_frequency_data`]
    pub fn set_decibel_range(&self, min_db: f32, max_db: f32) -> Result<()> {
        if min_db >= max_db {
            return Err(AudioError::InvalidState(format!(
                "min decibels {min_db} must be below max decibels {max_db}"
            )));
        }
        let mut spectrum = self.spectrum.lock().unwrap_or_else(PoisonError::into_inner);
        spectrum.min_db = min_db;
        spectrum.max_db = max_db;
        Ok(())
    }

    /// Latest waveform, oldest sample first
    pub fn get_float_time_domain_data(&self, out: &mut [f32]) {
        let size = self.fft_size().min(out.len());
        let ring = self.ring.lock().unwrap_or_else(PoisonError::into_inner);
        ring.latest(&mut out[..size]);
    }

    /// Smoothed magnitude spectrum in dB
    pub fn get_float_frequency_data(&self, out: &mut [f32]) {
        let mut spectrum = self.spectrum.lock().unwrap_or_else(PoisonError::into_inner);
        {
            let ring = self.ring.lock().unwrap_or_else(PoisonError::into_inner);
            spectrum.analyse(&ring);
        }
        for (o, &m) in out.iter_mut().zip(&spectrum.smoothed) {
            *o = 20.0 * m.max(f32::MIN_POSITIVE).log10();
        }
    }

    /// Smoothed magnitude spectrum scaled into the decibel range
    pub fn get_byte_frequency_data(&self, out: &mut [u8]) {
        let mut spectrum = self.spectrum.lock().unwrap_or_else(PoisonError::into_inner);
        {
            let ring = self.ring.lock().unwrap_or_else(PoisonError::into_inner);
            spectrum.analyse(&ring);
        }
        let (min_db, range) = (spectrum.min_db, spectrum.max_db - spectrum.min_db);
        for (o, &m) in out.iter_mut().zip(&spectrum.smoothed) {
            let db = 20.0 * m.max(f32::MIN_POSITIVE).log10();
            *o = (255.0 * (db - min_db) / range).clamp(0.0, 255.0) as u8;
        }
    }
}

impl AudioNode for AnalyserNode {
    fn node_ref(&self) -> &NodeRef {
        &self.node
    }
}

struct AnalyserProcessor {
    ring: Arc<Mutex<Ring>>,
}

impl Processor for AnalyserProcessor {
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
        output.copy_from(input);

        // Never wait on the control side; a skipped quantum only costs display detail
        if let Ok(mut ring) = self.ring.try_lock() {
            let mut mono = [0.0_f32; crate::block::RENDER_QUANTUM];
            for (n, s) in mono.iter_mut().enumerate() {
                *s = input.mono_sample(n);
            }
            ring.push(&mono);
        }
    }
}
