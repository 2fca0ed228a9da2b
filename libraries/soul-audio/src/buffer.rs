//! Decoded, immutable audio data
//!
//! `AudioBuffer` holds planar `f32` samples at a fixed sample rate. Buffers are
//! produced by [`AudioBuffer::decode`] (WAV, via `hound`) and consumed by the
//! convolver and the in-memory media element.

use crate::error::{AudioError, Result};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use std::io::Cursor;
use tracing::debug;

/// Chunk size fed to the resampler when converting decoded data
const RESAMPLE_CHUNK: usize = 1024;

/// Planar audio data
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    sample_rate: u32,
    channels: Vec<Vec<f32>>,
}

impl AudioBuffer {
    /// Create a buffer from planar channel data
    ///
    /// All channels must have the same length and there must be at least one.
    pub fn new(sample_rate: u32, channels: Vec<Vec<f32>>) -> Result<Self> {
        if sample_rate == 0 {
            return Err(AudioError::InvalidBuffer("sample rate must be > 0".into()));
        }
        let Some(first) = channels.first() else {
            return Err(AudioError::InvalidBuffer("no channels".into()));
        };
        let len = first.len();
        if channels.iter().any(|c| c.len() != len) {
            return Err(AudioError::InvalidBuffer(
                "channels have different lengths".into(),
            ));
        }
        Ok(Self {
            sample_rate,
            channels,
        })
    }

    /// Create a buffer from interleaved samples
    pub fn from_interleaved(samples: &[f32], channels: usize, sample_rate: u32) -> Result<Self> {
        if channels == 0 {
            return Err(AudioError::InvalidBuffer("no channels".into()));
        }
        let frames = samples.len() / channels;
        let mut planar = vec![Vec::with_capacity(frames); channels];
        for frame in samples.chunks_exact(channels) {
            for (ch, &s) in frame.iter().enumerate() {
                planar[ch].push(s);
            }
        }
        Self::new(sample_rate, planar)
    }

    /// Decode WAV bytes
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let reader = hound::WavReader::new(Cursor::new(bytes))
            .map_err(|e| AudioError::DecodeError(e.to_string()))?;

        let spec = reader.spec();
        let channels = spec.channels as usize;

        let samples: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .into_samples::<f32>()
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| AudioError::DecodeError(e.to_string()))?,
            hound::SampleFormat::Int => {
                let max_val = (1i64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|s| s as f32 / max_val))
                    .collect::<std::result::Result<_, _>>()
                    .map_err(|e| AudioError::DecodeError(e.to_string()))?
            }
        };

        if samples.is_empty() {
            return Err(AudioError::DecodeError("no audio frames".into()));
        }

        debug!(
            channels,
            sample_rate = spec.sample_rate,
            frames = samples.len() / channels.max(1),
            "Decoded WAV data"
        );

        Self::from_interleaved(&samples, channels, spec.sample_rate)
    }

    /// Decode WAV bytes and convert to `target_rate` if needed
    pub fn decode_at_rate(bytes: &[u8], target_rate: u32) -> Result<Self> {
        let decoded = Self::decode(bytes)?;
        if decoded.sample_rate == target_rate {
            Ok(decoded)
        } else {
            decoded.resampled(target_rate)
        }
    }

    /// Sample rate in Hz
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn number_of_channels(&self) -> usize {
        self.channels.len()
    }

    /// Length in frames
    pub fn length(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    /// Duration in seconds
    pub fn duration(&self) -> f64 {
        self.length() as f64 / f64::from(self.sample_rate)
    }

    /// Samples of one channel
    pub fn channel(&self, index: usize) -> &[f32] {
        self.channels.get(index).map_or(&[], Vec::as_slice)
    }

    /// Convert to another sample rate with a sinc resampler
    pub fn resampled(&self, target_rate: u32) -> Result<Self> {
        if target_rate == self.sample_rate {
            return Ok(self.clone());
        }

        let ratio = f64::from(target_rate) / f64::from(self.sample_rate);
        let params = SincInterpolationParameters {
            sinc_len: 128,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Cubic,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        };
        let channel_count = self.channels.len();
        let mut resampler =
            SincFixedIn::<f32>::new(ratio, 1.0, params, RESAMPLE_CHUNK, channel_count)
                .map_err(|e| AudioError::Resample(e.to_string()))?;

        let len = self.length();
        let delay = resampler.output_delay();
        let expected = (len as f64 * ratio).ceil() as usize;
        let mut out: Vec<Vec<f32>> = vec![Vec::with_capacity(expected + delay); channel_count];

        fn append(block: Vec<Vec<f32>>, out: &mut [Vec<f32>]) {
            for (dst, src) in out.iter_mut().zip(block) {
                dst.extend_from_slice(&src);
            }
        }

        let mut pos = 0;
        while pos + RESAMPLE_CHUNK <= len {
            let slices: Vec<&[f32]> = self
                .channels
                .iter()
                .map(|c| &c[pos..pos + RESAMPLE_CHUNK])
                .collect();
            let block = resampler
                .process(&slices, None)
                .map_err(|e| AudioError::Resample(e.to_string()))?;
            append(block, &mut out);
            pos += RESAMPLE_CHUNK;
        }

        if pos < len {
            let slices: Vec<&[f32]> = self.channels.iter().map(|c| &c[pos..]).collect();
            let block = resampler
                .process_partial(Some(slices.as_slice()), None)
                .map_err(|e| AudioError::Resample(e.to_string()))?;
            append(block, &mut out);
        }

        // Drain the filter tail until the delayed output is complete
        while out[0].len() < expected + delay {
            let block = resampler
                .process_partial::<&[f32]>(None, None)
                .map_err(|e| AudioError::Resample(e.to_string()))?;
            if block.first().map_or(true, Vec::is_empty) {
                break;
            }
            append(block, &mut out);
        }

        for ch in &mut out {
            ch.drain(..delay.min(ch.len()));
            ch.truncate(expected);
        }

        debug!(
            from = self.sample_rate,
            to = target_rate,
            frames = expected,
            "Resampled audio buffer"
        );

        Self::new(target_rate, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wav_bytes(samples: &[f32], channels: u16, sample_rate: u32) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for &s in samples {
                writer.write_sample(s).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn decode_stereo_float_wav() {
        let bytes = wav_bytes(&[0.5, -0.5, 0.25, -0.25], 2, 48000);
        let buffer = AudioBuffer::decode(&bytes).unwrap();

        assert_eq!(buffer.number_of_channels(), 2);
        assert_eq!(buffer.length(), 2);
        assert_eq!(buffer.channel(0), &[0.5, 0.25]);
        assert_eq!(buffer.channel(1), &[-0.5, -0.25]);
    }

    #[test]
    fn decode_garbage_fails() {
        let result = AudioBuffer::decode(b"definitely not a wav file");
        assert!(matches!(result, Err(AudioError::DecodeError(_))));
    }

    #[test]
    fn mismatched_channel_lengths_rejected() {
        let result = AudioBuffer::new(48000, vec![vec![0.0; 4], vec![0.0; 3]]);
        assert!(result.is_err());
    }

    #[test]
    fn resampling_scales_length() {
        let buffer = AudioBuffer::new(44100, vec![vec![0.1; 4410]]).unwrap();
        let resampled = buffer.resampled(48000).unwrap();

        assert_eq!(resampled.sample_rate(), 48000);
        assert_eq!(resampled.length(), 4800);
    }

    #[test]
    fn out_of_range_channel_is_empty() {
        let buffer = AudioBuffer::new(48000, vec![vec![1.0; 8]]).unwrap();
        assert!(buffer.channel(3).is_empty());
        assert!((buffer.duration() - 8.0 / 48000.0).abs() < 1e-12);
    }
}
