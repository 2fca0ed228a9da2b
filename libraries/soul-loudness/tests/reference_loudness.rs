//! Meter readings checked against a brute-force loudness computation
//!
//! Tests include:
//! - Direct form I K-weighting and a full re-sum of every window
//! - Multi-channel input at several sample rates
//! - Windows that have not filled yet, and a burst followed by silence
//! - Random tones across rates and levels

use proptest::prelude::*;
use soul_loudness::MomentaryLoudnessMeter;

const TOLERANCE_LU: f64 = 1e-6;

/// Direct form I biquad, `a0` equal to one
struct DirectForm {
    b: [f64; 3],
    a: [f64; 2],
    x: [f64; 2],
    y: [f64; 2],
}

impl DirectForm {
    fn new(b: [f64; 3], a: [f64; 2]) -> Self {
        Self {
            b,
            a,
            x: [0.0; 2],
            y: [0.0; 2],
        }
    }

    fn step(&mut self, x0: f64) -> f64 {
        let y0 = self.b[0] * x0 + self.b[1] * self.x[0] + self.b[2] * self.x[1]
            - self.a[0] * self.y[0]
            - self.a[1] * self.y[1];
        self.x = [x0, self.x[0]];
        self.y = [y0, self.y[0]];
        y0
    }
}

/// Squared K-weighted samples of one channel
fn weighted_squares(channel: &[f32]) -> Vec<f64> {
    let mut high_pass = DirectForm::new([1.0, -2.0, 1.0], [-1.99004745483398, 0.99007225036621]);
    let mut shelf = DirectForm::new(
        [1.53512485958697, -2.69169618940638, 1.19839281085285],
        [-1.69065929318241, 0.73248077421585],
    );
    channel
        .iter()
        .map(|&s| {
            let y = shelf.step(high_pass.step(f64::from(s)));
            y * y
        })
        .collect()
}

/// Expected readings, keyed by the index of the frame that triggers them
fn reference_readings(sample_rate: u32, channels: &[Vec<f32>]) -> Vec<(usize, f64)> {
    let fs = f64::from(sample_rate);
    let window = (0.4 * fs).round() as usize;
    let interval = (0.1 * fs).floor() as usize;
    let squares: Vec<Vec<f64>> = channels.iter().map(|c| weighted_squares(c)).collect();
    let frames = channels[0].len();

    let mut readings = Vec::new();
    for end in (interval..=frames).step_by(interval) {
        let start = end.saturating_sub(window);
        let total: f64 = squares
            .iter()
            .map(|sq| sq[start..end].iter().sum::<f64>())
            .sum();
        let mean_square = total / (channels.len() * window) as f64;
        if mean_square > 0.0 {
            readings.push((end - 1, 10.0 * mean_square.log10() - 0.691));
        }
    }
    readings
}

fn meter_readings(sample_rate: u32, channels: &[Vec<f32>]) -> Vec<(usize, f64)> {
    let mut meter = MomentaryLoudnessMeter::new(sample_rate).unwrap();
    let mut readings = Vec::new();
    let mut frame = vec![0.0_f32; channels.len()];
    for n in 0..channels[0].len() {
        for (slot, channel) in frame.iter_mut().zip(channels) {
            *slot = channel[n];
        }
        if let Some(lufs) = meter.push_frame(&frame) {
            readings.push((n, lufs));
        }
    }
    readings
}

fn assert_matches_reference(sample_rate: u32, channels: &[Vec<f32>]) {
    let expected = reference_readings(sample_rate, channels);
    let actual = meter_readings(sample_rate, channels);

    assert!(!expected.is_empty());
    assert_eq!(actual.len(), expected.len());
    for ((n, got), (m, want)) in actual.iter().zip(&expected) {
        assert_eq!(n, m);
        assert!(
            (got - want).abs() < TOLERANCE_LU,
            "frame {n}: meter {got}, reference {want}"
        );
    }
}

fn tone(sample_rate: u32, frequency: f64, amplitude: f64, frames: usize) -> Vec<f32> {
    (0..frames)
        .map(|n| {
            let t = n as f64 / f64::from(sample_rate);
            (amplitude * (std::f64::consts::TAU * frequency * t).sin()) as f32
        })
        .collect()
}

/// Deterministic white-ish noise from a linear congruential generator
fn noise(seed: u64, amplitude: f32, frames: usize) -> Vec<f32> {
    let mut state = seed;
    (0..frames)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            let unit = (state >> 40) as f32 / (1u64 << 24) as f32;
            amplitude * (2.0 * unit - 1.0)
        })
        .collect()
}

#[test]
fn test_stereo_tone_and_noise_at_48k() {
    let frames = 96_000;
    let channels = vec![tone(48000, 997.0, 0.5, frames), noise(7, 0.25, frames)];
    assert_matches_reference(48000, &channels);
}

#[test]
fn test_mono_sweep_at_44k1() {
    let frames = 88_200;
    let channel: Vec<f32> = (0..frames)
        .map(|n| {
            let t = n as f64 / 44100.0;
            // Linear sweep from 50 Hz to 12 kHz over two seconds
            let phase = std::f64::consts::TAU * (50.0 * t + (11950.0 / 4.0) * t * t);
            (0.3 * phase.sin()) as f32
        })
        .collect();
    assert_matches_reference(44100, &[channel]);
}

#[test]
fn test_three_channels_with_partial_window() {
    // First three readings arrive before the window fills
    let frames = 16_000;
    let channels = vec![
        noise(1, 0.1, frames),
        tone(32000, 250.0, 0.8, frames),
        noise(99, 0.6, frames),
    ];
    let expected = reference_readings(32000, &channels);
    assert_eq!(expected.first().map(|&(n, _)| n), Some(3199));

    assert_matches_reference(32000, &channels);
}

#[test]
fn test_burst_then_silence_inside_one_window() {
    let mut channel = tone(48000, 440.0, 0.7, 9600);
    channel.resize(19_200, 0.0);
    assert_matches_reference(48000, &[channel]);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn prop_tone_matches_reference(
        sample_rate in prop::sample::select(vec![22050u32, 32000, 44100, 48000, 96000]),
        frequency in 40.0f64..9000.0,
        amplitude in 0.05f64..1.0,
    ) {
        let frames = sample_rate as usize;
        let channels = vec![
            tone(sample_rate, frequency, amplitude, frames),
            tone(sample_rate, frequency * 1.5, amplitude * 0.5, frames),
        ];
        let expected = reference_readings(sample_rate, &channels);
        let actual = meter_readings(sample_rate, &channels);

        prop_assert_eq!(actual.len(), expected.len());
        for ((n, got), (m, want)) in actual.iter().zip(&expected) {
            prop_assert_eq!(n, m);
            prop_assert!((got - want).abs() < TOLERANCE_LU, "{} vs {}", got, want);
        }
    }
}
