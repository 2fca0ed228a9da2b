//! Streaming momentary loudness
//!
//! Each channel is K-weighted and its squared output kept in a circular
//! window of `round(0.4 · fs)` samples together with a running sum, so every
//! sample costs O(1) regardless of the window length. A reading is produced
//! every `floor(0.1 · fs)` samples from the mean square over all channels.

use crate::error::{LoudnessError, Result};
use crate::kweighting::KWeighting;
use crate::{CALIBRATION_OFFSET_DB, REPORT_INTERVAL_SECONDS, WINDOW_SECONDS};
use tracing::debug;

const MIN_SAMPLE_RATE: u32 = 1000;
const MAX_SAMPLE_RATE: u32 = 768_000;

#[derive(Debug, Clone)]
struct ChannelWindow {
    filter: KWeighting,
    squares: Vec<f64>,
    sum: f64,
}

impl ChannelWindow {
    fn new(len: usize) -> Self {
        Self {
            filter: KWeighting::new(),
            squares: vec![0.0; len],
            sum: 0.0,
        }
    }
}

/// Sliding-window loudness meter fed one frame at a time
#[derive(Debug, Clone)]
pub struct MomentaryLoudnessMeter {
    sample_rate: u32,
    window_len: usize,
    report_interval: usize,
    /// Sized on the first non-empty frame
    channels: Vec<ChannelWindow>,
    index: usize,
    since_report: usize,
}

impl MomentaryLoudnessMeter {
    pub fn new(sample_rate: u32) -> Result<Self> {
        if !(MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&sample_rate) {
            return Err(LoudnessError::InvalidSampleRate(sample_rate));
        }
        let fs = f64::from(sample_rate);
        let window_len = (WINDOW_SECONDS * fs).round() as usize;
        let report_interval = (REPORT_INTERVAL_SECONDS * fs).floor() as usize;

        debug!(
            sample_rate,
            window_len, report_interval, "Created momentary loudness meter"
        );

        Ok(Self {
            sample_rate,
            window_len,
            report_interval,
            channels: Vec::new(),
            index: 0,
            since_report: 0,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Window length in samples
    pub fn window_len(&self) -> usize {
        self.window_len
    }

    /// Samples between two readings
    pub fn report_interval(&self) -> usize {
        self.report_interval
    }

    /// Channels being tracked; zero until the first frame arrives
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Feed one frame (one sample per channel)
    ///
    /// Returns a loudness reading in LUFS when a report is due and the window
    /// holds any energy. Channels missing from a shorter frame count as
    /// silence; extra channels beyond the first frame's count are ignored.
    pub fn push_frame(&mut self, frame: &[f32]) -> Option<f64> {
        if frame.is_empty() {
            return None;
        }
        if self.channels.is_empty() {
            self.channels = vec![ChannelWindow::new(self.window_len); frame.len()];
            debug!(channels = frame.len(), "Sized loudness meter channels");
        }

        let index = self.index;
        for (ch, window) in self.channels.iter_mut().enumerate() {
            let x = frame.get(ch).copied().map_or(0.0, f64::from);
            let y = window.filter.process(x);
            let square = y * y;
            window.sum += square - window.squares[index];
            // Running sums of non-negative terms may drift just below zero
            if window.sum < 0.0 {
                window.sum = 0.0;
            }
            window.squares[index] = square;
        }
        self.index = (index + 1) % self.window_len;

        self.since_report += 1;
        if self.since_report < self.report_interval {
            return None;
        }
        self.since_report = 0;
        self.momentary()
    }

    /// Loudness of the current window, `None` while it is silent
    pub fn momentary(&self) -> Option<f64> {
        if self.channels.is_empty() {
            return None;
        }
        let total: f64 = self.channels.iter().map(|c| c.sum).sum();
        let mean_square = total / (self.channels.len() * self.window_len) as f64;
        (mean_square > 0.0).then(|| 10.0 * mean_square.log10() - CALIBRATION_OFFSET_DB)
    }

    /// Feed planar channel slices, calling `on_report` for every reading
    pub fn process_planar(&mut self, channels: &[&[f32]], mut on_report: impl FnMut(f64)) {
        let frames = channels.iter().map(|c| c.len()).min().unwrap_or(0);
        let mut frame = [0.0_f32; 8];
        let width = channels.len().min(frame.len());
        for n in 0..frames {
            for (slot, channel) in frame.iter_mut().zip(channels.iter()) {
                *slot = channel[n];
            }
            if let Some(lufs) = self.push_frame(&frame[..width]) {
                on_report(lufs);
            }
        }
    }

    /// Forget all history, keeping the channel layout
    pub fn reset(&mut self) {
        for window in &mut self.channels {
            window.filter.reset();
            window.squares.fill(0.0);
            window.sum = 0.0;
        }
        self.index = 0;
        self.since_report = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::TAU;

    fn sine(frequency: f32, amplitude: f32, n: usize) -> f32 {
        amplitude * (TAU * frequency * n as f32 / 48000.0).sin()
    }

    #[test]
    fn sizes_window_and_interval_from_rate() {
        let meter = MomentaryLoudnessMeter::new(48000).unwrap();
        assert_eq!(meter.window_len(), 19200);
        assert_eq!(meter.report_interval(), 4800);

        let meter = MomentaryLoudnessMeter::new(44100).unwrap();
        assert_eq!(meter.window_len(), 17640);
        assert_eq!(meter.report_interval(), 4410);
    }

    #[test]
    fn rejects_absurd_rates() {
        assert!(MomentaryLoudnessMeter::new(0).is_err());
        assert!(MomentaryLoudnessMeter::new(10_000_000).is_err());
    }

    #[test]
    fn silence_never_reports() {
        let mut meter = MomentaryLoudnessMeter::new(48000).unwrap();
        for _ in 0..48000 {
            assert_eq!(meter.push_frame(&[0.0, 0.0]), None);
        }
        assert_eq!(meter.channel_count(), 2);
    }

    #[test]
    fn reports_every_hundred_milliseconds() {
        let mut meter = MomentaryLoudnessMeter::new(48000).unwrap();
        let mut reports = Vec::new();
        for n in 0..48000 {
            let s = sine(1000.0, 0.5, n);
            if meter.push_frame(&[s]).is_some() {
                reports.push(n);
            }
        }
        assert_eq!(reports.len(), 10);
        assert_eq!(reports[0], 4799);
        assert_eq!(reports[1] - reports[0], 4800);
    }

    #[test]
    fn full_scale_sine_reads_near_reference() {
        // A 0 dBFS 1 kHz sine on one channel reads about -3 LUFS
        let mut meter = MomentaryLoudnessMeter::new(48000).unwrap();
        let mut last = None;
        for n in 0..48000 {
            if let Some(lufs) = meter.push_frame(&[sine(1000.0, 1.0, n)]) {
                last = Some(lufs);
            }
        }
        let lufs = last.unwrap();
        assert!((lufs - -3.0).abs() < 0.5, "read {lufs}");
    }

    #[test]
    fn louder_input_reads_louder() {
        let measure = |amplitude: f32| {
            let mut meter = MomentaryLoudnessMeter::new(48000).unwrap();
            let mut last = None;
            for n in 0..24000 {
                let s = sine(440.0, amplitude, n);
                if let Some(lufs) = meter.push_frame(&[s, s]) {
                    last = Some(lufs);
                }
            }
            last.unwrap()
        };
        let quiet = measure(0.1);
        let loud = measure(0.4);
        // Four times the amplitude is about 12 dB
        assert!((loud - quiet - 12.04).abs() < 0.2);
    }

    #[test]
    fn reset_clears_history() {
        let mut meter = MomentaryLoudnessMeter::new(48000).unwrap();
        for n in 0..4000 {
            meter.push_frame(&[sine(1000.0, 0.5, n)]);
        }
        assert!(meter.momentary().is_some());
        meter.reset();
        assert_eq!(meter.momentary(), None);
    }

    #[test]
    fn planar_matches_frame_by_frame() {
        let left: Vec<f32> = (0..9600).map(|n| sine(300.0, 0.3, n)).collect();
        let right: Vec<f32> = (0..9600).map(|n| sine(500.0, 0.2, n)).collect();

        let mut a = MomentaryLoudnessMeter::new(48000).unwrap();
        let mut planar = Vec::new();
        a.process_planar(&[&left, &right], |l| planar.push(l));

        let mut b = MomentaryLoudnessMeter::new(48000).unwrap();
        let framed: Vec<f64> = left
            .iter()
            .zip(&right)
            .filter_map(|(&l, &r)| b.push_frame(&[l, r]))
            .collect();

        assert_eq!(planar, framed);
    }
}
