//! Two-stage K-weighting filter
//!
//! A high-pass pre-filter followed by a high-shelf, both with the fixed
//! 48 kHz coefficients from ITU-R BS.1770. Other sample rates reuse the same
//! coefficients, which shifts the corner frequencies slightly; momentary
//! readings for level control tolerate that.

/// Transposed direct form II biquad with `a0` normalized to one
#[derive(Debug, Clone, Copy)]
struct Biquad {
    b: [f64; 3],
    a: [f64; 2],
    z1: f64,
    z2: f64,
}

impl Biquad {
    const fn new(b: [f64; 3], a: [f64; 2]) -> Self {
        Self {
            b,
            a,
            z1: 0.0,
            z2: 0.0,
        }
    }

    #[inline]
    fn process(&mut self, x: f64) -> f64 {
        let y = self.b[0] * x + self.z1;
        self.z1 = self.b[1] * x - self.a[0] * y + self.z2;
        self.z2 = self.b[2] * x - self.a[1] * y;
        y
    }

    fn reset(&mut self) {
        self.z1 = 0.0;
        self.z2 = 0.0;
    }
}

const PRE_FILTER_B: [f64; 3] = [1.0, -2.0, 1.0];
const PRE_FILTER_A: [f64; 2] = [-1.99004745483398, 0.99007225036621];

const SHELF_B: [f64; 3] = [1.53512485958697, -2.69169618940638, 1.19839281085285];
const SHELF_A: [f64; 2] = [-1.69065929318241, 0.73248077421585];

/// Per-channel K-weighting state
#[derive(Debug, Clone, Copy)]
pub struct KWeighting {
    pre_filter: Biquad,
    shelf: Biquad,
}

impl Default for KWeighting {
    fn default() -> Self {
        Self::new()
    }
}

impl KWeighting {
    pub const fn new() -> Self {
        Self {
            pre_filter: Biquad::new(PRE_FILTER_B, PRE_FILTER_A),
            shelf: Biquad::new(SHELF_B, SHELF_A),
        }
    }

    #[inline]
    pub fn process(&mut self, sample: f64) -> f64 {
        self.shelf.process(self.pre_filter.process(sample))
    }

    pub fn reset(&mut self) {
        self.pre_filter.reset();
        self.shelf.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::TAU;

    fn steady_state_gain(frequency: f64) -> f64 {
        let mut filter = KWeighting::new();
        let fs = 48000.0;
        let mut peak: f64 = 0.0;
        for n in 0..48000 {
            let y = filter.process((TAU * frequency * n as f64 / fs).sin());
            if n > 24000 {
                peak = peak.max(y.abs());
            }
        }
        peak
    }

    #[test]
    fn blocks_dc() {
        let mut filter = KWeighting::new();
        let mut last = 1.0;
        for _ in 0..48000 {
            last = filter.process(1.0);
        }
        assert!(last.abs() < 1e-3, "DC leaked: {last}");
    }

    #[test]
    fn shelf_lifts_high_frequencies() {
        let low = steady_state_gain(1000.0);
        let high = steady_state_gain(8000.0);
        assert!(high > low);
        // About +4 dB at the top of the shelf
        assert!((20.0 * (high / low).log10() - 3.5).abs() < 1.5);
    }

    #[test]
    fn rolls_off_low_frequencies() {
        assert!(steady_state_gain(20.0) < steady_state_gain(1000.0) * 0.5);
    }
}
