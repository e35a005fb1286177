//! Synthetic test-tone + noise I/Q generator, one phase accumulator per DDC.

use std::collections::HashMap;
use std::f64::consts::TAU;

use num_complex::Complex64;
use rand::Rng;
use rand_distr::StandardNormal;

/// Generates per-DDC test I/Q: a single continuous tone plus additive white noise.
#[derive(Debug, Clone)]
pub struct SignalGenerator {
    pub sample_rate: u32,
    pub tone_offset_hz: f64,
    pub noise_level: f64,
    pub amplitude: f64,
    phase: HashMap<u8, f64>,
}

impl SignalGenerator {
    pub fn new(sample_rate: u32, tone_offset_hz: f64, noise_level: f64) -> Self {
        Self {
            sample_rate,
            tone_offset_hz,
            noise_level,
            amplitude: 0.3,
            phase: HashMap::new(),
        }
    }

    /// Generate `n` complex I/Q samples for `ddc`, advancing that DDC's phase.
    pub fn generate_iq(&mut self, n: usize, ddc: u8) -> Vec<Complex64> {
        let mut rng = rand::thread_rng();
        let phase = *self.phase.get(&ddc).unwrap_or(&0.0);
        let sr = f64::from(self.sample_rate);

        let mut out = Vec::with_capacity(n);
        for k in 0..n {
            let t = (k as f64) / sr + phase;
            let tone = Complex64::from_polar(self.amplitude, TAU * self.tone_offset_hz * t);
            let noise_i: f64 = rng.sample::<f64, _>(StandardNormal) * self.noise_level;
            let noise_q: f64 = rng.sample::<f64, _>(StandardNormal) * self.noise_level;
            out.push(tone + Complex64::new(noise_i, noise_q));
        }

        let mut new_phase = phase + (n as f64) / sr;
        if new_phase.abs() > 1.0e6 {
            if self.tone_offset_hz != 0.0 {
                new_phase %= 1.0 / self.tone_offset_hz;
            } else {
                new_phase = 0.0;
            }
        }
        self.phase.insert(ddc, new_phase);

        out
    }
}
