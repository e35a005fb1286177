//! TX-echo loopback: records host-supplied TX I/Q keyed by frequency and replays
//! it, frequency-shifted and attenuated, on any RX within bandwidth.

use std::collections::HashMap;
use std::f64::consts::TAU;

use num_complex::Complex64;

/// Echo playback attenuation: 10^(-80/20) dB, applied to every mixed sample.
pub const ATTENUATION: f64 = 1.0e-4; // 10^(-80/20)

const MAX_DURATION_SECS: f64 = 10.0;

/// Frequency-keyed loop store for TX I/Q, replayed as attenuated RX echoes.
#[derive(Debug, Clone)]
pub struct EchoBuffer {
    sample_rate: u32,
    echoes: HashMap<u32, Vec<Complex64>>,
    playback_pos: HashMap<u32, usize>,
    shift_phase: HashMap<u32, f64>,

    recording: Vec<Complex64>,
    recording_freq: u32,
    is_recording: bool,
}

impl EchoBuffer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            echoes: HashMap::new(),
            playback_pos: HashMap::new(),
            shift_phase: HashMap::new(),
            recording: Vec::new(),
            recording_freq: 0,
            is_recording: false,
        }
    }

    /// Begin recording TX I/Q at `tx_freq`. Commits any in-progress recording first.
    pub fn start_recording(&mut self, tx_freq: u32) {
        if self.is_recording {
            self.commit();
        }
        self.recording.clear();
        self.recording_freq = tx_freq;
        self.is_recording = true;
        log::info!("echo: recording started on {tx_freq} Hz");
    }

    /// Append TX I/Q while recording is active. No-op otherwise or on empty input.
    pub fn feed(&mut self, samples: &[Complex64]) {
        if !self.is_recording || samples.is_empty() {
            return;
        }
        self.recording.extend_from_slice(samples);
    }

    /// Stop recording, committing whatever has been captured.
    pub fn stop_recording(&mut self) {
        if self.is_recording {
            self.commit();
            self.is_recording = false;
        }
    }

    fn commit(&mut self) {
        if self.recording.is_empty() {
            return;
        }
        let freq = self.recording_freq;
        if freq == 0 {
            log::debug!("echo: discarding recording with freq=0");
            self.recording.clear();
            return;
        }
        let max_samples = (f64::from(self.sample_rate) * MAX_DURATION_SECS) as usize;
        let mut buf = std::mem::take(&mut self.recording);
        buf.truncate(max_samples);
        if buf.is_empty() {
            return;
        }
        log::info!(
            "echo: committed {} samples ({:.2}s) on {} Hz",
            buf.len(),
            buf.len() as f64 / f64::from(self.sample_rate),
            freq
        );
        self.playback_pos.insert(freq, 0);
        self.shift_phase.insert(freq, 0.0);
        self.echoes.insert(freq, buf);
    }

    /// Generate `n` mixed, frequency-shifted, attenuated samples for a DDC tuned
    /// to `rx_freq`, sampling at `sample_rate`.
    pub fn generate_echo(&mut self, n: usize, rx_freq: u32, sample_rate: u32) -> Vec<Complex64> {
        let mut result = vec![Complex64::new(0.0, 0.0); n];
        if self.echoes.is_empty() {
            return result;
        }
        let half_bw = f64::from(sample_rate) / 2.0;

        let freqs: Vec<u32> = self.echoes.keys().copied().collect();
        for freq in freqs {
            let offset_hz = f64::from(rx_freq) - f64::from(freq);
            if offset_hz.abs() > half_bw {
                continue;
            }

            let echo_len = self.echoes[&freq].len();
            if echo_len == 0 {
                continue;
            }
            let mut pos = *self.playback_pos.get(&freq).unwrap_or(&0);
            let mut chunk = Vec::with_capacity(n);
            let echo = &self.echoes[&freq];
            let mut remaining = n;
            while remaining > 0 {
                let available = remaining.min(echo_len - pos);
                chunk.extend_from_slice(&echo[pos..pos + available]);
                pos = (pos + available) % echo_len;
                remaining -= available;
            }
            self.playback_pos.insert(freq, pos);

            if offset_hz != 0.0 {
                let phase0 = *self.shift_phase.get(&freq).unwrap_or(&0.0);
                let step = TAU * offset_hz / f64::from(sample_rate);
                for (k, s) in chunk.iter_mut().enumerate() {
                    let angle = phase0 + step * (k as f64);
                    *s *= Complex64::from_polar(1.0, angle);
                }
                let mut new_phase = phase0 + step * (n as f64);
                if new_phase.abs() > 1.0e6 {
                    new_phase %= TAU;
                }
                self.shift_phase.insert(freq, new_phase);
            }

            for (r, c) in result.iter_mut().zip(chunk.iter()) {
                *r += c;
            }
        }

        for r in result.iter_mut() {
            *r *= ATTENUATION;
        }
        result
    }

    /// Whether any frequency currently has a committed echo.
    pub fn has_echoes(&self) -> bool {
        !self.echoes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(n: usize, freq_hz: f64, sample_rate: u32) -> Vec<Complex64> {
        (0..n)
            .map(|k| {
                Complex64::from_polar(1.0, TAU * freq_hz * (k as f64) / f64::from(sample_rate))
            })
            .collect()
    }

    #[test]
    fn commit_truncates_to_ten_second_cap() {
        let sr = 1000u32;
        let mut echo = EchoBuffer::new(sr);
        echo.start_recording(7_000_000);
        let chunk = tone(sr as usize * 20, 10.0, sr); // 20 seconds worth
        echo.feed(&chunk);
        echo.stop_recording();

        assert_eq!(echo.echoes[&7_000_000].len(), sr as usize * 10);
        assert_eq!(echo.echoes[&7_000_000], chunk[..sr as usize * 10]);
    }

    #[test]
    fn discards_recording_at_freq_zero() {
        let mut echo = EchoBuffer::new(1000);
        echo.start_recording(0);
        echo.feed(&tone(100, 10.0, 1000));
        echo.stop_recording();
        assert!(!echo.has_echoes());
    }

    #[test]
    fn bandwidth_gate_returns_zero_outside_nyquist() {
        let sr = 48_000u32;
        let mut echo = EchoBuffer::new(sr);
        echo.start_recording(7_000_000);
        echo.feed(&tone(4800, 1000.0, sr));
        echo.stop_recording();

        let out = echo.generate_echo(256, 7_000_000 + sr + 1, sr);
        assert!(out.iter().all(|s| s.norm() == 0.0));
    }

    #[test]
    fn phase_continuity_matches_single_large_call() {
        let sr = 48_000u32;
        let mut a = EchoBuffer::new(sr);
        a.start_recording(7_100_000);
        a.feed(&tone(sr as usize, 1000.0, sr));
        a.stop_recording();

        let rx_freq = 7_100_500u32; // 500 Hz offset -> exercises the shifter

        let mut split = a.clone();
        let part1 = split.generate_echo(100, rx_freq, sr);
        let part2 = split.generate_echo(100, rx_freq, sr);

        let mut whole = a.clone();
        let combined = whole.generate_echo(200, rx_freq, sr);

        for (x, y) in part1.iter().chain(part2.iter()).zip(combined.iter()) {
            assert!((x - y).norm() < 1e-9);
        }
    }

    #[test]
    fn attenuated_magnitude_matches_input_amplitude() {
        let sr = 48_000u32;
        let mut echo = EchoBuffer::new(sr);
        echo.start_recording(7_000_000);
        echo.feed(&tone(sr as usize, 1000.0, sr));
        echo.stop_recording();

        let out = echo.generate_echo(1000, 7_000_000, sr);
        for s in &out {
            assert!((s.norm() - ATTENUATION).abs() < 1e-9);
        }
    }

    #[test]
    fn idempotent_commit_with_nothing_recorded() {
        let mut echo = EchoBuffer::new(1000);
        echo.stop_recording(); // no-op, nothing in progress
        assert!(!echo.has_echoes());
    }
}
