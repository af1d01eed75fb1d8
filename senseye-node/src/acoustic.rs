//! Ultrasonic chirp synthesis, matched filtering and ToF extraction.
//!
//! Each node owns a deterministic 1 kHz frequency channel derived from its
//! id, so overlapping chirps from different nodes can be separated by
//! matched filtering against the right template.

use async_trait::async_trait;
use rustfft::{num_complex::Complex64, FftPlanner};
use sha2::{Digest, Sha256};
use thiserror::Error;

use senseye_common::NodeId;

/// Speed of sound in air at ~20 °C (m/s).
pub const SPEED_OF_SOUND: f64 = 343.0;

/// Base frequency of channel 0 (Hz).
pub const CHANNEL_BASE_FREQ: u32 = 17_000;
/// Width of each channel (Hz).
pub const CHANNEL_WIDTH: u32 = 1_000;
/// Number of chirp channels.
pub const NUM_CHANNELS: u32 = 6;

/// Default audio sample rate (Hz).
pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;
/// Default chirp duration (seconds).
pub const DEFAULT_CHIRP_DURATION: f64 = 0.01;

/// Matched-filter peak must exceed the noise floor by this factor.
const PEAK_SNR_GATE: f64 = 3.0;

/// Identification gate. The max/median ratio of a pure-noise envelope over
/// ~10k lags already sits near 5.6, so chirp identification needs more
/// margin than echo detection.
const IDENTIFY_SNR_GATE: f64 = 8.0;

/// Acoustic hardware failures.
#[derive(Debug, Error)]
pub enum AcousticError {
    /// No audio backend is available on this platform.
    #[error("audio device unavailable")]
    Unavailable,

    /// The audio backend failed mid-operation.
    #[error("audio device error: {0}")]
    Device(String),
}

/// Platform audio collaborator: chirp playback and PCM capture.
///
/// Implementations wrap the platform audio stack; the core only consumes
/// this contract.
#[async_trait]
pub trait AcousticDevice: Send + Sync {
    /// Plays a chirp; returns the transmit-start timestamp (Unix seconds).
    async fn play_chirp(
        &self,
        freq_start: u32,
        freq_end: u32,
        duration_s: f64,
    ) -> Result<f64, AcousticError>;

    /// Records `duration_s` of mono PCM; returns the samples and the
    /// capture-start timestamp.
    async fn record(&self, duration_s: f64) -> Result<(Vec<f32>, f64), AcousticError>;
}

/// Deterministic chirp channel for a node: `SHA256(node_id) mod 6`.
///
/// Returns the `(freq_start, freq_end)` band in Hz.
pub fn chirp_channel(node_id: &str) -> (u32, u32) {
    let digest = Sha256::digest(node_id.as_bytes());
    // The low 8 bytes are plenty for a mod-6 bucket.
    let tail = u64::from_be_bytes([
        digest[24], digest[25], digest[26], digest[27],
        digest[28], digest[29], digest[30], digest[31],
    ]);
    let channel = (tail % NUM_CHANNELS as u64) as u32;
    let f_start = CHANNEL_BASE_FREQ + channel * CHANNEL_WIDTH;
    (f_start, f_start + CHANNEL_WIDTH)
}

/// Generates a linear FMCW chirp sweeping `freq_start..freq_end`.
pub fn generate_chirp(
    freq_start: u32,
    freq_end: u32,
    duration_s: f64,
    sample_rate: u32,
) -> Vec<f32> {
    let n = (duration_s * sample_rate as f64) as usize;
    let sweep_rate = (freq_end as f64 - freq_start as f64) / duration_s;
    (0..n)
        .map(|i| {
            let t = i as f64 / sample_rate as f64;
            let phase =
                2.0 * std::f64::consts::PI * (freq_start as f64 * t + 0.5 * sweep_rate * t * t);
            phase.sin() as f32
        })
        .collect()
}

/// Cross-correlates `received` with a normalized chirp template via FFT.
///
/// Returns the correlation magnitude envelope of length
/// `received.len() + template.len() − 1`.
pub fn matched_filter(received: &[f32], template: &[f32]) -> Vec<f64> {
    if received.is_empty() || template.is_empty() {
        return Vec::new();
    }
    let n = received.len() + template.len() - 1;
    let fft_size = n.next_power_of_two();

    let template_norm = {
        let energy: f64 = template.iter().map(|&x| (x as f64) * (x as f64)).sum();
        let norm = energy.sqrt() + 1e-12;
        template.iter().map(|&x| x as f64 / norm).collect::<Vec<_>>()
    };

    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(fft_size);
    let ifft = planner.plan_fft_inverse(fft_size);

    let mut r: Vec<Complex64> = received
        .iter()
        .map(|&x| Complex64::new(x as f64, 0.0))
        .chain(std::iter::repeat(Complex64::new(0.0, 0.0)))
        .take(fft_size)
        .collect();
    let mut t: Vec<Complex64> = template_norm
        .iter()
        .map(|&x| Complex64::new(x, 0.0))
        .chain(std::iter::repeat(Complex64::new(0.0, 0.0)))
        .take(fft_size)
        .collect();

    fft.process(&mut r);
    fft.process(&mut t);
    for (ri, ti) in r.iter_mut().zip(&t) {
        *ri *= ti.conj();
    }
    ifft.process(&mut r);

    // rustfft's inverse is unnormalized.
    let scale = 1.0 / fft_size as f64;
    r.iter().take(n).map(|c| (c * scale).norm()).collect()
}

/// Finds the time of flight from a correlation envelope.
///
/// The first `skip` lags (typically the template length) are excluded so
/// the direct-coupling peak does not mask the echo. Returns `None` when no
/// peak clears 3× the noise floor.
pub fn find_peak_tof(correlation: &[f64], sample_rate: u32, skip: usize) -> Option<f64> {
    if skip >= correlation.len() {
        return None;
    }
    let search = &correlation[skip..];
    let (peak_idx, &peak_val) = search
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))?;

    let noise_floor = median(search);
    if peak_val <= 1e-12 || peak_val < noise_floor * PEAK_SNR_GATE {
        return None;
    }
    Some((skip + peak_idx) as f64 / sample_rate as f64)
}

/// Peak SNR of a correlation envelope relative to its median noise floor.
pub fn peak_snr(correlation: &[f64], skip: usize) -> f64 {
    if skip >= correlation.len() {
        return 0.0;
    }
    let search = &correlation[skip..];
    let peak = search.iter().fold(0.0f64, |acc, &v| acc.max(v));
    let noise_floor = median(search) + 1e-12;
    peak / noise_floor
}

/// Converts a one-way time of flight to distance in meters.
pub fn tof_to_distance(tof_s: f64) -> f64 {
    tof_s * SPEED_OF_SOUND
}

fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<f64> = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    sorted[sorted.len() / 2]
}

/// Scans a recording for the chirp signatures of candidate nodes.
///
/// Returns `(node_id, peak_snr)` for each node whose band-matched template
/// clears the detection gate.
pub fn identify_chirps(
    recording: &[f32],
    candidates: &[NodeId],
    chirp_duration: f64,
    sample_rate: u32,
) -> Vec<(NodeId, f64)> {
    let mut detected = Vec::new();
    for node_id in candidates {
        let (f_start, f_end) = chirp_channel(node_id);
        let template = generate_chirp(f_start, f_end, chirp_duration, sample_rate);
        let correlation = matched_filter(recording, &template);
        let snr = peak_snr(&correlation, 0);
        if snr > IDENTIFY_SNR_GATE {
            detected.push((node_id.clone(), snr));
        }
    }
    detected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_is_deterministic_and_in_band() {
        let (start, end) = chirp_channel("node-alpha");
        assert_eq!(chirp_channel("node-alpha"), (start, end));
        assert!(start >= CHANNEL_BASE_FREQ);
        assert!(end <= CHANNEL_BASE_FREQ + NUM_CHANNELS * CHANNEL_WIDTH);
        assert_eq!(end - start, CHANNEL_WIDTH);
    }

    #[test]
    fn test_channels_spread_across_nodes() {
        // A handful of ids should not all collapse onto one channel.
        let channels: std::collections::HashSet<u32> = (0..32)
            .map(|i| chirp_channel(&format!("node-{i}")).0)
            .collect();
        assert!(channels.len() > 1);
    }

    #[test]
    fn test_chirp_length_and_amplitude() {
        let chirp = generate_chirp(18_000, 19_000, 0.01, 48_000);
        assert_eq!(chirp.len(), 480);
        assert!(chirp.iter().all(|&s| (-1.0..=1.0).contains(&s)));
    }

    #[test]
    fn test_matched_filter_finds_embedded_chirp() {
        let sample_rate = 48_000;
        let chirp = generate_chirp(18_000, 19_000, 0.01, sample_rate);
        let offset = 960; // 20 ms → 6.86 m of travel
        let mut recording = vec![0.0f32; 4800];
        for (i, &s) in chirp.iter().enumerate() {
            recording[offset + i] = s * 0.3;
        }

        let correlation = matched_filter(&recording, &chirp);
        let tof = find_peak_tof(&correlation, sample_rate, chirp.len()).unwrap();
        let expected_tof = offset as f64 / sample_rate as f64;
        assert!(
            (tof - expected_tof).abs() < 0.001,
            "tof {tof} vs expected {expected_tof}"
        );
        let distance = tof_to_distance(tof);
        assert!((distance - 6.86).abs() < 0.4);
    }

    #[test]
    fn test_no_peak_in_noise() {
        // A flat recording has no correlation peak above the gate.
        let chirp = generate_chirp(18_000, 19_000, 0.01, 48_000);
        let silence = vec![0.0f32; 4800];
        let correlation = matched_filter(&silence, &chirp);
        assert!(find_peak_tof(&correlation, 48_000, chirp.len()).is_none());
    }

    /// Deterministic uniform noise in [−0.5, 0.5), like a quiet microphone
    /// floor.
    fn lcg_noise(len: usize, mut state: u64) -> Vec<f32> {
        (0..len)
            .map(|_| {
                state = (state.wrapping_mul(1_103_515_245).wrapping_add(12_345)) % (1 << 31);
                (state as f64 / (1u64 << 31) as f64 - 0.5) as f32
            })
            .collect()
    }

    #[test]
    fn test_identify_chirps_separates_channels() {
        let sample_rate = 48_000;
        let duration = 0.01;
        // Two nodes at least two channels apart so their bands are disjoint.
        let names: Vec<String> = (0..64).map(|i| format!("n{i}")).collect();
        let present = names[0].clone();
        let absent = names
            .iter()
            .find(|n| {
                let a = chirp_channel(n).0 as i64;
                let b = chirp_channel(&present).0 as i64;
                (a - b).abs() >= 2 * CHANNEL_WIDTH as i64
            })
            .unwrap()
            .clone();

        let (f_start, f_end) = chirp_channel(&present);
        let chirp = generate_chirp(f_start, f_end, duration, sample_rate);
        // Noise floor plus the present node's chirp at full amplitude.
        let mut recording: Vec<f32> =
            lcg_noise(9600, 987_654_321).iter().map(|n| n * 0.8).collect();
        for (i, &s) in chirp.iter().enumerate() {
            recording[2400 + i] += s;
        }

        let detected = identify_chirps(
            &recording,
            &[present.clone(), absent.clone()],
            duration,
            sample_rate,
        );
        assert!(detected.iter().any(|(id, _)| *id == present));
        assert!(!detected.iter().any(|(id, _)| *id == absent));
    }

    #[test]
    fn test_identify_rejects_pure_noise() {
        let recording: Vec<f32> = lcg_noise(9600, 1234).iter().map(|n| n * 0.8).collect();
        let detected = identify_chirps(&recording, &["n0".to_string()], 0.01, 48_000);
        assert!(detected.is_empty());
    }

    #[test]
    fn test_matched_filter_empty_inputs() {
        assert!(matched_filter(&[], &[1.0]).is_empty());
        assert!(matched_filter(&[1.0], &[]).is_empty());
    }
}
