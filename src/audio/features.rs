//! # Mel-Spectrogram Feature Extraction
//!
//! Converts a one-second waveform window into a fixed-shape log-mel tensor for
//! the recurrent classifier. The computation follows the librosa
//! `melspectrogram` defaults the classifier was trained with:
//!
//! 1. Reflect-pad `n_fft / 2` samples on both sides (centered frames)
//! 2. Periodic Hann window, FFT, power spectrum `|X|^2`
//! 3. Slaney mel filter bank with Slaney area normalization
//! 4. Optional `power_to_db` with an 80 dB dynamic range
//!
//! ## Output layout:
//! Row-major `(n_frames, n_mels)`: time frames are the sequence axis, mel bands
//! are the per-step features. `n_frames = 1 + window_len / hop_length`.
//!
//! ## Thread Safety:
//! The window, filter bank and FFT plan are built once and only read afterwards,
//! so one extractor can be shared across sessions behind an `Arc`.

use crate::error::{AudioError, AudioResult};
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::sync::Arc;

const POWER_FLOOR: f32 = 1e-10;
const TOP_DB: f32 = 80.0;

/// Extraction parameters. Shape of the output is a pure function of these.
#[derive(Debug, Clone, PartialEq)]
pub struct MelConfig {
    pub sample_rate: u32,
    pub n_fft: usize,
    pub hop_length: usize,
    pub n_mels: usize,
    pub f_min: f32,
    pub f_max: f32,
    pub log_scale: bool,
}

impl Default for MelConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            n_fft: 2048,
            hop_length: 512,
            n_mels: 128,
            f_min: 0.0,
            f_max: 24000.0,
            log_scale: true,
        }
    }
}

impl MelConfig {
    /// Number of samples every input window must have.
    pub fn window_len(&self) -> usize {
        self.sample_rate as usize
    }

    /// Number of time frames produced for one window.
    pub fn n_frames(&self) -> usize {
        let pad = self.n_fft / 2;
        1 + (self.window_len() + 2 * pad - self.n_fft) / self.hop_length
    }
}

/// Fixed-shape spectral features for one window.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTensor {
    data: Vec<f32>,
    n_frames: usize,
    n_mels: usize,
}

impl FeatureTensor {
    pub fn new(data: Vec<f32>, n_frames: usize, n_mels: usize) -> AudioResult<Self> {
        if data.len() != n_frames * n_mels {
            return Err(AudioError::Shape {
                expected: format!("{} values ({} x {})", n_frames * n_mels, n_frames, n_mels),
                actual: format!("{} values", data.len()),
            });
        }
        Ok(Self { data, n_frames, n_mels })
    }

    /// `(n_frames, n_mels)`
    pub fn shape(&self) -> (usize, usize) {
        (self.n_frames, self.n_mels)
    }

    pub fn n_frames(&self) -> usize {
        self.n_frames
    }

    pub fn n_mels(&self) -> usize {
        self.n_mels
    }

    /// Row-major values, one row per frame.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn frame(&self, index: usize) -> &[f32] {
        &self.data[index * self.n_mels..(index + 1) * self.n_mels]
    }
}

/// Stateless mel-spectrogram extractor with precomputed tables.
pub struct MelExtractor {
    config: MelConfig,
    window: Vec<f32>,
    /// `[n_mels * n_freqs]`, row per mel band
    filters: Vec<f32>,
    /// `n_mels + 2` band edges in Hz
    band_edges: Vec<f32>,
    fft: Arc<dyn Fft<f32>>,
}

impl std::fmt::Debug for MelExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MelExtractor").field("config", &self.config).finish()
    }
}

impl MelExtractor {
    pub fn new(config: MelConfig) -> Self {
        let window = hann_window(config.n_fft);
        let band_edges = mel_frequencies(config.n_mels + 2, config.f_min, config.f_max);
        let filters = mel_filter_bank(&config, &band_edges);
        let fft = FftPlanner::<f32>::new().plan_fft_forward(config.n_fft);

        Self {
            config,
            window,
            filters,
            band_edges,
            fft,
        }
    }

    pub fn config(&self) -> &MelConfig {
        &self.config
    }

    /// Output shape for every valid window: `(n_frames, n_mels)`.
    pub fn output_shape(&self) -> (usize, usize) {
        (self.config.n_frames(), self.config.n_mels)
    }

    /// Center frequency (Hz) of each mel band.
    pub fn band_centers(&self) -> &[f32] {
        &self.band_edges[1..self.band_edges.len() - 1]
    }

    /// Compute the feature tensor for one window.
    ///
    /// ## Errors:
    /// - **Shape**: window is not exactly `sample_rate` samples long
    /// - **Numeric**: window contains NaN or infinite samples
    pub fn extract(&self, window: &[f32]) -> AudioResult<FeatureTensor> {
        let expected = self.config.window_len();
        if window.len() != expected {
            return Err(AudioError::Shape {
                expected: format!("{} samples", expected),
                actual: format!("{} samples", window.len()),
            });
        }
        if let Some(position) = window.iter().position(|s| !s.is_finite()) {
            return Err(AudioError::Numeric(format!(
                "non-finite sample {} at index {}",
                window[position], position
            )));
        }

        let n_fft = self.config.n_fft;
        let n_freqs = n_fft / 2 + 1;
        let n_mels = self.config.n_mels;
        let n_frames = self.config.n_frames();
        let padded = pad_reflect(window, n_fft / 2);

        let mut mel = Vec::with_capacity(n_frames * n_mels);
        let mut spectrum = vec![Complex::new(0.0f32, 0.0); n_fft];
        let mut power = vec![0.0f32; n_freqs];

        for frame in 0..n_frames {
            let start = frame * self.config.hop_length;
            for (i, bin) in spectrum.iter_mut().enumerate() {
                *bin = Complex::new(padded[start + i] * self.window[i], 0.0);
            }
            self.fft.process(&mut spectrum);

            for (p, bin) in power.iter_mut().zip(&spectrum[..n_freqs]) {
                *p = bin.norm_sqr();
            }

            for band in self.filters.chunks_exact(n_freqs) {
                let energy: f32 = band.iter().zip(&power).map(|(w, p)| w * p).sum();
                mel.push(energy);
            }
        }

        if self.config.log_scale {
            power_to_db(&mut mel);
        }

        if mel.iter().any(|v| !v.is_finite()) {
            return Err(AudioError::Numeric("mel-spectrogram contains non-finite values".to_string()));
        }

        FeatureTensor::new(mel, n_frames, n_mels)
    }
}

/// Periodic Hann window (the STFT variant).
fn hann_window(size: usize) -> Vec<f32> {
    let factor = 2.0 * std::f64::consts::PI / size as f64;
    (0..size)
        .map(|i| (0.5 - 0.5 * (i as f64 * factor).cos()) as f32)
        .collect()
}

/// numpy-style reflect padding (edge sample not repeated).
fn pad_reflect(samples: &[f32], pad: usize) -> Vec<f32> {
    let n = samples.len();
    let mut padded = Vec::with_capacity(n + 2 * pad);
    for i in (1..=pad).rev() {
        padded.push(samples[i.min(n - 1)]);
    }
    padded.extend_from_slice(samples);
    for i in 1..=pad {
        padded.push(samples[(n - 1).saturating_sub(i)]);
    }
    padded
}

fn hz_to_mel(freq: f64) -> f64 {
    const F_SP: f64 = 200.0 / 3.0;
    const MIN_LOG_HZ: f64 = 1000.0;
    const MIN_LOG_MEL: f64 = MIN_LOG_HZ / F_SP;
    let logstep = (6.4f64).ln() / 27.0;

    if freq >= MIN_LOG_HZ {
        MIN_LOG_MEL + (freq / MIN_LOG_HZ).ln() / logstep
    } else {
        freq / F_SP
    }
}

fn mel_to_hz(mel: f64) -> f64 {
    const F_SP: f64 = 200.0 / 3.0;
    const MIN_LOG_HZ: f64 = 1000.0;
    const MIN_LOG_MEL: f64 = MIN_LOG_HZ / F_SP;
    let logstep = (6.4f64).ln() / 27.0;

    if mel >= MIN_LOG_MEL {
        MIN_LOG_HZ * (logstep * (mel - MIN_LOG_MEL)).exp()
    } else {
        F_SP * mel
    }
}

/// `count` frequencies evenly spaced on the Slaney mel scale between `f_min` and `f_max`.
fn mel_frequencies(count: usize, f_min: f32, f_max: f32) -> Vec<f32> {
    let mel_min = hz_to_mel(f_min as f64);
    let mel_max = hz_to_mel(f_max as f64);
    let steps = (count - 1).max(1) as f64;
    (0..count)
        .map(|i| mel_to_hz(mel_min + (mel_max - mel_min) * i as f64 / steps) as f32)
        .collect()
}

/// Triangular filters with Slaney area normalization, `[n_mels * n_freqs]`.
fn mel_filter_bank(config: &MelConfig, band_edges: &[f32]) -> Vec<f32> {
    let n_freqs = config.n_fft / 2 + 1;
    let bin_hz = config.sample_rate as f64 / config.n_fft as f64;
    let mut filters = vec![0.0f32; config.n_mels * n_freqs];

    for m in 0..config.n_mels {
        let lower = band_edges[m] as f64;
        let center = band_edges[m + 1] as f64;
        let upper = band_edges[m + 2] as f64;
        let enorm = 2.0 / (upper - lower);

        for k in 0..n_freqs {
            let freq = k as f64 * bin_hz;
            let rising = (freq - lower) / (center - lower);
            let falling = (upper - freq) / (upper - center);
            let weight = rising.min(falling).max(0.0);
            filters[m * n_freqs + k] = (weight * enorm) as f32;
        }
    }

    filters
}

/// In-place `10 * log10(max(S, 1e-10))` clipped to `max - 80 dB`.
fn power_to_db(values: &mut [f32]) {
    for v in values.iter_mut() {
        *v = 10.0 * v.max(POWER_FLOOR).log10();
    }
    let peak = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let floor = peak - TOP_DB;
    for v in values.iter_mut() {
        *v = v.max(floor);
    }
}
