// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Mel-frequency cepstral coefficients of one feature frame.
//!
//! Per frame: scale samples to [-1, 1), apply a Hann window, zero-pad to a
//! power of two, take the power spectrum, sum the square root of each FFT
//! bin's power through a bank of triangular mel filters, take the natural
//! log and finish with a DCT-II.

use std::f32::consts::PI;
use std::sync::Arc;

use canonical_error::{CanonicalError, invalid_argument_error};
use rustfft::{Fft, FftPlanner, num_complex::Complex32};

use crate::config::MfccConfig;

// Slaney mel scale: linear below 1 kHz, logarithmic above.
const SLANEY_FREQ_STEP: f32 = 200.0 / 3.0;
const SLANEY_MIN_LOG_HZ: f32 = 1000.0;
const SLANEY_MIN_LOG_MEL: f32 = SLANEY_MIN_LOG_HZ / SLANEY_FREQ_STEP;

fn slaney_log_step() -> f32 {
    6.4f32.ln() / 27.0
}

pub fn mel_scale(freq: f32, use_htk: bool) -> f32 {
    if use_htk {
        1127.0 * (1.0 + freq / 700.0).ln()
    } else if freq >= SLANEY_MIN_LOG_HZ {
        SLANEY_MIN_LOG_MEL + (freq / SLANEY_MIN_LOG_HZ).ln() / slaney_log_step()
    } else {
        freq / SLANEY_FREQ_STEP
    }
}

pub fn inverse_mel_scale(mel: f32, use_htk: bool) -> f32 {
    if use_htk {
        700.0 * ((mel / 1127.0).exp() - 1.0)
    } else if mel >= SLANEY_MIN_LOG_MEL {
        SLANEY_MIN_LOG_HZ * (slaney_log_step() * (mel - SLANEY_MIN_LOG_MEL)).exp()
    } else {
        SLANEY_FREQ_STEP * mel
    }
}

/// One triangular filter, stored over the FFT bins where it is non-zero.
#[derive(Clone, Debug)]
struct MelFilter {
    first_bin: usize,
    weights: Vec<f32>,
}

fn mel_filter_bank(config: &MfccConfig, padded_len: usize) -> Vec<MelFilter> {
    let num_fft_bins = padded_len / 2;
    let bin_width = config.sampling_freq / padded_len as f32;
    let mel_lo = mel_scale(config.mel_lo_freq, config.use_htk_method);
    let mel_hi = mel_scale(config.mel_hi_freq, config.use_htk_method);
    let mel_delta = (mel_hi - mel_lo) / (config.num_fbank_bins + 1) as f32;

    (0..config.num_fbank_bins).map(|bin| {
        let left = mel_lo + bin as f32 * mel_delta;
        let center = mel_lo + (bin + 1) as f32 * mel_delta;
        let right = mel_lo + (bin + 2) as f32 * mel_delta;
        let mut filter = MelFilter{first_bin: 0, weights: Vec::new()};
        for i in 0..num_fft_bins {
            let mel = mel_scale(bin_width * i as f32, config.use_htk_method);
            if mel > left && mel < right {
                let weight = if mel <= center {
                    (mel - left) / (center - left)
                } else {
                    (right - mel) / (right - center)
                };
                if filter.weights.is_empty() {
                    filter.first_bin = i;
                }
                filter.weights.push(weight);
            }
        }
        filter
    }).collect()
}

// Row k, column n: sqrt(2/N) cos((n + 0.5) k pi / N).
fn dct_matrix(input_len: usize, coefficients: usize) -> Vec<f32> {
    let normalizer = (2.0 / input_len as f32).sqrt();
    let angle = PI / input_len as f32;
    let mut dct = Vec::with_capacity(input_len * coefficients);
    for k in 0..coefficients {
        for n in 0..input_len {
            dct.push(normalizer * ((n as f32 + 0.5) * angle * k as f32).cos());
        }
    }
    dct
}

/// MFCC extractor for a fixed frame geometry. Filter bank, window and DCT
/// are built once at construction.
pub struct Mfcc {
    config: MfccConfig,
    padded_len: usize,
    window: Vec<f32>,
    filters: Vec<MelFilter>,
    dct: Vec<f32>,
    fft: Arc<dyn Fft<f32>>,

    // Scratch, reused across frames.
    buffer: Vec<Complex32>,
    scratch: Vec<Complex32>,
    power: Vec<f32>,
    mel_energies: Vec<f32>,
}

impl Mfcc {
    pub fn new(config: &MfccConfig) -> Result<Self, CanonicalError> {
        if config.frame_len == 0 || config.num_fbank_bins == 0
            || config.num_mfcc_features == 0
            || config.num_mfcc_features > config.num_fbank_bins {
            return Err(invalid_argument_error(
                format!("Invalid MFCC configuration {:?}", config).as_str()));
        }
        if !(config.mel_lo_freq < config.mel_hi_freq
             && config.mel_hi_freq <= config.sampling_freq / 2.0) {
            return Err(invalid_argument_error(
                format!("Mel range {}..{} Hz does not fit sampling rate {} Hz",
                        config.mel_lo_freq, config.mel_hi_freq,
                        config.sampling_freq).as_str()));
        }
        if config.quant_scale <= 0.0 {
            return Err(invalid_argument_error("Quantisation scale must be positive"));
        }
        let padded_len = config.frame_len.next_power_of_two();
        let window = (0..config.frame_len)
            .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f32 / config.frame_len as f32).cos())
            .collect();
        let fft = FftPlanner::<f32>::new().plan_fft_forward(padded_len);
        let scratch = vec![Complex32::default(); fft.get_inplace_scratch_len()];
        Ok(Mfcc{config: config.clone(),
                padded_len,
                window,
                filters: mel_filter_bank(config, padded_len),
                dct: dct_matrix(config.num_fbank_bins, config.num_mfcc_features),
                fft,
                buffer: vec![Complex32::default(); padded_len],
                scratch,
                power: vec![0.0; padded_len / 2 + 1],
                mel_energies: vec![0.0; config.num_fbank_bins]})
    }

    pub fn frame_len(&self) -> usize {
        self.config.frame_len
    }

    pub fn num_features(&self) -> usize {
        self.config.num_mfcc_features
    }

    /// Natural log of the mel filter bank energies of `frame`.
    pub fn log_mel_energies(&mut self, frame: &[i16]) -> Result<&[f32], CanonicalError> {
        if frame.len() < self.config.frame_len {
            return Err(invalid_argument_error(
                format!("Frame has {} samples, need {}",
                        frame.len(), self.config.frame_len).as_str()));
        }
        const NORMALIZER: f32 = 1.0 / 32768.0;
        for (i, c) in self.buffer.iter_mut().enumerate() {
            let re = if i < self.config.frame_len {
                frame[i] as f32 * NORMALIZER * self.window[i]
            } else {
                0.0
            };
            *c = Complex32::new(re, 0.0);
        }
        self.fft.process_with_scratch(&mut self.buffer, &mut self.scratch);
        for (p, c) in self.power.iter_mut().zip(&self.buffer) {
            *p = c.norm_sqr();
        }
        for (energy, filter) in self.mel_energies.iter_mut().zip(&self.filters) {
            let bins = &self.power[filter.first_bin..filter.first_bin + filter.weights.len()];
            // Start above zero so the log stays finite.
            let sum: f32 = filter.weights.iter().zip(bins).map(|(w, p)| w * p.sqrt())
                .fold(f32::MIN_POSITIVE, |acc, x| acc + x);
            *energy = sum.ln();
        }
        Ok(&self.mel_energies)
    }

    /// MFCC features of the first `frame_len` samples of `frame`.
    pub fn compute(&mut self, frame: &[i16]) -> Result<Vec<f32>, CanonicalError> {
        self.log_mel_energies(frame)?;
        let bins = self.config.num_fbank_bins;
        Ok(self.dct.chunks_exact(bins).map(|row| {
            row.iter().zip(&self.mel_energies).map(|(d, m)| d * m).sum()
        }).collect())
    }

    /// Features quantised for an int8 input tensor:
    /// `round(f / scale) + offset`, saturated.
    pub fn compute_quantized(&mut self, frame: &[i16]) -> Result<Vec<i8>, CanonicalError> {
        let features = self.compute(frame)?;
        Ok(features.iter().map(|f| quantize(*f, self.config.quant_scale,
                                            self.config.quant_offset)).collect())
    }

    pub fn padded_len(&self) -> usize {
        self.padded_len
    }
}

pub fn quantize(value: f32, scale: f32, offset: i32) -> i8 {
    let q = (value / scale).round() + offset as f32;
    q.clamp(i8::MIN as f32, i8::MAX as f32) as i8
}
