// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Amplitude normalisation of 16-bit mono PCM windows ahead of feature
//! extraction: stereo downmix, DC offset removal and adaptive gain.

use std::fmt;

use clap::ValueEnum;
use log::debug;

/// Gain ceiling, 80 dB. Keeps near-silent input from being blown up to
/// full-scale noise.
pub const MAX_GAIN: f32 = 10000.0;

/// Largest gain increase between consecutive windows, +0.5 dB. Decreases
/// take effect immediately.
pub const MAX_GAIN_INC_PER_STRIDE: f32 = 1.059_253_7;

/// Rounding average of a stereo pair; ties round up.
#[inline]
pub fn rounding_average(left: i16, right: i16) -> i16 {
    ((left as i32 + right as i32 + 1) >> 1) as i16
}

/// Downmixes interleaved stereo `interleaved` into `mono`, one output sample
/// per pair.
pub fn downmix_stereo(interleaved: &[i16], mono: &mut [i16]) {
    assert!(mono.len() * 2 <= interleaved.len());
    for (m, pair) in mono.iter_mut().zip(interleaved.chunks_exact(2)) {
        *m = rounding_average(pair[0], pair[1]);
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct WindowStats {
    /// Mean, rounded to nearest.
    pub mean: i32,
    pub min: i16,
    pub max: i16,
    /// Largest magnitude; 32768 when the window contains -32768.
    pub absmax: i32,
}

impl fmt::Display for WindowStats {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)  // Just re-use Debug.
    }
}

pub fn window_stats(samples: &[i16]) -> WindowStats {
    if samples.is_empty() {
        return WindowStats::default();
    }
    let mut sum = 0i64;
    let mut min = i16::MAX;
    let mut max = i16::MIN;
    for &s in samples {
        sum += s as i64;
        min = min.min(s);
        max = max.max(s);
    }
    let mean = (sum as f64 / samples.len() as f64).round() as i32;
    let absmax = (min as i32).abs().max((max as i32).abs());
    WindowStats{mean, min, max, absmax}
}

/// Subtracts `offset` from every sample, saturating.
pub fn remove_dc(samples: &mut [i16], offset: i32) {
    if offset == 0 {
        return;
    }
    for s in samples.iter_mut() {
        *s = (*s as i32 - offset).clamp(i16::MIN as i32, i16::MAX as i32) as i16;
    }
}

/// Multiplies every sample by `gain`, rounding and saturating to i16.
pub fn apply_gain(samples: &mut [i16], gain: f32) {
    for s in samples.iter_mut() {
        *s = (*s as f32 * gain).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
    }
}

/// How the DC offset to remove is measured.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum DcMode {
    /// The mean of the window being normalised.
    #[default]
    WindowMean,
    /// A slow tracker, `dc = dc*7/8 + mean/8` in integer steps, starting
    /// from zero. Suits streaming input whose offset drifts slowly.
    Tracking,
}

/// Result of normalising one window.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct NormalizeReport {
    /// Statistics of the window as received.
    pub input: WindowStats,
    pub dc_removed: i32,
    pub gain: f32,
}

impl NormalizeReport {
    pub fn gain_db(&self) -> f32 {
        20.0 * self.gain.log10()
    }
}

/// Stateful per-stream normaliser. Gain is `min(32768 / absmax, max_gain)`,
/// with absmax measured after DC removal, and may rise by at most
/// `max_gain_inc` per window.
#[derive(Clone, Debug)]
pub struct GainNormalizer {
    max_gain: f32,
    max_gain_inc: f32,
    dc_mode: DcMode,
    current_gain: f32,
    tracked_dc: i32,
}

impl Default for GainNormalizer {
    fn default() -> Self {
        GainNormalizer::new(MAX_GAIN, MAX_GAIN_INC_PER_STRIDE, DcMode::WindowMean)
    }
}

impl GainNormalizer {
    pub fn new(max_gain: f32, max_gain_inc: f32, dc_mode: DcMode) -> Self {
        assert!(max_gain > 0.0 && max_gain_inc >= 1.0);
        // Starting at the ceiling lets the first window take its computed
        // gain directly.
        GainNormalizer{max_gain, max_gain_inc, dc_mode,
                       current_gain: max_gain, tracked_dc: 0}
    }

    pub fn current_gain(&self) -> f32 {
        self.current_gain
    }

    /// Removes DC from `window` and scales it towards full scale.
    pub fn normalize(&mut self, window: &mut [i16]) -> NormalizeReport {
        let input = window_stats(window);
        let dc = match self.dc_mode {
            DcMode::WindowMean => input.mean,
            DcMode::Tracking => {
                self.tracked_dc = (self.tracked_dc / 8) * 7 + input.mean / 8;
                self.tracked_dc
            },
        };
        remove_dc(window, dc);

        let absmax = window_stats(window).absmax;
        let new_gain = if absmax == 0 {
            self.max_gain
        } else {
            (32768.0 / absmax as f32).min(self.max_gain)
        };
        self.current_gain = new_gain.min(self.current_gain * self.max_gain_inc);
        apply_gain(window, self.current_gain);

        let report = NormalizeReport{input, dc_removed: dc, gain: self.current_gain};
        debug!("Normalised window: absmax {} mean {} dc {} gain {:.1} dB",
               input.absmax, input.mean, dc, report.gain_db());
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rounding_average() {
        assert_eq!(rounding_average(1, 0), 1);
        assert_eq!(rounding_average(0, 1), 1);
        assert_eq!(rounding_average(-1, 0), 0);
        assert_eq!(rounding_average(3, 4), 4);
        assert_eq!(rounding_average(-3, -4), -3);
        assert_eq!(rounding_average(i16::MAX, i16::MAX), i16::MAX);
        assert_eq!(rounding_average(i16::MIN, i16::MIN), i16::MIN);
    }

    #[test]
    fn test_downmix() {
        let stereo = [1i16, 0, 10, 20, -5, -6, 100, 101];
        let mut mono = [0i16; 4];
        downmix_stereo(&stereo, &mut mono);
        assert_eq!(mono, [1, 15, -5, 101]);
    }

    #[test]
    fn test_stats() {
        let s = window_stats(&[-4, 2, 3, 0]);
        assert_eq!(s, WindowStats{mean: 0, min: -4, max: 3, absmax: 4});
        assert_eq!(window_stats(&[i16::MIN, 5]).absmax, 32768);
        assert_eq!(window_stats(&[1, 2]).mean, 2);
        assert_eq!(window_stats(&[]), WindowStats::default());
    }

    #[test]
    fn test_gain_ceiling() {
        let mut n = GainNormalizer::default();
        let mut window = vec![0i16; 100];
        window[10] = 1;
        let report = n.normalize(&mut window);
        assert!(report.gain <= MAX_GAIN);
        assert_eq!(report.gain, MAX_GAIN);
        assert_eq!(window[10], 10000);
    }

    #[test]
    fn test_silence_gets_ceiling() {
        let mut n = GainNormalizer::new(100.0, MAX_GAIN_INC_PER_STRIDE, DcMode::WindowMean);
        let mut window = vec![0i16; 16];
        assert_eq!(n.normalize(&mut window).gain, 100.0);
        assert!(window.iter().all(|s| *s == 0));
    }

    #[test]
    fn test_gain_rises_slowly_and_falls_fast() {
        let mut n = GainNormalizer::default();
        let mut loud: Vec<i16> = (0..64).map(|i| if i % 2 == 0 { 16384 } else { -16384 }).collect();
        assert_eq!(n.normalize(&mut loud).gain, 2.0);

        let mut quiet: Vec<i16> = (0..64).map(|i| if i % 2 == 0 { 1024 } else { -1024 }).collect();
        let g = n.normalize(&mut quiet).gain;
        assert!((g - 2.0 * MAX_GAIN_INC_PER_STRIDE).abs() < 1e-4);

        let mut louder: Vec<i16> = (0..64).map(|i| if i % 2 == 0 { 32767 } else { -32767 }).collect();
        let g = n.normalize(&mut louder).gain;
        assert!(g < 1.001);
    }

    #[test]
    fn test_saturation() {
        let mut s = [30000i16, -30000, 100];
        apply_gain(&mut s, 2.0);
        assert_eq!(s, [32767, -32768, 200]);
    }

    #[test]
    fn test_tracking_dc() {
        let mut n = GainNormalizer::new(1.0, 1.0, DcMode::Tracking);
        let mut window = vec![800i16; 8];
        let report = n.normalize(&mut window);
        // 0/8*7 + 800/8
        assert_eq!(report.dc_removed, 100);
        assert_eq!(window[0], 700);
        let mut window = vec![800i16; 8];
        // (100/8)*7 + 800/8, integer steps.
        assert_eq!(n.normalize(&mut window).dc_removed, 184);
    }
}
