// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Aspect-ratio crop and fixed-point bilinear resize of packed frames.
//!
//! Resize contract:
//! * Positions are tracked in a 14-bit fractional accumulator (`FRAC_BITS`).
//! * The first destination sample sits half a source pixel in, so that
//!   downsampling by an integer factor samples between source pixels instead
//!   of being biased towards the top-left.
//! * Every interpolation step rounds to nearest by adding half before the
//!   shift: first along x on the two source rows, then along y.
//! * RGB565 corners are expanded to 8 bits per channel by bit replication
//!   (`(v << 3) | (v >> 2)` for 5-bit, `(v << 2) | (v >> 4)` for 6-bit) before
//!   interpolating. Output is always RGB888.
//! * Right/bottom neighbours beyond the frame edge repeat the edge pixel.

use canonical_error::{CanonicalError, invalid_argument_error, out_of_range_error};
use clap::ValueEnum;
use imageproc::rect::Rect;

pub const FRAC_BITS: u32 = 14;
const FRAC_VAL: u32 = 1 << FRAC_BITS;
const FRAC_MASK: u32 = FRAC_VAL - 1;

/// Packed pixel layouts handled by the pipeline.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum PixelFormat {
    #[default]
    Rgb888,
    /// Little-endian 16-bit words, red in the top 5 bits.
    Rgb565,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Rgb888 => 3,
            PixelFormat::Rgb565 => 2,
        }
    }

    /// Maps a bits-per-pixel value (24 or 16) to a format.
    pub fn from_bits_per_pixel(bpp: u32) -> Result<PixelFormat, CanonicalError> {
        match bpp {
            24 => Ok(PixelFormat::Rgb888),
            16 => Ok(PixelFormat::Rgb565),
            _ => Err(invalid_argument_error(
                format!("Frame format with {} bits per pixel not supported", bpp).as_str())),
        }
    }

    pub fn frame_bytes(&self, width: u32, height: u32) -> usize {
        width as usize * height as usize * self.bytes_per_pixel()
    }
}

/// Expands one little-endian RGB565 pixel to RGB888.
#[inline]
pub fn unpack_rgb565(lo: u8, hi: u8) -> [u8; 3] {
    let v = u16::from_le_bytes([lo, hi]);
    let r = ((v >> 11) & 0x1F) as u8;
    let g = ((v >> 5) & 0x3F) as u8;
    let b = (v & 0x1F) as u8;
    [(r << 3) | (r >> 2), (g << 2) | (g >> 4), (b << 3) | (b >> 2)]
}

/// Packs RGB888 into a little-endian RGB565 pixel by truncation.
#[inline]
pub fn pack_rgb565(rgb: [u8; 3]) -> [u8; 2] {
    let v = ((rgb[0] as u16 >> 3) << 11) | ((rgb[1] as u16 >> 2) << 5) | (rgb[2] as u16 >> 3);
    v.to_le_bytes()
}

/// Crop dimensions that give `dst` aspect ratio: the longer source axis is
/// scaled down, the shorter one kept. Integer truncation throughout. The
/// result can exceed the source when `dst` is more elongated than it; see
/// `fit_crop_dims`.
pub fn calculate_crop_dims(src_w: u32, src_h: u32, dst_w: u32, dst_h: u32)
                           -> Result<(u32, u32), CanonicalError> {
    if dst_w == 0 || dst_h == 0 {
        return Err(invalid_argument_error(
            format!("Invalid output size {}x{}", dst_w, dst_h).as_str()));
    }
    let scaled = |num: u32, src: u32, den: u32| {
        (num as u64 * src as u64 / den as u64).min(u32::MAX as u64) as u32
    };
    if src_w > src_h {
        Ok((scaled(dst_w, src_h, dst_h), src_h))
    } else {
        Ok((src_w, scaled(dst_h, src_w, dst_w)))
    }
}

/// Like `calculate_crop_dims`, but fails unless the crop is non-empty and
/// lies within the source frame.
pub fn fit_crop_dims(src_w: u32, src_h: u32, dst_w: u32, dst_h: u32)
                     -> Result<(u32, u32), CanonicalError> {
    let (crop_w, crop_h) = calculate_crop_dims(src_w, src_h, dst_w, dst_h)?;
    if crop_w > src_w || crop_h > src_h {
        return Err(out_of_range_error(
            format!("Crop {}x{} for output {}x{} exceeds {}x{} frame",
                    crop_w, crop_h, dst_w, dst_h, src_w, src_h).as_str()));
    }
    if crop_w == 0 || crop_h == 0 {
        return Err(invalid_argument_error(
            format!("Output {}x{} degenerates to an empty crop", dst_w, dst_h).as_str()));
    }
    Ok((crop_w, crop_h))
}

fn check_window(src_w: u32, src_h: u32, window: &Rect) -> Result<(), CanonicalError> {
    let fits = window.left() >= 0 && window.top() >= 0
        && window.left() as u64 + window.width() as u64 <= src_w as u64
        && window.top() as u64 + window.height() as u64 <= src_h as u64;
    if !fits {
        return Err(out_of_range_error(
            format!("Crop window {:?} exceeds {}x{} frame", window, src_w, src_h).as_str()));
    }
    Ok(())
}

fn is_full_frame(src_w: u32, src_h: u32, window: &Rect) -> bool {
    window.left() == 0 && window.top() == 0
        && window.width() == src_w && window.height() == src_h
}

/// Copies `window` of the `src_w` x `src_h` frame `src` into the start of
/// `dst`.
pub fn frame_crop(src: &[u8], src_w: u32, src_h: u32, window: Rect,
                  dst: &mut [u8], format: PixelFormat) -> Result<(), CanonicalError> {
    check_window(src_w, src_h, &window)?;
    let bpp = format.bytes_per_pixel();
    let out_bytes = format.frame_bytes(window.width(), window.height());
    if dst.len() < out_bytes {
        return Err(invalid_argument_error(
            format!("Crop output needs {} bytes, buffer has {}", out_bytes, dst.len()).as_str()));
    }
    if is_full_frame(src_w, src_h, &window) {
        dst[..out_bytes].copy_from_slice(&src[..out_bytes]);
        return Ok(());
    }
    let src_stride = src_w as usize * bpp;
    let row_bytes = window.width() as usize * bpp;
    for row in 0..window.height() as usize {
        let s = (window.top() as usize + row) * src_stride + window.left() as usize * bpp;
        dst[row * row_bytes..(row + 1) * row_bytes].copy_from_slice(&src[s..s + row_bytes]);
    }
    Ok(())
}

/// Crops `buf` in place: the window is compacted to the start of the buffer.
pub fn frame_crop_in_place(buf: &mut [u8], src_w: u32, src_h: u32, window: Rect,
                           format: PixelFormat) -> Result<(), CanonicalError> {
    check_window(src_w, src_h, &window)?;
    if is_full_frame(src_w, src_h, &window) {
        return Ok(());
    }
    let bpp = format.bytes_per_pixel();
    let src_stride = src_w as usize * bpp;
    let row_bytes = window.width() as usize * bpp;
    // Destination rows never lie after their source rows, so moving forward
    // row by row never clobbers unread data.
    for row in 0..window.height() as usize {
        let s = (window.top() as usize + row) * src_stride + window.left() as usize * bpp;
        buf.copy_within(s..s + row_bytes, row * row_bytes);
    }
    Ok(())
}

#[inline]
fn corner(src: &[u8], index: usize, format: PixelFormat) -> [u32; 3] {
    match format {
        PixelFormat::Rgb888 => {
            let o = index * 3;
            [src[o] as u32, src[o + 1] as u32, src[o + 2] as u32]
        },
        PixelFormat::Rgb565 => {
            let o = index * 2;
            let p = unpack_rgb565(src[o], src[o + 1]);
            [p[0] as u32, p[1] as u32, p[2] as u32]
        },
    }
}

/// Bilinear resize of `src` (`src_w` x `src_h`, in `format`) into RGB888
/// `dst` of `dst_w` x `dst_h`. See the module docs for the exact rounding.
/// Equal dimensions are a straight copy (or unpack for RGB565).
pub fn resize_image(src: &[u8], src_w: u32, src_h: u32,
                    dst: &mut [u8], dst_w: u32, dst_h: u32,
                    format: PixelFormat) -> Result<(), CanonicalError> {
    if src_h < 2 {
        return Err(out_of_range_error(
            format!("Cannot resize from height {}", src_h).as_str()));
    }
    if src_w == 0 || dst_w == 0 || dst_h == 0 {
        return Err(invalid_argument_error(
            format!("Cannot resize {}x{} to {}x{}", src_w, src_h, dst_w, dst_h).as_str()));
    }
    let in_bytes = format.frame_bytes(src_w, src_h);
    let out_bytes = PixelFormat::Rgb888.frame_bytes(dst_w, dst_h);
    if src.len() < in_bytes || dst.len() < out_bytes {
        return Err(invalid_argument_error(
            format!("Resize buffers too small: have {}/{} bytes, need {}/{}",
                    src.len(), dst.len(), in_bytes, out_bytes).as_str()));
    }
    let (sw, sh) = (src_w as usize, src_h as usize);

    if src_w == dst_w && src_h == dst_h {
        match format {
            PixelFormat::Rgb888 => dst[..out_bytes].copy_from_slice(&src[..in_bytes]),
            PixelFormat::Rgb565 => {
                for (s, d) in src[..in_bytes].chunks_exact(2).zip(dst.chunks_exact_mut(3)) {
                    d.copy_from_slice(&unpack_rgb565(s[0], s[1]));
                }
            },
        }
        return Ok(());
    }

    let src_x_frac = ((src_w as u64 * FRAC_VAL as u64) / dst_w as u64) as u32;
    let src_y_frac = ((src_h as u64 * FRAC_VAL as u64) / dst_h as u64) as u32;
    let half = FRAC_VAL / 2;

    let mut src_y_accum = half;
    let mut out = 0;
    for _ in 0..dst_h {
        let ty = ((src_y_accum >> FRAC_BITS) as usize).min(sh - 1);
        let ty1 = (ty + 1).min(sh - 1);
        let y_frac = src_y_accum & FRAC_MASK;
        let ny_frac = FRAC_VAL - y_frac;
        src_y_accum += src_y_frac;

        let mut src_x_accum = half;
        for _ in 0..dst_w {
            let tx = ((src_x_accum >> FRAC_BITS) as usize).min(sw - 1);
            let tx1 = (tx + 1).min(sw - 1);
            let x_frac = src_x_accum & FRAC_MASK;
            let nx_frac = FRAC_VAL - x_frac;
            src_x_accum += src_x_frac;

            let p00 = corner(src, ty * sw + tx, format);
            let p10 = corner(src, ty * sw + tx1, format);
            let p01 = corner(src, ty1 * sw + tx, format);
            let p11 = corner(src, ty1 * sw + tx1, format);
            for c in 0..3 {
                let top = (p00[c] * nx_frac + p10[c] * x_frac + half) >> FRAC_BITS;
                let bottom = (p01[c] * nx_frac + p11[c] * x_frac + half) >> FRAC_BITS;
                dst[out + c] = ((top * ny_frac + bottom * y_frac + half) >> FRAC_BITS) as u8;
            }
            out += 3;
        }
    }
    Ok(())
}

/// Crops `buf` (in place) to the aspect ratio of `dst_w` x `dst_h`, centred,
/// then resizes the crop into RGB888 `dst`.
pub fn crop_and_interpolate(buf: &mut [u8], src_w: u32, src_h: u32,
                            dst: &mut [u8], dst_w: u32, dst_h: u32,
                            format: PixelFormat) -> Result<(), CanonicalError> {
    let (crop_w, crop_h) = fit_crop_dims(src_w, src_h, dst_w, dst_h)?;
    let window = Rect::at(((src_w - crop_w) / 2) as i32, ((src_h - crop_h) / 2) as i32)
        .of_size(crop_w, crop_h);
    frame_crop_in_place(buf, src_w, src_h, window, format)?;
    resize_image(&buf[..format.frame_bytes(crop_w, crop_h)], crop_w, crop_h,
                 dst, dst_w, dst_h, format)
}
