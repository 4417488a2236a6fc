// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Per-pixel colour correction of packed RGB888 frames: a 3x3 matrix
//! followed by a gamma (OETF) lookup table.

use std::fmt;

use clap::ValueEnum;
use log::debug;

/// Colour correction matrix. `rows[out][in]` is the contribution of input
/// channel `in` to output channel `out`, with channels ordered R, G, B.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ColorMatrix {
    rows: [[f32; 3]; 3],
}

impl ColorMatrix {
    /// Coefficients in use since June 2023.
    pub const REVISED: ColorMatrix = ColorMatrix::from_coefficients(
        2.2583, -0.5501, -0.1248,
        -0.1606, 1.4318, -0.5268,
        -0.6317, -0.0653, 2.3735);

    /// Coefficients used before June 2023.
    pub const LEGACY: ColorMatrix = ColorMatrix::from_coefficients(
        2.092, -0.492, -0.139,
        -0.369, 1.315, -0.664,
        -0.636, 0.162, 3.017);

    pub const IDENTITY: ColorMatrix = ColorMatrix::from_coefficients(
        1.0, 0.0, 0.0,
        0.0, 1.0, 0.0,
        0.0, 0.0, 1.0);

    /// Builds a matrix from coefficients named `c_<in><out>`: `c_rg` is how
    /// much of the red input ends up in the green output.
    #[allow(clippy::too_many_arguments)]
    pub const fn from_coefficients(c_rr: f32, c_rg: f32, c_rb: f32,
                                   c_gr: f32, c_gg: f32, c_gb: f32,
                                   c_br: f32, c_bg: f32, c_bb: f32) -> ColorMatrix {
        ColorMatrix{rows: [[c_rr, c_gr, c_br],
                           [c_rg, c_gg, c_bg],
                           [c_rb, c_gb, c_bb]]}
    }

    pub fn rows(&self) -> &[[f32; 3]; 3] {
        &self.rows
    }
}

/// Named coefficient sets, selectable at run time.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum ColorMatrixPreset {
    #[default]
    Revised,
    Legacy,
    Identity,
}

impl ColorMatrixPreset {
    pub fn matrix(&self) -> ColorMatrix {
        match self {
            ColorMatrixPreset::Revised => ColorMatrix::REVISED,
            ColorMatrixPreset::Legacy => ColorMatrix::LEGACY,
            ColorMatrixPreset::Identity => ColorMatrix::IDENTITY,
        }
    }
}

/// Opto-electronic transfer function baked into the gamma table.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum TransferFunction {
    #[default]
    Srgb,
    Rec709,
    Linear,
}

impl TransferFunction {
    /// Maps linear light in [0, 1] to the encoded value in [0, 1].
    pub fn encode(&self, x: f32) -> f32 {
        match self {
            TransferFunction::Srgb => {
                if x <= 0.0031308 {
                    12.92 * x
                } else {
                    1.055 * x.powf(1.0 / 2.4) - 0.055
                }
            },
            TransferFunction::Rec709 => {
                if x < 0.018 {
                    4.5 * x
                } else {
                    1.099 * x.powf(0.45) - 0.099
                }
            },
            TransferFunction::Linear => x,
        }
    }
}

impl fmt::Display for TransferFunction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)  // Just re-use Debug.
    }
}

/// 256-entry gamma table, built once when the corrector is constructed.
#[derive(Clone)]
pub struct GammaLut {
    table: [u8; 256],
}

impl GammaLut {
    pub fn new(transfer: TransferFunction) -> Self {
        let mut table = [0u8; 256];
        for (i, entry) in table.iter_mut().enumerate() {
            let v = 255.0 * transfer.encode(i as f32 / 255.0) + 0.5;
            *entry = v.clamp(0.0, 255.0) as u8;
        }
        GammaLut{table}
    }

    pub fn lookup(&self, value: u8) -> u8 {
        self.table[value as usize]
    }

    pub fn table(&self) -> &[u8; 256] {
        &self.table
    }
}

/// Matrix stage of the colour correction. Implementations must agree to
/// within one count per channel; the result is always clamped to [0, 255].
pub trait CorrectionKernel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Transforms packed RGB888 `src` into `dst` (same length).
    fn transform(&self, src: &[u8], dst: &mut [u8]);

    /// Transforms packed RGB888 `pixels` in place.
    fn transform_in_place(&self, pixels: &mut [u8]);
}

/// Floating point, one pixel at a time. Rounds to nearest before clamping.
pub struct ReferenceKernel {
    rows: [[f32; 3]; 3],
}

impl ReferenceKernel {
    pub fn new(matrix: &ColorMatrix) -> Self {
        ReferenceKernel{rows: *matrix.rows()}
    }

    fn pixel(&self, p: &[u8]) -> [u8; 3] {
        let (r, g, b) = (p[0] as f32, p[1] as f32, p[2] as f32);
        let mut out = [0u8; 3];
        for (o, row) in out.iter_mut().zip(self.rows.iter()) {
            let v = row[0] * r + row[1] * g + row[2] * b;
            *o = v.round().clamp(0.0, 255.0) as u8;
        }
        out
    }
}

impl CorrectionKernel for ReferenceKernel {
    fn name(&self) -> &'static str {
        "reference"
    }

    fn transform(&self, src: &[u8], dst: &mut [u8]) {
        for (s, d) in src.chunks_exact(3).zip(dst.chunks_exact_mut(3)) {
            d.copy_from_slice(&self.pixel(s));
        }
    }

    fn transform_in_place(&self, pixels: &mut [u8]) {
        for p in pixels.chunks_exact_mut(3) {
            let out = self.pixel(p);
            p.copy_from_slice(&out);
        }
    }
}

const FIXED_SHIFT: u32 = 20;
const BLOCK_PIXELS: usize = 8;

/// Q20 fixed point, processing blocks of pixels de-interleaved into planes so
/// the inner loops vectorize.
pub struct FixedPointKernel {
    rows: [[i64; 3]; 3],
}

impl FixedPointKernel {
    pub fn new(matrix: &ColorMatrix) -> Self {
        let mut rows = [[0i64; 3]; 3];
        for (dst, src) in rows.iter_mut().zip(matrix.rows().iter()) {
            for (d, s) in dst.iter_mut().zip(src.iter()) {
                *d = (*s as f64 * (1u64 << FIXED_SHIFT) as f64).round() as i64;
            }
        }
        FixedPointKernel{rows}
    }

    fn block(&self, src: &[u8], dst: &mut [u8]) {
        let n = src.len() / 3;
        let mut planes = [[0i64; BLOCK_PIXELS]; 3];
        for i in 0..n {
            for c in 0..3 {
                planes[c][i] = src[i * 3 + c] as i64;
            }
        }
        let round = 1i64 << (FIXED_SHIFT - 1);
        for (c, row) in self.rows.iter().enumerate() {
            let mut acc = [0i64; BLOCK_PIXELS];
            for i in 0..BLOCK_PIXELS {
                acc[i] = row[0] * planes[0][i] + row[1] * planes[1][i]
                    + row[2] * planes[2][i] + round;
            }
            for i in 0..n {
                dst[i * 3 + c] = (acc[i] >> FIXED_SHIFT).clamp(0, 255) as u8;
            }
        }
    }
}

impl CorrectionKernel for FixedPointKernel {
    fn name(&self) -> &'static str {
        "fixed-point"
    }

    fn transform(&self, src: &[u8], dst: &mut [u8]) {
        for (s, d) in src.chunks(BLOCK_PIXELS * 3).zip(dst.chunks_mut(BLOCK_PIXELS * 3)) {
            self.block(s, d);
        }
    }

    fn transform_in_place(&self, pixels: &mut [u8]) {
        let mut scratch = [0u8; BLOCK_PIXELS * 3];
        for chunk in pixels.chunks_mut(BLOCK_PIXELS * 3) {
            let len = chunk.len();
            self.block(chunk, &mut scratch[..len]);
            chunk.copy_from_slice(&scratch[..len]);
        }
    }
}

/// Which matrix kernel a `ColorCorrector` uses.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum KernelChoice {
    Reference,
    FixedPoint,
    /// Fixed point on targets with wide integer SIMD, reference elsewhere.
    #[default]
    Auto,
}

impl KernelChoice {
    fn build(&self, matrix: &ColorMatrix) -> Box<dyn CorrectionKernel> {
        let use_fixed = match self {
            KernelChoice::Reference => false,
            KernelChoice::FixedPoint => true,
            KernelChoice::Auto => cfg!(any(target_arch = "x86_64",
                                           target_arch = "aarch64",
                                           target_feature = "mve")),
        };
        if use_fixed {
            Box::new(FixedPointKernel::new(matrix))
        } else {
            Box::new(ReferenceKernel::new(matrix))
        }
    }
}

/// Matrix kernel plus gamma table, ready to apply to frames.
pub struct ColorCorrector {
    matrix: ColorMatrix,
    transfer: TransferFunction,
    lut: GammaLut,
    kernel: Box<dyn CorrectionKernel>,
}

impl ColorCorrector {
    pub fn new(matrix: ColorMatrix, transfer: TransferFunction,
               choice: KernelChoice) -> Self {
        let kernel = choice.build(&matrix);
        debug!("Colour correction using {} kernel, {} transfer",
               kernel.name(), transfer);
        ColorCorrector{matrix, transfer, lut: GammaLut::new(transfer), kernel}
    }

    pub fn matrix(&self) -> &ColorMatrix {
        &self.matrix
    }

    pub fn transfer(&self) -> TransferFunction {
        self.transfer
    }

    pub fn lut(&self) -> &GammaLut {
        &self.lut
    }

    pub fn kernel_name(&self) -> &'static str {
        self.kernel.name()
    }

    /// Corrects packed RGB888 `src` into `dst`.
    pub fn apply(&self, src: &[u8], dst: &mut [u8]) {
        assert_eq!(src.len(), dst.len());
        assert_eq!(src.len() % 3, 0);
        self.kernel.transform(src, dst);
        self.apply_lut(dst);
    }

    /// Corrects packed RGB888 `pixels` in place.
    pub fn apply_in_place(&self, pixels: &mut [u8]) {
        assert_eq!(pixels.len() % 3, 0);
        self.kernel.transform_in_place(pixels);
        self.apply_lut(pixels);
    }

    fn apply_lut(&self, pixels: &mut [u8]) {
        for v in pixels.iter_mut() {
            *v = self.lut.lookup(*v);
        }
    }
}
