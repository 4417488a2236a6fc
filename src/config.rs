// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Pipeline settings with their defaults. Binaries fill these from command
//! line arguments.

use std::time::Duration;

use crate::audio_capture::MicSelection;
use crate::audio_normalize::{DcMode, MAX_GAIN, MAX_GAIN_INC_PER_STRIDE};
use crate::color_correction::{ColorMatrixPreset, KernelChoice, TransferFunction};

#[derive(Clone, Debug)]
pub struct ImagePipelineConfig {
    pub matrix: ColorMatrixPreset,
    pub transfer: TransferFunction,
    pub kernel: KernelChoice,
    /// Run the software gain controller on demosaiced frames.
    pub auto_gain: bool,
    /// Bound on the frame wait; `None` waits forever.
    pub capture_timeout: Option<Duration>,
    /// How often a polling backend checks for completion.
    pub poll_interval: Duration,
}

impl Default for ImagePipelineConfig {
    fn default() -> Self {
        ImagePipelineConfig{
            matrix: ColorMatrixPreset::Revised,
            transfer: TransferFunction::Srgb,
            kernel: KernelChoice::Auto,
            auto_gain: true,
            capture_timeout: Some(Duration::from_secs(2)),
            poll_interval: Duration::from_millis(1),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AudioPipelineConfig {
    pub sample_rate: u32,
    /// Samples in one analysis window.
    pub window: usize,
    /// Samples the window advances per step.
    pub stride: usize,
    /// Mono samples per driver transfer.
    pub block: usize,
    pub mics: MicSelection,
    pub max_gain: f32,
    pub max_gain_inc_per_stride: f32,
    pub dc_mode: DcMode,
    /// Bound on the wait for each stride; `None` waits forever.
    pub stride_timeout: Option<Duration>,
}

impl Default for AudioPipelineConfig {
    fn default() -> Self {
        AudioPipelineConfig{
            sample_rate: 16000,
            window: 16000,
            stride: 8000,
            block: 1600,
            mics: MicSelection::Mix,
            max_gain: MAX_GAIN,
            max_gain_inc_per_stride: MAX_GAIN_INC_PER_STRIDE,
            dc_mode: DcMode::WindowMean,
            stride_timeout: Some(Duration::from_secs(5)),
        }
    }
}

/// Feature extraction settings for keyword spotting.
#[derive(Clone, Debug)]
pub struct MfccConfig {
    pub sampling_freq: f32,
    pub num_fbank_bins: usize,
    pub mel_lo_freq: f32,
    pub mel_hi_freq: f32,
    pub num_mfcc_features: usize,
    /// Samples per feature frame.
    pub frame_len: usize,
    /// Samples between feature frames.
    pub frame_stride: usize,
    /// Feature frames per inference.
    pub num_frames: usize,
    pub use_htk_method: bool,
    /// Input tensor quantisation.
    pub quant_scale: f32,
    pub quant_offset: i32,
}

impl Default for MfccConfig {
    fn default() -> Self {
        MfccConfig{
            sampling_freq: 16000.0,
            num_fbank_bins: 40,
            mel_lo_freq: 20.0,
            mel_hi_freq: 4000.0,
            num_mfcc_features: 10,
            frame_len: 640,
            frame_stride: 320,
            num_frames: 49,
            use_htk_method: true,
            quant_scale: 1.0,
            quant_offset: 0,
        }
    }
}
