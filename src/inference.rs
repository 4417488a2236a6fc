// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Feeding captured frames and audio features to an inference model.

use canonical_error::{CanonicalError, invalid_argument_error};
use log::{debug, info};

use crate::abstract_camera::{AbstractCamera, CameraStatus};
use crate::audio_capture::StrideRecorder;
use crate::audio_normalize::{GainNormalizer, NormalizeReport};
use crate::config::{AudioPipelineConfig, MfccConfig};
use crate::feature_cache::{FeatureCache, WindowPlan};
use crate::mfcc::Mfcc;
use crate::sliding_window::{FractionalSlidingWindow, SlidingWindow};

/// Neural network runtime. Tensors are exposed as raw bytes in the model's
/// own element type.
pub trait InferenceModel: Send {
    fn input_tensor_mut(&mut self, index: usize) -> Result<&mut [u8], CanonicalError>;

    fn run_inference(&mut self) -> Result<(), CanonicalError>;

    fn output_tensor(&self, index: usize) -> Result<&[u8], CanonicalError>;
}

/// Waits for the camera's frame, copies it into input tensor 0 and runs
/// the model. A stopped single-frame camera is restarted before inference
/// so the next exposure overlaps it.
pub async fn capture_and_infer(camera: &mut dyn AbstractCamera,
                               model: &mut dyn InferenceModel)
                               -> Result<(), CanonicalError> {
    let frame = camera.get_captured_frame().await?;
    let input = model.input_tensor_mut(0)?;
    if input.len() != frame.len() {
        return Err(invalid_argument_error(
            format!("Frame is {} bytes but the input tensor is {}",
                    frame.len(), input.len()).as_str()));
    }
    input.copy_from_slice(frame);
    if camera.status() == CameraStatus::Stopped {
        camera.start()?;
    }
    model.run_inference()
}

/// Result of one analysis window.
#[derive(Copy, Clone, Debug)]
pub struct WindowReport {
    /// 0-based index of the analysis window.
    pub window_index: u64,
    pub normalize: NormalizeReport,
    /// Feature frames taken from the cache rather than computed.
    pub reused_frames: usize,
}

/// Normalises analysis windows, extracts quantised MFCC features into the
/// model's input tensor (frame-major, `num_mfcc_features` per frame) and
/// runs inference.
pub struct AudioFeaturePipeline {
    plan: WindowPlan,
    normalizer: GainNormalizer,
    mfcc: Mfcc,
    cache: FeatureCache<i8>,
    scratch: Vec<i16>,
    windows: u64,
}

impl AudioFeaturePipeline {
    pub fn new(audio: &AudioPipelineConfig, mfcc: &MfccConfig) -> Result<Self, CanonicalError> {
        let plan = WindowPlan::from_config(mfcc)?;
        info!("Audio window {} stride {}, {} of {} feature frames reused per window",
              plan.audio_window, plan.audio_stride, plan.reused_vectors, plan.num_frames);
        Ok(AudioFeaturePipeline{
            plan,
            normalizer: GainNormalizer::new(audio.max_gain, audio.max_gain_inc_per_stride,
                                            audio.dc_mode),
            mfcc: Mfcc::new(mfcc)?,
            cache: FeatureCache::new(&plan),
            scratch: vec![0; plan.audio_window],
            windows: 0,
        })
    }

    /// `base` with window and stride set to match this pipeline, for
    /// starting a `StrideRecorder`.
    pub fn recorder_config(&self, base: &AudioPipelineConfig) -> AudioPipelineConfig {
        AudioPipelineConfig{window: self.plan.audio_window,
                            stride: self.plan.audio_stride,
                            ..base.clone()}
    }

    pub fn plan(&self) -> &WindowPlan {
        &self.plan
    }

    /// Starts over, e.g. for a new clip.
    pub fn reset(&mut self) {
        self.cache.clear();
        self.windows = 0;
    }

    /// Processes `window`, which must directly follow the previous window
    /// by one audio stride for cached features to be valid.
    pub fn process_window(&mut self, window: &[i16], model: &mut dyn InferenceModel)
                          -> Result<WindowReport, CanonicalError> {
        if window.len() != self.plan.audio_window {
            return Err(invalid_argument_error(
                format!("Window has {} samples, expected {}",
                        window.len(), self.plan.audio_window).as_str()));
        }
        // The caller's window is left untouched; overlapping samples are
        // needed unnormalised for the next window.
        self.scratch.copy_from_slice(window);
        let normalize = self.normalizer.normalize(&mut self.scratch);

        let n = self.mfcc.num_features();
        let input = model.input_tensor_mut(0)?;
        if input.len() < self.plan.num_frames * n {
            return Err(invalid_argument_error(
                format!("Input tensor holds {} bytes, need {}",
                        input.len(), self.plan.num_frames * n).as_str()));
        }
        let use_cache = self.windows > 0 && self.plan.reused_vectors > 0;
        let hits_before = self.cache.hits();
        let mut frames = SlidingWindow::new(&self.scratch, self.plan.frame_len,
                                            self.plan.frame_stride)?;
        let mfcc = &mut self.mfcc;
        while let Some(frame) = frames.next_window() {
            let index = frames.index();
            let features = self.cache.features(index, use_cache,
                                               || mfcc.compute_quantized(frame))?;
            for (dst, f) in input[index * n..(index + 1) * n].iter_mut().zip(features) {
                *dst = f as u8;
            }
        }
        model.run_inference()?;

        let report = WindowReport{window_index: self.windows, normalize,
                                  reused_frames: (self.cache.hits() - hits_before) as usize};
        debug!("Window {}: gain {:.1} dB, {} frames reused", report.window_index,
               normalize.gain_db(), report.reused_frames);
        self.windows += 1;
        Ok(report)
    }

    /// Waits for the recorder's next window and processes it. The recorder
    /// is already capturing the following stride while this runs.
    pub async fn process_next(&mut self, recorder: &mut StrideRecorder,
                              model: &mut dyn InferenceModel)
                              -> Result<WindowReport, CanonicalError> {
        let window = recorder.next_window().await?;
        self.process_window(window, model)
    }

    /// Runs a whole clip through the model, one analysis stride at a time.
    /// A partial final window is zero padded. `on_output` receives each
    /// window's report and output tensor 0.
    pub fn process_clip<F>(&mut self, clip: &[i16], model: &mut dyn InferenceModel,
                           mut on_output: F) -> Result<usize, CanonicalError>
    where F: FnMut(&WindowReport, &[u8])
    {
        self.reset();
        let mut padded = vec![0i16; self.plan.audio_window];
        let mut windows = FractionalSlidingWindow::new(clip, self.plan.audio_window,
                                                       self.plan.audio_stride)?;
        let mut count = 0;
        while let Some(w) = windows.next_window() {
            padded[..w.len()].copy_from_slice(w);
            padded[w.len()..].fill(0);
            let report = self.process_window(&padded, model)?;
            on_output(&report, model.output_tensor(0)?);
            count += 1;
        }
        Ok(count)
    }
}
