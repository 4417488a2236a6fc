//! Reuse of per-frame features across overlapping analysis windows.
//!
//! Consecutive analysis windows overlap, so the trailing feature frames of
//! one window are the leading feature frames of the next. `FeatureCache`
//! keeps the trailing frames' features so they are computed once.

use canonical_error::{CanonicalError, invalid_argument_error};
use log::debug;

use crate::config::MfccConfig;

/// Window geometry for feature extraction, all in samples unless noted.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct WindowPlan {
    pub frame_len: usize,
    pub frame_stride: usize,
    /// Feature frames per analysis window.
    pub num_frames: usize,
    /// Analysis window length.
    pub audio_window: usize,
    /// Analysis window advance, a multiple of `frame_stride`.
    pub audio_stride: usize,
    /// Feature frames newly computed per analysis stride.
    pub vectors_per_stride: usize,
    /// Feature frames carried over between consecutive windows.
    pub reused_vectors: usize,
}

impl WindowPlan {
    /// Plans an analysis window of `num_frames` feature frames, advancing by
    /// half a window rounded down to whole feature frames.
    pub fn new(frame_len: usize, frame_stride: usize, num_frames: usize)
               -> Result<Self, CanonicalError> {
        if frame_stride == 0 || frame_len < frame_stride || num_frames == 0 {
            return Err(invalid_argument_error(
                format!("Invalid feature framing: len {} stride {} frames {}",
                        frame_len, frame_stride, num_frames).as_str()));
        }
        let audio_window = num_frames * frame_stride + (frame_len - frame_stride);
        let mut audio_stride = audio_window / 2;
        audio_stride -= audio_stride % frame_stride;
        if audio_stride == 0 {
            return Err(invalid_argument_error(
                format!("Window of {} samples is too short to stride by {}",
                        audio_window, frame_stride).as_str()));
        }
        let vectors_per_stride = audio_stride / frame_stride;
        let total_strides = (audio_window - frame_len) / frame_stride;
        let reused_vectors = (total_strides + 1).saturating_sub(vectors_per_stride);
        Ok(WindowPlan{frame_len, frame_stride, num_frames, audio_window, audio_stride,
                      vectors_per_stride, reused_vectors})
    }

    pub fn from_config(config: &MfccConfig) -> Result<Self, CanonicalError> {
        WindowPlan::new(config.frame_len, config.frame_stride, config.num_frames)
    }
}

/// Fixed-size store of feature vectors, indexed by frame position within
/// the analysis window.
#[derive(Debug)]
pub struct FeatureCache<T> {
    slots: Vec<Option<Vec<T>>>,
    // Frames at or past this index are kept for the next window.
    overlap_index: usize,
    hits: u64,
    misses: u64,
}

impl<T: Clone> FeatureCache<T> {
    pub fn new(plan: &WindowPlan) -> Self {
        FeatureCache{slots: vec![None; plan.reused_vectors],
                     overlap_index: plan.vectors_per_stride,
                     hits: 0, misses: 0}
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Returns the features of frame `index`, from the cache when
    /// `use_cache` is set and the previous window computed them, otherwise
    /// from `compute`. Frames in the overlap region are saved for the next
    /// window.
    pub fn features<F>(&mut self, index: usize, use_cache: bool, compute: F)
                       -> Result<Vec<T>, CanonicalError>
    where F: FnOnce() -> Result<Vec<T>, CanonicalError>
    {
        let cached = if use_cache && index < self.slots.len() {
            self.slots[index].take()
        } else {
            None
        };
        let features = match cached {
            Some(f) => {
                self.hits += 1;
                f
            },
            None => {
                self.misses += 1;
                compute()?
            },
        };
        if index >= self.overlap_index {
            if let Some(slot) = self.slots.get_mut(index - self.overlap_index) {
                *slot = Some(features.clone());
            }
        }
        Ok(features)
    }

    /// Forgets everything, e.g. at the start of a new clip.
    pub fn clear(&mut self) {
        debug!("Feature cache cleared after {} hits, {} misses", self.hits, self.misses);
        self.slots.iter_mut().for_each(|s| *s = None);
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }
}
