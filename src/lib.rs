// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

pub mod abstract_camera;
pub mod audio_capture;
pub mod audio_normalize;
pub mod auto_gain;
pub mod bayer;
pub mod color_correction;
pub mod config;
pub mod feature_cache;
pub mod frame_resize;
pub mod image_camera;
pub mod inference;
pub mod mfcc;
pub mod select_camera;
pub mod sensor_camera;
pub mod sliding_window;
pub mod virtual_camera;
