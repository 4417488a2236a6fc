// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::f32::consts::PI;
use std::time::Duration;

use imageproc::rect::Rect;

use sensor_pipeline::audio_capture::{AudioFormat, ClipAudioDriver, StrideRecorder};
use sensor_pipeline::audio_normalize::{DcMode, GainNormalizer, MAX_GAIN,
                                       MAX_GAIN_INC_PER_STRIDE, window_stats};
use sensor_pipeline::bayer::{ColorFilter, demosaic_simple};
use sensor_pipeline::color_correction::{ColorCorrector, ColorMatrix, KernelChoice,
                                        TransferFunction};
use sensor_pipeline::config::AudioPipelineConfig;
use sensor_pipeline::frame_resize::{PixelFormat, frame_crop, resize_image};

// Grey Bayer frame through demosaic, crop away the zeroed border, identity
// colour correction and a 2:1 resize.
#[test_log::test]
fn test_grey_frame_stays_grey() {
    let (raw_w, raw_h) = (34u32, 26u32);
    let raw = vec![128u8; (raw_w * raw_h) as usize];
    let mut rgb = vec![0u8; raw.len() * 3];
    let stats = demosaic_simple(&raw, &mut rgb, raw_w as usize, raw_h as usize,
                                ColorFilter::Rggb);
    assert_eq!(stats.over, 0);
    assert_eq!(stats.under, 0);

    let (crop_w, crop_h) = (32u32, 24u32);
    let mut cropped = vec![0u8; (crop_w * crop_h * 3) as usize];
    frame_crop(&rgb, raw_w, raw_h, Rect::at(0, 0).of_size(crop_w, crop_h),
               &mut cropped, PixelFormat::Rgb888).unwrap();
    assert!(cropped.iter().all(|v| *v == 128));

    for kernel in [KernelChoice::Reference, KernelChoice::FixedPoint] {
        let corrector = ColorCorrector::new(ColorMatrix::IDENTITY, TransferFunction::Srgb,
                                            kernel);
        let mut corrected = cropped.clone();
        corrector.apply_in_place(&mut corrected);
        let grey = corrector.lut().lookup(128);

        let mut out = vec![0u8; (crop_w / 2 * crop_h / 2 * 3) as usize];
        resize_image(&corrected, crop_w, crop_h, &mut out, crop_w / 2, crop_h / 2,
                     PixelFormat::Rgb888).unwrap();
        assert!(out.iter().all(|v| *v == grey), "{} kernel", corrector.kernel_name());
    }
}

fn tone_with_offset(samples: usize) -> Vec<i16> {
    // 250 Hz at 16 kHz: 64 samples per period.
    (0..samples).map(|i| {
        (8000.0 * (2.0 * PI * (i % 64) as f32 / 64.0).sin()).round() as i16 + 300
    }).collect()
}

#[test]
fn test_tone_normalised_to_full_scale() {
    let mut clip = tone_with_offset(32000);
    let mut normalizer = GainNormalizer::new(MAX_GAIN, MAX_GAIN_INC_PER_STRIDE,
                                             DcMode::WindowMean);
    let report = normalizer.normalize(&mut clip);
    assert_eq!(report.dc_removed, 300);
    let out = window_stats(&clip);
    assert!(out.max >= 32766, "{}", out);
    assert!(out.min <= -32766, "{}", out);
    assert!(out.mean.abs() <= 1, "{}", out);
}

#[test_log::test(tokio::test)]
async fn test_streamed_tone_normalised_per_window() {
    let driver = ClipAudioDriver::new(AudioFormat::mono(16000),
                                      vec![tone_with_offset(32000)]).unwrap();
    let config = AudioPipelineConfig{stride_timeout: Some(Duration::from_secs(2)),
                                     ..Default::default()};
    let mut recorder = StrideRecorder::start(Box::new(driver), &config).unwrap();
    let mut normalizer = GainNormalizer::new(config.max_gain, config.max_gain_inc_per_stride,
                                             config.dc_mode);
    let mut work = vec![0i16; config.window];
    // 32000 samples give windows ending at 16000, 24000 and 32000.
    for _ in 0..3 {
        let window = recorder.next_window().await.unwrap();
        work.copy_from_slice(window);
        let report = normalizer.normalize(&mut work);
        assert!((report.gain - 4.096).abs() < 1e-3);
        let out = window_stats(&work);
        assert!(out.max >= 32766 && out.min <= -32766, "{}", out);
        assert!(out.mean.abs() <= 1, "{}", out);
    }
    recorder.stop();
}
