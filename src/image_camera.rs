// Camera that replays a fixed set of sample images. For testing.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use canonical_error::{CanonicalError, invalid_argument_error, not_found_error,
                      out_of_range_error};
use image::RgbImage;
use log::{debug, info};

use crate::abstract_camera::{AbstractCamera, CameraDevice, CameraStatus,
                             Capabilities, CaptureConfig};
use crate::frame_resize::{PixelFormat, pack_rgb565};

const CAPABILITIES: Capabilities = Capabilities{
    continuous: true,
    formats: &[PixelFormat::Rgb888, PixelFormat::Rgb565],
    max_dimensions: None,
};

pub struct ImageCamera {
    device: CameraDevice,
    samples: Vec<RgbImage>,

    // Samples packed in the configured format.
    frames: Vec<Vec<u8>>,
    next: usize,
    looping: bool,
}

impl ImageCamera {
    pub fn new(samples: Vec<RgbImage>) -> Result<Self, CanonicalError> {
        if samples.is_empty() {
            return Err(invalid_argument_error("No sample images given"));
        }
        Ok(ImageCamera{device: CameraDevice::new("Static sample images", CAPABILITIES),
                       samples,
                       frames: Vec::new(),
                       next: 0,
                       looping: false})
    }

    /// Loads samples from image files of any format the `image` crate reads.
    pub fn from_files<P: AsRef<Path>>(paths: &[P]) -> Result<Self, CanonicalError> {
        let mut samples = Vec::with_capacity(paths.len());
        for path in paths {
            let path = path.as_ref();
            let img = match image::open(path) {
                Ok(img) => img,
                Err(image::ImageError::IoError(e)) => {
                    return Err(not_found_error(
                        format!("{}: {}", path.display(), e).as_str()));
                },
                Err(e) => {
                    return Err(invalid_argument_error(
                        format!("{}: {}", path.display(), e).as_str()));
                },
            };
            samples.push(img.to_rgb8());
        }
        ImageCamera::new(samples)
    }

    /// When set, replay restarts from the first sample instead of ending.
    pub fn set_looping(&mut self, looping: bool) {
        self.looping = looping;
    }

    pub fn sample_dimensions(&self) -> (u32, u32) {
        self.samples[0].dimensions()
    }

    fn exhausted(&self) -> bool {
        self.next >= self.frames.len()
    }

    fn pack(sample: &RgbImage, format: PixelFormat) -> Vec<u8> {
        match format {
            PixelFormat::Rgb888 => sample.as_raw().clone(),
            PixelFormat::Rgb565 => sample.pixels().flat_map(|p| pack_rgb565(p.0)).collect(),
        }
    }
}

#[async_trait]
impl AbstractCamera for ImageCamera {
    fn device_name(&self) -> String {
        self.device.name().to_string()
    }

    fn init(&mut self) -> Result<(), CanonicalError> {
        self.device.reset();
        self.frames.clear();
        self.next = 0;
        self.device.mark_initialised();
        info!("{}: {} samples", self.device.name(), self.samples.len());
        Ok(())
    }

    fn configure(&mut self, config: &CaptureConfig) -> Result<(), CanonicalError> {
        self.device.check_config(config)?;
        for (i, sample) in self.samples.iter().enumerate() {
            if sample.dimensions() != (config.width, config.height) {
                return Err(invalid_argument_error(
                    format!("Sample {} is {}x{}, not the requested {}x{}", i,
                            sample.width(), sample.height(),
                            config.width, config.height).as_str()));
            }
        }
        self.device.configure(config)?;
        self.frames = self.samples.iter().map(|s| Self::pack(s, config.format)).collect();
        self.next = 0;
        Ok(())
    }

    fn set_buffer(&mut self, buffer: Vec<u8>) -> Result<(), CanonicalError> {
        self.device.set_buffer(buffer)
    }

    fn start(&mut self) -> Result<(), CanonicalError> {
        if self.exhausted() && self.device.config().is_some() {
            return Err(out_of_range_error("No more sample images"));
        }
        self.device.begin_capture()
    }

    async fn get_captured_frame(&mut self) -> Result<&[u8], CanonicalError> {
        self.device.check_running()?;
        if self.exhausted() {
            self.device.stop();
            return Err(out_of_range_error("No more sample images"));
        }
        self.device.frame_mut().copy_from_slice(&self.frames[self.next]);
        debug!("{}: sample {}", self.device.name(), self.next);
        self.next += 1;
        if self.exhausted() && self.looping {
            self.next = 0;
        }
        self.device.complete_capture();
        Ok(self.device.frame())
    }

    fn stop(&mut self) -> Result<(), CanonicalError> {
        self.device.stop();
        Ok(())
    }

    fn status(&self) -> CameraStatus {
        self.device.status()
    }

    fn release(&mut self) {
        self.device.reset();
        self.frames.clear();
        self.next = 0;
    }

    // Samples are available immediately; there is nothing to wait for.
    fn set_capture_timeout(&mut self, _timeout: Option<Duration>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use canonical_error::CanonicalErrorCode;
    use image::Rgb;

    use crate::abstract_camera::CameraMode;

    fn solid(w: u32, h: u32, v: u8) -> RgbImage {
        RgbImage::from_pixel(w, h, Rgb([v, v / 2, 255 - v]))
    }

    #[tokio::test]
    async fn test_replays_then_ends() {
        let mut cam = ImageCamera::new(vec![solid(4, 2, 10), solid(4, 2, 20)]).unwrap();
        cam.init().unwrap();
        cam.configure(&CaptureConfig::new(4, 2)).unwrap();
        for v in [10u8, 20] {
            cam.start().unwrap();
            let frame = cam.get_captured_frame().await.unwrap();
            assert_eq!(&frame[..3], &[v, v / 2, 255 - v]);
            assert_eq!(cam.status(), CameraStatus::Stopped);
        }
        assert_eq!(cam.start().unwrap_err().code, CanonicalErrorCode::OutOfRange);
        assert_eq!(cam.status(), CameraStatus::Stopped);
    }

    #[tokio::test]
    async fn test_looping_continuous() {
        let mut cam = ImageCamera::new(vec![solid(2, 2, 1), solid(2, 2, 2)]).unwrap();
        cam.set_looping(true);
        cam.init().unwrap();
        let mut config = CaptureConfig::new(2, 2);
        config.mode = CameraMode::Continuous;
        cam.configure(&config).unwrap();
        cam.start().unwrap();
        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(cam.get_captured_frame().await.unwrap()[0]);
            assert_eq!(cam.status(), CameraStatus::Running);
        }
        assert_eq!(seen, vec![1, 2, 1, 2, 1]);
        cam.stop().unwrap();
        assert_eq!(cam.status(), CameraStatus::Stopped);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejected() {
        let mut cam = ImageCamera::new(vec![solid(4, 2, 10)]).unwrap();
        cam.init().unwrap();
        assert!(cam.configure(&CaptureConfig::new(2, 4)).is_err());
        assert_eq!(cam.status(), CameraStatus::Invalid);
    }

    #[tokio::test]
    async fn test_rgb565_samples() {
        let mut cam = ImageCamera::new(vec![solid(3, 2, 255)]).unwrap();
        cam.init().unwrap();
        let mut config = CaptureConfig::new(3, 2);
        config.format = PixelFormat::Rgb565;
        cam.configure(&config).unwrap();
        cam.start().unwrap();
        let frame = cam.get_captured_frame().await.unwrap();
        assert_eq!(frame.len(), 12);
        assert_eq!(&frame[..2], &pack_rgb565([255, 127, 0]));
    }

    #[tokio::test]
    async fn test_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.png");
        solid(5, 3, 40).save(&path).unwrap();
        let mut cam = ImageCamera::from_files(&[&path]).unwrap();
        assert_eq!(cam.sample_dimensions(), (5, 3));
        cam.init().unwrap();
        cam.configure(&CaptureConfig::new(5, 3)).unwrap();
        cam.start().unwrap();
        assert_eq!(cam.get_captured_frame().await.unwrap()[0], 40);

        let missing = dir.path().join("missing.png");
        assert!(ImageCamera::from_files(&[missing]).is_err());
    }
}
