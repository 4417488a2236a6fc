// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Camera backend for a raw image sensor. The sensor driver captures into
//! its own raw buffer; completed frames are demosaiced, gain-controlled,
//! cropped and resized to the configured output, then colour corrected.

use std::time::Duration;

use async_trait::async_trait;
use canonical_error::{CanonicalError, deadline_exceeded_error,
                      failed_precondition_error, internal_error,
                      invalid_argument_error, unavailable_error};
use log::{debug, error, info, warn};
use tokio::time::Instant;

use crate::abstract_camera::{AbstractCamera, CameraDevice, CameraStatus,
                             Capabilities, CaptureConfig};
use crate::auto_gain::{AutoGain, UNITY_GAIN};
use crate::bayer::{ColorFilter, Demosaicer};
use crate::color_correction::ColorCorrector;
use crate::config::ImagePipelineConfig;
use crate::frame_resize::{PixelFormat, crop_and_interpolate, fit_crop_dims, pack_rgb565};

/// Layout of the sensor's raw frames.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RawFormat {
    Bayer(ColorFilter),
    Rgb565,
}

impl RawFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            RawFormat::Bayer(_) => 1,
            RawFormat::Rgb565 => 2,
        }
    }
}

/// Register-level sensor access, as provided by a board support layer.
pub trait SensorDriver: Send {
    fn model(&self) -> String;

    /// Identifies and powers up the sensor.
    fn probe(&mut self) -> Result<(), CanonicalError>;

    fn raw_format(&self) -> RawFormat;

    /// (width, height) of raw frames.
    fn dimensions(&self) -> (u32, u32);

    /// Triggers a single frame capture into the raw buffer.
    fn start_snapshot(&mut self) -> Result<(), CanonicalError>;

    /// True once the triggered frame is complete. Errors on capture failure.
    fn poll_capture(&mut self) -> Result<bool, CanonicalError>;

    /// Most recently completed raw frame.
    fn raw_frame(&self) -> &[u8];

    /// Current gain, Q16.
    fn gain(&self) -> u32;

    /// Requests a gain (Q16); returns the gain actually applied.
    fn set_gain(&mut self, gain: u32) -> Result<u32, CanonicalError>;

    /// Aborts any capture in progress.
    fn stop(&mut self);
}

const RGB888_ONLY: &[PixelFormat] = &[PixelFormat::Rgb888];

pub struct SensorCamera {
    driver: Box<dyn SensorDriver>,
    device: CameraDevice,
    corrector: ColorCorrector,
    demosaicer: Option<Demosaicer>,
    auto_gain: Option<AutoGain>,
    auto_gain_enabled: bool,

    // Full-resolution RGB (or copied RGB565) frame before crop/resize.
    scratch: Vec<u8>,

    poll_interval: Duration,
    timeout: Option<Duration>,
}

impl SensorCamera {
    pub fn new(driver: Box<dyn SensorDriver>, config: &ImagePipelineConfig) -> Self {
        let (width, height) = driver.dimensions();
        let caps = Capabilities{continuous: false,
                                formats: RGB888_ONLY,
                                max_dimensions: Some((width, height))};
        let device = CameraDevice::new(&driver.model(), caps);
        SensorCamera{
            driver,
            device,
            corrector: ColorCorrector::new(config.matrix.matrix(), config.transfer,
                                           config.kernel),
            demosaicer: None,
            auto_gain: None,
            auto_gain_enabled: config.auto_gain,
            scratch: Vec::new(),
            poll_interval: config.poll_interval,
            timeout: config.capture_timeout,
        }
    }

    /// Gain multiplier the sensor is running at.
    pub fn gain(&self) -> f32 {
        self.driver.gain() as f32 / UNITY_GAIN as f32
    }

    // Turns the completed raw frame into the configured output frame.
    fn process_frame(&mut self) -> Result<(), CanonicalError> {
        let config = match self.device.config() {
            Some(c) => *c,
            None => return Err(failed_precondition_error("Camera not configured")),
        };
        let (width, height) = self.driver.dimensions();
        let format = match self.driver.raw_format() {
            RawFormat::Bayer(_) => {
                let demosaicer = match self.demosaicer.as_mut() {
                    Some(d) => d,
                    None => return Err(failed_precondition_error("Camera not initialised")),
                };
                let stats = demosaicer.process(self.driver.raw_frame(), &mut self.scratch,
                                               width as usize, height as usize);
                if let Some(auto_gain) = self.auto_gain.as_mut() {
                    let pixels = (width * height) as usize;
                    match auto_gain.update(&stats, pixels, |g| self.driver.set_gain(g)) {
                        Ok(gain) => debug!("{}: gain {:.3}", self.device.name(), gain),
                        // The frame is still usable at the old gain.
                        Err(e) => warn!("{}: gain update failed: {}", self.device.name(), e),
                    }
                }
                PixelFormat::Rgb888
            },
            RawFormat::Rgb565 => {
                let raw = self.driver.raw_frame();
                self.scratch[..raw.len()].copy_from_slice(raw);
                PixelFormat::Rgb565
            },
        };
        let out = self.device.frame_mut();
        crop_and_interpolate(&mut self.scratch, width, height,
                             out, config.width, config.height, format)?;
        self.corrector.apply_in_place(out);
        Ok(())
    }
}

#[async_trait]
impl AbstractCamera for SensorCamera {
    fn device_name(&self) -> String {
        self.device.name().to_string()
    }

    fn init(&mut self) -> Result<(), CanonicalError> {
        self.device.reset();
        if let Err(e) = self.driver.probe() {
            error!("{}: sensor probe failed: {}", self.device.name(), e);
            return Err(unavailable_error(
                format!("Sensor {} not found: {}", self.device.name(), e).as_str()));
        }
        let (width, height) = self.driver.dimensions();
        self.scratch = vec![0u8; width as usize * height as usize * 3];
        self.demosaicer = match self.driver.raw_format() {
            RawFormat::Bayer(filter) => Some(Demosaicer::new(filter)),
            RawFormat::Rgb565 => None,
        };
        self.auto_gain = match (self.auto_gain_enabled, self.driver.raw_format()) {
            (true, RawFormat::Bayer(_)) => Some(AutoGain::new(self.driver.gain())),
            _ => None,
        };
        self.device.mark_initialised();
        info!("{}: {}x{} {:?}, {} colour kernel", self.device.name(), width, height,
              self.driver.raw_format(), self.corrector.kernel_name());
        Ok(())
    }

    fn configure(&mut self, config: &CaptureConfig) -> Result<(), CanonicalError> {
        self.device.check_config(config)?;
        // The centred aspect crop must fit the sensor frame.
        let (width, height) = self.driver.dimensions();
        if let Err(e) = fit_crop_dims(width, height, config.width, config.height) {
            return Err(invalid_argument_error(
                format!("{}: cannot produce {}x{}: {}", self.device.name(),
                        config.width, config.height, e.message).as_str()));
        }
        self.device.configure(config)?;
        info!("{}: output {}x{} {:?}", self.device.name(),
              config.width, config.height, config.format);
        Ok(())
    }

    fn set_buffer(&mut self, buffer: Vec<u8>) -> Result<(), CanonicalError> {
        self.device.set_buffer(buffer)
    }

    fn start(&mut self) -> Result<(), CanonicalError> {
        self.device.begin_capture()?;
        if let Err(e) = self.driver.start_snapshot() {
            warn!("{}: snapshot failed: {}", self.device.name(), e);
            self.device.fail();
            return Err(e);
        }
        Ok(())
    }

    async fn get_captured_frame(&mut self) -> Result<&[u8], CanonicalError> {
        self.device.check_running()?;
        let deadline = self.timeout.map(|t| Instant::now() + t);
        loop {
            match self.driver.poll_capture() {
                Ok(true) => break,
                Ok(false) => {},
                Err(e) => {
                    warn!("{}: capture failed: {}", self.device.name(), e);
                    self.device.fail();
                    return Err(e);
                },
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    warn!("{}: capture timed out", self.device.name());
                    self.driver.stop();
                    self.device.fail();
                    return Err(deadline_exceeded_error(
                        format!("{} frame not ready after {:?}",
                                self.device.name(), self.timeout.unwrap_or_default()).as_str()));
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
        if let Err(e) = self.process_frame() {
            self.device.fail();
            return Err(internal_error(
                format!("Frame conversion failed: {}", e).as_str()));
        }
        self.device.complete_capture();
        debug!("{}: frame ready, gain {:.3}", self.device.name(), self.gain());
        Ok(self.device.frame())
    }

    fn stop(&mut self) -> Result<(), CanonicalError> {
        if self.device.status() == CameraStatus::Running {
            self.driver.stop();
        }
        self.device.stop();
        Ok(())
    }

    fn status(&self) -> CameraStatus {
        self.device.status()
    }

    fn release(&mut self) {
        self.driver.stop();
        self.device.reset();
        self.demosaicer = None;
        self.auto_gain = None;
    }

    fn set_capture_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }
}

/// Failure to inject into a `SyntheticSensor`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum SensorFault {
    #[default]
    None,
    /// `probe()` fails.
    Absent,
    /// Every capture reports an error.
    CaptureError,
    /// Captures never complete.
    Hang,
    /// Gain requests are refused.
    GainError,
}

/// Sensor driver producing a colour bar test pattern: seven bars stacked
/// vertically, each ramping in intensity from left to right, rolling down
/// one row per frame. Gain scales the pattern and saturates at 255.
pub struct SyntheticSensor {
    width: u32,
    height: u32,
    format: RawFormat,
    raw: Vec<u8>,
    roll: u32,
    gain: u32,
    gain_limits: (u32, u32),
    polls_per_frame: u32,
    pending_polls: Option<u32>,
    fault: SensorFault,
}

impl SyntheticSensor {
    /// Dimensions must be non-zero and even, as the pattern is drawn in 2x2
    /// tiles.
    pub fn new(width: u32, height: u32, format: RawFormat) -> Result<Self, CanonicalError> {
        if width == 0 || height == 0 || width % 2 != 0 || height % 2 != 0 {
            return Err(invalid_argument_error(
                format!("Sensor size {}x{} must be non-zero and even", width, height).as_str()));
        }
        Ok(SyntheticSensor{
            width,
            height,
            format,
            raw: vec![0u8; (width * height) as usize * format.bytes_per_pixel()],
            roll: 0,
            gain: UNITY_GAIN,
            gain_limits: (UNITY_GAIN / 4, UNITY_GAIN * 16),
            polls_per_frame: 2,
            pending_polls: None,
            fault: SensorFault::None,
        })
    }

    /// Range the sensor clamps gain requests to, Q16.
    pub fn with_gain_limits(mut self, min: u32, max: u32) -> Self {
        self.gain_limits = (min, max);
        self.gain = self.gain.clamp(min, max);
        self
    }

    pub fn with_fault(mut self, fault: SensorFault) -> Self {
        self.fault = fault;
        self
    }

    /// Number of `poll_capture()` calls before a frame completes.
    pub fn with_polls_per_frame(mut self, polls: u32) -> Self {
        self.polls_per_frame = polls;
        self
    }

    fn bar_colour(&self, y: u32) -> [f32; 3] {
        let bar = 7 * ((y + self.roll) % self.height) / self.height + 1;
        let on = |bit: u32| if bar & bit != 0 { 255.0 } else { 0.0 };
        [on(2), on(4), on(1)]
    }

    fn render(&mut self) {
        let gain = self.gain as f32 / UNITY_GAIN as f32;
        let (w, h) = (self.width as usize, self.height as usize);
        for y in (0..h).step_by(2) {
            let bar = self.bar_colour(y as u32);
            for x in (0..w).step_by(2) {
                let intensity = x as f32 / (w - 2).max(1) as f32 * gain;
                let [r, g, b] = bar.map(|c| (c * intensity + 0.5).min(255.0) as u8);
                match self.format {
                    RawFormat::Bayer(filter) => {
                        let tile = match filter {
                            ColorFilter::Rggb => [r, g, g, b],
                            ColorFilter::Grbg => [g, r, b, g],
                            ColorFilter::Gbrg => [g, b, r, g],
                            ColorFilter::Bggr => [b, g, g, r],
                        };
                        let o = y * w + x;
                        self.raw[o] = tile[0];
                        self.raw[o + 1] = tile[1];
                        self.raw[o + w] = tile[2];
                        self.raw[o + w + 1] = tile[3];
                    },
                    RawFormat::Rgb565 => {
                        let px = pack_rgb565([r, g, b]);
                        for (dy, dx) in [(0, 0), (0, 1), (1, 0), (1, 1)] {
                            let o = ((y + dy) * w + x + dx) * 2;
                            self.raw[o..o + 2].copy_from_slice(&px);
                        }
                    },
                }
            }
        }
        self.roll = (self.roll + 1) % self.height;
    }
}

impl SensorDriver for SyntheticSensor {
    fn model(&self) -> String {
        "Synthetic sensor".to_string()
    }

    fn probe(&mut self) -> Result<(), CanonicalError> {
        if self.fault == SensorFault::Absent {
            return Err(unavailable_error("No response on sensor bus"));
        }
        Ok(())
    }

    fn raw_format(&self) -> RawFormat {
        self.format
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn start_snapshot(&mut self) -> Result<(), CanonicalError> {
        self.pending_polls = Some(self.polls_per_frame);
        Ok(())
    }

    fn poll_capture(&mut self) -> Result<bool, CanonicalError> {
        let remaining = match self.pending_polls {
            Some(r) => r,
            None => return Err(failed_precondition_error("No capture triggered")),
        };
        match self.fault {
            SensorFault::CaptureError => {
                self.pending_polls = None;
                return Err(internal_error("FIFO overflow"));
            },
            SensorFault::Hang => return Ok(false),
            _ => {},
        }
        if remaining > 0 {
            self.pending_polls = Some(remaining - 1);
            return Ok(false);
        }
        self.pending_polls = None;
        self.render();
        Ok(true)
    }

    fn raw_frame(&self) -> &[u8] {
        &self.raw
    }

    fn gain(&self) -> u32 {
        self.gain
    }

    fn set_gain(&mut self, gain: u32) -> Result<u32, CanonicalError> {
        if self.fault == SensorFault::GainError {
            return Err(unavailable_error("Gain register write failed"));
        }
        self.gain = gain.clamp(self.gain_limits.0, self.gain_limits.1);
        Ok(self.gain)
    }

    fn stop(&mut self) {
        self.pending_polls = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canonical_error::CanonicalErrorCode;
    use crate::color_correction::{ColorMatrixPreset, TransferFunction};

    fn plain_config() -> ImagePipelineConfig {
        ImagePipelineConfig{matrix: ColorMatrixPreset::Identity,
                            transfer: TransferFunction::Linear,
                            auto_gain: false,
                            poll_interval: Duration::from_micros(100),
                            ..Default::default()}
    }

    fn camera(sensor: SyntheticSensor, config: &ImagePipelineConfig) -> SensorCamera {
        let mut cam = SensorCamera::new(Box::new(sensor), config);
        cam.init().unwrap();
        cam
    }

    #[tokio::test]
    async fn test_capture_bayer_frame() {
        let sensor = SyntheticSensor::new(64, 48, RawFormat::Bayer(ColorFilter::Grbg)).unwrap();
        let mut cam = camera(sensor, &plain_config());
        cam.configure(&CaptureConfig::new(32, 32)).unwrap();
        cam.start().unwrap();
        assert_eq!(cam.status(), CameraStatus::Running);
        let frame = cam.get_captured_frame().await.unwrap();
        assert_eq!(frame.len(), 32 * 32 * 3);
        // Intensity ramps left to right, so the right side is brighter.
        let left: u32 = frame[..3].iter().map(|v| *v as u32).sum();
        let right: u32 = frame[29 * 3..30 * 3].iter().map(|v| *v as u32).sum();
        assert!(right > left, "{} vs {}", right, left);
        assert_eq!(cam.status(), CameraStatus::Stopped);
    }

    #[tokio::test]
    async fn test_capture_rgb565_sensor() {
        let sensor = SyntheticSensor::new(40, 30, RawFormat::Rgb565).unwrap();
        let mut cam = camera(sensor, &plain_config());
        cam.configure(&CaptureConfig::new(20, 15)).unwrap();
        cam.start().unwrap();
        let frame = cam.get_captured_frame().await.unwrap();
        assert_eq!(frame.len(), 20 * 15 * 3);
        assert!(frame.iter().any(|v| *v > 0));
    }

    #[tokio::test]
    async fn test_rejects_rgb565_output_and_upscale() {
        let sensor = SyntheticSensor::new(32, 24, RawFormat::Bayer(ColorFilter::Rggb)).unwrap();
        let mut cam = camera(sensor, &plain_config());
        let mut config = CaptureConfig::new(16, 16);
        config.format = PixelFormat::Rgb565;
        assert!(cam.configure(&config).is_err());
        assert!(cam.configure(&CaptureConfig::new(64, 64)).is_err());
        assert_eq!(cam.status(), CameraStatus::Invalid);
    }

    #[tokio::test]
    async fn test_rejects_output_whose_crop_overflows_sensor() {
        // Landscape sensor, output far wider: 64 * 48 / 16 = 192 columns.
        let sensor = SyntheticSensor::new(64, 48, RawFormat::Bayer(ColorFilter::Grbg)).unwrap();
        let mut cam = camera(sensor, &plain_config());
        let err = cam.configure(&CaptureConfig::new(64, 16)).unwrap_err();
        assert_eq!(err.code, CanonicalErrorCode::InvalidArgument);
        assert_eq!(cam.status(), CameraStatus::Invalid);

        // A good configuration survives a later bad one.
        cam.configure(&CaptureConfig::new(32, 24)).unwrap();
        assert!(cam.configure(&CaptureConfig::new(64, 16)).is_err());
        assert_eq!(cam.status(), CameraStatus::Stopped);
        cam.start().unwrap();
        assert_eq!(cam.get_captured_frame().await.unwrap().len(), 32 * 24 * 3);

        // Portrait sensor, output far taller.
        let sensor = SyntheticSensor::new(48, 64, RawFormat::Bayer(ColorFilter::Grbg)).unwrap();
        let mut cam = camera(sensor, &plain_config());
        let err = cam.configure(&CaptureConfig::new(16, 64)).unwrap_err();
        assert_eq!(err.code, CanonicalErrorCode::InvalidArgument);
        assert_eq!(cam.status(), CameraStatus::Invalid);
        cam.configure(&CaptureConfig::new(24, 32)).unwrap();
        cam.start().unwrap();
        assert_eq!(cam.get_captured_frame().await.unwrap().len(), 24 * 32 * 3);
    }

    #[test_log::test(tokio::test)]
    async fn test_gain_failure_keeps_frame() {
        let sensor = SyntheticSensor::new(32, 24, RawFormat::Bayer(ColorFilter::Grbg)).unwrap()
            .with_fault(SensorFault::GainError);
        let mut config = plain_config();
        config.auto_gain = true;
        let mut cam = camera(sensor, &config);
        cam.configure(&CaptureConfig::new(16, 16)).unwrap();
        for _ in 0..3 {
            cam.start().unwrap();
            assert_eq!(cam.get_captured_frame().await.unwrap().len(), 16 * 16 * 3);
            assert_eq!(cam.status(), CameraStatus::Stopped);
        }
        assert_eq!(cam.gain(), 1.0);
    }

    #[test]
    fn test_synthetic_sensor_size_checked() {
        for (w, h) in [(63, 48), (64, 47), (0, 48), (64, 0)] {
            let err = SyntheticSensor::new(w, h, RawFormat::Rgb565).err().unwrap();
            assert_eq!(err.code, CanonicalErrorCode::InvalidArgument);
        }
    }

    #[tokio::test]
    async fn test_probe_failure() {
        let sensor = SyntheticSensor::new(32, 24, RawFormat::Bayer(ColorFilter::Rggb)).unwrap()
            .with_fault(SensorFault::Absent);
        let mut cam = SensorCamera::new(Box::new(sensor), &plain_config());
        assert_eq!(cam.init().unwrap_err().code, CanonicalErrorCode::Unavailable);
        assert!(cam.configure(&CaptureConfig::new(16, 16)).is_err());
    }

    #[tokio::test]
    async fn test_capture_error_sets_error_status() {
        let sensor = SyntheticSensor::new(32, 24, RawFormat::Bayer(ColorFilter::Rggb)).unwrap()
            .with_fault(SensorFault::CaptureError);
        let mut cam = camera(sensor, &plain_config());
        cam.configure(&CaptureConfig::new(16, 16)).unwrap();
        cam.start().unwrap();
        assert!(cam.get_captured_frame().await.is_err());
        assert_eq!(cam.status(), CameraStatus::Error);
        assert!(cam.start().is_err());
        cam.release();
        assert_eq!(cam.status(), CameraStatus::Invalid);
    }

    #[tokio::test]
    async fn test_hang_times_out() {
        let sensor = SyntheticSensor::new(32, 24, RawFormat::Bayer(ColorFilter::Rggb)).unwrap()
            .with_fault(SensorFault::Hang);
        let mut cam = camera(sensor, &plain_config());
        cam.set_capture_timeout(Some(Duration::from_millis(20)));
        cam.configure(&CaptureConfig::new(16, 16)).unwrap();
        cam.start().unwrap();
        let err = cam.get_captured_frame().await.unwrap_err();
        assert_eq!(err.code, CanonicalErrorCode::DeadlineExceeded);
        assert_eq!(cam.status(), CameraStatus::Error);
    }

    #[tokio::test]
    async fn test_auto_gain_settles_at_sensor_limit() {
        // A dim scene keeps asking for more gain than the sensor allows.
        let sensor = SyntheticSensor::new(32, 24, RawFormat::Bayer(ColorFilter::Grbg)).unwrap()
            .with_gain_limits(UNITY_GAIN / 8, UNITY_GAIN / 4);
        let mut config = plain_config();
        config.auto_gain = true;
        let mut cam = camera(sensor, &config);
        cam.configure(&CaptureConfig::new(16, 16)).unwrap();
        for _ in 0..4 {
            cam.start().unwrap();
            cam.get_captured_frame().await.unwrap();
        }
        assert!(cam.gain() <= 0.25 + 1e-6);
    }

    #[test]
    fn test_pattern_rolls() {
        let mut sensor = SyntheticSensor::new(16, 16, RawFormat::Bayer(ColorFilter::Rggb)).unwrap();
        sensor.render();
        let first = sensor.raw_frame().to_vec();
        sensor.render();
        assert_ne!(first, sensor.raw_frame());
    }
}
