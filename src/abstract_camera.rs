// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use canonical_error::{CanonicalError, failed_precondition_error,
                      invalid_argument_error};
use clap::ValueEnum;
use log::debug;

use crate::frame_resize::PixelFormat;

/// Device status. Transitions are `Invalid -> Stopped -> Running ->
/// Stopped | Error`; `Error` persists until `release()`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CameraStatus {
    Invalid,
    Stopped,
    Running,
    Error,
}

impl fmt::Display for CameraStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)  // Just re-use Debug.
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum CameraMode {
    /// Each `start()` captures one frame, after which the device is stopped.
    #[default]
    SingleFrame,
    Continuous,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CaptureConfig {
    pub width: u32,
    pub height: u32,
    pub mode: CameraMode,
    pub format: PixelFormat,
}

impl CaptureConfig {
    pub fn new(width: u32, height: u32) -> Self {
        CaptureConfig{width, height, mode: CameraMode::SingleFrame,
                      format: PixelFormat::Rgb888}
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.format.frame_bytes(self.width, self.height)
    }
}

/// What a backend can do; checked by `configure()`.
#[derive(Copy, Clone, Debug)]
pub struct Capabilities {
    pub continuous: bool,
    pub formats: &'static [PixelFormat],
    /// Largest output frame, if bounded.
    pub max_dimensions: Option<(u32, u32)>,
}

/// AbstractCamera is the capture contract shared by all backends: a real
/// sensor, a simulated video input and static sample images.
///
/// Usage: `init()`, `configure()`, optionally `set_buffer()`, then repeatedly
/// `start()` and `get_captured_frame()`. The frame returned borrows the
/// device's output buffer and stays valid until the next mutating call.
#[async_trait]
pub trait AbstractCamera: Send {
    /// Human readable name of this device.
    fn device_name(&self) -> String;

    /// Resets the device to `Invalid` and probes it. Fails if the underlying
    /// device cannot be identified.
    fn init(&mut self) -> Result<(), CanonicalError>;

    /// Fixes the output size, mode and format. Rejected, with no state
    /// change, while running or in error, for an unsupported mode or format,
    /// or when the frame would not fit the output buffer. On success the
    /// device is `Stopped`.
    fn configure(&mut self, config: &CaptureConfig) -> Result<(), CanonicalError>;

    /// Supplies the output buffer. Rejected if smaller than the configured
    /// frame. Without one, `configure()` allocates a buffer for the session.
    fn set_buffer(&mut self, buffer: Vec<u8>) -> Result<(), CanonicalError>;

    /// Only valid when `Stopped`; begins a capture.
    fn start(&mut self) -> Result<(), CanonicalError>;

    /// Waits for the capture started by `start()` to complete and returns
    /// the frame. On a backend failure or timeout the status becomes `Error`.
    /// In single frame mode completion returns the status to `Stopped`.
    async fn get_captured_frame(&mut self) -> Result<&[u8], CanonicalError>;

    /// Idempotent; only has an effect while `Running`.
    fn stop(&mut self) -> Result<(), CanonicalError>;

    fn status(&self) -> CameraStatus;

    /// Returns the device to `Invalid`, clearing any error.
    fn release(&mut self);

    /// Bounds the wait in `get_captured_frame()`. `None` waits forever.
    fn set_capture_timeout(&mut self, timeout: Option<Duration>);
}

/// Device state shared by the backends: configuration, output buffer and
/// status, with the transition rules of `AbstractCamera`.
pub struct CameraDevice {
    name: String,
    capabilities: Capabilities,
    initialised: bool,
    config: Option<CaptureConfig>,
    buffer: Option<Vec<u8>>,
    status: CameraStatus,
}

impl CameraDevice {
    pub fn new(name: &str, capabilities: Capabilities) -> Self {
        CameraDevice{name: name.to_string(),
                     capabilities,
                     initialised: false,
                     config: None,
                     buffer: None,
                     status: CameraStatus::Invalid}
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> CameraStatus {
        self.status
    }

    pub fn config(&self) -> Option<&CaptureConfig> {
        self.config.as_ref()
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.config.map_or(0, |c| c.bytes_per_frame())
    }

    fn set_status(&mut self, status: CameraStatus) {
        if status != self.status {
            debug!("{}: {} -> {}", self.name, self.status, status);
            self.status = status;
        }
    }

    /// Back to `Invalid`, forgetting configuration and buffer.
    pub fn reset(&mut self) {
        self.set_status(CameraStatus::Invalid);
        self.initialised = false;
        self.config = None;
        self.buffer = None;
    }

    /// Records a successful probe.
    pub fn mark_initialised(&mut self) {
        self.initialised = true;
    }

    /// Validates `config` without changing anything.
    pub fn check_config(&self, config: &CaptureConfig) -> Result<(), CanonicalError> {
        if !self.initialised {
            return Err(failed_precondition_error(
                format!("{} not initialised", self.name).as_str()));
        }
        match self.status {
            CameraStatus::Running => {
                return Err(failed_precondition_error(
                    format!("{} cannot be configured while running", self.name).as_str()));
            },
            CameraStatus::Error => {
                return Err(failed_precondition_error(
                    format!("{} is in error; release it first", self.name).as_str()));
            },
            _ => {},
        }
        if config.width == 0 || config.height == 0 {
            return Err(invalid_argument_error(
                format!("Invalid frame size {}x{}", config.width, config.height).as_str()));
        }
        if let Some((max_w, max_h)) = self.capabilities.max_dimensions {
            if config.width > max_w || config.height > max_h {
                return Err(invalid_argument_error(
                    format!("Frame {}x{} exceeds {}x{}",
                            config.width, config.height, max_w, max_h).as_str()));
            }
        }
        if config.mode == CameraMode::Continuous && !self.capabilities.continuous {
            return Err(invalid_argument_error(
                format!("{} only supports single frame capture", self.name).as_str()));
        }
        if !self.capabilities.formats.contains(&config.format) {
            return Err(invalid_argument_error(
                format!("{} does not support {:?}", self.name, config.format).as_str()));
        }
        if let Some(buffer) = &self.buffer {
            if config.bytes_per_frame() > buffer.len() {
                return Err(invalid_argument_error(
                    format!("Frame needs {} bytes but output buffer has {}",
                            config.bytes_per_frame(), buffer.len()).as_str()));
            }
        }
        Ok(())
    }

    /// Validates and applies `config`, moving to `Stopped`.
    pub fn configure(&mut self, config: &CaptureConfig) -> Result<(), CanonicalError> {
        self.check_config(config)?;
        if self.buffer.is_none() {
            self.buffer = Some(vec![0u8; config.bytes_per_frame()]);
        }
        self.config = Some(*config);
        self.set_status(CameraStatus::Stopped);
        Ok(())
    }

    pub fn set_buffer(&mut self, buffer: Vec<u8>) -> Result<(), CanonicalError> {
        if self.status == CameraStatus::Running {
            return Err(failed_precondition_error(
                "Cannot replace output buffer during capture"));
        }
        if buffer.len() < self.bytes_per_frame() {
            return Err(invalid_argument_error(
                format!("Buffer of {} bytes is smaller than the {} byte frame",
                        buffer.len(), self.bytes_per_frame()).as_str()));
        }
        self.buffer = Some(buffer);
        Ok(())
    }

    /// Checks that a capture may begin, then moves to `Running`.
    pub fn begin_capture(&mut self) -> Result<(), CanonicalError> {
        if self.status != CameraStatus::Stopped {
            return Err(failed_precondition_error(
                format!("{} cannot start from {}", self.name, self.status).as_str()));
        }
        if self.buffer.is_none() {
            return Err(failed_precondition_error("No output buffer"));
        }
        self.set_status(CameraStatus::Running);
        Ok(())
    }

    /// Fails unless a capture is in progress.
    pub fn check_running(&self) -> Result<(), CanonicalError> {
        if self.status != CameraStatus::Running {
            return Err(failed_precondition_error(
                format!("{} has no capture in progress ({})", self.name, self.status).as_str()));
        }
        Ok(())
    }

    /// A frame completed; single frame captures return to `Stopped`.
    pub fn complete_capture(&mut self) {
        if self.config.map(|c| c.mode) == Some(CameraMode::SingleFrame) {
            self.set_status(CameraStatus::Stopped);
        }
    }

    pub fn fail(&mut self) {
        self.set_status(CameraStatus::Error);
    }

    pub fn stop(&mut self) {
        if self.status == CameraStatus::Running {
            self.set_status(CameraStatus::Stopped);
        }
    }

    /// Hands the output buffer to a producer. Must be given back with
    /// `restore_buffer()`.
    pub fn take_buffer(&mut self) -> Option<Vec<u8>> {
        self.buffer.take()
    }

    pub fn restore_buffer(&mut self, buffer: Vec<u8>) {
        self.buffer = Some(buffer);
    }

    /// The configured frame within the output buffer.
    pub fn frame(&self) -> &[u8] {
        let n = self.bytes_per_frame();
        match self.buffer.as_ref() {
            Some(b) => &b[..n],
            None => &[],
        }
    }

    pub fn frame_mut(&mut self) -> &mut [u8] {
        let n = self.bytes_per_frame();
        match self.buffer.as_mut() {
            Some(b) => &mut b[..n],
            None => &mut [],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canonical_error::CanonicalErrorCode;

    const CAPS: Capabilities = Capabilities{
        continuous: false,
        formats: &[PixelFormat::Rgb888],
        max_dimensions: Some((64, 48)),
    };

    fn ready_device() -> CameraDevice {
        let mut d = CameraDevice::new("test", CAPS);
        d.mark_initialised();
        d
    }

    #[test]
    fn test_configure_requires_init() {
        let mut d = CameraDevice::new("test", CAPS);
        assert!(d.configure(&CaptureConfig::new(8, 8)).is_err());
        assert_eq!(d.status(), CameraStatus::Invalid);
    }

    #[test]
    fn test_lifecycle() {
        let mut d = ready_device();
        d.configure(&CaptureConfig::new(8, 4)).unwrap();
        assert_eq!(d.status(), CameraStatus::Stopped);
        assert_eq!(d.bytes_per_frame(), 96);
        assert_eq!(d.frame().len(), 96);

        d.begin_capture().unwrap();
        assert_eq!(d.status(), CameraStatus::Running);
        assert!(d.begin_capture().is_err());
        assert!(d.configure(&CaptureConfig::new(8, 8)).is_err());
        assert_eq!(d.bytes_per_frame(), 96);

        d.complete_capture();
        assert_eq!(d.status(), CameraStatus::Stopped);
        d.stop();
        assert_eq!(d.status(), CameraStatus::Stopped);
    }

    #[test]
    fn test_rejections_leave_state() {
        let mut d = ready_device();
        d.configure(&CaptureConfig::new(8, 4)).unwrap();
        let mut bad = CaptureConfig::new(8, 4);
        bad.mode = CameraMode::Continuous;
        assert_eq!(d.configure(&bad).unwrap_err().code, CanonicalErrorCode::InvalidArgument);
        bad = CaptureConfig::new(8, 4);
        bad.format = PixelFormat::Rgb565;
        assert!(d.configure(&bad).is_err());
        assert!(d.configure(&CaptureConfig::new(65, 4)).is_err());
        assert!(d.configure(&CaptureConfig::new(0, 4)).is_err());
        // Allocated buffer is 96 bytes; a larger frame no longer fits.
        assert!(d.configure(&CaptureConfig::new(16, 16)).is_err());
        assert_eq!(d.config(), Some(&CaptureConfig::new(8, 4)));
        assert_eq!(d.status(), CameraStatus::Stopped);
    }

    #[test]
    fn test_set_buffer() {
        let mut d = ready_device();
        d.set_buffer(vec![0u8; 1000]).unwrap();
        d.configure(&CaptureConfig::new(16, 16)).unwrap();
        assert!(d.set_buffer(vec![0u8; 767]).is_err());
        d.set_buffer(vec![0u8; 768]).unwrap();
        d.begin_capture().unwrap();
        assert!(d.set_buffer(vec![0u8; 768]).is_err());
    }

    #[test]
    fn test_error_until_release() {
        let mut d = ready_device();
        d.configure(&CaptureConfig::new(8, 4)).unwrap();
        d.begin_capture().unwrap();
        d.fail();
        assert_eq!(d.status(), CameraStatus::Error);
        d.stop();
        assert_eq!(d.status(), CameraStatus::Error);
        assert!(d.begin_capture().is_err());
        assert!(d.configure(&CaptureConfig::new(8, 4)).is_err());
        d.reset();
        assert_eq!(d.status(), CameraStatus::Invalid);
        d.mark_initialised();
        d.configure(&CaptureConfig::new(8, 4)).unwrap();
        assert_eq!(d.status(), CameraStatus::Stopped);
    }
}
