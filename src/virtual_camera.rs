// Simulated video input. A producer thread plays the part of the capture
// hardware: it takes ownership of the output buffer, fills it from a
// FrameSource and hands it back over a channel when the frame is done.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use canonical_error::{CanonicalError, aborted_error, deadline_exceeded_error,
                      failed_precondition_error, internal_error,
                      unavailable_error};
use log::{debug, info, warn};
use tokio::time::Instant;

use crate::abstract_camera::{AbstractCamera, CameraDevice, CameraStatus,
                             Capabilities, CaptureConfig};
use crate::frame_resize::{PixelFormat, pack_rgb565};

/// Produces frame contents for the simulated input.
pub trait FrameSource: Send {
    fn fill(&mut self, frame_index: u64, frame: &mut [u8], config: &CaptureConfig)
            -> Result<(), CanonicalError>;
}

impl<F> FrameSource for F
where F: FnMut(u64, &mut [u8], &CaptureConfig) -> Result<(), CanonicalError> + Send
{
    fn fill(&mut self, frame_index: u64, frame: &mut [u8], config: &CaptureConfig)
            -> Result<(), CanonicalError> {
        self(frame_index, frame, config)
    }
}

/// Rolling colour bars with a left-to-right intensity ramp.
pub struct TestPattern;

impl FrameSource for TestPattern {
    fn fill(&mut self, frame_index: u64, frame: &mut [u8], config: &CaptureConfig)
            -> Result<(), CanonicalError> {
        let (w, h) = (config.width as u64, config.height as u64);
        let bpp = config.format.bytes_per_pixel();
        for y in 0..h {
            let bar = 7 * ((y + frame_index) % h) / h + 1;
            for x in 0..w {
                let intensity = x as f32 / (w.max(2) - 1) as f32;
                let level = |bit: u64| if bar & bit != 0 {
                    (255.0 * intensity + 0.5) as u8
                } else {
                    0
                };
                let rgb = [level(2), level(4), level(1)];
                let o = ((y * w + x) as usize) * bpp;
                match config.format {
                    PixelFormat::Rgb888 => frame[o..o + 3].copy_from_slice(&rgb),
                    PixelFormat::Rgb565 => frame[o..o + 2].copy_from_slice(&pack_rgb565(rgb)),
                }
            }
        }
        Ok(())
    }
}

/// Failure to inject into the simulated hardware.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum VirtualFault {
    #[default]
    None,
    /// Frames complete with an overflow error.
    Overflow,
    /// Frames never complete until stopped.
    Hang,
}

struct Completion {
    source: Box<dyn FrameSource>,
    buffer: Vec<u8>,
    result: Result<(), CanonicalError>,
}

struct InFlight {
    done: mpsc::Receiver<Completion>,
    cancel: mpsc::Sender<()>,
}

const CAPABILITIES: Capabilities = Capabilities{
    continuous: false,
    formats: &[PixelFormat::Rgb888, PixelFormat::Rgb565],
    max_dimensions: None,
};

pub struct VirtualCamera {
    device: CameraDevice,
    source: Option<Box<dyn FrameSource>>,
    in_flight: Option<InFlight>,
    frame_index: u64,
    frame_time: Duration,
    fault: VirtualFault,
    poll_interval: Duration,
    timeout: Option<Duration>,
}

impl VirtualCamera {
    pub fn new(source: Box<dyn FrameSource>) -> Self {
        VirtualCamera{
            device: CameraDevice::new("Virtual video input", CAPABILITIES),
            source: Some(source),
            in_flight: None,
            frame_index: 0,
            frame_time: Duration::from_millis(5),
            fault: VirtualFault::None,
            poll_interval: Duration::from_millis(1),
            timeout: Some(Duration::from_secs(2)),
        }
    }

    /// Simulated exposure plus readout time per frame.
    pub fn set_frame_time(&mut self, frame_time: Duration) {
        self.frame_time = frame_time;
    }

    pub fn inject_fault(&mut self, fault: VirtualFault) {
        self.fault = fault;
    }

    /// Frames delivered so far.
    pub fn frame_count(&self) -> u64 {
        self.frame_index
    }

    fn accept(&mut self, completion: Completion) -> Result<(), CanonicalError> {
        self.source = Some(completion.source);
        self.device.restore_buffer(completion.buffer);
        completion.result
    }

    // Cancels any capture in progress and waits for the producer to hand the
    // buffer back.
    fn reclaim(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            let _ = in_flight.cancel.send(());
            match in_flight.done.recv() {
                Ok(completion) => {
                    let _ = self.accept(completion);
                },
                Err(_) => warn!("{}: producer exited without returning its buffer",
                                self.device.name()),
            }
        }
    }
}

fn produce(mut source: Box<dyn FrameSource>, mut buffer: Vec<u8>, config: CaptureConfig,
           frame_index: u64, frame_time: Duration, fault: VirtualFault,
           cancel: mpsc::Receiver<()>, done: mpsc::Sender<Completion>) {
    let cancelled = match fault {
        VirtualFault::Hang => {
            let _ = cancel.recv();
            true
        },
        _ => cancel.recv_timeout(frame_time).is_ok(),
    };
    let result = if cancelled {
        Err(aborted_error("Capture cancelled"))
    } else if fault == VirtualFault::Overflow {
        Err(internal_error("Video input FIFO overflow"))
    } else {
        source.fill(frame_index, &mut buffer[..config.bytes_per_frame()], &config)
    };
    let _ = done.send(Completion{source, buffer, result});
}

#[async_trait]
impl AbstractCamera for VirtualCamera {
    fn device_name(&self) -> String {
        self.device.name().to_string()
    }

    fn init(&mut self) -> Result<(), CanonicalError> {
        self.reclaim();
        self.device.reset();
        if self.source.is_none() {
            return Err(unavailable_error("Video source lost"));
        }
        self.device.mark_initialised();
        info!("{} ready", self.device.name());
        Ok(())
    }

    fn configure(&mut self, config: &CaptureConfig) -> Result<(), CanonicalError> {
        self.device.configure(config)?;
        info!("{}: {}x{} {:?}", self.device.name(), config.width, config.height,
              config.format);
        Ok(())
    }

    fn set_buffer(&mut self, buffer: Vec<u8>) -> Result<(), CanonicalError> {
        self.device.set_buffer(buffer)
    }

    fn start(&mut self) -> Result<(), CanonicalError> {
        let config = match self.device.config() {
            Some(c) => *c,
            None => return Err(failed_precondition_error("Camera not configured")),
        };
        self.device.begin_capture()?;
        let (buffer, source) = match (self.device.take_buffer(), self.source.take()) {
            (Some(b), Some(s)) => (b, s),
            (b, s) => {
                if let Some(b) = b {
                    self.device.restore_buffer(b);
                }
                self.source = s;
                self.device.fail();
                return Err(unavailable_error("Video input resources missing"));
            },
        };
        let (done_tx, done_rx) = mpsc::channel();
        let (cancel_tx, cancel_rx) = mpsc::channel();
        let (index, frame_time, fault) = (self.frame_index, self.frame_time, self.fault);
        thread::spawn(move || {
            produce(source, buffer, config, index, frame_time, fault, cancel_rx, done_tx);
        });
        self.in_flight = Some(InFlight{done: done_rx, cancel: cancel_tx});
        debug!("{}: capture {} started", self.device.name(), index);
        Ok(())
    }

    async fn get_captured_frame(&mut self) -> Result<&[u8], CanonicalError> {
        self.device.check_running()?;
        let deadline = self.timeout.map(|t| Instant::now() + t);
        loop {
            let polled = match &self.in_flight {
                Some(in_flight) => in_flight.done.try_recv(),
                None => Err(mpsc::TryRecvError::Disconnected),
            };
            match polled {
                Ok(completion) => {
                    self.in_flight = None;
                    if let Err(e) = self.accept(completion) {
                        warn!("{}: capture failed: {}", self.device.name(), e);
                        self.device.fail();
                        return Err(e);
                    }
                    self.frame_index += 1;
                    self.device.complete_capture();
                    return Ok(self.device.frame());
                },
                Err(mpsc::TryRecvError::Empty) => {},
                Err(mpsc::TryRecvError::Disconnected) => {
                    self.in_flight = None;
                    self.device.fail();
                    return Err(internal_error("Video input producer vanished"));
                },
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    warn!("{}: capture timed out", self.device.name());
                    self.device.fail();
                    return Err(deadline_exceeded_error(
                        format!("{} frame not ready after {:?}", self.device.name(),
                                self.timeout.unwrap_or_default()).as_str()));
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    fn stop(&mut self) -> Result<(), CanonicalError> {
        if self.device.status() == CameraStatus::Running {
            self.reclaim();
        }
        self.device.stop();
        Ok(())
    }

    fn status(&self) -> CameraStatus {
        self.device.status()
    }

    fn release(&mut self) {
        self.reclaim();
        self.device.reset();
    }

    fn set_capture_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }
}

impl Drop for VirtualCamera {
    fn drop(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            let _ = in_flight.cancel.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canonical_error::CanonicalErrorCode;

    fn ready(source: Box<dyn FrameSource>, config: &CaptureConfig) -> VirtualCamera {
        let mut cam = VirtualCamera::new(source);
        cam.set_frame_time(Duration::from_millis(1));
        cam.init().unwrap();
        cam.configure(config).unwrap();
        cam
    }

    #[tokio::test]
    async fn test_frames_come_from_source() {
        let source = |index: u64, frame: &mut [u8], _: &CaptureConfig| {
            frame.fill(index as u8 + 10);
            Ok::<(), CanonicalError>(())
        };
        let mut cam = ready(Box::new(source), &CaptureConfig::new(4, 4));
        for expected in [10u8, 11, 12] {
            cam.start().unwrap();
            let frame = cam.get_captured_frame().await.unwrap();
            assert_eq!(frame.len(), 48);
            assert!(frame.iter().all(|v| *v == expected));
            assert_eq!(cam.status(), CameraStatus::Stopped);
        }
        assert_eq!(cam.frame_count(), 3);
    }

    #[tokio::test]
    async fn test_test_pattern_rgb565() {
        let mut config = CaptureConfig::new(16, 8);
        config.format = PixelFormat::Rgb565;
        let mut cam = ready(Box::new(TestPattern), &config);
        cam.start().unwrap();
        let frame = cam.get_captured_frame().await.unwrap();
        assert_eq!(frame.len(), 16 * 8 * 2);
        // Leftmost column has zero intensity.
        assert_eq!(&frame[..2], &[0, 0]);
    }

    #[tokio::test]
    async fn test_continuous_rejected() {
        let mut cam = VirtualCamera::new(Box::new(TestPattern));
        cam.init().unwrap();
        let mut config = CaptureConfig::new(8, 8);
        config.mode = crate::abstract_camera::CameraMode::Continuous;
        assert_eq!(cam.configure(&config).unwrap_err().code,
                   CanonicalErrorCode::InvalidArgument);
    }

    #[tokio::test]
    async fn test_overflow_is_error() {
        let mut cam = ready(Box::new(TestPattern), &CaptureConfig::new(8, 8));
        cam.inject_fault(VirtualFault::Overflow);
        cam.start().unwrap();
        assert!(cam.get_captured_frame().await.is_err());
        assert_eq!(cam.status(), CameraStatus::Error);
        cam.release();
        cam.init().unwrap();
        cam.inject_fault(VirtualFault::None);
        cam.configure(&CaptureConfig::new(8, 8)).unwrap();
        cam.start().unwrap();
        assert!(cam.get_captured_frame().await.is_ok());
    }

    #[tokio::test]
    async fn test_hang_times_out_and_stop_reclaims() {
        let mut cam = ready(Box::new(TestPattern), &CaptureConfig::new(8, 8));
        cam.inject_fault(VirtualFault::Hang);
        cam.set_capture_timeout(Some(Duration::from_millis(20)));
        cam.start().unwrap();
        let err = cam.get_captured_frame().await.unwrap_err();
        assert_eq!(err.code, CanonicalErrorCode::DeadlineExceeded);
        assert_eq!(cam.status(), CameraStatus::Error);
        cam.release();
        cam.init().unwrap();
    }

    #[tokio::test]
    async fn test_stop_during_capture() {
        let mut cam = ready(Box::new(TestPattern), &CaptureConfig::new(8, 8));
        cam.inject_fault(VirtualFault::Hang);
        cam.start().unwrap();
        cam.stop().unwrap();
        assert_eq!(cam.status(), CameraStatus::Stopped);
        cam.stop().unwrap();
        cam.inject_fault(VirtualFault::None);
        cam.start().unwrap();
        assert_eq!(cam.get_captured_frame().await.unwrap().len(), 8 * 8 * 3);
    }
}
