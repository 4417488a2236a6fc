use std::path::PathBuf;

use canonical_error::{CanonicalError, failed_precondition_error};
use clap::ValueEnum;
use log::info;

use crate::abstract_camera::AbstractCamera;
use crate::bayer::ColorFilter;
use crate::config::ImagePipelineConfig;
use crate::image_camera::ImageCamera;
use crate::sensor_camera::{RawFormat, SensorCamera, SyntheticSensor};
use crate::virtual_camera::{TestPattern, VirtualCamera};

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum CameraInterface {
    /// Raw image sensor with software demosaic and colour pipeline.
    Sensor,
    /// Simulated video input.
    Virtual,
    /// Static sample images.
    Static,
}

/// Inputs needed by the individual backends.
#[derive(Clone, Debug)]
pub struct CameraOptions {
    pub pipeline: ImagePipelineConfig,
    /// Raw sensor size for the sensor backend.
    pub sensor_dimensions: (u32, u32),
    pub sensor_filter: ColorFilter,
    /// Image files for the static backend.
    pub sample_images: Vec<PathBuf>,
    pub loop_samples: bool,
}

impl Default for CameraOptions {
    fn default() -> Self {
        CameraOptions{pipeline: ImagePipelineConfig::default(),
                      sensor_dimensions: (560, 560),
                      sensor_filter: ColorFilter::Grbg,
                      sample_images: Vec::new(),
                      loop_samples: false}
    }
}

// Builds the camera for `camera_interface`:
// * Sensor: the synthetic colour bar sensor through the full raw pipeline.
// * Virtual: the simulated video input with a test pattern source.
// * Static: `options.sample_images`, which must not be empty.
// The capture timeout from `options.pipeline` is applied to all of them.
pub fn select_camera(camera_interface: CameraInterface, options: &CameraOptions)
                     -> Result<Box<dyn AbstractCamera + Send>, CanonicalError> {
    let mut camera: Box<dyn AbstractCamera + Send> = match camera_interface {
        CameraInterface::Sensor => {
            let (width, height) = options.sensor_dimensions;
            let sensor = SyntheticSensor::new(width, height,
                                              RawFormat::Bayer(options.sensor_filter))?;
            Box::new(SensorCamera::new(Box::new(sensor), &options.pipeline))
        },
        CameraInterface::Virtual => Box::new(VirtualCamera::new(Box::new(TestPattern))),
        CameraInterface::Static => {
            if options.sample_images.is_empty() {
                return Err(failed_precondition_error(
                    "Static camera requested but no sample images were given"));
            }
            let mut camera = ImageCamera::from_files(&options.sample_images)?;
            camera.set_looping(options.loop_samples);
            Box::new(camera)
        },
    };
    camera.set_capture_timeout(options.pipeline.capture_timeout);
    info!("Selected {:?} camera: {}", camera_interface, camera.device_name());
    Ok(camera)
}
