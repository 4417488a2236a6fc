// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

extern crate chrono;
use chrono::offset::Local;
use chrono::DateTime;

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use clap::Parser;
use env_logger;
use image::RgbImage;
use log::info;

use sensor_pipeline::abstract_camera::CaptureConfig;
use sensor_pipeline::bayer::ColorFilter;
use sensor_pipeline::color_correction::{ColorMatrixPreset, KernelChoice, TransferFunction};
use sensor_pipeline::config::ImagePipelineConfig;
use sensor_pipeline::frame_resize::{PixelFormat, unpack_rgb565};
use sensor_pipeline::select_camera::{CameraInterface, CameraOptions, select_camera};

/// Captures one frame from the selected camera and writes it as an image
/// file.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about=None)]
struct Args {
    /// Output file; the extension picks the image format.
    #[arg(short, long)]
    output: PathBuf,

    #[arg(long, value_enum, default_value_t = CameraInterface::Sensor)]
    interface: CameraInterface,

    #[arg(long, default_value_t = 320)]
    width: u32,

    #[arg(long, default_value_t = 240)]
    height: u32,

    #[arg(long, value_enum, default_value_t = PixelFormat::Rgb888)]
    format: PixelFormat,

    /// Raw sensor size, WIDTHxHEIGHT, for the sensor interface.
    #[arg(long, default_value = "560x560", value_parser = parse_dimensions)]
    sensor_size: (u32, u32),

    #[arg(long, value_enum, default_value_t = ColorFilter::Grbg)]
    sensor_filter: ColorFilter,

    /// Sample images for the static interface.
    #[arg(long)]
    sample: Vec<PathBuf>,

    #[arg(long, value_enum, default_value_t = ColorMatrixPreset::Revised)]
    matrix: ColorMatrixPreset,

    #[arg(long, value_enum, default_value_t = TransferFunction::Srgb)]
    transfer: TransferFunction,

    #[arg(long, value_enum, default_value_t = KernelChoice::Auto)]
    kernel: KernelChoice,

    /// Frame wait limit in milliseconds; 0 waits forever.
    #[arg(long, default_value_t = 2000)]
    timeout_ms: u64,
}

fn parse_dimensions(arg: &str) -> Result<(u32, u32), String> {
    let (w, h) = arg.split_once('x').ok_or(format!("expected WIDTHxHEIGHT, got {}", arg))?;
    let w = w.parse::<u32>().map_err(|e| e.to_string())?;
    let h = h.parse::<u32>().map_err(|e| e.to_string())?;
    Ok((w, h))
}

#[tokio::main]
async fn main() {
    // If any thread panics, bail out.
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("Thread panicked: {}", panic_info);
        std::process::exit(1);
    }));
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let options = CameraOptions{
        pipeline: ImagePipelineConfig{
            matrix: args.matrix,
            transfer: args.transfer,
            kernel: args.kernel,
            capture_timeout: if args.timeout_ms == 0 {
                None
            } else {
                Some(Duration::from_millis(args.timeout_ms))
            },
            ..Default::default()
        },
        sensor_dimensions: args.sensor_size,
        sensor_filter: args.sensor_filter,
        sample_images: args.sample.clone(),
        loop_samples: false,
    };
    let mut camera = select_camera(args.interface, &options).unwrap();
    camera.init().unwrap();
    let mut config = CaptureConfig::new(args.width, args.height);
    config.format = args.format;
    camera.configure(&config).unwrap();
    camera.start().unwrap();
    let frame = camera.get_captured_frame().await.unwrap();
    let captured_at = SystemTime::now();

    let rgb = match args.format {
        PixelFormat::Rgb888 => frame.to_vec(),
        PixelFormat::Rgb565 => {
            frame.chunks_exact(2).flat_map(|p| unpack_rgb565(p[0], p[1])).collect()
        },
    };
    let image = RgbImage::from_raw(args.width, args.height, rgb).unwrap();
    image.save(&args.output).unwrap();
    camera.release();

    let datetime: DateTime<Local> = captured_at.into();
    info!("{}x{} image from {} obtained at {}, saved to {}",
          args.width, args.height, camera.device_name(),
          datetime.format("%d/%m/%Y %T"), args.output.display());
}
