// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use clap::ValueEnum;
use env_logger;

use sensor_pipeline::select_camera::{CameraInterface, CameraOptions, select_camera};

fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")).init();

    let options = CameraOptions::default();
    let interfaces = CameraInterface::value_variants();
    println!("Found {} camera interfaces: ", interfaces.len());
    for (i, interface) in interfaces.iter().enumerate() {
        match select_camera(*interface, &options) {
            Ok(mut camera) => {
                let probe = match camera.init() {
                    Ok(()) => "ready".to_string(),
                    Err(e) => format!("init failed: {}", e.message),
                };
                println!("{}: {:?} {} ({})", i, interface, camera.device_name(), probe);
                camera.release();
            },
            Err(e) => println!("{}: {:?} unavailable: {}", i, interface, e.message),
        }
    }
}
