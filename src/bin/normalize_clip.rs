// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::PathBuf;
use std::time::Duration;

use canonical_error::CanonicalErrorCode;
use clap::Parser;
use env_logger;
use log::{info, warn};

use sensor_pipeline::audio_capture::{ClipAudioDriver, MicSelection, StrideRecorder};
use sensor_pipeline::audio_normalize::{DcMode, GainNormalizer, MAX_GAIN,
                                       MAX_GAIN_INC_PER_STRIDE, window_stats};
use sensor_pipeline::config::AudioPipelineConfig;

/// Streams WAV clips through the audio capture and normalisation pipeline,
/// logging per-window statistics and optionally saving the result.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about=None)]
struct Args {
    /// 16-bit PCM WAV files, played back to back.
    #[arg(required = true)]
    input: Vec<PathBuf>,

    /// Mono WAV file receiving the normalised stream.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Analysis window, in samples.
    #[arg(long, default_value_t = 16000)]
    window: usize,

    /// Window advance, in samples.
    #[arg(long, default_value_t = 8000)]
    stride: usize,

    #[arg(long, value_enum, default_value_t = MicSelection::Mix)]
    mics: MicSelection,

    #[arg(long, value_enum, default_value_t = DcMode::WindowMean)]
    dc_mode: DcMode,

    /// Gain ceiling in dB.
    #[arg(long, default_value_t = 80.0)]
    max_gain_db: f32,

    /// Play back at the clip's sample rate instead of as fast as possible.
    #[arg(long, default_value_t = false)]
    realtime: bool,
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

    let driver = ClipAudioDriver::from_wav_files(&args.input).unwrap()
        .with_realtime(args.realtime);
    let sample_rate = driver.format().sample_rate;
    let config = AudioPipelineConfig{
        sample_rate,
        window: args.window,
        stride: args.stride,
        mics: args.mics,
        max_gain: 10f32.powf(args.max_gain_db / 20.0).min(MAX_GAIN),
        max_gain_inc_per_stride: MAX_GAIN_INC_PER_STRIDE,
        dc_mode: args.dc_mode,
        stride_timeout: Some(Duration::from_secs(5)),
        ..Default::default()
    };
    let mut normalizer = GainNormalizer::new(config.max_gain, config.max_gain_inc_per_stride,
                                             config.dc_mode);
    let mut writer = args.output.as_ref().map(|path| {
        let spec = hound::WavSpec{channels: 1, sample_rate, bits_per_sample: 16,
                                  sample_format: hound::SampleFormat::Int};
        hound::WavWriter::create(path, spec).unwrap()
    });

    let mut recorder = StrideRecorder::start(Box::new(driver), &config).unwrap();
    let mut normalized = vec![0i16; config.window];
    let mut windows = 0;
    loop {
        let window = match recorder.next_window().await {
            Ok(w) => w,
            Err(e) if e.code == CanonicalErrorCode::OutOfRange => break,
            Err(e) => {
                warn!("Recording failed: {}", e.message);
                break;
            },
        };
        normalized.copy_from_slice(window);
        let report = normalizer.normalize(&mut normalized);
        let out = window_stats(&normalized);
        info!("window {}: in {} dc {} gain {:.1} dB out absmax {} mean {}",
              windows, report.input, report.dc_removed, report.gain_db(),
              out.absmax, out.mean);
        if let Some(w) = writer.as_mut() {
            // Everything is new in the first window, only the last stride after.
            let new = if windows == 0 { config.window } else { config.stride };
            for s in &normalized[config.window - new..] {
                w.write_sample(*s).unwrap();
            }
        }
        windows += 1;
    }
    recorder.stop();
    if let Some(w) = writer {
        w.finalize().unwrap();
    }
    info!("Processed {} windows", windows);
}
