// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Audio acquisition into an overlapping analysis window.
//!
//! The analysis window holds the most recent `window` mono samples. Each step
//! discards the oldest `stride` samples and appends a freshly captured
//! stride. Capture runs on a producer thread that owns the audio driver; the
//! stride buffer is handed back and forth over channels, so the consumer
//! only ever sees a stride after the producer has finished writing it. The
//! next stride is requested before the window is handed to the caller, so
//! capture of stride k+1 overlaps processing of stride k.

use std::path::Path;
use std::sync::mpsc as std_mpsc;
use std::thread;
use std::time::Duration;

use canonical_error::{CanonicalError, deadline_exceeded_error,
                      invalid_argument_error, not_found_error,
                      out_of_range_error, unavailable_error};
use clap::ValueEnum;
use log::{debug, info, warn};
use tokio::sync::mpsc;

use crate::audio_normalize::{apply_gain, downmix_stereo};
use crate::config::AudioPipelineConfig;

/// Sample rate and channel count. Drivers exchange it as a packed code,
/// `channels << 16 | sample_rate`, so rates above `MAX_SAMPLE_RATE` have no
/// code.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

pub const MAX_SAMPLE_RATE: u32 = 0xFFFF;

impl AudioFormat {
    /// Validated format: one or two channels, rate in `1..=MAX_SAMPLE_RATE`.
    pub fn new(sample_rate: u32, channels: u16) -> Result<Self, CanonicalError> {
        let format = AudioFormat{sample_rate, channels};
        format.validate()?;
        Ok(format)
    }

    pub fn mono(sample_rate: u32) -> Self {
        AudioFormat{sample_rate, channels: 1}
    }

    pub fn stereo(sample_rate: u32) -> Self {
        AudioFormat{sample_rate, channels: 2}
    }

    pub fn validate(&self) -> Result<(), CanonicalError> {
        if !(1..=2).contains(&self.channels) {
            return Err(invalid_argument_error(
                format!("Unsupported channel count {}", self.channels).as_str()));
        }
        if self.sample_rate == 0 || self.sample_rate > MAX_SAMPLE_RATE {
            return Err(invalid_argument_error(
                format!("Sample rate {} outside 1..={}",
                        self.sample_rate, MAX_SAMPLE_RATE).as_str()));
        }
        Ok(())
    }

    pub fn from_raw(raw: u32) -> Result<Self, CanonicalError> {
        match AudioFormat::new(raw & 0xFFFF, (raw >> 16) as u16) {
            Ok(f) => Ok(f),
            Err(_) => Err(invalid_argument_error(
                format!("Invalid audio format code {:#x}", raw).as_str())),
        }
    }

    pub fn raw(&self) -> Result<u32, CanonicalError> {
        self.validate()?;
        Ok(((self.channels as u32) << 16) | self.sample_rate)
    }
}

/// Which microphone(s) of a stereo pair feed the mono stream.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum MicSelection {
    Left,
    Right,
    /// Rounding average of both.
    #[default]
    Mix,
}

/// Converts interleaved driver samples to mono.
pub fn select_mics(interleaved: &[i16], channels: u16, mics: MicSelection, mono: &mut [i16]) {
    if channels == 1 {
        mono.copy_from_slice(&interleaved[..mono.len()]);
        return;
    }
    match mics {
        MicSelection::Mix => downmix_stereo(interleaved, mono),
        MicSelection::Left | MicSelection::Right => {
            let offset = if mics == MicSelection::Left { 0 } else { 1 };
            for (m, pair) in mono.iter_mut().zip(interleaved.chunks_exact(2)) {
                *m = pair[offset];
            }
        },
    }
}

/// Audio input peripheral.
pub trait AudioDriver: Send {
    fn name(&self) -> String;

    /// Prepares capture at `sample_rate`, returning the delivered format.
    fn init(&mut self, sample_rate: u32) -> Result<AudioFormat, CanonicalError>;

    /// Fills `block` with interleaved samples, blocking until the transfer
    /// is complete.
    fn receive(&mut self, block: &mut [i16]) -> Result<(), CanonicalError>;

    /// Input gain, as a multiplier.
    fn set_gain(&mut self, gain: f32) -> Result<(), CanonicalError>;
}

/// Replays PCM clips ("static sample audio files"), one after another.
pub struct ClipAudioDriver {
    format: AudioFormat,
    clips: Vec<Vec<i16>>,
    clip: usize,
    position: usize,
    looping: bool,
    ended: bool,
    realtime: bool,
    gain: f32,
}

impl ClipAudioDriver {
    /// `clips` hold interleaved samples in `format`.
    pub fn new(format: AudioFormat, clips: Vec<Vec<i16>>) -> Result<Self, CanonicalError> {
        format.validate()?;
        if clips.iter().all(|c| c.is_empty()) {
            return Err(invalid_argument_error("No audio samples given"));
        }
        Ok(ClipAudioDriver{format, clips, clip: 0, position: 0,
                           looping: false, ended: false, realtime: false, gain: 1.0})
    }

    /// Loads 16-bit PCM WAV files, which must share one format.
    pub fn from_wav_files<P: AsRef<Path>>(paths: &[P]) -> Result<Self, CanonicalError> {
        let mut format = None;
        let mut clips = Vec::with_capacity(paths.len());
        for path in paths {
            let path = path.as_ref();
            let reader = match hound::WavReader::open(path) {
                Ok(r) => r,
                Err(hound::Error::IoError(e)) => {
                    return Err(not_found_error(format!("{}: {}", path.display(), e).as_str()));
                },
                Err(e) => {
                    return Err(invalid_argument_error(
                        format!("{}: {}", path.display(), e).as_str()));
                },
            };
            let spec = reader.spec();
            if spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int
                || spec.channels == 0 || spec.channels > 2 {
                return Err(invalid_argument_error(
                    format!("{}: need 16-bit mono or stereo PCM, got {:?}",
                            path.display(), spec).as_str()));
            }
            let clip_format = match AudioFormat::new(spec.sample_rate, spec.channels) {
                Ok(f) => f,
                Err(e) => {
                    return Err(invalid_argument_error(
                        format!("{}: {}", path.display(), e.message).as_str()));
                },
            };
            match format {
                None => format = Some(clip_format),
                Some(f) if f != clip_format => {
                    return Err(invalid_argument_error(
                        format!("{}: format {:?} differs from {:?}",
                                path.display(), clip_format, f).as_str()));
                },
                _ => {},
            }
            let samples: Result<Vec<i16>, _> = reader.into_samples::<i16>().collect();
            match samples {
                Ok(s) => clips.push(s),
                Err(e) => {
                    return Err(invalid_argument_error(
                        format!("{}: {}", path.display(), e).as_str()));
                },
            }
        }
        match format {
            Some(f) => ClipAudioDriver::new(f, clips),
            None => Err(invalid_argument_error("No audio files given")),
        }
    }

    /// Restart from the first clip instead of ending.
    pub fn with_looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    /// Pace `receive()` at the clip's sample rate, like a live microphone.
    pub fn with_realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }
}

impl AudioDriver for ClipAudioDriver {
    fn name(&self) -> String {
        "Static sample audio files".to_string()
    }

    fn init(&mut self, sample_rate: u32) -> Result<AudioFormat, CanonicalError> {
        if sample_rate != self.format.sample_rate {
            return Err(invalid_argument_error(
                format!("Clips are {} Hz, {} Hz requested",
                        self.format.sample_rate, sample_rate).as_str()));
        }
        self.clip = 0;
        self.position = 0;
        self.ended = false;
        Ok(self.format)
    }

    fn receive(&mut self, block: &mut [i16]) -> Result<(), CanonicalError> {
        if self.ended {
            return Err(out_of_range_error("End of audio clips"));
        }
        let mut filled = 0;
        while filled < block.len() {
            if self.clip >= self.clips.len() {
                if !self.looping {
                    // Pad the final block; the next call reports the end.
                    block[filled..].fill(0);
                    self.ended = true;
                    break;
                }
                self.clip = 0;
            }
            let clip = &self.clips[self.clip];
            let n = (clip.len() - self.position).min(block.len() - filled);
            block[filled..filled + n].copy_from_slice(&clip[self.position..self.position + n]);
            filled += n;
            self.position += n;
            if self.position >= clip.len() {
                self.clip += 1;
                self.position = 0;
            }
        }
        if self.gain != 1.0 {
            apply_gain(block, self.gain);
        }
        if self.realtime {
            let frames = block.len() as u64 / self.format.channels as u64;
            thread::sleep(Duration::from_micros(frames * 1_000_000 / self.format.sample_rate as u64));
        }
        Ok(())
    }

    fn set_gain(&mut self, gain: f32) -> Result<(), CanonicalError> {
        self.gain = gain;
        Ok(())
    }
}

type StrideResult = Result<Vec<i16>, CanonicalError>;

// Producer loop: waits for an empty stride buffer, fills it block by block
// and sends it back. Exits when the consumer goes away or the driver fails.
fn record_strides(mut driver: Box<dyn AudioDriver>, format: AudioFormat, block: usize,
                  mics: MicSelection, requests: std_mpsc::Receiver<Vec<i16>>,
                  filled: mpsc::Sender<StrideResult>) {
    let channels = format.channels as usize;
    let mut raw = vec![0i16; block * channels];
    while let Ok(mut stride) = requests.recv() {
        let mut done = 0;
        while done < stride.len() {
            let n = block.min(stride.len() - done);
            if let Err(e) = driver.receive(&mut raw[..n * channels]) {
                let _ = filled.blocking_send(Err(e));
                return;
            }
            select_mics(&raw[..n * channels], format.channels, mics,
                        &mut stride[done..done + n]);
            done += n;
        }
        if filled.blocking_send(Ok(stride)).is_err() {
            break;  // Consumer dropped.
        }
    }
    debug!("{}: recorder exiting", driver.name());
}

/// Keeps the analysis window filled from an `AudioDriver`.
pub struct StrideRecorder {
    window: Vec<i16>,
    stride: usize,
    requests: Option<std_mpsc::Sender<Vec<i16>>>,
    filled: mpsc::Receiver<StrideResult>,
    timeout: Option<Duration>,
    strides_received: u64,
}

impl StrideRecorder {
    /// Initialises `driver` and starts capturing the first stride.
    pub fn start(mut driver: Box<dyn AudioDriver>, config: &AudioPipelineConfig)
                 -> Result<Self, CanonicalError> {
        if config.stride == 0 || config.stride > config.window || config.block == 0 {
            return Err(invalid_argument_error(
                format!("Invalid window {} / stride {} / block {}",
                        config.window, config.stride, config.block).as_str()));
        }
        let format = driver.init(config.sample_rate)?;
        info!("{}: {} Hz, {} channel(s), window {} stride {}", driver.name(),
              format.sample_rate, format.channels, config.window, config.stride);

        let (request_tx, request_rx) = std_mpsc::channel();
        let (filled_tx, filled_rx) = mpsc::channel(1);
        let (block, mics) = (config.block, config.mics);
        thread::spawn(move || {
            record_strides(driver, format, block, mics, request_rx, filled_tx);
        });
        if request_tx.send(vec![0i16; config.stride]).is_err() {
            return Err(unavailable_error("Audio recorder failed to start"));
        }
        Ok(StrideRecorder{window: vec![0i16; config.window],
                          stride: config.stride,
                          requests: Some(request_tx),
                          filled: filled_rx,
                          timeout: config.stride_timeout,
                          strides_received: 0})
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Number of strides consumed so far.
    pub fn strides_received(&self) -> u64 {
        self.strides_received
    }

    async fn receive_stride(&mut self) -> Result<Vec<i16>, CanonicalError> {
        let received = match self.timeout {
            Some(t) => match tokio::time::timeout(t, self.filled.recv()).await {
                Ok(r) => r,
                Err(_) => {
                    warn!("Audio stride not received within {:?}", t);
                    return Err(deadline_exceeded_error(
                        format!("Audio stride not received within {:?}", t).as_str()));
                },
            },
            None => self.filled.recv().await,
        };
        match received {
            Some(r) => r,
            None => Err(unavailable_error("Audio recorder stopped")),
        }
    }

    /// Waits for the next stride and returns the updated window, oldest
    /// sample first. The first call waits until the whole window is filled.
    pub async fn next_window(&mut self) -> Result<&mut [i16], CanonicalError> {
        loop {
            let stride = self.receive_stride().await?;
            let n = self.window.len();
            self.window.copy_within(self.stride.., 0);
            self.window[n - self.stride..].copy_from_slice(&stride);
            self.strides_received += 1;

            // Start the next stride before anyone processes this window.
            let requested = match &self.requests {
                Some(tx) => tx.send(stride).is_ok(),
                None => false,
            };
            if !requested {
                debug!("Audio recorder gone; no further strides");
            }
            if self.strides_received as usize * self.stride >= n {
                return Ok(self.window.as_mut_slice());
            }
        }
    }

    /// Stops requesting strides; the producer exits once its current stride
    /// completes.
    pub fn stop(&mut self) {
        self.requests = None;
    }
}
