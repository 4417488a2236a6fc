// Software gain control driven by demosaic exposure statistics.

use canonical_error::CanonicalError;
use log::debug;

use crate::bayer::ExposureStats;

const TARGET_HIGHLOW_DIFFERENCE: f32 = 0.0;
const OVERUNDER_WEIGHT: f32 = 4.0;
const KP: f32 = 0.45;
const KI: f32 = 0.54 / 2.0;
const TINY_ERROR: f32 = 1.0 / 16.0;
const SATURATION_DEVIATION: f32 = 0.25;

/// Sensor gains are exchanged in Q16 fixed point: 65536 is unity gain.
pub const UNITY_GAIN: u32 = 1 << 16;

fn api_gain_to_log(api: u32) -> f32 {
    (api as f32 / UNITY_GAIN as f32).ln()
}

fn log_gain_to_api(gain: f32) -> u32 {
    let api = gain.exp() * UNITY_GAIN as f32;
    if api >= u32::MAX as f32 {
        u32::MAX
    } else {
        api as u32
    }
}

/// PI controller acting on the logarithm of sensor gain. It steers towards
/// equal proportions of high and low pixels, counting over/under exposed
/// pixels several times over.
///
/// The sensor reports the gain it actually applied. When that differs from
/// the request by more than 25%, the reported value is remembered as the
/// minimum or maximum and later requests are clamped to it.
#[derive(Debug)]
pub struct AutoGain {
    current_log_gain: f32,
    current_api_gain: u32,
    last_requested_api_gain: u32,
    minimum_log_gain: f32,
    maximum_log_gain: f32,
    previous_error: f32,
}

impl AutoGain {
    /// `initial_api_gain` is the gain the sensor is running at (Q16).
    pub fn new(initial_api_gain: u32) -> Self {
        let initial = initial_api_gain.max(1);
        AutoGain{
            current_log_gain: api_gain_to_log(initial),
            current_api_gain: initial,
            last_requested_api_gain: 0,
            minimum_log_gain: f32::NEG_INFINITY,
            maximum_log_gain: f32::INFINITY,
            previous_error: 0.0,
        }
    }

    /// Gain currently applied by the sensor, as a multiplier.
    pub fn gain(&self) -> f32 {
        self.current_api_gain as f32 / UNITY_GAIN as f32
    }

    pub fn limits(&self) -> (f32, f32) {
        (self.minimum_log_gain.exp(), self.maximum_log_gain.exp())
    }

    /// Runs one controller step for a frame of `pixel_count` pixels. When the
    /// desired gain changed, `set_gain` is called with the Q16 request and
    /// must return the Q16 gain the sensor actually applied.
    /// Returns the gain multiplier in effect afterwards.
    pub fn update<F>(&mut self, stats: &ExposureStats, pixel_count: usize,
                     set_gain: F) -> Result<f32, CanonicalError>
    where F: FnOnce(u32) -> Result<u32, CanonicalError>
    {
        let scale = 1.0 / pixel_count.max(1) as f32;
        let high = (stats.high as f32 + OVERUNDER_WEIGHT * stats.over as f32) * scale;
        let low = (stats.low as f32 + OVERUNDER_WEIGHT * stats.under as f32) * scale;
        let mut error = (high - low) - TARGET_HIGHLOW_DIFFERENCE;

        // Ignore small errors, so we don't oscillate.
        if error.abs() < TINY_ERROR * high.max(low) {
            error = 0.0;
        }

        let delta = (KP + KI) * error - KP * self.previous_error;
        self.previous_error = error;
        self.current_log_gain = (self.current_log_gain - delta)
            .min(self.maximum_log_gain)
            .max(self.minimum_log_gain);

        let desired = log_gain_to_api(self.current_log_gain).max(1);
        if desired == self.last_requested_api_gain {
            return Ok(self.gain());
        }
        let applied = set_gain(desired)?;
        self.last_requested_api_gain = desired;
        self.current_api_gain = applied.max(1);
        debug!("Camera gain changed to {:.3}", self.gain());

        let deviation = (self.current_api_gain as f32 - desired as f32) / desired as f32;
        if deviation.abs() > SATURATION_DEVIATION {
            if deviation < 0.0 {
                self.maximum_log_gain = api_gain_to_log(self.current_api_gain);
                debug!("Noted maximum gain {:.3}", self.gain());
            } else {
                self.minimum_log_gain = api_gain_to_log(self.current_api_gain);
                debug!("Noted minimum gain {:.3}", self.gain());
            }
            self.current_log_gain = api_gain_to_log(self.current_api_gain);
        }
        Ok(self.gain())
    }
}
