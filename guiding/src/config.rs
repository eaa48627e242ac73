//! Guiding configuration
//!
//! All tunables of the tracker, the axis correctors, calibration, capture and
//! dither live here. The struct round-trips through JSON; missing fields take
//! their defaults so older files keep loading.

use crate::corrector::{DecAlgorithm, DecGuideMode};
use crate::error::{GuideError, GuideResult};
use nightshade_gear::NoiseReduction;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GuidingConfig {
    pub tracker: TrackerConfig,
    pub ra: RaConfig,
    pub dec: DecConfig,
    pub calibration: CalibrationConfig,
    pub capture: CaptureConfig,
    pub dither: DitherConfig,
}

/// Star tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Half-size of the search window around the last position (px)
    pub search_region: u32,
    pub mass_change_enabled: bool,
    /// Fractional mass change that rejects a frame while guiding
    pub mass_change_threshold: f64,
    pub min_mass: f64,
    pub min_snr: f64,
    /// Border excluded from automatic star selection (px)
    pub auto_select_margin: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            search_region: 15,
            mass_change_enabled: true,
            mass_change_threshold: 0.5,
            min_mass: 10.0,
            min_snr: 3.0,
            auto_select_margin: 20,
        }
    }
}

/// Right ascension correction (hysteresis algorithm)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaConfig {
    /// Weight of the previous offset in the blend, 0..1
    pub hysteresis: f64,
    pub aggression: f64,
    /// Offsets smaller than this (px) produce no pulse
    pub min_motion: f64,
    pub max_duration_ms: u32,
}

impl Default for RaConfig {
    fn default() -> Self {
        Self {
            hysteresis: 0.1,
            aggression: 1.0,
            min_motion: 0.15,
            max_duration_ms: 2500,
        }
    }
}

/// Declination correction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecConfig {
    pub algorithm: DecAlgorithm,
    pub mode: DecGuideMode,
    pub min_motion: f64,
    pub max_duration_ms: u32,
    /// Weight of the trend slope in the lowpass-median estimate
    pub slope_weight: f64,
    pub resist_switch: ResistSwitchConfig,
}

impl Default for DecConfig {
    fn default() -> Self {
        Self {
            algorithm: DecAlgorithm::ResistSwitch,
            mode: DecGuideMode::Auto,
            min_motion: 0.15,
            max_duration_ms: 2500,
            slope_weight: 5.0,
            resist_switch: ResistSwitchConfig::default(),
        }
    }
}

/// Empirically tuned thresholds of the resist-switch algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResistSwitchConfig {
    /// Samples kept in the rolling history
    pub history_len: usize,
    /// Minimum |sum of signs| before the correction side may change
    pub switch_evidence: i32,
    /// Samples compared at each end of the history to detect a growing error
    pub trend_window: usize,
}

impl Default for ResistSwitchConfig {
    fn default() -> Self {
        Self {
            history_len: 10,
            switch_evidence: 3,
            trend_window: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Length of each calibration pulse
    pub step_ms: u32,
    /// Star travel required on each axis (px)
    pub distance_px: f64,
    /// Steps allowed per direction before calibration gives up
    pub max_steps: u32,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            step_ms: 750,
            distance_px: 25.0,
            max_steps: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub exposure_ms: u32,
    /// Pause before each exposure
    pub delay_ms: u32,
    pub noise_reduction: NoiseReduction,
    /// Allowance on top of the exposure time before a capture counts as timed out
    pub timeout_margin_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            exposure_ms: 1000,
            delay_ms: 0,
            noise_reduction: NoiseReduction::None,
            timeout_margin_ms: 15_000,
        }
    }
}

/// How dither offsets are chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DitherMode {
    /// Uniform random offset up to the dither amount on each axis
    #[default]
    Random,
    /// Walk a square spiral around the starting lock position
    Spiral,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DitherConfig {
    pub mode: DitherMode,
    /// Dither in RA only
    pub ra_only: bool,
    /// Multiplier applied to the requested dither amount
    pub scale: f64,
}

impl Default for DitherConfig {
    fn default() -> Self {
        Self {
            mode: DitherMode::Random,
            ra_only: false,
            scale: 1.0,
        }
    }
}

impl GuidingConfig {
    /// Load from a JSON file and validate
    pub fn load(path: impl AsRef<Path>) -> GuideResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| GuideError::Config(format!("{}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| GuideError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> GuideResult<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| GuideError::Config(e.to_string()))?;
        std::fs::write(path.as_ref(), json)
            .map_err(|e| GuideError::Config(format!("{}: {}", path.as_ref().display(), e)))
    }

    pub fn validate(&self) -> GuideResult<()> {
        if !(0.0..=1.0).contains(&self.ra.hysteresis) {
            return Err(GuideError::Config(format!(
                "RA hysteresis must be within 0..1, got {}",
                self.ra.hysteresis
            )));
        }
        if self.ra.aggression <= 0.0 {
            return Err(GuideError::Config("RA aggression must be positive".into()));
        }
        if self.ra.min_motion < 0.0 || self.dec.min_motion < 0.0 {
            return Err(GuideError::Config("min motion cannot be negative".into()));
        }
        if self.tracker.search_region == 0 {
            return Err(GuideError::Config("search region must be at least 1 px".into()));
        }
        if self.calibration.step_ms == 0 || self.calibration.distance_px <= 0.0 {
            return Err(GuideError::Config(
                "calibration step and distance must be positive".into(),
            ));
        }
        if self.capture.exposure_ms == 0 {
            return Err(GuideError::Config("exposure must be positive".into()));
        }
        let rs = &self.dec.resist_switch;
        if rs.history_len == 0 || rs.trend_window == 0 || rs.trend_window * 2 > rs.history_len {
            return Err(GuideError::Config(format!(
                "resist-switch trend window {} does not fit a history of {}",
                rs.trend_window, rs.history_len
            )));
        }
        Ok(())
    }
}
