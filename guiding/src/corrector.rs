//! Per-axis guide corrections
//!
//! Turns a mount-space offset (pixels along the RA or Dec axis) into a guide
//! pulse. RA uses a hysteresis blend with the previous offset. Dec offers
//! three algorithms that trade responsiveness against resistance to noise.
//!
//! Sign convention: a positive RA offset is corrected with an East pulse, a
//! positive Dec offset with a South pulse.

use crate::calibration::Calibration;
use crate::config::{DecConfig, RaConfig};
use nightshade_gear::GuideDirection;
use serde::{Deserialize, Serialize};

/// Samples averaged by the lowpass-median algorithm
pub const LOWPASS_WINDOW: usize = 11;

/// Samples fitted by the linear-regression algorithm
pub const REGRESSION_WINDOW: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DecAlgorithm {
    #[default]
    ResistSwitch,
    LowpassMedian,
    LinearRegression,
}

/// Which Dec corrections may be sent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DecGuideMode {
    Off,
    #[default]
    Auto,
    North,
    South,
}

impl DecGuideMode {
    pub fn permits(self, direction: GuideDirection) -> bool {
        match self {
            DecGuideMode::Off => false,
            DecGuideMode::Auto => true,
            DecGuideMode::North => direction == GuideDirection::North,
            DecGuideMode::South => direction == GuideDirection::South,
        }
    }
}

/// A computed correction for one axis. A zero duration means no pulse.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisMove {
    pub direction: GuideDirection,
    pub duration_ms: f64,
    /// The distance the duration was derived from, after filtering
    pub distance: f64,
}

impl AxisMove {
    fn none(direction: GuideDirection, distance: f64) -> Self {
        Self {
            direction,
            duration_ms: 0.0,
            distance,
        }
    }

    pub fn is_pulse(&self) -> bool {
        self.duration_ms > 0.0
    }

    /// Duration rounded to whole milliseconds for the pulse-guide port
    pub fn pulse_ms(&self) -> u32 {
        self.duration_ms.round().clamp(0.0, u32::MAX as f64) as u32
    }
}

// =============================================================================
// ROLLING HISTORY
// =============================================================================

/// Fixed-capacity ring buffer of offsets; a push into a full buffer
/// overwrites the oldest sample.
#[derive(Debug, Clone)]
pub struct History {
    buf: Vec<f64>,
    cursor: usize,
    len: usize,
}

impl History {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0.0; capacity.max(1)],
            cursor: 0,
            len: 0,
        }
    }

    /// A history holding `count` zero samples
    pub fn zeroed(capacity: usize, count: usize) -> Self {
        let mut history = Self::new(capacity);
        for _ in 0..count.min(capacity) {
            history.push(0.0);
        }
        history
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append a sample, returning the one it displaced
    pub fn push(&mut self, value: f64) -> Option<f64> {
        let cap = self.buf.len();
        let evicted = (self.len == cap).then(|| self.buf[self.cursor]);
        self.buf[self.cursor] = value;
        self.cursor = (self.cursor + 1) % cap;
        self.len = (self.len + 1).min(cap);
        evicted
    }

    /// Samples from oldest to newest
    pub fn iter(&self) -> impl ExactSizeIterator<Item = f64> + DoubleEndedIterator + '_ {
        let cap = self.buf.len();
        let start = (self.cursor + cap - self.len) % cap;
        (0..self.len).map(move |i| self.buf[(start + i) % cap])
    }

    pub fn clear(&mut self) {
        self.cursor = 0;
        self.len = 0;
    }
}

/// Least-squares slope of `samples` against x = 1..n.
///
/// Zero for fewer than two samples.
pub fn calc_slope(samples: impl Iterator<Item = f64>) -> f64 {
    let (mut n, mut sx, mut sy, mut sxy, mut sxx) = (0.0, 0.0, 0.0, 0.0, 0.0);
    for (i, y) in samples.enumerate() {
        let x = (i + 1) as f64;
        n += 1.0;
        sx += x;
        sy += y;
        sxy += x * y;
        sxx += x * x;
    }
    let denom = n * sxx - sx * sx;
    if denom.abs() < f64::EPSILON {
        return 0.0;
    }
    (n * sxy - sx * sy) / denom
}

/// Never let a model predict more error than was observed
pub fn limit_to_observed(corrected: f64, observed: f64) -> f64 {
    if corrected.abs() > observed.abs() {
        observed
    } else {
        corrected
    }
}

fn sign(value: f64) -> i32 {
    if value > 0.0 {
        1
    } else if value < 0.0 {
        -1
    } else {
        0
    }
}

fn duration_for(distance: f64, rate: f64) -> f64 {
    if rate > 0.0 {
        distance.abs() / rate
    } else {
        0.0
    }
}

// =============================================================================
// RIGHT ASCENSION
// =============================================================================

#[derive(Debug, Clone)]
pub struct RaCorrector {
    config: RaConfig,
    last_offset: f64,
}

impl RaCorrector {
    pub fn new(config: RaConfig) -> Self {
        Self {
            config,
            last_offset: 0.0,
        }
    }

    pub fn config(&self) -> &RaConfig {
        &self.config
    }

    pub fn reset(&mut self) {
        self.last_offset = 0.0;
    }

    pub fn correct(&mut self, offset_ra: f64, calibration: &Calibration) -> AxisMove {
        let h = self.config.hysteresis;
        let smoothed = (1.0 - h) * offset_ra + h * self.last_offset;
        self.last_offset = smoothed;

        let direction = if smoothed > 0.0 {
            GuideDirection::East
        } else {
            GuideDirection::West
        };
        if offset_ra.abs() < self.config.min_motion {
            return AxisMove::none(direction, smoothed);
        }

        let duration = (duration_for(smoothed, calibration.ra_rate) * self.config.aggression)
            .clamp(0.0, self.config.max_duration_ms as f64);
        AxisMove {
            direction,
            duration_ms: duration,
            distance: smoothed,
        }
    }
}

// =============================================================================
// DECLINATION
// =============================================================================

#[derive(Debug, Clone)]
pub struct DecCorrector {
    config: DecConfig,
    history: History,
    /// Sign of the side resist-switch currently corrects on, 0 before any move
    side: i32,
}

impl DecCorrector {
    pub fn new(config: DecConfig) -> Self {
        let history = Self::fresh_history(&config);
        Self {
            config,
            history,
            side: 0,
        }
    }

    fn fresh_history(config: &DecConfig) -> History {
        match config.algorithm {
            DecAlgorithm::ResistSwitch => {
                let len = config.resist_switch.history_len;
                History::zeroed(len, len)
            }
            DecAlgorithm::LowpassMedian => History::zeroed(LOWPASS_WINDOW, LOWPASS_WINDOW - 1),
            DecAlgorithm::LinearRegression => History::new(REGRESSION_WINDOW),
        }
    }

    pub fn config(&self) -> &DecConfig {
        &self.config
    }

    pub fn mode(&self) -> DecGuideMode {
        self.config.mode
    }

    pub fn set_mode(&mut self, mode: DecGuideMode) {
        if mode != self.config.mode {
            tracing::info!("Dec guide mode {:?} -> {:?}", self.config.mode, mode);
            self.config.mode = mode;
        }
    }

    pub fn set_algorithm(&mut self, algorithm: DecAlgorithm) {
        self.config.algorithm = algorithm;
        self.reset();
    }

    /// Side resist-switch is locked to: 1 (South), -1 (North) or 0
    pub fn side(&self) -> i32 {
        self.side
    }

    pub fn reset(&mut self) {
        self.history = Self::fresh_history(&self.config);
        self.side = 0;
    }

    pub fn correct(&mut self, offset_dec: f64, calibration: &Calibration) -> AxisMove {
        if self.config.mode == DecGuideMode::Off {
            return AxisMove::none(direction_of(offset_dec), offset_dec);
        }

        let proposed = match self.config.algorithm {
            DecAlgorithm::ResistSwitch => self.resist_switch(offset_dec, calibration),
            DecAlgorithm::LowpassMedian => self.lowpass_median(offset_dec, calibration),
            DecAlgorithm::LinearRegression => self.linear_regression(offset_dec, calibration),
        };

        if !self.config.mode.permits(proposed.direction) {
            return AxisMove::none(proposed.direction, proposed.distance);
        }
        AxisMove {
            duration_ms: proposed.duration_ms.min(self.config.max_duration_ms as f64),
            ..proposed
        }
    }

    fn resist_switch(&mut self, offset: f64, calibration: &Calibration) -> AxisMove {
        self.history.push(offset);
        let min_motion = self.config.min_motion;
        let tuning = self.config.resist_switch;
        let auto = self.config.mode == DecGuideMode::Auto;
        let mut allow = offset.abs() >= min_motion;

        if auto && allow {
            let evidence: i32 = self
                .history
                .iter()
                .filter(|v| v.abs() > min_motion)
                .map(sign)
                .sum();
            let evidence_side = evidence.signum();

            if self.side == 0 || self.side == -evidence_side {
                if evidence.abs() < tuning.switch_evidence {
                    allow = false;
                } else if self.side == 0 || self.error_growing(tuning.trend_window) {
                    tracing::debug!(
                        "Dec resist-switch: side {} -> {} (evidence {})",
                        self.side,
                        evidence_side,
                        evidence
                    );
                    self.side = evidence_side;
                } else {
                    allow = false;
                }
            }
        }

        // Corrections against the established side are overshoot
        if allow && auto && self.side != sign(offset) {
            allow = false;
        }

        let direction = direction_of(offset);
        if !allow {
            return AxisMove::none(direction, offset);
        }
        AxisMove {
            direction,
            duration_ms: duration_for(offset, calibration.dec_rate),
            distance: offset,
        }
    }

    /// Whether the newest samples sum to more than the oldest ones
    fn error_growing(&self, window: usize) -> bool {
        let oldest: f64 = self.history.iter().take(window).sum();
        let newest: f64 = self.history.iter().rev().take(window).sum();
        newest.abs() > oldest.abs()
    }

    fn lowpass_median(&mut self, offset: f64, calibration: &Calibration) -> AxisMove {
        self.history.push(offset);
        let mut sorted: Vec<f64> = self.history.iter().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let median = sorted[sorted.len() / 2];
        let slope = calc_slope(self.history.iter());

        let corrected = limit_to_observed(median + self.config.slope_weight * slope, offset);
        let direction = direction_of(corrected);
        if corrected.abs() <= self.config.min_motion {
            return AxisMove::none(direction, corrected);
        }
        // The estimate is cumulative over the window, so spread it out. Divides by the
        // full window even while the zero-filled history is still filling.
        AxisMove {
            direction,
            duration_ms: duration_for(corrected, calibration.dec_rate) / LOWPASS_WINDOW as f64,
            distance: corrected,
        }
    }

    fn linear_regression(&mut self, offset: f64, calibration: &Calibration) -> AxisMove {
        self.history.push(offset);
        let slope = calc_slope(self.history.iter());
        let chosen = if offset.abs() < slope.abs() { offset } else { slope };
        AxisMove {
            direction: direction_of(chosen),
            duration_ms: duration_for(chosen, calibration.dec_rate),
            distance: chosen,
        }
    }

    #[cfg(test)]
    fn preload(&mut self, samples: &[f64]) {
        for &s in samples {
            self.history.push(s);
        }
    }
}

fn direction_of(dec_distance: f64) -> GuideDirection {
    if dec_distance > 0.0 {
        GuideDirection::South
    } else {
        GuideDirection::North
    }
}
