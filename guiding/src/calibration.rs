//! Mount calibration
//!
//! A [`Calibration`] records how guide pulses move the star on the sensor:
//! the camera-space direction of each mount axis and the rate in pixels per
//! millisecond. [`CalibrationRoutine`] measures one by stepping the mount
//! West/East and North/South while the guider feeds back star positions.

use crate::config::CalibrationConfig;
use crate::error::{GuideError, GuideResult};
use chrono::{DateTime, Utc};
use nightshade_gear::{GuideDirection, PierSide, Point};
use serde::{Deserialize, Serialize};
use std::f64::consts::{FRAC_PI_2, PI};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Parity {
    Even,
    Odd,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    /// Camera-space angle (radians) the star moves for a West pulse
    pub ra_angle: f64,
    /// Camera-space angle (radians) the star moves for a North pulse
    pub dec_angle: f64,
    /// Pixels per millisecond of RA pulse
    pub ra_rate: f64,
    /// Pixels per millisecond of Dec pulse
    pub dec_rate: f64,
    pub ra_parity: Parity,
    pub dec_parity: Parity,
    pub pier_side: PierSide,
    pub timestamp: DateTime<Utc>,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            ra_angle: 0.0,
            dec_angle: FRAC_PI_2,
            ra_rate: 0.0,
            dec_rate: 0.0,
            ra_parity: Parity::Unknown,
            dec_parity: Parity::Unknown,
            pier_side: PierSide::Unknown,
            timestamp: Utc::now(),
        }
    }
}

impl Calibration {
    /// Project a camera-space offset onto the mount axes. `x` of the result
    /// is the RA distance, `y` the Dec distance.
    pub fn camera_to_mount(&self, camera: Point) -> Point {
        let theta = camera.angle();
        let hyp = camera.distance();
        Point::new(
            (self.ra_angle - theta).cos() * hyp,
            (self.dec_angle - theta).cos() * hyp,
        )
    }

    /// Inverse of [`camera_to_mount`](Self::camera_to_mount)
    pub fn mount_to_camera(&self, mount: Point) -> GuideResult<Point> {
        let (sa, ca) = self.ra_angle.sin_cos();
        let (sb, cb) = self.dec_angle.sin_cos();
        let det = ca * sb - sa * cb;
        if det.abs() < 1e-6 {
            return Err(GuideError::CalibrationFailed(
                "RA and Dec axes are parallel".to_string(),
            ));
        }
        Ok(Point::new(
            (mount.x * sb - mount.y * sa) / det,
            (mount.y * ca - mount.x * cb) / det,
        ))
    }

    /// Deviation of the measured axes from perpendicular, in degrees
    pub fn orthogonality_error(&self) -> f64 {
        let diff = normalize_angle(self.dec_angle - self.ra_angle);
        (diff.abs() - FRAC_PI_2).abs().to_degrees()
    }

    /// The calibration after the tube moved to `pier_side`; RA reverses on the sensor.
    pub fn flipped(&self, pier_side: PierSide) -> Calibration {
        Calibration {
            ra_angle: normalize_angle(self.ra_angle + PI),
            pier_side,
            ..*self
        }
    }
}

/// Wrap an angle into (-PI, PI]
pub fn normalize_angle(angle: f64) -> f64 {
    let mut a = angle % (2.0 * PI);
    if a <= -PI {
        a += 2.0 * PI;
    } else if a > PI {
        a -= 2.0 * PI;
    }
    a
}

// =============================================================================
// CALIBRATION ROUTINE
// =============================================================================

/// What the routine wants done after seeing a star position
#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationStep {
    Move {
        direction: GuideDirection,
        duration_ms: u32,
    },
    Complete(Calibration),
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    West,
    East,
    North,
    South,
    Done,
}

#[derive(Debug, Clone)]
pub struct CalibrationRoutine {
    config: CalibrationConfig,
    phase: Phase,
    origin: Point,
    steps: u32,
    west_steps: u32,
    north_steps: u32,
    ra: Option<(f64, f64)>,
    dec: Option<(f64, f64)>,
    calibrate_dec: bool,
}

impl CalibrationRoutine {
    pub fn new(config: CalibrationConfig, start: Point, calibrate_dec: bool) -> Self {
        tracing::info!(
            "Calibration started at ({:.1}, {:.1}), {} ms steps, {:.0} px travel",
            start.x,
            start.y,
            config.step_ms,
            config.distance_px
        );
        Self {
            config,
            phase: Phase::West,
            origin: start,
            steps: 0,
            west_steps: 0,
            north_steps: 0,
            ra: None,
            dec: None,
            calibrate_dec,
        }
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    fn step(&self, direction: GuideDirection) -> CalibrationStep {
        CalibrationStep::Move {
            direction,
            duration_ms: self.config.step_ms,
        }
    }

    /// Advance with the star position measured after the previous step.
    ///
    /// `pier_side` is recorded in the finished calibration.
    pub fn update(&mut self, position: Point, pier_side: PierSide) -> CalibrationStep {
        loop {
            match self.phase {
                Phase::West | Phase::North => {
                    let travel = position - self.origin;
                    if self.steps > 0 && travel.distance() >= self.config.distance_px {
                        let rate =
                            travel.distance() / (self.steps as f64 * self.config.step_ms as f64);
                        if self.phase == Phase::West {
                            tracing::info!(
                                "RA calibrated: angle {:.1}°, rate {:.4} px/ms after {} steps",
                                travel.angle().to_degrees(),
                                rate,
                                self.steps
                            );
                            self.ra = Some((travel.angle(), rate));
                            self.west_steps = self.steps;
                            self.phase = Phase::East;
                        } else {
                            tracing::info!(
                                "Dec calibrated: angle {:.1}°, rate {:.4} px/ms after {} steps",
                                travel.angle().to_degrees(),
                                rate,
                                self.steps
                            );
                            self.dec = Some((travel.angle(), rate));
                            self.north_steps = self.steps;
                            self.phase = Phase::South;
                        }
                        self.steps = 0;
                        continue;
                    }
                    if self.steps >= self.config.max_steps {
                        let axis = if self.phase == Phase::West { "RA" } else { "Dec" };
                        return CalibrationStep::Failed(format!(
                            "{} calibration failed: star moved only {:.1} px in {} steps",
                            axis,
                            travel.distance(),
                            self.steps
                        ));
                    }
                    self.steps += 1;
                    return if self.phase == Phase::West {
                        self.step(GuideDirection::West)
                    } else {
                        self.step(GuideDirection::North)
                    };
                }
                Phase::East => {
                    if self.steps < self.west_steps {
                        self.steps += 1;
                        return self.step(GuideDirection::East);
                    }
                    self.steps = 0;
                    self.origin = position;
                    self.phase = if self.calibrate_dec {
                        Phase::North
                    } else {
                        Phase::Done
                    };
                }
                Phase::South => {
                    if self.steps < self.north_steps {
                        self.steps += 1;
                        return self.step(GuideDirection::South);
                    }
                    self.phase = Phase::Done;
                }
                Phase::Done => return CalibrationStep::Complete(self.result(pier_side)),
            }
        }
    }

    fn result(&self, pier_side: PierSide) -> Calibration {
        let (ra_angle, ra_rate) = self.ra.unwrap_or((0.0, 0.0));
        // Without a Dec measurement assume a perpendicular axis at the RA rate
        let (dec_angle, dec_rate, dec_parity) = match self.dec {
            Some((angle, rate)) => {
                let cross = (angle - ra_angle).sin();
                let parity = if cross >= 0.0 { Parity::Even } else { Parity::Odd };
                (angle, rate, parity)
            }
            None => (normalize_angle(ra_angle + FRAC_PI_2), ra_rate, Parity::Unknown),
        };
        let calibration = Calibration {
            ra_angle,
            dec_angle,
            ra_rate,
            dec_rate,
            ra_parity: Parity::Even,
            dec_parity,
            pier_side,
            timestamp: Utc::now(),
        };
        let ortho = calibration.orthogonality_error();
        if ortho > 10.0 {
            tracing::warn!("Calibration axes are {:.1}° from perpendicular", ortho);
        }
        calibration
    }
}
