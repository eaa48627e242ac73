//! Guider capability and the single-star guider
//!
//! The guider owns the lock position and the star bookkeeping. Every frame
//! goes through [`Guider::process_frame`], which tells the session what to
//! do next: nothing, a calibration step, or a guide correction.

use crate::calibration::{CalibrationRoutine, CalibrationStep};
use crate::config::{DitherMode, GuidingConfig};
use crate::corrector::DecGuideMode;
use crate::error::{GuideError, GuideResult};
use crate::mount::{GuiderOffset, SharedMount};
use crate::star::{StarFix, StarTracker};
use nightshade_gear::{Frame, GuideDirection, Point, Rect};
use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuiderState {
    /// No star selected
    Uninitialized,
    Selected,
    Calibrating,
    Calibrated,
    Guiding,
}

/// What the session should do with the result of one frame
#[derive(Debug, Clone, PartialEq)]
pub enum GuideStep {
    None,
    /// The star was not found this frame; no correction is sent
    Lost(StarFix),
    Calibrate {
        direction: GuideDirection,
        duration_ms: u32,
    },
    Correct(GuiderOffset),
}

/// Guider capability consumed by the session controller
pub trait Guider: Send {
    fn state(&self) -> GuiderState;

    fn is_guiding(&self) -> bool {
        self.state() == GuiderState::Guiding
    }

    fn is_calibrating(&self) -> bool {
        self.state() == GuiderState::Calibrating
    }

    fn is_calibrating_or_guiding(&self) -> bool {
        matches!(
            self.state(),
            GuiderState::Calibrating | GuiderState::Calibrated | GuiderState::Guiding
        )
    }

    /// The star was found on the last frame
    fn is_locked(&self) -> bool;

    /// Distance between the star and the lock position (px)
    fn current_error(&self) -> f64;

    fn lock_position(&self) -> Option<Point>;

    fn current_position(&self) -> Option<Point>;

    fn move_lock_position(&mut self, delta: Point) -> GuideResult<()>;

    fn lock_pos_is_sticky(&self) -> bool;

    fn set_lock_pos_is_sticky(&mut self, sticky: bool);

    fn is_capture_active(&self) -> bool;

    fn start_capturing(&mut self) -> GuideResult<()>;

    fn stop_capturing(&mut self);

    /// Stop guiding; a full reset also forgets the star
    fn reset(&mut self, full: bool);

    fn auto_select_star(&mut self, roi: Option<Rect>) -> GuideResult<()>;

    /// Start guiding, calibrating first when the mount needs it
    fn start_guiding(&mut self) -> GuideResult<()>;

    fn dither(&mut self, pixels: f64, ra_only: bool) -> GuideResult<()>;

    fn process_frame(&mut self, frame: Frame) -> GuideStep;

    /// Why the last calibration attempt failed, if it did
    fn calibration_error(&self) -> Option<String> {
        None
    }
}

/// Square spiral of dither offsets in units of the dither amount.
///
/// RA-only walks x = 0, 1, -1, -2, 2, 3, -3, ...; RA/Dec walks an outward
/// square spiral one step at a time.
#[derive(Debug, Clone, PartialEq)]
struct DitherSpiral {
    x: i32,
    y: i32,
    dx: i32,
    dy: i32,
    prev_ra_only: bool,
}

impl Default for DitherSpiral {
    fn default() -> Self {
        Self {
            x: 0,
            y: 0,
            dx: -1,
            dy: 0,
            prev_ra_only: false,
        }
    }
}

impl DitherSpiral {
    fn reset(&mut self) {
        tracing::debug!("Reset dither spiral");
        *self = Self::default();
    }

    fn rotate(&mut self) {
        let t = -self.dx;
        self.dx = self.dy;
        self.dy = t;
    }

    /// Next (RA, Dec) offset
    fn next(&mut self, amount: f64, ra_only: bool) -> (f64, f64) {
        // Switching between RA-only and RA/Dec starts a new spiral
        if ra_only != self.prev_ra_only {
            self.reset();
            self.prev_ra_only = ra_only;
        }

        if ra_only {
            self.rotate();
            let x0 = self.x;
            if self.dy == 0 {
                self.x = -self.x;
            } else {
                self.x += self.dy;
            }
            ((self.x - x0) as f64 * amount, 0.0)
        } else {
            let (x, y) = (self.x, self.y);
            if x == y || (x > 0 && x == -y) || (x <= 0 && y == 1 - x) {
                self.rotate();
            }
            self.x += self.dx;
            self.y += self.dy;
            (self.dx as f64 * amount, self.dy as f64 * amount)
        }
    }
}

/// Guides on a single star against the primary mount
#[derive(Debug)]
pub struct OneStarGuider {
    config: GuidingConfig,
    tracker: StarTracker,
    mount: Option<SharedMount>,
    state: GuiderState,
    lock: Option<Point>,
    current: Option<Point>,
    sticky: bool,
    locked: bool,
    current_error: f64,
    capture_active: bool,
    last_frame: Option<Frame>,
    routine: Option<CalibrationRoutine>,
    calibration_error: Option<String>,
    spiral: DitherSpiral,
}

impl OneStarGuider {
    pub fn new(config: GuidingConfig, mount: Option<SharedMount>) -> Self {
        Self {
            tracker: StarTracker::new(config.tracker.clone()),
            config,
            mount,
            state: GuiderState::Uninitialized,
            lock: None,
            current: None,
            sticky: false,
            locked: false,
            current_error: 0.0,
            capture_active: false,
            last_frame: None,
            routine: None,
            calibration_error: None,
            spiral: DitherSpiral::default(),
        }
    }

    fn connected_mount(&self) -> GuideResult<&SharedMount> {
        match &self.mount {
            Some(mount) if mount.is_connected() => Ok(mount),
            _ => Err(GuideError::NotConnected),
        }
    }

    fn begin_guiding(&mut self) {
        self.state = GuiderState::Guiding;
        self.tracker.set_guiding(true);
        self.spiral.reset();
        if let Some(mount) = &self.mount {
            mount.reset_guide_state();
        }
        if !self.sticky || self.lock.is_none() {
            self.lock = self.current;
        }
        if let Some(lock) = self.lock {
            tracing::info!("Guiding started, lock position ({:.2}, {:.2})", lock.x, lock.y);
        }
    }

    fn step_calibration(&mut self, position: Point) -> GuideStep {
        let pier_side = self
            .mount
            .as_ref()
            .map(|m| m.pier_side())
            .unwrap_or_default();
        let Some(routine) = self.routine.as_mut() else {
            return GuideStep::None;
        };
        match routine.update(position, pier_side) {
            CalibrationStep::Move {
                direction,
                duration_ms,
            } => GuideStep::Calibrate {
                direction,
                duration_ms,
            },
            CalibrationStep::Complete(calibration) => {
                self.routine = None;
                if let Some(mount) = &self.mount {
                    mount.set_calibration(calibration);
                }
                self.state = GuiderState::Calibrated;
                self.begin_guiding();
                GuideStep::None
            }
            CalibrationStep::Failed(message) => {
                tracing::warn!("{}", message);
                self.routine = None;
                self.calibration_error = Some(message);
                self.state = GuiderState::Selected;
                GuideStep::None
            }
        }
    }

    fn track(&mut self, frame: &Frame) -> Option<StarFix> {
        let prior = self.current?;
        let fix = self
            .tracker
            .locate(frame, prior, self.config.tracker.search_region);
        self.locked = fix.found();
        if self.locked {
            self.current = Some(fix.position);
        } else {
            tracing::debug!("Star not found: {}", fix.result);
        }
        Some(fix)
    }
}

impl Guider for OneStarGuider {
    fn state(&self) -> GuiderState {
        self.state
    }

    fn is_locked(&self) -> bool {
        self.locked && self.state != GuiderState::Uninitialized
    }

    fn current_error(&self) -> f64 {
        self.current_error
    }

    fn lock_position(&self) -> Option<Point> {
        self.lock
    }

    fn current_position(&self) -> Option<Point> {
        self.current
    }

    fn move_lock_position(&mut self, delta: Point) -> GuideResult<()> {
        let lock = self
            .lock
            .ok_or_else(|| GuideError::Dither("no lock position".to_string()))?;
        let moved = lock + delta;
        if let Some(frame) = &self.last_frame {
            let margin = self.config.tracker.search_region as f64;
            if moved.x < margin
                || moved.y < margin
                || moved.x >= frame.width() as f64 - margin
                || moved.y >= frame.height() as f64 - margin
            {
                return Err(GuideError::Dither(format!(
                    "lock position ({:.1}, {:.1}) would leave the frame",
                    moved.x, moved.y
                )));
            }
        }
        self.lock = Some(moved);
        Ok(())
    }

    fn lock_pos_is_sticky(&self) -> bool {
        self.sticky
    }

    fn set_lock_pos_is_sticky(&mut self, sticky: bool) {
        self.sticky = sticky;
    }

    fn is_capture_active(&self) -> bool {
        self.capture_active
    }

    fn start_capturing(&mut self) -> GuideResult<()> {
        if !self.capture_active {
            tracing::info!("Capturing started");
            self.capture_active = true;
        }
        Ok(())
    }

    fn stop_capturing(&mut self) {
        if self.capture_active {
            tracing::info!("Capturing stopped");
            self.capture_active = false;
        }
    }

    fn reset(&mut self, full: bool) {
        self.routine = None;
        self.tracker.set_guiding(false);
        self.locked = false;
        self.current_error = 0.0;
        if full || self.current.is_none() {
            self.state = GuiderState::Uninitialized;
            self.current = None;
            if !self.sticky {
                self.lock = None;
            }
        } else {
            self.state = GuiderState::Selected;
        }
    }

    fn auto_select_star(&mut self, roi: Option<Rect>) -> GuideResult<()> {
        let frame = self.last_frame.as_ref().ok_or(GuideError::NoGuideStar)?;
        let fix = self.tracker.auto_select(frame, roi)?;
        tracing::info!(
            "Auto-selected star at ({:.2}, {:.2}), mass {:.0}, SNR {:.1}",
            fix.position.x,
            fix.position.y,
            fix.mass,
            fix.snr
        );
        self.current = Some(fix.position);
        if !self.sticky || self.lock.is_none() {
            self.lock = Some(fix.position);
        }
        self.locked = true;
        self.state = GuiderState::Selected;
        Ok(())
    }

    fn start_guiding(&mut self) -> GuideResult<()> {
        if self.is_calibrating_or_guiding() {
            return Ok(());
        }
        let start = self
            .current
            .ok_or_else(|| GuideError::StartGuiding("no star selected".to_string()))?;
        let mount = self.connected_mount()?;

        if mount.is_calibrated() {
            self.begin_guiding();
            return Ok(());
        }

        let calibrate_dec = mount.dec_guide_mode() != Some(DecGuideMode::Off);
        self.routine = Some(CalibrationRoutine::new(
            self.config.calibration.clone(),
            start,
            calibrate_dec,
        ));
        if !self.sticky || self.lock.is_none() {
            self.lock = Some(start);
        }
        self.calibration_error = None;
        self.tracker.set_guiding(false);
        self.state = GuiderState::Calibrating;
        Ok(())
    }

    fn dither(&mut self, pixels: f64, ra_only: bool) -> GuideResult<()> {
        if !self.is_guiding() {
            return Err(GuideError::Dither("cannot dither if not guiding".to_string()));
        }
        let calibration = self
            .mount
            .as_ref()
            .and_then(|m| m.calibration())
            .ok_or(GuideError::NotCalibrated)?;

        let amount = pixels * self.config.dither.scale;
        let (ra, dec) = match self.config.dither.mode {
            DitherMode::Spiral => self.spiral.next(amount, ra_only),
            DitherMode::Random => {
                let mut rng = rand::thread_rng();
                let ra = amount * rng.gen_range(-1.0..=1.0);
                let dec = if ra_only {
                    0.0
                } else {
                    amount * rng.gen_range(-1.0..=1.0)
                };
                (ra, dec)
            }
        };
        let delta = calibration
            .mount_to_camera(Point::new(ra, dec))
            .map_err(|e| GuideError::Dither(e.to_string()))?;

        tracing::info!(
            "Dither by RA {:.2} Dec {:.2} px (camera {:.2}, {:.2})",
            ra,
            dec,
            delta.x,
            delta.y
        );
        self.move_lock_position(delta)
    }

    fn process_frame(&mut self, frame: Frame) -> GuideStep {
        let step = match self.state {
            GuiderState::Uninitialized => GuideStep::None,
            GuiderState::Selected => match self.track(&frame) {
                Some(fix) if !fix.found() => GuideStep::Lost(fix),
                _ => GuideStep::None,
            },
            GuiderState::Calibrating => match self.track(&frame) {
                Some(fix) if fix.found() => self.step_calibration(fix.position),
                Some(fix) => GuideStep::Lost(fix),
                None => GuideStep::None,
            },
            GuiderState::Calibrated | GuiderState::Guiding => match self.track(&frame) {
                Some(fix) if fix.found() => {
                    let calibration = self.mount.as_ref().and_then(|m| m.calibration());
                    match (self.lock, calibration) {
                        (Some(lock), Some(calibration)) => {
                            let camera = fix.position - lock;
                            self.current_error = camera.distance();
                            GuideStep::Correct(GuiderOffset::new(camera, &calibration))
                        }
                        _ => GuideStep::None,
                    }
                }
                Some(fix) => GuideStep::Lost(fix),
                None => GuideStep::None,
            },
        };
        self.last_frame = Some(frame);
        step
    }

    fn calibration_error(&self) -> Option<String> {
        self.calibration_error.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::Calibration;
    use crate::mount::{Mount, Scope};
    use nightshade_gear::{SimSky, SimSkyConfig, SimulatedPulseGuider};
    use std::sync::Arc;

    struct Rig {
        sky: SimSky,
        scope: Arc<Scope>,
        guider: OneStarGuider,
    }

    fn rig() -> Rig {
        let sky = SimSky::new(SimSkyConfig {
            noise: 0.0,
            ..Default::default()
        });
        let port = Arc::new(SimulatedPulseGuider::new(sky.clone()));
        let mut config = GuidingConfig::default();
        config.calibration.step_ms = 500;
        config.calibration.distance_px = 20.0;
        let scope = Arc::new(Scope::new(port, &config));
        let mount: SharedMount = scope.clone();
        let guider = OneStarGuider::new(config, Some(mount));
        Rig { sky, scope, guider }
    }

    fn frame(sky: &SimSky) -> Frame {
        let mut frame = Frame::new(320, 240).unwrap();
        sky.render(&mut frame);
        frame
    }

    #[test]
    fn test_auto_select_needs_a_frame() {
        let mut rig = rig();
        assert!(matches!(
            rig.guider.auto_select_star(None),
            Err(GuideError::NoGuideStar)
        ));
        assert_eq!(rig.guider.process_frame(frame(&rig.sky)), GuideStep::None);
        rig.guider.auto_select_star(None).unwrap();
        assert_eq!(rig.guider.state(), GuiderState::Selected);
        let lock = rig.guider.lock_position().unwrap();
        assert!(lock.distance_to(Point::new(160.0, 120.0)) < 0.3);
    }

    #[test]
    fn test_start_guiding_without_star() {
        let mut rig = rig();
        assert!(matches!(
            rig.guider.start_guiding(),
            Err(GuideError::StartGuiding(_))
        ));
    }

    #[test]
    fn test_calibrates_then_guides() {
        let mut rig = rig();
        rig.guider.process_frame(frame(&rig.sky));
        rig.guider.auto_select_star(None).unwrap();
        rig.guider.start_guiding().unwrap();
        assert!(rig.guider.is_calibrating());

        // Play the mount: apply each calibration pulse to the sky
        for _ in 0..200 {
            match rig.guider.process_frame(frame(&rig.sky)) {
                GuideStep::Calibrate {
                    direction,
                    duration_ms,
                } => rig.sky.apply_pulse(direction, duration_ms),
                GuideStep::None => break,
                other => panic!("unexpected step {:?}", other),
            }
        }
        assert!(rig.guider.is_guiding());
        let cal = rig.scope.calibration().unwrap();
        assert!(cal.ra_angle.abs() < 0.05);
        assert!((cal.ra_rate - 0.02).abs() < 0.002);

        // Nudge the star and expect an RA correction
        let pos = rig.sky.star_position();
        rig.sky.set_star_position(pos + Point::new(1.5, 0.0));
        match rig.guider.process_frame(frame(&rig.sky)) {
            GuideStep::Correct(offset) => {
                assert!(offset.mount.x > 1.0);
                assert!(rig.guider.current_error() > 1.0);
            }
            other => panic!("expected a correction, got {:?}", other),
        }
        assert!(rig.guider.is_locked());
    }

    #[test]
    fn test_lost_star_is_reported() {
        let mut rig = rig();
        rig.scope.set_calibration(Calibration {
            ra_rate: 0.02,
            dec_rate: 0.02,
            ..Calibration::default()
        });
        rig.guider.process_frame(frame(&rig.sky));
        rig.guider.auto_select_star(None).unwrap();
        rig.guider.start_guiding().unwrap();
        assert!(rig.guider.is_guiding());

        let blank = Frame::from_pixels(320, 240, vec![200; 320 * 240]).unwrap();
        assert!(matches!(rig.guider.process_frame(blank), GuideStep::Lost(_)));
        assert!(!rig.guider.is_locked());
    }

    fn guiding_rig(config: impl FnOnce(&mut GuidingConfig)) -> Rig {
        let mut rig = rig();
        config(&mut rig.guider.config);
        rig.scope.set_calibration(Calibration {
            ra_rate: 0.02,
            dec_rate: 0.02,
            ..Calibration::default()
        });
        rig.guider.process_frame(frame(&rig.sky));
        rig.guider.auto_select_star(None).unwrap();
        rig.guider.start_guiding().unwrap();
        assert!(rig.guider.is_guiding());
        rig
    }

    #[test]
    fn test_dither_requires_guiding() {
        let mut rig = rig();
        assert!(rig.guider.dither(3.0, false).is_err());

        rig.scope.set_calibration(Calibration {
            ra_rate: 0.02,
            dec_rate: 0.02,
            ..Calibration::default()
        });
        rig.guider.process_frame(frame(&rig.sky));
        rig.guider.auto_select_star(None).unwrap();
        assert_eq!(rig.guider.state(), GuiderState::Selected);
        let lock = rig.guider.lock_position();

        match rig.guider.dither(5.0, false) {
            Err(GuideError::Dither(message)) => assert_eq!(message, "cannot dither if not guiding"),
            other => panic!("expected a dither error, got {:?}", other),
        }
        assert_eq!(rig.guider.lock_position(), lock);
    }

    #[test]
    fn test_dither_moves_lock_position() {
        let mut rig = guiding_rig(|_| {});
        let before = rig.guider.lock_position().unwrap();

        rig.guider.dither(3.0, true).unwrap();
        let after = rig.guider.lock_position().unwrap();
        let delta = after - before;
        // RA-only dither along the RA axis (camera x) by at most 3 px
        assert!(delta.y.abs() < 1e-9);
        assert!(delta.x.abs() <= 3.0 + 1e-9);
    }

    fn spiral_steps(guider: &mut OneStarGuider, count: usize, ra_only: bool) -> Vec<(f64, f64)> {
        (0..count)
            .map(|_| {
                let before = guider.lock_position().unwrap();
                guider.dither(1.0, ra_only).unwrap();
                let delta = guider.lock_position().unwrap() - before;
                (delta.x.round(), delta.y.round())
            })
            .collect()
    }

    #[test]
    fn test_spiral_dither_order() {
        // RA along camera x and Dec along camera y, so offsets map straight through
        let mut rig = guiding_rig(|config| config.dither.mode = DitherMode::Spiral);

        let ra_only = spiral_steps(&mut rig.guider, 6, true);
        let xs: Vec<f64> = ra_only.iter().map(|d| d.0).collect();
        assert_eq!(xs, vec![1.0, -2.0, -1.0, 4.0, 1.0, -6.0]);
        assert!(ra_only.iter().all(|d| d.1 == 0.0));

        // Switching to RA/Dec starts a fresh spiral
        let both = spiral_steps(&mut rig.guider, 7, false);
        assert_eq!(
            both,
            vec![
                (0.0, 1.0),
                (1.0, 0.0),
                (0.0, -1.0),
                (0.0, -1.0),
                (-1.0, 0.0),
                (-1.0, 0.0),
                (0.0, 1.0),
            ]
        );
    }

    #[test]
    fn test_spiral_restarts_with_guiding() {
        let mut rig = guiding_rig(|config| config.dither.mode = DitherMode::Spiral);
        assert_eq!(spiral_steps(&mut rig.guider, 2, true), vec![(1.0, 0.0), (-2.0, 0.0)]);

        rig.guider.reset(false);
        rig.guider.start_guiding().unwrap();
        assert_eq!(spiral_steps(&mut rig.guider, 1, true), vec![(1.0, 0.0)]);
    }

    #[test]
    fn test_move_lock_position_stays_on_frame() {
        let mut rig = rig();
        rig.guider.process_frame(frame(&rig.sky));
        rig.guider.auto_select_star(None).unwrap();
        assert!(rig.guider.move_lock_position(Point::new(500.0, 0.0)).is_err());
        assert!(rig.guider.move_lock_position(Point::new(5.0, -5.0)).is_ok());
    }

    #[test]
    fn test_reset_keeps_sticky_lock() {
        let mut rig = rig();
        rig.guider.process_frame(frame(&rig.sky));
        rig.guider.auto_select_star(None).unwrap();
        rig.guider.set_lock_pos_is_sticky(true);
        rig.guider.reset(true);
        assert_eq!(rig.guider.state(), GuiderState::Uninitialized);
        assert!(rig.guider.lock_position().is_some());
        assert!(rig.guider.current_position().is_none());
    }
}
