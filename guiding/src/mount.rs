//! Mount capability used by the guiding core
//!
//! [`Mount`] is what the session controller and hardware worker talk to.
//! [`Scope`] implements it on top of a pulse-guide port: it owns the
//! calibration and the per-axis correctors and turns a guider offset into
//! RA and Dec pulses.

use crate::calibration::Calibration;
use crate::config::GuidingConfig;
use crate::corrector::{AxisMove, DecCorrector, DecGuideMode, RaCorrector};
use async_trait::async_trait;
use nightshade_gear::{
    DeviceError, GuideDirection, InterruptFlag, PierSide, Point, SharedPulseGuider,
};
use std::fmt::Debug;
use std::sync::{Arc, Mutex, MutexGuard};

/// Outcome of a mount move
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveResult {
    Ok,
    Error,
    LimitReached,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MoveOptions {
    /// Run the offset through the guide algorithms instead of moving the raw distance
    pub algorithm_result: bool,
    /// Issued by a user or API call rather than the guide loop
    pub manual: bool,
}

impl MoveOptions {
    pub fn guide() -> Self {
        Self {
            algorithm_result: true,
            manual: false,
        }
    }

    pub fn calibration() -> Self {
        Self::default()
    }
}

/// Star-to-lock offset for one frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GuiderOffset {
    pub camera: Point,
    /// `x` = RA distance, `y` = Dec distance
    pub mount: Point,
}

impl GuiderOffset {
    pub fn new(camera: Point, calibration: &Calibration) -> Self {
        Self {
            camera,
            mount: calibration.camera_to_mount(camera),
        }
    }
}

/// Mount capability
#[async_trait]
pub trait Mount: Send + Sync + Debug {
    fn name(&self) -> &str;

    fn is_connected(&self) -> bool;

    fn is_calibrated(&self) -> bool {
        self.calibration().is_some()
    }

    fn calibration(&self) -> Option<Calibration>;

    fn set_calibration(&self, calibration: Calibration);

    fn clear_calibration(&self);

    /// Whether moves may run on the hardware worker thread
    fn supports_background_move(&self) -> bool;

    /// Adaptive optics and other step guiders
    fn is_step_guider(&self) -> bool {
        false
    }

    /// An AO unit is re-centering through the primary mount
    fn is_bump_in_progress(&self) -> bool {
        false
    }

    /// Last known pier side
    fn pier_side(&self) -> PierSide {
        PierSide::Unknown
    }

    /// `None` for mounts without Dec guide mode control
    fn dec_guide_mode(&self) -> Option<DecGuideMode> {
        None
    }

    fn set_dec_guide_mode(&self, _mode: DecGuideMode) {}

    /// Forget correction history, called whenever guiding (re)starts
    fn reset_guide_state(&self) {}

    fn notify_settle_done(&self, _success: bool) {}

    async fn move_axis(
        &self,
        direction: GuideDirection,
        duration_ms: u32,
        options: MoveOptions,
        interrupt: &InterruptFlag,
    ) -> MoveResult;

    async fn move_offset(
        &self,
        offset: &GuiderOffset,
        options: MoveOptions,
        interrupt: &InterruptFlag,
    ) -> MoveResult;
}

pub type SharedMount = Arc<dyn Mount>;

// =============================================================================
// SCOPE
// =============================================================================

#[derive(Debug)]
struct ScopeState {
    calibration: Option<Calibration>,
    ra: RaCorrector,
    dec: DecCorrector,
    pier_side: PierSide,
}

/// A telescope mount guided through its pulse-guide port
#[derive(Debug)]
pub struct Scope {
    name: String,
    port: SharedPulseGuider,
    state: Mutex<ScopeState>,
}

impl Scope {
    pub fn new(port: SharedPulseGuider, config: &GuidingConfig) -> Self {
        Self {
            name: port.name().to_string(),
            port,
            state: Mutex::new(ScopeState {
                calibration: None,
                ra: RaCorrector::new(config.ra.clone()),
                dec: DecCorrector::new(config.dec.clone()),
                pier_side: PierSide::Unknown,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ScopeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn pulse(
        &self,
        direction: GuideDirection,
        duration_ms: u32,
        interrupt: &InterruptFlag,
    ) -> MoveResult {
        if duration_ms == 0 {
            return MoveResult::Ok;
        }
        match self.port.pulse_guide(direction, duration_ms, interrupt).await {
            Ok(()) => MoveResult::Ok,
            Err(DeviceError::LimitReached(dir)) => {
                tracing::warn!("{}: limit reached moving {:?}", self.name, dir);
                MoveResult::LimitReached
            }
            Err(e) => {
                tracing::warn!(
                    "{}: pulse {:?} {} ms failed: {}",
                    self.name,
                    direction,
                    duration_ms,
                    e
                );
                MoveResult::Error
            }
        }
    }

    /// Refresh the cached pier side and flip the calibration if it changed.
    async fn track_pier_side(&self) {
        let side = match self.port.side_of_pier().await {
            Ok(side) => side,
            Err(e) => {
                tracing::debug!("{}: pier side unavailable: {}", self.name, e);
                return;
            }
        };
        let mut state = self.state();
        state.pier_side = side;
        let Some(cal) = state.calibration else {
            return;
        };
        if side != PierSide::Unknown
            && cal.pier_side != PierSide::Unknown
            && side != cal.pier_side
        {
            tracing::info!(
                "{}: pier side changed {:?} -> {:?}, flipping RA calibration",
                self.name,
                cal.pier_side,
                side
            );
            state.calibration = Some(cal.flipped(side));
            state.ra.reset();
            state.dec.reset();
        }
    }

    fn raw_moves(state: &ScopeState, mount: Point, cal: &Calibration) -> (AxisMove, AxisMove) {
        let ra = AxisMove {
            direction: if mount.x > 0.0 {
                GuideDirection::East
            } else {
                GuideDirection::West
            },
            duration_ms: rate_duration(mount.x, cal.ra_rate)
                .min(state.ra.config().max_duration_ms as f64),
            distance: mount.x,
        };
        let dec_direction = if mount.y > 0.0 {
            GuideDirection::South
        } else {
            GuideDirection::North
        };
        let dec_duration = if state.dec.mode().permits(dec_direction) {
            rate_duration(mount.y, cal.dec_rate).min(state.dec.config().max_duration_ms as f64)
        } else {
            0.0
        };
        let dec = AxisMove {
            direction: dec_direction,
            duration_ms: dec_duration,
            distance: mount.y,
        };
        (ra, dec)
    }
}

fn rate_duration(distance: f64, rate: f64) -> f64 {
    if rate > 0.0 {
        distance.abs() / rate
    } else {
        0.0
    }
}

#[async_trait]
impl Mount for Scope {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_connected(&self) -> bool {
        self.port.is_connected()
    }

    fn calibration(&self) -> Option<Calibration> {
        self.state().calibration
    }

    fn set_calibration(&self, calibration: Calibration) {
        tracing::info!(
            "{}: calibration set (RA {:.1}° {:.4} px/ms, Dec {:.1}° {:.4} px/ms)",
            self.name,
            calibration.ra_angle.to_degrees(),
            calibration.ra_rate,
            calibration.dec_angle.to_degrees(),
            calibration.dec_rate
        );
        let mut state = self.state();
        state.calibration = Some(calibration);
        state.ra.reset();
        state.dec.reset();
    }

    fn clear_calibration(&self) {
        tracing::info!("{}: calibration cleared", self.name);
        self.state().calibration = None;
    }

    fn supports_background_move(&self) -> bool {
        self.port.supports_background_pulse()
    }

    fn pier_side(&self) -> PierSide {
        self.state().pier_side
    }

    fn dec_guide_mode(&self) -> Option<DecGuideMode> {
        Some(self.state().dec.mode())
    }

    fn set_dec_guide_mode(&self, mode: DecGuideMode) {
        self.state().dec.set_mode(mode);
    }

    fn reset_guide_state(&self) {
        let mut state = self.state();
        state.ra.reset();
        state.dec.reset();
    }

    async fn move_axis(
        &self,
        direction: GuideDirection,
        duration_ms: u32,
        _options: MoveOptions,
        interrupt: &InterruptFlag,
    ) -> MoveResult {
        if !self.is_connected() {
            return MoveResult::Error;
        }
        let result = self.pulse(direction, duration_ms, interrupt).await;
        self.track_pier_side().await;
        result
    }

    async fn move_offset(
        &self,
        offset: &GuiderOffset,
        options: MoveOptions,
        interrupt: &InterruptFlag,
    ) -> MoveResult {
        if !self.is_connected() {
            return MoveResult::Error;
        }
        self.track_pier_side().await;

        let (ra, dec) = {
            let mut state = self.state();
            let Some(cal) = state.calibration else {
                tracing::warn!("{}: cannot move offset, not calibrated", self.name);
                return MoveResult::Error;
            };
            let mount = cal.camera_to_mount(offset.camera);
            if options.algorithm_result {
                let ra = state.ra.correct(mount.x, &cal);
                let dec = state.dec.correct(mount.y, &cal);
                (ra, dec)
            } else {
                Self::raw_moves(&state, mount, &cal)
            }
        };

        tracing::debug!(
            "{}: offset ({:.2}, {:.2}) -> RA {:?} {:.0} ms, Dec {:?} {:.0} ms",
            self.name,
            offset.camera.x,
            offset.camera.y,
            ra.direction,
            ra.duration_ms,
            dec.direction,
            dec.duration_ms
        );

        let ra_result = self.pulse(ra.direction, ra.pulse_ms(), interrupt).await;
        let dec_result = self.pulse(dec.direction, dec.pulse_ms(), interrupt).await;
        if ra_result != MoveResult::Ok {
            ra_result
        } else {
            dec_result
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nightshade_gear::{SimSky, SimSkyConfig, SimulatedPulseGuider};
    use std::f64::consts::FRAC_PI_2;

    fn scope() -> (Scope, Arc<SimulatedPulseGuider>, SimSky) {
        let sky = SimSky::new(SimSkyConfig {
            noise: 0.0,
            guide_rate: 0.02,
            ..Default::default()
        });
        let port = Arc::new(SimulatedPulseGuider::new(sky.clone()));
        let mut config = GuidingConfig::default();
        config.ra.hysteresis = 0.0;
        (Scope::new(port.clone(), &config), port, sky)
    }

    fn calibration() -> Calibration {
        Calibration {
            ra_angle: 0.0,
            dec_angle: FRAC_PI_2,
            ra_rate: 0.02,
            dec_rate: 0.02,
            pier_side: PierSide::East,
            ..Calibration::default()
        }
    }

    #[test]
    fn test_calibration_lifecycle() {
        let (scope, _, _) = scope();
        assert!(!scope.is_calibrated());
        scope.set_calibration(calibration());
        assert!(scope.is_calibrated());
        scope.clear_calibration();
        assert!(scope.calibration().is_none());
    }

    #[test]
    fn test_dec_guide_mode_passthrough() {
        let (scope, _, _) = scope();
        assert_eq!(scope.dec_guide_mode(), Some(DecGuideMode::Auto));
        scope.set_dec_guide_mode(DecGuideMode::North);
        assert_eq!(scope.dec_guide_mode(), Some(DecGuideMode::North));
    }

    #[tokio::test]
    async fn test_move_offset_requires_calibration() {
        let (scope, port, _) = scope();
        let offset = GuiderOffset::new(Point::new(2.0, 0.0), &calibration());
        let flag = InterruptFlag::new();
        assert_eq!(
            scope.move_offset(&offset, MoveOptions::guide(), &flag).await,
            MoveResult::Error
        );
        assert_eq!(port.pulse_count(), 0);
    }

    #[tokio::test]
    async fn test_move_offset_corrects_star() {
        let (scope, port, sky) = scope();
        scope.set_calibration(calibration());
        let flag = InterruptFlag::new();

        // Star 2 px right of the lock position: 100 ms East brings it back
        let offset = GuiderOffset::new(Point::new(2.0, 0.0), &calibration());
        let result = scope.move_offset(&offset, MoveOptions::guide(), &flag).await;
        assert_eq!(result, MoveResult::Ok);
        assert_eq!(port.pulse_count(), 1);
        assert!((sky.star_position().x - 158.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_raw_move_respects_dec_mode() {
        let (scope, port, sky) = scope();
        scope.set_calibration(calibration());
        scope.set_dec_guide_mode(DecGuideMode::North);
        let flag = InterruptFlag::new();

        // Positive Dec offset wants South, which North-only mode forbids
        let offset = GuiderOffset::new(Point::new(0.0, 1.0), &calibration());
        let result = scope.move_offset(&offset, MoveOptions::calibration(), &flag).await;
        assert_eq!(result, MoveResult::Ok);
        assert_eq!(port.pulse_count(), 0);
        assert!((sky.star_position().y - 120.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_move_axis_limit() {
        let (scope, port, _) = scope();
        port.set_limit(Some(GuideDirection::North));
        let flag = InterruptFlag::new();
        let result = scope
            .move_axis(GuideDirection::North, 50, MoveOptions::calibration(), &flag)
            .await;
        assert_eq!(result, MoveResult::LimitReached);
        let result = scope
            .move_axis(GuideDirection::South, 50, MoveOptions::calibration(), &flag)
            .await;
        assert_eq!(result, MoveResult::Ok);
    }

    #[tokio::test]
    async fn test_pier_flip_reverses_ra_correction() {
        let (scope, _, sky) = scope();
        scope.set_calibration(calibration());
        sky.meridian_flip();
        let flag = InterruptFlag::new();

        let offset = GuiderOffset::new(Point::new(2.0, 0.0), &calibration());
        scope.move_offset(&offset, MoveOptions::guide(), &flag).await;
        let cal = scope.calibration().unwrap();
        assert_eq!(cal.pier_side, PierSide::West);
        assert_eq!(scope.pier_side(), PierSide::West);
        // The flipped calibration still drives the star back toward the lock position
        assert!((sky.star_position().x - 158.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_disconnected_port() {
        let (scope, port, _) = scope();
        port.set_connected(false);
        let flag = InterruptFlag::new();
        let result = scope
            .move_axis(GuideDirection::East, 10, MoveOptions::calibration(), &flag)
            .await;
        assert_eq!(result, MoveResult::Error);
    }
}
