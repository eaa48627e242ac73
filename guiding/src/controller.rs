//! Session controller
//!
//! Drives one guide or dither request from start to a settled (or failed)
//! finish. The controller never blocks: [`SessionController::update_controller_state`]
//! is called once per guide frame and advances the state machine as far as
//! it can before waiting for the next frame.
//!
//! ```text
//! Idle -> Setup -> AttemptStart -> SelectStar -> WaitSelected -> Calibrate
//!                       |                                         |    |
//!                       +--> CalibrationWait <--------------------+    v
//!                       |          |                                 Guide
//!                       +----------+--> SettleBegin <------------------+
//!                                            |
//!                                        SettleWait -> Finish -> Idle
//! ```
//!
//! Every failure funnels through `Finish` with a single message and the
//! controller always ends up back in `Idle`.

use crate::config::GuidingConfig;
use crate::corrector::DecGuideMode;
use crate::error::{GuideError, GuideResult};
use crate::event::{ControllerEvent, SettleOutcome};
use crate::guider::{Guider, GuiderState};
use crate::mount::SharedMount;
use nightshade_gear::{Rect, SharedCamera};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tokio::sync::broadcast;

/// Settle time value that turns off time-based settling
pub const SETTLING_TIME_DISABLED: u32 = 9999;

const AUTO_FIND_ATTEMPTS: u32 = 3;
const WAIT_SELECTED_POLLS: u32 = 3;

/// When a guide or dither counts as settled
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettleParams {
    /// Maximum guide error (px) that counts as in range
    pub tolerance_px: f64,
    /// Seconds the error must stay in range
    pub settle_time_sec: u32,
    /// Give up after this many seconds
    pub timeout_sec: u32,
    /// Settle after this many frames regardless of error
    pub frames: u32,
}

impl Default for SettleParams {
    fn default() -> Self {
        Self {
            tolerance_px: 1.5,
            settle_time_sec: 10,
            timeout_sec: 60,
            frames: u32::MAX,
        }
    }
}

impl SettleParams {
    /// Settle by frame count only
    pub fn frames(frames: u32) -> Self {
        Self {
            tolerance_px: 99.0,
            settle_time_sec: SETTLING_TIME_DISABLED,
            timeout_sec: SETTLING_TIME_DISABLED,
            frames,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControllerState {
    Idle,
    Setup,
    AttemptStart,
    SelectStar,
    WaitSelected,
    Calibrate,
    CalibrationWait,
    Guide,
    SettleBegin,
    SettleWait,
    Finish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SettleOp {
    Guide,
    Dither,
}

impl SettleOp {
    fn name(self) -> &'static str {
        match self {
            SettleOp::Guide => "guide",
            SettleOp::Dither => "dither",
        }
    }
}

/// Handles to the equipment a session runs against
pub struct SessionContext<G: Guider> {
    pub camera: SharedCamera,
    pub mount: Option<SharedMount>,
    /// Adaptive optics unit guiding ahead of the primary mount
    pub secondary_mount: Option<SharedMount>,
    pub guider: G,
    pub config: GuidingConfig,
}

impl<G: Guider> SessionContext<G> {
    pub fn new(
        camera: SharedCamera,
        mount: Option<SharedMount>,
        guider: G,
        config: GuidingConfig,
    ) -> Self {
        Self {
            camera,
            mount,
            secondary_mount: None,
            guider,
            config,
        }
    }

    pub fn with_secondary_mount(mut self, mount: SharedMount) -> Self {
        self.secondary_mount = Some(mount);
        self
    }

    fn mounts(&self) -> impl Iterator<Item = &SharedMount> {
        self.mount.iter().chain(self.secondary_mount.iter())
    }

    pub fn all_gear_connected(&self) -> bool {
        self.camera.is_connected() && self.mounts().all(|m| m.is_connected())
    }

    fn all_mounts_calibrated(&self) -> bool {
        self.mounts().all(|m| m.is_calibrated())
    }

    fn ao_bump_in_progress(&self) -> bool {
        self.mount
            .as_ref()
            .map_or(false, |m| m.is_step_guider() && m.is_bump_in_progress())
    }
}

/// Guide/dither state machine
#[derive(Debug)]
pub struct SessionController {
    state: ControllerState,
    op: SettleOp,
    force_calibration: bool,
    saved_sticky: Option<bool>,
    auto_find_remaining: u32,
    wait_selected_remaining: u32,
    settle: SettleParams,
    roi: Option<Rect>,
    prior_frame_in_range: bool,
    settle_started: Option<Instant>,
    in_range_since: Option<Instant>,
    saved_dec_mode: Option<DecGuideMode>,
    override_dec_mode: bool,
    settle_frames: u32,
    dropped_frames: u32,
    succeeded: bool,
    error: Option<GuideError>,
    last_outcome: Option<SettleOutcome>,
    event_tx: broadcast::Sender<ControllerEvent>,
}

impl Default for SessionController {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionController {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            state: ControllerState::Idle,
            op: SettleOp::Guide,
            force_calibration: false,
            saved_sticky: None,
            auto_find_remaining: AUTO_FIND_ATTEMPTS,
            wait_selected_remaining: WAIT_SELECTED_POLLS,
            settle: SettleParams::default(),
            roi: None,
            prior_frame_in_range: false,
            settle_started: None,
            in_range_since: None,
            saved_dec_mode: None,
            override_dec_mode: false,
            settle_frames: 0,
            dropped_frames: 0,
            succeeded: false,
            error: None,
            last_outcome: None,
            event_tx,
        }
    }

    /// Subscribe to controller events
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.event_tx.subscribe()
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn is_settling(&self) -> bool {
        matches!(
            self.state,
            ControllerState::SettleBegin | ControllerState::SettleWait
        )
    }

    /// Not starting, calibrating, settling or finishing
    pub fn is_idle(&self) -> bool {
        self.state == ControllerState::Idle
    }

    /// Result of the most recently finished cycle
    pub fn last_outcome(&self) -> Option<&SettleOutcome> {
        self.last_outcome.as_ref()
    }

    fn set_state(&mut self, state: ControllerState) {
        tracing::debug!("SessionController: new state {:?}", state);
        self.state = state;
        let _ = self.event_tx.send(ControllerEvent::StateChanged(state));
    }

    fn reentrancy_error(&self, operation: &'static str) -> GuideError {
        GuideError::Reentrancy {
            operation,
            active: self.op.name(),
        }
    }

    fn fail(&mut self, error: GuideError) {
        tracing::debug!("SessionController failed: {}", error);
        self.succeeded = false;
        self.error = Some(error);
        self.set_state(ControllerState::Finish);
    }

    /// Equipment is connected and guiding can be attempted
    pub fn can_guide<G: Guider>(ctx: &SessionContext<G>) -> GuideResult<()> {
        if ctx.all_gear_connected() {
            Ok(())
        } else {
            Err(GuideError::NotConnected)
        }
    }

    /// Start guiding: select a star, calibrate if needed, then settle.
    ///
    /// Completion is reported through [`ControllerEvent::SettleDone`].
    pub fn guide<G: Guider>(
        &mut self,
        ctx: &mut SessionContext<G>,
        force_calibration: bool,
        settle: SettleParams,
        roi: Option<Rect>,
    ) -> GuideResult<()> {
        if !self.is_idle() {
            tracing::debug!(
                "SessionController::guide reentrancy state = {:?} op = {:?}",
                self.state,
                self.op
            );
            return Err(self.reentrancy_error("guide"));
        }

        tracing::info!(
            "Guide requested (recalibrate = {}, tolerance {:.2} px, settle {} s, timeout {} s)",
            force_calibration,
            settle.tolerance_px,
            settle.settle_time_sec,
            settle.timeout_sec
        );
        self.force_calibration = force_calibration;
        self.op = SettleOp::Guide;
        self.settle = settle;
        self.roi = roi;
        self.set_state(ControllerState::Setup);
        self.update_controller_state(ctx);
        Ok(())
    }

    /// Move the lock position by up to `pixels` and wait for guiding to settle
    pub fn dither<G: Guider>(
        &mut self,
        ctx: &mut SessionContext<G>,
        pixels: f64,
        force_ra_only: bool,
        settle: SettleParams,
    ) -> GuideResult<()> {
        if !self.is_idle() {
            tracing::debug!(
                "SessionController::dither reentrancy state = {:?} op = {:?}",
                self.state,
                self.op
            );
            return Err(self.reentrancy_error("dither"));
        }

        let mut ra_only = ctx.config.dither.ra_only || force_ra_only;
        let mut override_dec_mode = false;
        let mut saved_dec_mode = None;

        if let Some(mount) = ctx.mount.as_ref().filter(|m| !m.is_step_guider()) {
            if !ra_only {
                // Settling in both directions needs Auto; otherwise keep Dec still
                match mount.dec_guide_mode() {
                    Some(mode @ (DecGuideMode::North | DecGuideMode::South))
                        if settle.settle_time_sec != SETTLING_TIME_DISABLED =>
                    {
                        override_dec_mode = true;
                        saved_dec_mode = Some(mode);
                    }
                    Some(DecGuideMode::Auto) | None => {}
                    Some(mode) => {
                        tracing::debug!(
                            "SessionController: forcing dither RA-only since Dec guide mode is {:?}",
                            mode
                        );
                        ra_only = true;
                    }
                }
            }
        }

        if let Err(e) = ctx.guider.dither(pixels, ra_only) {
            tracing::warn!("Dither failed: {}", e);
            return Err(match e {
                GuideError::Dither(_) => e,
                other => GuideError::Dither(other.to_string()),
            });
        }

        self.op = SettleOp::Dither;
        self.settle = settle;
        self.override_dec_mode = override_dec_mode;
        self.saved_dec_mode = saved_dec_mode;
        self.set_state(ControllerState::SettleBegin);
        self.update_controller_state(ctx);
        Ok(())
    }

    /// Dither and settle by frame count
    pub fn dither_frames<G: Guider>(
        &mut self,
        ctx: &mut SessionContext<G>,
        pixels: f64,
        settle_frames: u32,
    ) -> GuideResult<()> {
        self.dither(ctx, pixels, false, SettleParams::frames(settle_frames))
    }

    /// Fail the active cycle with `reason`.
    ///
    /// Only the state machine is stopped; an in-flight hardware request keeps
    /// running unless the worker is interrupted as well.
    pub fn abort_controller<G: Guider>(&mut self, ctx: &mut SessionContext<G>, reason: &str) {
        if !self.is_idle() {
            self.fail(GuideError::Aborted(reason.to_string()));
            self.update_controller_state(ctx);
        }
    }

    pub fn update_controller_state<G: Guider>(&mut self, ctx: &mut SessionContext<G>) {
        self.update_at(ctx, Instant::now());
    }

    /// Advance the state machine, taking `now` as the current time
    pub fn update_at<G: Guider>(&mut self, ctx: &mut SessionContext<G>, now: Instant) {
        loop {
            let done = match self.state {
                ControllerState::Idle => true,
                ControllerState::Setup => {
                    self.saved_sticky = None;
                    self.auto_find_remaining = AUTO_FIND_ATTEMPTS;
                    self.wait_selected_remaining = WAIT_SELECTED_POLLS;
                    self.override_dec_mode = false;
                    self.set_state(ControllerState::AttemptStart);
                    false
                }
                ControllerState::AttemptStart => self.attempt_start(ctx),
                ControllerState::SelectStar => self.select_star(ctx),
                ControllerState::WaitSelected => {
                    if ctx.guider.state() == GuiderState::Selected {
                        self.set_state(ControllerState::Calibrate);
                        false
                    } else {
                        self.wait_selected_remaining =
                            self.wait_selected_remaining.saturating_sub(1);
                        tracing::debug!(
                            "Waiting for star selected, attempts remaining = {}",
                            self.wait_selected_remaining
                        );
                        if self.wait_selected_remaining == 0 {
                            self.set_state(ControllerState::AttemptStart);
                        }
                        true
                    }
                }
                ControllerState::Calibrate => self.calibrate(ctx),
                ControllerState::CalibrationWait => self.calibration_wait(ctx),
                ControllerState::Guide => match ctx.guider.start_guiding() {
                    Ok(()) => {
                        self.set_state(ControllerState::SettleBegin);
                        true
                    }
                    Err(e) => {
                        self.fail(match e {
                            GuideError::StartGuiding(_) => e,
                            other => GuideError::StartGuiding(other.to_string()),
                        });
                        false
                    }
                },
                ControllerState::SettleBegin => {
                    let _ = self.event_tx.send(ControllerEvent::SettleBegin);
                    tracing::info!("Settling started");
                    if self.override_dec_mode {
                        if let Some(mount) = &ctx.mount {
                            tracing::debug!(
                                "SessionController: setting Dec guide mode to Auto for dither settle"
                            );
                            mount.set_dec_guide_mode(DecGuideMode::Auto);
                        }
                    }
                    self.prior_frame_in_range = false;
                    self.in_range_since = None;
                    self.settle_frames = 0;
                    self.dropped_frames = 0;
                    self.settle_started = Some(now);
                    self.set_state(ControllerState::SettleWait);
                    true
                }
                ControllerState::SettleWait => self.settle_wait(ctx, now),
                ControllerState::Finish => {
                    self.finish(ctx);
                    true
                }
            };
            if done {
                break;
            }
        }
    }

    fn attempt_start<G: Guider>(&mut self, ctx: &mut SessionContext<G>) -> bool {
        if let Err(e) = Self::can_guide(ctx) {
            tracing::debug!("SessionController: not ready: {}", e);
            self.fail(e);
            return false;
        }

        if ctx.guider.is_calibrating_or_guiding() {
            if self.force_calibration {
                self.set_state(ControllerState::Calibrate);
                return false;
            }
            let state = ctx.guider.state();
            tracing::debug!("SessionController: guider state = {:?}", state);
            if matches!(state, GuiderState::Calibrated | GuiderState::Guiding) {
                self.set_state(ControllerState::SettleBegin);
                return false;
            }
            self.set_state(ControllerState::CalibrationWait);
            return true;
        }

        if !ctx.guider.is_capture_active() {
            tracing::debug!("SessionController: start capturing");
            if !ctx.camera.is_connected() {
                self.fail(GuideError::StartCapture("camera not connected".to_string()));
                return false;
            }
            ctx.guider.reset(true);
            if let Err(e) = ctx.guider.start_capturing() {
                self.fail(GuideError::StartCapture(e.to_string()));
                return false;
            }
            self.set_state(ControllerState::SelectStar);
            return true;
        }

        if ctx.guider.state() == GuiderState::Selected {
            self.set_state(ControllerState::Calibrate);
        } else {
            self.set_state(ControllerState::SelectStar);
        }
        false
    }

    fn select_star<G: Guider>(&mut self, ctx: &mut SessionContext<G>) -> bool {
        match ctx.guider.auto_select_star(self.roi) {
            Ok(()) => {
                self.wait_selected_remaining = WAIT_SELECTED_POLLS;
                self.set_state(ControllerState::WaitSelected);
                true
            }
            Err(e) => {
                self.auto_find_remaining = self.auto_find_remaining.saturating_sub(1);
                tracing::debug!(
                    "Auto find star failed ({}), attempts remaining = {}",
                    e,
                    self.auto_find_remaining
                );
                if self.auto_find_remaining == 0 {
                    self.fail(GuideError::NoGuideStar);
                    false
                } else {
                    ctx.guider.reset(true);
                    self.set_state(ControllerState::AttemptStart);
                    true
                }
            }
        }
    }

    fn calibrate<G: Guider>(&mut self, ctx: &mut SessionContext<G>) -> bool {
        if self.force_calibration {
            tracing::debug!("SessionController: clearing calibration");
            for mount in ctx.mounts() {
                mount.clear_calibration();
            }
            // Drop back to the selected star so guiding restarts with calibration
            if ctx.guider.is_calibrating_or_guiding() {
                ctx.guider.reset(false);
            }
        }

        if ctx.all_mounts_calibrated() {
            self.set_state(ControllerState::Guide);
            return false;
        }

        tracing::debug!("SessionController: start calibration");
        let sticky = ctx.guider.lock_pos_is_sticky();
        self.saved_sticky = Some(sticky);
        ctx.guider.set_lock_pos_is_sticky(true);

        if let Err(e) = ctx.guider.start_guiding() {
            ctx.guider.set_lock_pos_is_sticky(sticky);
            self.fail(GuideError::StartCalibration(e.to_string()));
            return false;
        }

        self.set_state(ControllerState::CalibrationWait);
        true
    }

    fn calibration_wait<G: Guider>(&mut self, ctx: &mut SessionContext<G>) -> bool {
        if ctx.all_mounts_calibrated() {
            if let Some(sticky) = self.saved_sticky.take() {
                ctx.guider.set_lock_pos_is_sticky(sticky);
            }
            self.set_state(ControllerState::SettleBegin);
            return false;
        }

        if !ctx.guider.is_calibrating() {
            if let Some(sticky) = self.saved_sticky.take() {
                ctx.guider.set_lock_pos_is_sticky(sticky);
            }
            let reason = ctx
                .guider
                .calibration_error()
                .unwrap_or_else(|| "calibration stopped before completing".to_string());
            self.fail(GuideError::CalibrationFailed(reason));
            return false;
        }
        true
    }

    fn settle_wait<G: Guider>(&mut self, ctx: &mut SessionContext<G>, now: Instant) -> bool {
        let locked = ctx.guider.is_locked();
        let distance = ctx.guider.current_error();
        let in_range = locked && distance <= self.settle.tolerance_px;
        let ao_bump = ctx.ao_bump_in_progress();
        let mut time_in_range = 0.0;

        self.settle_frames += 1;
        if !locked {
            self.dropped_frames += 1;
        }

        tracing::debug!(
            "SessionController: settling, locked = {}, distance = {:.2} ({:.2}) aobump = {} frame = {} / {}",
            locked,
            distance,
            self.settle.tolerance_px,
            ao_bump,
            self.settle_frames,
            self.settle.frames
        );

        if self.settle_frames >= self.settle.frames {
            self.succeeded = true;
            self.set_state(ControllerState::Finish);
            return false;
        }

        if in_range {
            match (self.prior_frame_in_range, self.in_range_since) {
                (true, Some(since)) => {
                    let elapsed = now.saturating_duration_since(since);
                    time_in_range = elapsed.as_secs_f64();
                    if elapsed.as_secs() >= self.settle.settle_time_sec as u64 && !ao_bump {
                        self.succeeded = true;
                        self.set_state(ControllerState::Finish);
                        return false;
                    }
                }
                _ => {
                    if self.settle.settle_time_sec == 0 {
                        self.succeeded = true;
                        self.set_state(ControllerState::Finish);
                        return false;
                    }
                    self.in_range_since = Some(now);
                }
            }
        }

        let started = self.settle_started.unwrap_or(now);
        if now.saturating_duration_since(started).as_secs() >= self.settle.timeout_sec as u64 {
            self.fail(GuideError::SettleTimeout);
            return false;
        }

        let _ = self.event_tx.send(ControllerEvent::Settling {
            distance,
            elapsed: time_in_range,
            settle_time: self.settle.settle_time_sec,
            star_locked: locked,
        });
        self.prior_frame_in_range = in_range;
        true
    }

    fn finish<G: Guider>(&mut self, ctx: &mut SessionContext<G>) {
        if let Some(sticky) = self.saved_sticky.take() {
            tracing::debug!("SessionController: restore sticky lock position = {}", sticky);
            ctx.guider.set_lock_pos_is_sticky(sticky);
        }
        if self.override_dec_mode {
            if let (Some(mount), Some(mode)) = (&ctx.mount, self.saved_dec_mode) {
                tracing::debug!(
                    "SessionController: restore Dec guide mode to {:?} after dither",
                    mode
                );
                mount.set_dec_guide_mode(mode);
            }
            self.override_dec_mode = false;
        }

        let error = if self.succeeded {
            None
        } else {
            Some(
                self.error
                    .take()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown error".to_string()),
            )
        };
        match &error {
            None => tracing::info!(
                "Settling complete ({} frames, {} dropped)",
                self.settle_frames,
                self.dropped_frames
            ),
            Some(message) => tracing::warn!("Settling failed: {}", message),
        }

        let outcome = SettleOutcome {
            error,
            settle_frames: self.settle_frames,
            dropped_frames: self.dropped_frames,
        };
        if let Some(mount) = &ctx.mount {
            mount.notify_settle_done(outcome.succeeded());
        }
        let _ = self
            .event_tx
            .send(ControllerEvent::SettleDone(outcome.clone()));
        self.last_outcome = Some(outcome);
        self.succeeded = false;
        self.set_state(ControllerState::Idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::Calibration;
    use crate::guider::{GuideStep, OneStarGuider};
    use crate::mount::{GuiderOffset, Mount, MoveOptions, MoveResult, Scope, SharedMount};
    use async_trait::async_trait;
    use nightshade_gear::{
        Camera, CaptureOptions, DeviceResult, Frame, GuideDirection, InterruptFlag, Point, SimSky,
        SimSkyConfig, SimulatedPulseGuider,
    };
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Debug)]
    struct StubCamera {
        connected: AtomicBool,
    }

    #[async_trait]
    impl Camera for StubCamera {
        fn name(&self) -> &str {
            "Stub"
        }
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
        fn supports_background_capture(&self) -> bool {
            true
        }
        fn frame_size(&self) -> (u32, u32) {
            (64, 64)
        }
        async fn capture(
            &self,
            _duration_ms: u32,
            _frame: &mut Frame,
            _options: CaptureOptions,
            _subframe: Option<Rect>,
            _interrupt: &InterruptFlag,
        ) -> DeviceResult<()> {
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    struct StubMount {
        calibrated: AtomicBool,
        step_guider: bool,
        bump: AtomicBool,
        dec_mode: Mutex<Option<DecGuideMode>>,
        mode_history: Mutex<Vec<DecGuideMode>>,
        cleared: AtomicBool,
        settle_done: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl Mount for StubMount {
        fn name(&self) -> &str {
            "Stub"
        }
        fn is_connected(&self) -> bool {
            true
        }
        fn calibration(&self) -> Option<Calibration> {
            self.calibrated
                .load(Ordering::SeqCst)
                .then(Calibration::default)
        }
        fn set_calibration(&self, _calibration: Calibration) {
            self.calibrated.store(true, Ordering::SeqCst);
        }
        fn clear_calibration(&self) {
            self.cleared.store(true, Ordering::SeqCst);
            self.calibrated.store(false, Ordering::SeqCst);
        }
        fn supports_background_move(&self) -> bool {
            true
        }
        fn is_step_guider(&self) -> bool {
            self.step_guider
        }
        fn is_bump_in_progress(&self) -> bool {
            self.bump.load(Ordering::SeqCst)
        }
        fn dec_guide_mode(&self) -> Option<DecGuideMode> {
            *self.dec_mode.lock().unwrap()
        }
        fn set_dec_guide_mode(&self, mode: DecGuideMode) {
            *self.dec_mode.lock().unwrap() = Some(mode);
            self.mode_history.lock().unwrap().push(mode);
        }
        fn notify_settle_done(&self, success: bool) {
            self.settle_done.lock().unwrap().push(success);
        }
        async fn move_axis(
            &self,
            _direction: GuideDirection,
            _duration_ms: u32,
            _options: MoveOptions,
            _interrupt: &InterruptFlag,
        ) -> MoveResult {
            MoveResult::Ok
        }
        async fn move_offset(
            &self,
            _offset: &GuiderOffset,
            _options: MoveOptions,
            _interrupt: &InterruptFlag,
        ) -> MoveResult {
            MoveResult::Ok
        }
    }

    /// Guider whose answers are set directly by the test
    #[derive(Debug)]
    struct ScriptedGuider {
        state: GuiderState,
        capture_active: bool,
        locked: bool,
        error: f64,
        sticky: bool,
        select_ok: bool,
        calibrate_on_start: bool,
        calibration_error: Option<String>,
        dithers: Vec<(f64, bool)>,
        select_calls: u32,
    }

    impl Default for ScriptedGuider {
        fn default() -> Self {
            Self {
                state: GuiderState::Uninitialized,
                capture_active: false,
                locked: true,
                error: 0.0,
                sticky: false,
                select_ok: true,
                calibrate_on_start: false,
                calibration_error: None,
                dithers: Vec::new(),
                select_calls: 0,
            }
        }
    }

    impl Guider for ScriptedGuider {
        fn state(&self) -> GuiderState {
            self.state
        }
        fn is_locked(&self) -> bool {
            self.locked
        }
        fn current_error(&self) -> f64 {
            self.error
        }
        fn lock_position(&self) -> Option<Point> {
            Some(Point::new(32.0, 32.0))
        }
        fn current_position(&self) -> Option<Point> {
            Some(Point::new(32.0, 32.0))
        }
        fn move_lock_position(&mut self, _delta: Point) -> GuideResult<()> {
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
            self.capture_active = true;
            Ok(())
        }
        fn stop_capturing(&mut self) {
            self.capture_active = false;
        }
        fn reset(&mut self, full: bool) {
            self.state = if full {
                GuiderState::Uninitialized
            } else {
                GuiderState::Selected
            };
        }
        fn auto_select_star(&mut self, _roi: Option<Rect>) -> GuideResult<()> {
            self.select_calls += 1;
            if self.select_ok {
                self.state = GuiderState::Selected;
                Ok(())
            } else {
                Err(GuideError::NoGuideStar)
            }
        }
        fn start_guiding(&mut self) -> GuideResult<()> {
            self.state = if self.calibrate_on_start {
                GuiderState::Calibrating
            } else {
                GuiderState::Guiding
            };
            Ok(())
        }
        fn dither(&mut self, pixels: f64, ra_only: bool) -> GuideResult<()> {
            self.dithers.push((pixels, ra_only));
            Ok(())
        }
        fn process_frame(&mut self, _frame: Frame) -> GuideStep {
            GuideStep::None
        }
        fn calibration_error(&self) -> Option<String> {
            self.calibration_error.clone()
        }
    }

    fn context(mount: Arc<StubMount>, guider: ScriptedGuider) -> SessionContext<ScriptedGuider> {
        let camera = Arc::new(StubCamera {
            connected: AtomicBool::new(true),
        });
        SessionContext::new(camera, Some(mount), guider, GuidingConfig::default())
    }

    fn calibrated_mount() -> Arc<StubMount> {
        let mount = StubMount::default();
        mount.calibrated.store(true, Ordering::SeqCst);
        Arc::new(mount)
    }

    fn guiding_guider() -> ScriptedGuider {
        ScriptedGuider {
            state: GuiderState::Guiding,
            capture_active: true,
            ..Default::default()
        }
    }

    fn drain(rx: &mut broadcast::Receiver<ControllerEvent>) -> Vec<ControllerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_reentrant_calls_are_rejected() {
        let mut ctx = context(calibrated_mount(), ScriptedGuider::default());
        let mut controller = SessionController::new();
        assert!(controller.is_idle());

        controller
            .guide(&mut ctx, false, SettleParams::default(), None)
            .unwrap();
        assert_eq!(controller.state(), ControllerState::SelectStar);

        for _ in 0..2 {
            let err = controller
                .guide(&mut ctx, false, SettleParams::default(), None)
                .unwrap_err();
            assert_eq!(err.to_string(), "Cannot initiate guide while guide is in progress");
            assert_eq!(controller.state(), ControllerState::SelectStar);
        }
        let err = controller
            .dither(&mut ctx, 3.0, false, SettleParams::default())
            .unwrap_err();
        assert_eq!(err.to_string(), "Cannot initiate dither while guide is in progress");
        assert!(ctx.guider.dithers.is_empty());
    }

    #[test]
    fn test_disconnected_gear_fails_cycle() {
        let mut ctx = context(calibrated_mount(), ScriptedGuider::default());
        let camera = Arc::new(StubCamera {
            connected: AtomicBool::new(false),
        });
        ctx.camera = camera;
        let mut controller = SessionController::new();
        let mut rx = controller.subscribe();

        controller
            .guide(&mut ctx, false, SettleParams::default(), None)
            .unwrap();
        assert!(controller.is_idle());
        let outcome = controller.last_outcome().unwrap();
        assert_eq!(
            outcome.error.as_deref(),
            Some("all equipment must be connected first")
        );
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, ControllerEvent::SettleDone(o) if !o.succeeded())));
    }

    #[test]
    fn test_guide_select_calibrate_settle() {
        let mount = Arc::new(StubMount::default());
        let guider = ScriptedGuider {
            calibrate_on_start: true,
            ..Default::default()
        };
        let mut ctx = context(mount.clone(), guider);
        let mut controller = SessionController::new();
        let settle = SettleParams {
            tolerance_px: 1.0,
            settle_time_sec: 0,
            timeout_sec: 60,
            frames: u32::MAX,
        };

        controller.guide(&mut ctx, false, settle, None).unwrap();
        assert!(ctx.guider.capture_active);
        assert_eq!(controller.state(), ControllerState::SelectStar);

        controller.update_controller_state(&mut ctx);
        assert_eq!(controller.state(), ControllerState::WaitSelected);

        controller.update_controller_state(&mut ctx);
        assert_eq!(controller.state(), ControllerState::CalibrationWait);
        assert!(ctx.guider.sticky);

        // Still calibrating
        controller.update_controller_state(&mut ctx);
        assert_eq!(controller.state(), ControllerState::CalibrationWait);

        mount.calibrated.store(true, Ordering::SeqCst);
        ctx.guider.state = GuiderState::Guiding;
        controller.update_controller_state(&mut ctx);
        assert_eq!(controller.state(), ControllerState::SettleWait);
        assert!(!ctx.guider.sticky);

        ctx.guider.error = 0.4;
        controller.update_controller_state(&mut ctx);
        assert!(controller.is_idle());
        let outcome = controller.last_outcome().unwrap();
        assert!(outcome.succeeded());
        assert_eq!(outcome.settle_frames, 1);
        assert_eq!(*mount.settle_done.lock().unwrap(), vec![true]);
    }

    #[test]
    fn test_settle_needs_continuous_time_in_range() {
        let mut ctx = context(calibrated_mount(), guiding_guider());
        let mut controller = SessionController::new();
        let settle = SettleParams {
            tolerance_px: 1.0,
            settle_time_sec: 5,
            timeout_sec: 60,
            frames: u32::MAX,
        };
        let t0 = Instant::now();
        controller.guide(&mut ctx, false, settle, None).unwrap();
        assert_eq!(controller.state(), ControllerState::SettleWait);

        let at = |s: u64| t0 + Duration::from_secs(s);
        ctx.guider.error = 0.5;
        for s in 1..=5 {
            controller.update_at(&mut ctx, at(s));
            assert!(controller.is_settling(), "settled early at {} s", s);
        }

        // One frame out of range restarts the clock
        ctx.guider.error = 1.2;
        controller.update_at(&mut ctx, at(6));
        ctx.guider.error = 0.5;
        for s in 7..=11 {
            controller.update_at(&mut ctx, at(s));
            assert!(controller.is_settling(), "settled early at {} s", s);
        }
        controller.update_at(&mut ctx, at(12));
        assert!(controller.is_idle());
        let outcome = controller.last_outcome().unwrap();
        assert!(outcome.succeeded());
        assert_eq!(outcome.settle_frames, 12);
    }

    #[test]
    fn test_settle_times_out() {
        let mut ctx = context(calibrated_mount(), guiding_guider());
        let mut controller = SessionController::new();
        let settle = SettleParams {
            tolerance_px: 1.0,
            settle_time_sec: 2,
            timeout_sec: 10,
            frames: u32::MAX,
        };
        let t0 = Instant::now();
        controller.guide(&mut ctx, false, settle, None).unwrap();

        ctx.guider.error = 3.0;
        ctx.guider.locked = false;
        for s in 1..=9 {
            controller.update_at(&mut ctx, t0 + Duration::from_secs(s));
            assert!(controller.is_settling());
        }
        controller.update_at(&mut ctx, t0 + Duration::from_secs(11));
        assert!(controller.is_idle());
        let outcome = controller.last_outcome().unwrap();
        assert_eq!(
            outcome.error.as_deref(),
            Some("timed-out waiting for guider to settle")
        );
        assert_eq!(outcome.dropped_frames, 10);
    }

    #[test]
    fn test_star_selection_gives_up() {
        let guider = ScriptedGuider {
            select_ok: false,
            ..Default::default()
        };
        let mut ctx = context(calibrated_mount(), guider);
        let mut controller = SessionController::new();
        controller
            .guide(&mut ctx, false, SettleParams::default(), None)
            .unwrap();

        controller.update_controller_state(&mut ctx);
        controller.update_controller_state(&mut ctx);
        assert!(!controller.is_idle());
        controller.update_controller_state(&mut ctx);
        assert!(controller.is_idle());
        assert_eq!(ctx.guider.select_calls, 3);
        assert_eq!(
            controller.last_outcome().unwrap().error.as_deref(),
            Some("failed to find a suitable guide star")
        );
    }

    #[test]
    fn test_calibration_failure_ends_cycle() {
        let mount = Arc::new(StubMount::default());
        let guider = ScriptedGuider {
            state: GuiderState::Selected,
            capture_active: true,
            calibrate_on_start: true,
            ..Default::default()
        };
        let mut ctx = context(mount, guider);
        let mut controller = SessionController::new();
        controller
            .guide(&mut ctx, false, SettleParams::default(), None)
            .unwrap();
        assert_eq!(controller.state(), ControllerState::CalibrationWait);

        ctx.guider.state = GuiderState::Selected;
        ctx.guider.calibration_error = Some("RA calibration failed: star did not move".to_string());
        controller.update_controller_state(&mut ctx);
        assert!(controller.is_idle());
        assert!(!ctx.guider.sticky);
        let message = controller.last_outcome().unwrap().error.clone().unwrap();
        assert!(message.contains("star did not move"), "{}", message);
    }

    #[test]
    fn test_already_guiding_goes_straight_to_settle() {
        let mount = calibrated_mount();
        let mut ctx = context(mount.clone(), guiding_guider());
        let mut controller = SessionController::new();
        controller
            .guide(&mut ctx, false, SettleParams::default(), None)
            .unwrap();
        assert_eq!(controller.state(), ControllerState::SettleWait);
        assert!(!mount.cleared.load(Ordering::SeqCst));
    }

    #[test]
    fn test_forced_recalibration_clears_calibration() {
        let mount = calibrated_mount();
        let guider = ScriptedGuider {
            calibrate_on_start: true,
            ..guiding_guider()
        };
        let mut ctx = context(mount.clone(), guider);
        let mut controller = SessionController::new();
        controller
            .guide(&mut ctx, true, SettleParams::default(), None)
            .unwrap();
        assert!(mount.cleared.load(Ordering::SeqCst));
        assert_eq!(controller.state(), ControllerState::CalibrationWait);
        assert!(ctx.guider.is_calibrating());
    }

    #[test]
    fn test_dither_overrides_dec_mode_while_settling() {
        let mount = calibrated_mount();
        *mount.dec_mode.lock().unwrap() = Some(DecGuideMode::North);
        let mut ctx = context(mount.clone(), guiding_guider());
        let mut controller = SessionController::new();

        controller
            .dither(&mut ctx, 4.0, false, SettleParams::default())
            .unwrap();
        assert_eq!(ctx.guider.dithers, vec![(4.0, false)]);
        assert_eq!(mount.dec_guide_mode(), Some(DecGuideMode::Auto));

        controller.abort_controller(&mut ctx, "stop requested");
        assert!(controller.is_idle());
        assert_eq!(mount.dec_guide_mode(), Some(DecGuideMode::North));
        assert_eq!(
            *mount.mode_history.lock().unwrap(),
            vec![DecGuideMode::Auto, DecGuideMode::North]
        );
        assert_eq!(
            controller.last_outcome().unwrap().error.as_deref(),
            Some("stop requested")
        );
    }

    #[test]
    fn test_frame_count_dither_forces_ra_only() {
        let mount = calibrated_mount();
        *mount.dec_mode.lock().unwrap() = Some(DecGuideMode::South);
        let mut ctx = context(mount.clone(), guiding_guider());
        let mut controller = SessionController::new();

        controller.dither_frames(&mut ctx, 2.0, 3).unwrap();
        assert_eq!(ctx.guider.dithers, vec![(2.0, true)]);
        assert!(mount.mode_history.lock().unwrap().is_empty());

        // Error is ignored, only the frame count matters
        ctx.guider.error = 50.0;
        controller.update_controller_state(&mut ctx);
        controller.update_controller_state(&mut ctx);
        assert!(controller.is_settling());
        controller.update_controller_state(&mut ctx);
        assert!(controller.is_idle());
        assert_eq!(controller.last_outcome().unwrap().settle_frames, 3);
    }

    #[test]
    fn test_ao_bump_holds_settling() {
        let mount = Arc::new(StubMount {
            step_guider: true,
            ..Default::default()
        });
        mount.calibrated.store(true, Ordering::SeqCst);
        mount.bump.store(true, Ordering::SeqCst);
        let mut ctx = context(mount.clone(), guiding_guider());
        let mut controller = SessionController::new();
        let settle = SettleParams {
            tolerance_px: 1.0,
            settle_time_sec: 1,
            timeout_sec: 60,
            frames: u32::MAX,
        };
        let t0 = Instant::now();
        controller.guide(&mut ctx, false, settle, None).unwrap();
        for s in 1..=5 {
            controller.update_at(&mut ctx, t0 + Duration::from_secs(s));
        }
        assert!(controller.is_settling());

        mount.bump.store(false, Ordering::SeqCst);
        controller.update_at(&mut ctx, t0 + Duration::from_secs(6));
        assert!(controller.is_idle());
        assert!(controller.last_outcome().unwrap().succeeded());
    }

    #[test]
    fn test_abort_during_calibration_restores_sticky_lock() {
        let mount = Arc::new(StubMount::default());
        let guider = ScriptedGuider {
            state: GuiderState::Selected,
            capture_active: true,
            calibrate_on_start: true,
            ..Default::default()
        };
        let mut ctx = context(mount.clone(), guider);
        let mut controller = SessionController::new();
        controller
            .guide(&mut ctx, false, SettleParams::default(), None)
            .unwrap();
        assert_eq!(controller.state(), ControllerState::CalibrationWait);
        assert!(ctx.guider.lock_pos_is_sticky());

        controller.abort_controller(&mut ctx, "stop requested");
        assert!(controller.is_idle());
        assert!(!ctx.guider.lock_pos_is_sticky());
        assert_eq!(*mount.settle_done.lock().unwrap(), vec![false]);

        // A sticky lock set by the user survives the cycle as well
        ctx.guider.sticky = true;
        ctx.guider.state = GuiderState::Selected;
        controller
            .guide(&mut ctx, false, SettleParams::default(), None)
            .unwrap();
        controller.abort_controller(&mut ctx, "stop requested");
        assert!(ctx.guider.lock_pos_is_sticky());
    }

    #[test]
    fn test_dither_needs_an_active_guide() {
        let sky = SimSky::new(SimSkyConfig {
            noise: 0.0,
            ..Default::default()
        });
        let config = GuidingConfig::default();
        let scope = Arc::new(Scope::new(
            Arc::new(SimulatedPulseGuider::new(sky.clone())),
            &config,
        ));
        scope.set_calibration(Calibration {
            ra_rate: 0.02,
            dec_rate: 0.02,
            ..Calibration::default()
        });
        let mount: SharedMount = scope;
        let guider = OneStarGuider::new(config.clone(), Some(mount.clone()));
        let camera = Arc::new(StubCamera {
            connected: AtomicBool::new(true),
        });
        let mut ctx = SessionContext::new(camera, Some(mount), guider, config);

        let mut frame = Frame::new(320, 240).unwrap();
        sky.render(&mut frame);
        ctx.guider.process_frame(frame);
        ctx.guider.auto_select_star(None).unwrap();
        assert_eq!(ctx.guider.state(), GuiderState::Selected);
        let lock = ctx.guider.lock_position();

        let mut controller = SessionController::new();
        let settle = SettleParams {
            settle_time_sec: 0,
            ..Default::default()
        };
        let err = controller.dither(&mut ctx, 5.0, false, settle).unwrap_err();
        assert!(matches!(err, GuideError::Dither(_)), "{:?}", err);
        assert!(controller.is_idle());
        assert!(controller.last_outcome().is_none());
        assert_eq!(ctx.guider.lock_position(), lock);
    }

    #[test]
    fn test_abort_when_idle_is_noop() {
        let mut ctx = context(calibrated_mount(), guiding_guider());
        let mut controller = SessionController::new();
        controller.abort_controller(&mut ctx, "nothing running");
        assert!(controller.is_idle());
        assert!(controller.last_outcome().is_none());
    }

    #[test]
    fn test_settle_params_serde_defaults() {
        let params: SettleParams = serde_json::from_str(r#"{"tolerance_px": 0.8}"#).unwrap();
        assert_eq!(params.tolerance_px, 0.8);
        assert_eq!(params.settle_time_sec, 10);
        assert_eq!(params.frames, u32::MAX);
        assert_eq!(SettleParams::frames(5).settle_time_sec, SETTLING_TIME_DISABLED);
    }
}
