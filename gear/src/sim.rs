//! Simulated guide camera and mount
//!
//! A [`SimSky`] holds one star whose camera position drifts over time and
//! moves in response to guide pulses. [`SimulatedCamera`] renders it and
//! [`SimulatedPulseGuider`] pushes it around, so the whole guiding loop can
//! run without hardware.

use crate::frame::{Frame, Point, Rect};
use crate::interrupt::InterruptFlag;
use crate::traits::{
    Camera, CaptureOptions, DeviceError, DeviceResult, GuideDirection, PierSide, PulseGuider,
};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Parameters of the simulated sky
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimSkyConfig {
    /// Initial star position on the sensor
    pub star_x: f64,
    pub star_y: f64,
    /// Camera-space drift in pixels per second
    pub drift_x: f64,
    pub drift_y: f64,
    /// Direction (radians) a West pulse moves the star on the sensor
    pub ra_angle: f64,
    /// Direction (radians) a North pulse moves the star on the sensor
    pub dec_angle: f64,
    /// Guide rate in pixels per millisecond of pulse
    pub guide_rate: f64,
    pub star_peak: f64,
    pub star_sigma: f64,
    pub background: f64,
    /// Uniform noise amplitude in ADU
    pub noise: f64,
    pub seed: u64,
}

impl Default for SimSkyConfig {
    fn default() -> Self {
        Self {
            star_x: 160.0,
            star_y: 120.0,
            drift_x: 0.0,
            drift_y: 0.0,
            ra_angle: 0.0,
            dec_angle: PI / 2.0,
            guide_rate: 0.02,
            star_peak: 4000.0,
            star_sigma: 1.5,
            background: 200.0,
            noise: 10.0,
            seed: 42,
        }
    }
}

#[derive(Debug)]
struct SkyState {
    config: SimSkyConfig,
    position: Point,
    pier_side: PierSide,
    last_drift: Instant,
    rng: StdRng,
}

impl SkyState {
    fn advance(&mut self) {
        let now = Instant::now();
        let dt = now.duration_since(self.last_drift).as_secs_f64();
        self.last_drift = now;
        self.position.x += self.config.drift_x * dt;
        self.position.y += self.config.drift_y * dt;
    }
}

/// Shared simulated sky, cheap to clone
#[derive(Debug, Clone)]
pub struct SimSky {
    inner: Arc<Mutex<SkyState>>,
}

impl SimSky {
    pub fn new(config: SimSkyConfig) -> Self {
        let state = SkyState {
            position: Point::new(config.star_x, config.star_y),
            pier_side: PierSide::East,
            last_drift: Instant::now(),
            rng: StdRng::seed_from_u64(config.seed),
            config,
        };
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SkyState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// True star position, including drift up to now
    pub fn star_position(&self) -> Point {
        let mut state = self.state();
        state.advance();
        state.position
    }

    pub fn set_star_position(&self, position: Point) {
        let mut state = self.state();
        state.advance();
        state.position = position;
    }

    pub fn pier_side(&self) -> PierSide {
        self.state().pier_side
    }

    /// Move the tube to the other side of the pier; RA pulses reverse on the sensor.
    pub fn meridian_flip(&self) {
        let mut state = self.state();
        state.pier_side = match state.pier_side {
            PierSide::East => PierSide::West,
            _ => PierSide::East,
        };
        state.config.ra_angle += PI;
    }

    /// Apply a completed guide pulse to the star position
    pub fn apply_pulse(&self, direction: GuideDirection, duration_ms: u32) {
        let mut state = self.state();
        state.advance();
        let dist = state.config.guide_rate * duration_ms as f64;
        let angle = match direction {
            GuideDirection::West => state.config.ra_angle,
            GuideDirection::East => state.config.ra_angle + PI,
            GuideDirection::North => state.config.dec_angle,
            GuideDirection::South => state.config.dec_angle + PI,
        };
        state.position.x += dist * angle.cos();
        state.position.y += dist * angle.sin();
    }

    /// Render background, noise and the star into the valid region of `frame`
    pub fn render(&self, frame: &mut Frame) {
        let mut state = self.state();
        state.advance();
        let region = frame.valid_region();
        let SimSkyConfig {
            background,
            noise,
            star_peak,
            star_sigma,
            ..
        } = state.config;
        let star = state.position;
        let two_sigma_sq = 2.0 * star_sigma * star_sigma;
        let reach = (star_sigma * 5.0).ceil();

        for y in region.y..region.bottom() {
            for x in region.x..region.right() {
                let mut value = background;
                if noise > 0.0 {
                    value += state.rng.gen_range(-noise..noise);
                }
                let dx = x as f64 - star.x;
                let dy = y as f64 - star.y;
                if dx.abs() <= reach && dy.abs() <= reach {
                    value += star_peak * (-(dx * dx + dy * dy) / two_sigma_sq).exp();
                }
                frame.set_pixel(x, y, value.clamp(0.0, u16::MAX as f64) as u16);
            }
        }
    }
}

// =============================================================================
// SIMULATED CAMERA
// =============================================================================

#[derive(Debug)]
pub struct SimulatedCamera {
    name: String,
    sky: SimSky,
    width: u32,
    height: u32,
    connected: AtomicBool,
    background_capture: bool,
    captures: AtomicU64,
}

impl SimulatedCamera {
    pub fn new(sky: SimSky, width: u32, height: u32) -> Self {
        Self {
            name: "Simulated Camera".to_string(),
            sky,
            width,
            height,
            connected: AtomicBool::new(true),
            background_capture: true,
            captures: AtomicU64::new(0),
        }
    }

    /// Behave like a driver that may only be called from its owning thread
    pub fn owner_thread_only(mut self) -> Self {
        self.background_capture = false;
        self
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Number of completed captures
    pub fn capture_count(&self) -> u64 {
        self.captures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Camera for SimulatedCamera {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn supports_background_capture(&self) -> bool {
        self.background_capture
    }

    fn frame_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    async fn capture(
        &self,
        duration_ms: u32,
        frame: &mut Frame,
        options: CaptureOptions,
        subframe: Option<Rect>,
        interrupt: &InterruptFlag,
    ) -> DeviceResult<()> {
        if !self.is_connected() {
            return Err(DeviceError::NotConnected(self.name.clone()));
        }
        frame.resize(self.width, self.height)?;
        let subframe = if options.use_subframe { subframe } else { None };
        frame.begin_exposure(duration_ms, subframe);

        if interrupt.sleep(duration_ms as u64, InterruptFlag::ANY).await != 0 {
            tracing::debug!("[SIM] Exposure interrupted");
            return Err(DeviceError::Interrupted);
        }

        self.sky.render(frame);
        let n = self.captures.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!("[SIM] Captured frame #{} ({} ms)", n, duration_ms);
        Ok(())
    }
}

// =============================================================================
// SIMULATED MOUNT
// =============================================================================

#[derive(Debug)]
pub struct SimulatedPulseGuider {
    name: String,
    sky: SimSky,
    connected: AtomicBool,
    background_pulse: bool,
    limit: Mutex<Option<GuideDirection>>,
    pulses: AtomicU64,
}

impl SimulatedPulseGuider {
    pub fn new(sky: SimSky) -> Self {
        Self {
            name: "Simulated Mount".to_string(),
            sky,
            connected: AtomicBool::new(true),
            background_pulse: true,
            limit: Mutex::new(None),
            pulses: AtomicU64::new(0),
        }
    }

    pub fn owner_thread_only(mut self) -> Self {
        self.background_pulse = false;
        self
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Pretend the mount is at a limit in `direction`
    pub fn set_limit(&self, direction: Option<GuideDirection>) {
        *self.limit.lock().unwrap_or_else(|e| e.into_inner()) = direction;
    }

    pub fn pulse_count(&self) -> u64 {
        self.pulses.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PulseGuider for SimulatedPulseGuider {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn supports_background_pulse(&self) -> bool {
        self.background_pulse
    }

    async fn pulse_guide(
        &self,
        direction: GuideDirection,
        duration_ms: u32,
        interrupt: &InterruptFlag,
    ) -> DeviceResult<()> {
        if !self.is_connected() {
            return Err(DeviceError::NotConnected(self.name.clone()));
        }
        let at_limit = *self.limit.lock().unwrap_or_else(|e| e.into_inner());
        if at_limit == Some(direction) {
            tracing::warn!("[SIM] Pulse {:?} refused: mount at limit", direction);
            return Err(DeviceError::LimitReached(direction));
        }

        tracing::debug!("[SIM] Pulse {:?} for {} ms", direction, duration_ms);
        if interrupt.sleep(duration_ms as u64, InterruptFlag::ANY).await != 0 {
            return Err(DeviceError::Interrupted);
        }
        self.sky.apply_pulse(direction, duration_ms);
        self.pulses.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn side_of_pier(&self) -> DeviceResult<PierSide> {
        Ok(self.sky.pier_side())
    }
}
