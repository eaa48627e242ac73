//! Run a guide session against the simulator.
//!
//! Usage: `guide_sim [config.json]`
//!
//! Calibrates, settles, dithers a few times and reports each settle result.
//! Set `RUST_LOG` to change the log level (default `info`).

use anyhow::Context;
use nightshade_gear::{SimSky, SimSkyConfig, SimulatedCamera, SimulatedPulseGuider};
use nightshade_guiding::{
    ControllerEvent, GuideSession, GuidingConfig, OneStarGuider, Scope, SessionContext,
    SettleParams, SharedMount,
};
use std::sync::Arc;
use tokio::sync::broadcast::error::TryRecvError;
use tracing_subscriber::EnvFilter;

const DITHERS: u32 = 3;
const DITHER_PIXELS: f64 = 3.0;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => GuidingConfig::load(&path)
            .with_context(|| format!("failed to load guiding config from {}", path))?,
        None => GuidingConfig {
            capture: nightshade_guiding::config::CaptureConfig {
                exposure_ms: 500,
                ..Default::default()
            },
            ..Default::default()
        },
    };
    config.validate()?;

    let sky = SimSky::new(SimSkyConfig {
        drift_x: 0.3,
        drift_y: -0.2,
        ..Default::default()
    });
    let camera = Arc::new(SimulatedCamera::new(sky.clone(), 320, 240));
    let port = Arc::new(SimulatedPulseGuider::new(sky.clone()));
    let mount: SharedMount = Arc::new(Scope::new(port, &config));
    let guider = OneStarGuider::new(config.clone(), Some(mount.clone()));
    let ctx = SessionContext::new(camera, Some(mount), guider, config);

    let mut session = GuideSession::new(ctx)?;
    let mut events = session.subscribe();
    let settle = SettleParams {
        tolerance_px: 1.0,
        settle_time_sec: 3,
        timeout_sec: 60,
        ..Default::default()
    };

    session.guide(false, settle, None)?;
    let outcome = session.run_until_idle().await?;
    report("guide", outcome.error.as_deref(), outcome.settle_frames);

    for n in 1..=DITHERS {
        session.dither(DITHER_PIXELS, false, settle)?;
        let outcome = session.run_until_idle().await?;
        report(&format!("dither {}", n), outcome.error.as_deref(), outcome.settle_frames);
    }

    let mut settling_frames = 0;
    loop {
        match events.try_recv() {
            Ok(ControllerEvent::Settling { .. }) => settling_frames += 1,
            Ok(_) | Err(TryRecvError::Lagged(_)) => {}
            Err(_) => break,
        }
    }
    tracing::info!(
        "{} frames processed, {} while settling",
        session.frame_count(),
        settling_frames
    );

    session.shutdown();
    Ok(())
}

fn report(what: &str, error: Option<&str>, frames: u32) {
    match error {
        None => tracing::info!("{} settled after {} frames", what, frames),
        Some(message) => tracing::warn!("{} failed after {} frames: {}", what, frames, message),
    }
}
