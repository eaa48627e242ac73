//! Owning-thread guide loop
//!
//! [`GuideSession`] ties the pieces together: it owns the session context
//! and controller, runs the hardware worker, and processes worker events one
//! at a time. Whoever calls [`GuideSession::step`] is the owning thread.

use crate::controller::{SessionContext, SessionController, SettleParams};
use crate::error::{GuideError, GuideResult};
use crate::event::{ControllerEvent, SettleOutcome};
use crate::guider::{GuideStep, Guider};
use crate::mount::{MoveOptions, MoveResult};
use crate::worker::{ExposeRequest, HardwareWorker, MoveKind, MoveRequest, WorkerEvent};
use nightshade_gear::{CaptureOptions, Frame, Rect};
use tokio::sync::{broadcast, mpsc};

pub struct GuideSession<G: Guider> {
    ctx: SessionContext<G>,
    controller: SessionController,
    worker: HardwareWorker,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    exposure_pending: bool,
    frame_count: u64,
}

impl<G: Guider> GuideSession<G> {
    pub fn new(ctx: SessionContext<G>) -> GuideResult<Self> {
        let (worker, events) = HardwareWorker::spawn(ctx.camera.clone())?;
        Ok(Self {
            ctx,
            controller: SessionController::new(),
            worker,
            events,
            exposure_pending: false,
            frame_count: 0,
        })
    }

    pub fn context(&self) -> &SessionContext<G> {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut SessionContext<G> {
        &mut self.ctx
    }

    pub fn controller(&self) -> &SessionController {
        &self.controller
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.controller.subscribe()
    }

    /// Frames processed so far
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn guide(
        &mut self,
        force_calibration: bool,
        settle: SettleParams,
        roi: Option<Rect>,
    ) -> GuideResult<()> {
        self.controller
            .guide(&mut self.ctx, force_calibration, settle, roi)?;
        self.keep_exposing()
    }

    pub fn dither(
        &mut self,
        pixels: f64,
        force_ra_only: bool,
        settle: SettleParams,
    ) -> GuideResult<()> {
        self.controller
            .dither(&mut self.ctx, pixels, force_ra_only, settle)?;
        self.keep_exposing()
    }

    pub fn dither_frames(&mut self, pixels: f64, settle_frames: u32) -> GuideResult<()> {
        self.controller
            .dither_frames(&mut self.ctx, pixels, settle_frames)?;
        self.keep_exposing()
    }

    /// Fail the active cycle; hardware keeps running
    pub fn abort(&mut self, reason: &str) {
        self.controller.abort_controller(&mut self.ctx, reason);
    }

    /// Stop capturing and interrupt whatever the worker is doing
    pub fn stop_capturing(&mut self) {
        self.ctx.guider.stop_capturing();
        self.worker.request_stop();
        self.abort("capture stopped");
    }

    fn keep_exposing(&mut self) -> GuideResult<()> {
        if self.exposure_pending || !self.ctx.guider.is_capture_active() {
            return Ok(());
        }
        let capture = &self.ctx.config.capture;
        let (width, height) = self.ctx.camera.frame_size();
        let request = ExposeRequest {
            duration_ms: capture.exposure_ms,
            delay_ms: capture.delay_ms,
            options: CaptureOptions {
                use_subframe: false,
                noise_reduction: capture.noise_reduction,
            },
            subframe: None,
            frame: Frame::new(width, height)?,
            timeout_margin_ms: capture.timeout_margin_ms,
        };
        self.worker.enqueue_expose(request)?;
        self.exposure_pending = true;
        Ok(())
    }

    fn enqueue_move(&mut self, kind: MoveKind, options: MoveOptions) -> GuideResult<()> {
        let Some(mount) = self.ctx.mount.clone() else {
            return Ok(());
        };
        self.worker.enqueue_move(MoveRequest {
            mount,
            kind,
            options,
        })
    }

    fn on_frame(&mut self, frame: Frame) -> GuideResult<()> {
        self.frame_count += 1;
        match self.ctx.guider.process_frame(frame) {
            GuideStep::None => {}
            GuideStep::Lost(fix) => {
                tracing::info!("Frame {}: {}", self.frame_count, GuideError::StarLost(fix.result))
            }
            GuideStep::Calibrate {
                direction,
                duration_ms,
            } => self.enqueue_move(
                MoveKind::Axis {
                    direction,
                    duration_ms,
                },
                MoveOptions::calibration(),
            )?,
            GuideStep::Correct(offset) => {
                tracing::debug!(
                    "Frame {}: offset RA {:.2} Dec {:.2} px",
                    self.frame_count,
                    offset.mount.x,
                    offset.mount.y
                );
                self.enqueue_move(MoveKind::Offset(offset), MoveOptions::guide())?
            }
        }
        self.controller.update_controller_state(&mut self.ctx);
        Ok(())
    }

    /// Wait for the next worker event and handle it
    pub async fn step(&mut self) -> GuideResult<()> {
        self.keep_exposing()?;
        let event = self.events.recv().await.ok_or(GuideError::WorkerStopped)?;
        match event {
            WorkerEvent::ExposeComplete(Ok(frame)) => {
                self.exposure_pending = false;
                self.on_frame(frame)?;
            }
            WorkerEvent::ExposeComplete(Err(e)) => {
                self.exposure_pending = false;
                tracing::warn!("Exposure failed: {}", e);
                self.ctx.guider.stop_capturing();
                self.controller
                    .abort_controller(&mut self.ctx, &e.to_string());
            }
            WorkerEvent::MoveComplete {
                mount,
                kind,
                result,
                ..
            } => {
                if result != MoveResult::Ok {
                    let error = GuideError::MoveFailed(format!(
                        "{:?} on {} returned {:?}",
                        kind, mount, result
                    ));
                    tracing::warn!("{}", error);
                    self.controller
                        .abort_controller(&mut self.ctx, &error.to_string());
                }
            }
            WorkerEvent::CaptureOnOwner(job) => job.service().await,
            WorkerEvent::MoveOnOwner(job) => job.service().await,
        }
        self.keep_exposing()
    }

    /// Step until the active guide/dither cycle finishes
    pub async fn run_until_idle(&mut self) -> GuideResult<SettleOutcome> {
        while !self.controller.is_idle() {
            self.step().await?;
        }
        self.controller
            .last_outcome()
            .cloned()
            .ok_or_else(|| GuideError::Aborted("no guide or dither cycle has run".to_string()))
    }

    /// Stop the worker thread and wait for it to exit
    pub fn shutdown(self) {
        let GuideSession {
            mut ctx,
            events,
            worker,
            ..
        } = self;
        ctx.guider.stop_capturing();
        // Pending owner handoffs are dropped here, releasing a waiting worker
        drop(events);
        worker.shutdown();
    }
}
