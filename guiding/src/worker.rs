//! Hardware worker thread
//!
//! One background thread executes camera exposures and mount moves so the
//! owning thread never blocks on hardware. Requests arrive on two queues:
//! moves and terminate go on the high-priority queue, exposures on the low
//! one. Each enqueue also posts a wakeup; the worker takes one wakeup,
//! drains high before low, executes exactly one request and reports the
//! result as a [`WorkerEvent`].
//!
//! Drivers that must not be called off their owning thread get an
//! `*OnOwner` event instead. The owning thread services it and answers on a
//! oneshot channel while the worker waits.
//!
//! A capture that overruns its timeout is reported as failed but the camera
//! call itself is left to finish; the next exposure waits for it first.

use crate::error::{GuideError, GuideResult};
use crate::mount::{GuiderOffset, MoveOptions, MoveResult, SharedMount};
use futures::FutureExt;
use nightshade_gear::{
    CaptureOptions, DeviceError, DeviceResult, Frame, GuideDirection, InterruptFlag, Rect,
    SharedCamera,
};
use std::panic::AssertUnwindSafe;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle as TaskHandle;

/// A background capture that outlived its timeout
type PendingCapture = TaskHandle<(Frame, DeviceResult<()>)>;

#[derive(Debug)]
pub struct ExposeRequest {
    pub duration_ms: u32,
    /// Wait before starting the exposure
    pub delay_ms: u32,
    pub options: CaptureOptions,
    pub subframe: Option<Rect>,
    /// Buffer to capture into, handed back in the completion event
    pub frame: Frame,
    /// Added to the exposure time to get the capture timeout
    pub timeout_margin_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MoveKind {
    Axis {
        direction: GuideDirection,
        duration_ms: u32,
    },
    Offset(GuiderOffset),
}

#[derive(Debug, Clone)]
pub struct MoveRequest {
    pub mount: SharedMount,
    pub kind: MoveKind,
    pub options: MoveOptions,
}

#[derive(Debug)]
enum WorkerRequest {
    Expose(ExposeRequest),
    Move(MoveRequest),
    Terminate,
}

/// Completion and handoff events sent to the owning thread
#[derive(Debug)]
pub enum WorkerEvent {
    ExposeComplete(GuideResult<Frame>),
    MoveComplete {
        mount: String,
        kind: MoveKind,
        options: MoveOptions,
        result: MoveResult,
    },
    /// The camera must be driven from the owning thread
    CaptureOnOwner(OwnerCapture),
    /// The mount must be driven from the owning thread
    MoveOnOwner(OwnerMove),
}

/// A capture the worker is waiting for the owning thread to perform
#[derive(Debug)]
pub struct OwnerCapture {
    camera: SharedCamera,
    duration_ms: u32,
    options: CaptureOptions,
    subframe: Option<Rect>,
    frame: Frame,
    interrupt: InterruptFlag,
    reply: oneshot::Sender<(Frame, DeviceResult<()>)>,
}

impl OwnerCapture {
    pub async fn service(self) {
        let OwnerCapture {
            camera,
            duration_ms,
            options,
            subframe,
            mut frame,
            interrupt,
            reply,
        } = self;
        let result = camera
            .capture(duration_ms, &mut frame, options, subframe, &interrupt)
            .await;
        // The worker may have timed out and gone on
        let _ = reply.send((frame, result));
    }
}

/// A move the worker is waiting for the owning thread to perform
#[derive(Debug)]
pub struct OwnerMove {
    request: MoveRequest,
    interrupt: InterruptFlag,
    reply: oneshot::Sender<MoveResult>,
}

impl OwnerMove {
    pub async fn service(self) {
        let result = execute_move(&self.request, &self.interrupt).await;
        let _ = self.reply.send(result);
    }
}

async fn execute_move(request: &MoveRequest, interrupt: &InterruptFlag) -> MoveResult {
    match request.kind {
        MoveKind::Axis {
            direction,
            duration_ms,
        } => {
            request
                .mount
                .move_axis(direction, duration_ms, request.options, interrupt)
                .await
        }
        MoveKind::Offset(offset) => {
            request
                .mount
                .move_offset(&offset, request.options, interrupt)
                .await
        }
    }
}

// =============================================================================
// WORKER HANDLE
// =============================================================================

#[derive(Debug)]
pub struct HardwareWorker {
    high: mpsc::UnboundedSender<WorkerRequest>,
    low: mpsc::UnboundedSender<WorkerRequest>,
    wakeup: mpsc::UnboundedSender<()>,
    interrupt: InterruptFlag,
    handle: Option<JoinHandle<()>>,
}

impl HardwareWorker {
    /// Start the worker thread for `camera`.
    ///
    /// Returns the handle and the receiver for completion events.
    pub fn spawn(
        camera: SharedCamera,
    ) -> GuideResult<(Self, mpsc::UnboundedReceiver<WorkerEvent>)> {
        let (high_tx, high_rx) = mpsc::unbounded_channel();
        let (low_tx, low_rx) = mpsc::unbounded_channel();
        let (wakeup_tx, wakeup_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let interrupt = InterruptFlag::new();

        let queues = Queues {
            high: high_rx,
            low: low_rx,
            wakeup: wakeup_rx,
        };
        let worker_interrupt = interrupt.clone();
        let handle = std::thread::Builder::new()
            .name("hardware-worker".to_string())
            .spawn(move || {
                match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt.block_on(run(camera, queues, events_tx, worker_interrupt)),
                    Err(e) => tracing::error!("Hardware worker runtime failed to start: {}", e),
                }
            })
            .map_err(|e| GuideError::StartCapture(e.to_string()))?;

        tracing::debug!("Hardware worker started");
        Ok((
            Self {
                high: high_tx,
                low: low_tx,
                wakeup: wakeup_tx,
                interrupt,
                handle: Some(handle),
            },
            events_rx,
        ))
    }

    fn enqueue(
        &self,
        queue: &mpsc::UnboundedSender<WorkerRequest>,
        request: WorkerRequest,
    ) -> GuideResult<()> {
        queue.send(request).map_err(|_| GuideError::WorkerStopped)?;
        self.wakeup.send(()).map_err(|_| GuideError::WorkerStopped)
    }

    /// Queue an exposure on the low-priority queue
    pub fn enqueue_expose(&self, request: ExposeRequest) -> GuideResult<()> {
        self.interrupt.clear(InterruptFlag::STOP);
        tracing::debug!("Enqueue expose ({} ms)", request.duration_ms);
        self.enqueue(&self.low, WorkerRequest::Expose(request))
    }

    /// Queue a move on the high-priority queue
    pub fn enqueue_move(&self, request: MoveRequest) -> GuideResult<()> {
        self.interrupt.clear(InterruptFlag::STOP);
        tracing::debug!("Enqueue move {:?} on {}", request.kind, request.mount.name());
        self.enqueue(&self.high, WorkerRequest::Move(request))
    }

    /// Ask the in-flight request to stop at its next checkpoint
    pub fn request_stop(&self) {
        self.interrupt.raise(InterruptFlag::STOP);
    }

    pub fn interrupt(&self) -> &InterruptFlag {
        &self.interrupt
    }

    /// Queue a terminate; the loop exits after the current request
    pub fn terminate(&self) -> GuideResult<()> {
        self.enqueue(&self.high, WorkerRequest::Terminate)
    }

    /// Terminate, interrupt the in-flight request and wait for the thread
    pub fn shutdown(mut self) {
        let _ = self.terminate();
        self.interrupt.raise(InterruptFlag::TERMINATE);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Hardware worker thread panicked");
            }
        }
        tracing::debug!("Hardware worker stopped");
    }
}

impl Drop for HardwareWorker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let _ = self.terminate();
            self.interrupt.raise(InterruptFlag::TERMINATE);
        }
    }
}

// =============================================================================
// WORKER LOOP
// =============================================================================

struct Queues {
    high: mpsc::UnboundedReceiver<WorkerRequest>,
    low: mpsc::UnboundedReceiver<WorkerRequest>,
    wakeup: mpsc::UnboundedReceiver<()>,
}

async fn run(
    camera: SharedCamera,
    mut queues: Queues,
    events: mpsc::UnboundedSender<WorkerEvent>,
    interrupt: InterruptFlag,
) {
    let mut pending: Option<PendingCapture> = None;
    while queues.wakeup.recv().await.is_some() {
        let request = match queues.high.try_recv() {
            Ok(request) => request,
            Err(_) => match queues.low.try_recv() {
                Ok(request) => request,
                Err(_) => continue,
            },
        };

        let event = match request {
            WorkerRequest::Terminate => {
                tracing::debug!("Hardware worker terminating");
                break;
            }
            WorkerRequest::Expose(request) => {
                let exposure = expose(&camera, request, &events, &interrupt, &mut pending);
                let result = AssertUnwindSafe(exposure)
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        Err(GuideError::StartCapture("camera driver panicked".to_string()))
                    });
                WorkerEvent::ExposeComplete(result)
            }
            WorkerRequest::Move(request) => {
                let result = AssertUnwindSafe(do_move(&request, &events, &interrupt))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        tracing::error!("Mount driver panicked during move");
                        MoveResult::Error
                    });
                WorkerEvent::MoveComplete {
                    mount: request.mount.name().to_string(),
                    kind: request.kind,
                    options: request.options,
                    result,
                }
            }
        };

        if events.send(event).is_err() {
            tracing::debug!("Owning thread gone, hardware worker exiting");
            break;
        }
    }

    if let Some(capture) = pending.take() {
        tracing::debug!("Waiting for timed-out capture before exiting");
        let _ = capture.await;
    }
}

async fn expose(
    camera: &SharedCamera,
    request: ExposeRequest,
    events: &mpsc::UnboundedSender<WorkerEvent>,
    interrupt: &InterruptFlag,
    pending: &mut Option<PendingCapture>,
) -> GuideResult<Frame> {
    let ExposeRequest {
        duration_ms,
        delay_ms,
        options,
        subframe,
        mut frame,
        timeout_margin_ms,
    } = request;

    if delay_ms > 0 && interrupt.sleep(delay_ms as u64, InterruptFlag::ANY).await != 0 {
        return Err(DeviceError::Interrupted.into());
    }
    if interrupt.is_raised(InterruptFlag::ANY) {
        return Err(DeviceError::Interrupted.into());
    }
    if !camera.is_connected() {
        return Err(GuideError::NotConnected);
    }

    let timeout_ms = duration_ms as u64 + timeout_margin_ms;
    let timeout = Duration::from_millis(timeout_ms);

    // The camera is still busy with an earlier capture that timed out
    if let Some(earlier) = pending.as_mut() {
        if tokio::time::timeout(timeout, earlier).await.is_err() {
            tracing::warn!("Camera still busy with a timed-out capture");
            return Err(GuideError::CaptureTimeout(timeout_ms));
        }
        tracing::debug!("Timed-out capture finished");
        *pending = None;
    }

    let result = if camera.supports_background_capture() {
        let mut task = tokio::spawn({
            let camera = camera.clone();
            let interrupt = interrupt.clone();
            async move {
                let mut frame = frame;
                let result = camera
                    .capture(duration_ms, &mut frame, options, subframe, &interrupt)
                    .await;
                (frame, result)
            }
        });
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok((returned, result))) => {
                frame = returned;
                result
            }
            Ok(Err(e)) if e.is_panic() => {
                return Err(GuideError::StartCapture("camera driver panicked".to_string()))
            }
            Ok(Err(e)) => return Err(GuideError::StartCapture(e.to_string())),
            Err(_) => {
                tracing::warn!("Capture timed out after {} ms, left running", timeout_ms);
                *pending = Some(task);
                return Err(GuideError::CaptureTimeout(timeout_ms));
            }
        }
    } else {
        let (reply, done) = oneshot::channel();
        events
            .send(WorkerEvent::CaptureOnOwner(OwnerCapture {
                camera: camera.clone(),
                duration_ms,
                options,
                subframe,
                frame,
                interrupt: interrupt.clone(),
                reply,
            }))
            .map_err(|_| GuideError::WorkerStopped)?;
        match tokio::time::timeout(timeout, done).await {
            Ok(Ok((returned, result))) => {
                frame = returned;
                result
            }
            Ok(Err(_)) => return Err(GuideError::WorkerStopped),
            Err(_) => return Err(GuideError::CaptureTimeout(timeout_ms)),
        }
    };

    if let Err(e) = result {
        tracing::warn!("Capture failed: {}", e);
        return Err(e.into());
    }

    frame.apply_noise_reduction(options.noise_reduction);
    Ok(frame)
}

async fn do_move(
    request: &MoveRequest,
    events: &mpsc::UnboundedSender<WorkerEvent>,
    interrupt: &InterruptFlag,
) -> MoveResult {
    if interrupt.is_raised(InterruptFlag::ANY) {
        tracing::debug!("Move skipped, interrupt pending");
        return MoveResult::Error;
    }

    if request.mount.supports_background_move() {
        return execute_move(request, interrupt).await;
    }

    let (reply, done) = oneshot::channel();
    let handoff = WorkerEvent::MoveOnOwner(OwnerMove {
        request: request.clone(),
        interrupt: interrupt.clone(),
        reply,
    });
    if events.send(handoff).is_err() {
        return MoveResult::Error;
    }
    done.await.unwrap_or(MoveResult::Error)
}
