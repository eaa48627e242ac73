//! Nightshade Guiding
//!
//! Closed-loop autoguiding core: measures a guide star on each frame,
//! turns the star's offset from the lock position into RA/Dec mount pulses,
//! and runs the guide/dither/settle state machine.
//!
//! ## Layout
//!
//! - [`star`]: star centroid, quality checks and auto-select
//! - [`corrector`]: per-axis guide algorithms
//! - [`calibration`]: camera/mount transform and the calibration routine
//! - [`mount`]: mount capability and the pulse-guided [`Scope`]
//! - [`guider`]: lock position bookkeeping, [`OneStarGuider`]
//! - [`worker`]: background hardware thread
//! - [`controller`]: guide/dither session state machine
//! - [`session`]: owning-thread loop tying it all together

pub mod calibration;
pub mod config;
pub mod controller;
pub mod corrector;
mod error;
pub mod event;
pub mod guider;
pub mod mount;
pub mod session;
pub mod star;
pub mod worker;

pub use calibration::{Calibration, CalibrationRoutine, CalibrationStep, Parity};
pub use config::{DitherMode, GuidingConfig};
pub use controller::{
    ControllerState, SessionContext, SessionController, SettleParams, SETTLING_TIME_DISABLED,
};
pub use corrector::{AxisMove, DecAlgorithm, DecCorrector, DecGuideMode, RaCorrector};
pub use error::{GuideError, GuideResult};
pub use event::{ControllerEvent, SettleOutcome};
pub use guider::{GuideStep, Guider, GuiderState, OneStarGuider};
pub use mount::{GuiderOffset, Mount, MoveOptions, MoveResult, Scope, SharedMount};
pub use session::GuideSession;
pub use star::{FindResult, StarFix, StarTracker};
pub use worker::{HardwareWorker, WorkerEvent};
