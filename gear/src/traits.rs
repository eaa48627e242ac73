//! Guiding Gear Traits
//!
//! Defines the capability interface the guiding core needs from a camera and
//! from the pulse-guide port of a mount. Vendor drivers live elsewhere; they
//! only have to implement these traits.

use crate::frame::{Frame, Rect};
use crate::interrupt::InterruptFlag;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

// =============================================================================
// ERRORS
// =============================================================================

/// Errors reported by camera and mount drivers
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("Device not connected: {0}")]
    NotConnected(String),

    /// The driver waited for the hardware longer than it was willing to.
    #[error("Timeout: {operation} did not complete within {duration:?}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    /// The operation observed a STOP or TERMINATE request at a sleep point.
    #[error("Operation interrupted")]
    Interrupted,

    #[error("Capture failed: {0}")]
    CaptureFailed(String),

    #[error("Pulse guide failed: {0}")]
    PulseFailed(String),

    #[error("Mount reached a limit while moving {0:?}")]
    LimitReached(GuideDirection),

    #[error("Cannot allocate frame buffer for {width}x{height}")]
    FrameAllocation { width: u32, height: u32 },

    #[error("Operation not supported")]
    NotSupported,
}

pub type DeviceResult<T> = Result<T, DeviceError>;

// =============================================================================
// COMMON TYPES
// =============================================================================

/// Guide pulse direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GuideDirection {
    North,
    South,
    East,
    West,
}

impl GuideDirection {
    /// The direction that undoes a pulse in this direction.
    pub fn opposite(self) -> Self {
        match self {
            GuideDirection::North => GuideDirection::South,
            GuideDirection::South => GuideDirection::North,
            GuideDirection::East => GuideDirection::West,
            GuideDirection::West => GuideDirection::East,
        }
    }

    pub fn is_ra(self) -> bool {
        matches!(self, GuideDirection::East | GuideDirection::West)
    }
}

/// Pier side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PierSide {
    East,
    West,
    #[default]
    Unknown,
}

/// Post-capture noise reduction applied to guide frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NoiseReduction {
    #[default]
    None,
    /// 2x2 box mean, keeps the frame size
    Mean2x2,
    /// 3x3 median
    Median3x3,
}

/// Options passed along with every capture request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CaptureOptions {
    /// Read out only the requested subframe when the camera supports it
    pub use_subframe: bool,
    pub noise_reduction: NoiseReduction,
}

// =============================================================================
// CAPABILITIES
// =============================================================================

/// Guide camera capability
#[async_trait]
pub trait Camera: Send + Sync + Debug {
    /// Get the device name
    fn name(&self) -> &str;

    /// Check if the camera is connected
    fn is_connected(&self) -> bool;

    /// Whether `capture` may be called from the hardware worker thread.
    ///
    /// Drivers that must run on the thread that owns them return false; the
    /// worker then hands each capture back to the owner.
    fn supports_background_capture(&self) -> bool;

    /// Full sensor size (width, height)
    fn frame_size(&self) -> (u32, u32);

    /// Expose for `duration_ms` and fill `frame`.
    ///
    /// Implementations wait through `interrupt.sleep` so a STOP request is seen
    /// within one sleep slice.
    async fn capture(
        &self,
        duration_ms: u32,
        frame: &mut Frame,
        options: CaptureOptions,
        subframe: Option<Rect>,
        interrupt: &InterruptFlag,
    ) -> DeviceResult<()>;
}

/// The pulse-guide port of a mount (ST-4 or driver pulse guiding)
#[async_trait]
pub trait PulseGuider: Send + Sync + Debug {
    /// Get the device name
    fn name(&self) -> &str;

    /// Check if the port is connected
    fn is_connected(&self) -> bool;

    /// Whether pulses may be issued from the hardware worker thread.
    fn supports_background_pulse(&self) -> bool {
        true
    }

    /// Issue a guide pulse and return once it has completed
    async fn pulse_guide(
        &self,
        direction: GuideDirection,
        duration_ms: u32,
        interrupt: &InterruptFlag,
    ) -> DeviceResult<()>;

    /// Current pier side, when the mount reports one
    async fn side_of_pier(&self) -> DeviceResult<PierSide> {
        Ok(PierSide::Unknown)
    }
}

pub type SharedCamera = Arc<dyn Camera>;
pub type SharedPulseGuider = Arc<dyn PulseGuider>;
