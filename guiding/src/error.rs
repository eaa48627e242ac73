//! Error types for the guiding core
//!
//! Every failure a guide or dither cycle can hit maps to one `GuideError`
//! variant. Its display string is the single message handed to the settle
//! completion notification.
//!
//! # Error Categories
//!
//! - Equipment errors: not connected, capture timeout, device failures
//! - Calibration errors: calibration could not be started, cleared or completed
//! - Reentrancy errors: a guide/dither request while another cycle is active
//! - Star-quality errors: per-frame, never fatal to a session
//! - Settle errors: the settle timeout expired

use crate::star::FindResult;
use nightshade_gear::DeviceError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GuideError {
    // =========================================================================
    // Equipment Errors
    // =========================================================================

    #[error("all equipment must be connected first")]
    NotConnected,

    #[error("camera capture timed out after {0} ms")]
    CaptureTimeout(u64),

    #[error("{0}")]
    Device(#[from] DeviceError),

    #[error("unable to start capturing: {0}")]
    StartCapture(String),

    #[error("mount move failed: {0}")]
    MoveFailed(String),

    // =========================================================================
    // Calibration Errors
    // =========================================================================

    #[error("could not start calibration: {0}")]
    StartCalibration(String),

    #[error("calibration failed: {0}")]
    CalibrationFailed(String),

    #[error("mount is not calibrated")]
    NotCalibrated,

    // =========================================================================
    // Session Errors
    // =========================================================================

    /// A guide or dither request arrived while another cycle was running
    #[error("Cannot initiate {operation} while {active} is in progress")]
    Reentrancy {
        operation: &'static str,
        active: &'static str,
    },

    #[error("failed to find a suitable guide star")]
    NoGuideStar,

    #[error("could not start guiding: {0}")]
    StartGuiding(String),

    #[error("Dither error: {0}")]
    Dither(String),

    #[error("timed-out waiting for guider to settle")]
    SettleTimeout,

    #[error("{0}")]
    Aborted(String),

    // =========================================================================
    // Star Quality
    // =========================================================================

    #[error("star lost: {0}")]
    StarLost(FindResult),

    // =========================================================================
    // Internal
    // =========================================================================

    #[error("hardware worker has stopped")]
    WorkerStopped,

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type GuideResult<T> = Result<T, GuideError>;
