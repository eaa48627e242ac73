//! Events published by the session controller

use crate::controller::ControllerState;
use serde::{Deserialize, Serialize};

/// How the last guide/dither cycle ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettleOutcome {
    /// `None` on success
    pub error: Option<String>,
    pub settle_frames: u32,
    pub dropped_frames: u32,
}

impl SettleOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Event emitted by the session controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControllerEvent {
    StateChanged(ControllerState),
    SettleBegin,
    /// Once per frame while settling
    Settling {
        distance: f64,
        /// Seconds spent continuously in range
        elapsed: f64,
        settle_time: u32,
        star_locked: bool,
    },
    SettleDone(SettleOutcome),
}
