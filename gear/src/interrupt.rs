//! Cooperative interrupt flag shared between the hardware worker and drivers
//!
//! An in-flight hardware call cannot be aborted from outside. Instead every
//! long wait is broken into short sleep slices and the flag is checked
//! between slices, so a STOP or TERMINATE request is noticed within one slice.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Longest single sleep before the flag is checked again
pub const SLEEP_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Default)]
pub struct InterruptFlag {
    bits: Arc<AtomicU32>,
}

impl InterruptFlag {
    /// Stop the current exposure/move and drop queued work
    pub const STOP: u32 = 1 << 0;
    /// Shut the worker down
    pub const TERMINATE: u32 = 1 << 1;
    pub const ANY: u32 = Self::STOP | Self::TERMINATE;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self, mask: u32) {
        self.bits.fetch_or(mask, Ordering::SeqCst);
    }

    pub fn clear(&self, mask: u32) {
        self.bits.fetch_and(!mask, Ordering::SeqCst);
    }

    /// The requested bits that are currently raised
    pub fn pending(&self, mask: u32) -> u32 {
        self.bits.load(Ordering::SeqCst) & mask
    }

    pub fn is_raised(&self, mask: u32) -> bool {
        self.pending(mask) != 0
    }

    /// Sleep for `duration_ms` in slices of at most [`SLEEP_SLICE`].
    ///
    /// Returns the raised bits of `mask` (0 when the full time elapsed).
    pub async fn sleep(&self, duration_ms: u64, mask: u32) -> u32 {
        let mut remaining = Duration::from_millis(duration_ms);
        loop {
            let raised = self.pending(mask);
            if raised != 0 || remaining.is_zero() {
                return raised;
            }
            let slice = remaining.min(SLEEP_SLICE);
            tokio::time::sleep(slice).await;
            remaining -= slice;
        }
    }
}
