//! Nightshade Guiding Gear
//!
//! The hardware boundary of the guiding core: the frame buffer, the camera
//! and pulse-guide capabilities drivers implement, the cooperative interrupt
//! flag used at every wait, and a simulated camera/mount pair.

pub mod frame;
pub mod interrupt;
pub mod sim;
pub mod traits;

pub use frame::{calculate_buffer_size, Frame, Point, Rect};
pub use interrupt::{InterruptFlag, SLEEP_SLICE};
pub use sim::{SimSky, SimSkyConfig, SimulatedCamera, SimulatedPulseGuider};
pub use traits::*;
