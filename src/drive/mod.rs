// Drive input processing for the two-wheel base
//
// Provides:
// - Tank-drive mixing (surface offset -> wheel targets) and the power-limit selector
// - Per-tick speed ramping toward the targets

pub mod mixer;
pub mod ramp;

pub use mixer::{PowerLimit, SurfaceOffset, WheelTarget};
pub use ramp::SpeedRamper;
