// Teleoperation core for a two-wheel motor controller
//
// Operator input -> wheel targets -> ramped speeds -> text packets, sent over
// serial or UDP, with inbound telemetry forwarded back to the operator surface.

pub mod config;
pub mod control;
pub mod drive;
pub mod messages;
pub mod protocol;
pub mod runtime;
pub mod state;
pub mod transport;
