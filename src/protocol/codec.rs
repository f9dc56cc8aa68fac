// Outbound wire format
//
// Two text profiles, one newline-terminated packet per command:
//   Legacy:       "S{speed};B{brake}\n"
//   Differential: "TX:{left},{right},{brake}\n"
// Speeds are scaled by the power limit before encoding.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::state::CommandState;

/// Packet layout expected by the motor controller firmware
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    /// Single speed for both motors
    Legacy,
    /// Independent left/right speeds
    #[default]
    Differential,
}

/// An encoded, immutable command packet
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Packet(String);

impl Packet {
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.trim_end())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WireCodec {
    profile: Profile,
}

impl WireCodec {
    pub fn new(profile: Profile) -> Self {
        Self { profile }
    }

    pub fn profile(&self) -> Profile {
        self.profile
    }

    /// Build the packet for the given state. Does not touch the state.
    pub fn encode(&self, state: &CommandState) -> Packet {
        let brake = u8::from(state.brake);
        let packet = match self.profile {
            Profile::Legacy => {
                // Rounded mean, equal to either wheel when both are driven together
                let mean = (state.current.left + state.current.right) as f32 / 2.0;
                let speed = (mean * state.limit.factor()).round() as i32;
                format!("S{};B{}\n", speed, brake)
            }
            Profile::Differential => {
                let left = state.limit.apply(state.current.left);
                let right = state.limit.apply(state.current.right);
                format!("TX:{},{},{}\n", left, right, brake)
            }
        };
        Packet(packet)
    }
}
