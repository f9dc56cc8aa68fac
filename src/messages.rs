// Message types exchanged with the operator surface

use serde::{Deserialize, Serialize};

use crate::drive::{SurfaceOffset, WheelTarget};
use crate::state::InputMode;
use crate::transport::ConnectionState;

// Operator surface -> runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    PointerMoved { offset: SurfaceOffset },
    PointerReleased,
    SetSpeed { speed: i32 },
    Brake { engaged: bool },
    /// Power-limit selector position, 1..=5
    SetLimit { position: u8 },
    SelectMode { mode: InputMode },
    /// Falls back to the saved port / baud rate when not given
    ConnectSerial {
        port: Option<String>,
        baud_rate: Option<u32>,
    },
    ListenUdp,
    Disconnect,
    RefreshPorts,
    Shutdown,
}

// Runtime -> operator surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Inbound line carrying the telemetry prefix, verbatim
    Telemetry { line: String },
    /// Inbound noise and runtime notices
    Diagnostic { text: String },
    ConnectionState { state: ConnectionState },
    /// Emitted once per ramp tick
    WheelSpeeds { speeds: WheelTarget },
    PacketSent { packet: String },
    LimitChanged { percent: u32 },
    Ports { ports: Vec<String> },
}

impl Event {
    pub fn diagnostic(text: impl Into<String>) -> Self {
        Event::Diagnostic { text: text.into() }
    }
}
