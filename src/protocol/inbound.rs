// Inbound line classification

/// Prefix the controller puts on telemetry lines
pub const TELEMETRY_PREFIX: &str = "RX:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Telemetry(String),
    /// Anything else, including transport error strings
    Noise(String),
}

impl Inbound {
    pub fn line(&self) -> &str {
        match self {
            Inbound::Telemetry(line) | Inbound::Noise(line) => line,
        }
    }

    pub fn is_telemetry(&self) -> bool {
        matches!(self, Inbound::Telemetry(_))
    }
}

pub fn classify(line: impl Into<String>) -> Inbound {
    let line = line.into();
    if line.starts_with(TELEMETRY_PREFIX) {
        Inbound::Telemetry(line)
    } else {
        Inbound::Noise(line)
    }
}
