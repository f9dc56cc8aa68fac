// Timing, drive limits, transport defaults and persisted settings
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::protocol::Profile;

// Ramp tick period while the joystick surface is active
pub const TICK_PERIOD: Duration = Duration::from_millis(30);

// Maximum change of a wheel speed per ramp tick
pub const RAMP_STEP: i32 = 15;

// Wheel speed range is [-MAX_SPEED, MAX_SPEED]
pub const MAX_SPEED: i32 = 255;

// Power-limit selector positions 1..=5
pub const LIMIT_STEPS: [f32; 5] = [0.2, 0.4, 0.6, 0.8, 1.0];

// Bounded per-read timeout for the serial reader (also bounds serial writes)
pub const SERIAL_READ_TIMEOUT: Duration = Duration::from_millis(100);

// UDP sends must never stall the control path
pub const UDP_SEND_TIMEOUT: Duration = Duration::from_millis(50);

// Baud rates offered by the port selector
pub const BAUD_RATES: [u32; 3] = [9600, 115_200, 250_000];
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

// Radius of the control surface, in surface units
pub const DEFAULT_SURFACE_RADIUS: f32 = 80.0;

pub const DEFAULT_CONFIG_FILE: &str = "config.json";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Settings persisted between sessions as plain key-value JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub port: Option<String>,
    pub baud_rate: u32,
    pub udp_ip: String,
    pub udp_tx_port: u16,
    pub udp_rx_port: u16,
    pub profile: Profile,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: DEFAULT_BAUD_RATE,
            udp_ip: "192.168.4.1".into(),
            udp_tx_port: 4210,
            udp_rx_port: 4211,
            profile: Profile::Differential,
        }
    }
}

impl Settings {
    /// Read settings from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let txt = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&txt)?)
    }

    /// Read settings, falling back to defaults on any failure
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Ignoring settings in {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        info!("Settings saved to {}", path.display());
        Ok(())
    }

    /// Drop a port that is not currently enumerated and reset an unsupported baud rate
    pub fn sanitize(&mut self, available_ports: &[String]) {
        if let Some(port) = &self.port {
            if !available_ports.contains(port) {
                info!("Saved port {} is not available", port);
                self.port = None;
            }
        }
        if !BAUD_RATES.contains(&self.baud_rate) {
            warn!("Unsupported baud rate {}, using {}", self.baud_rate, DEFAULT_BAUD_RATE);
            self.baud_rate = DEFAULT_BAUD_RATE;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("wheel-teleop-{}-{}.json", name, std::process::id()))
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let path = temp_path("missing");
        let _ = fs::remove_file(&path);
        assert_eq!(Settings::load(&path).unwrap(), Settings::default());
    }

    #[test]
    fn test_save_then_load() {
        let path = temp_path("save");
        let settings = Settings {
            port: Some("/dev/ttyUSB0".into()),
            baud_rate: 9600,
            profile: Profile::Legacy,
            ..Settings::default()
        };
        settings.save(&path).unwrap();
        let loaded = Settings::load(&path).unwrap();
        let _ = fs::remove_file(&path);
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let path = temp_path("partial");
        fs::write(&path, r#"{"port": "COM3", "baud_rate": 250000}"#).unwrap();
        let loaded = Settings::load(&path).unwrap();
        let _ = fs::remove_file(&path);
        assert_eq!(loaded.port.as_deref(), Some("COM3"));
        assert_eq!(loaded.baud_rate, 250_000);
        assert_eq!(loaded.udp_tx_port, Settings::default().udp_tx_port);
    }

    #[test]
    fn test_malformed_file_falls_back() {
        let path = temp_path("malformed");
        fs::write(&path, "port=COM3").unwrap();
        assert!(matches!(Settings::load(&path), Err(ConfigError::Parse(_))));
        let loaded = Settings::load_or_default(&path);
        let _ = fs::remove_file(&path);
        assert_eq!(loaded, Settings::default());
    }

    #[test]
    fn test_sanitize() {
        let mut settings = Settings {
            port: Some("/dev/ttyACM9".into()),
            baud_rate: 57_600,
            ..Settings::default()
        };
        settings.sanitize(&["/dev/ttyACM0".to_string()]);
        assert_eq!(settings.port, None);
        assert_eq!(settings.baud_rate, DEFAULT_BAUD_RATE);

        let mut kept = Settings {
            port: Some("/dev/ttyACM0".into()),
            baud_rate: 9600,
            ..Settings::default()
        };
        kept.sanitize(&["/dev/ttyACM0".to_string()]);
        assert_eq!(kept.port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(kept.baud_rate, 9600);
    }
}
