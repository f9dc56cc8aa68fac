// Command state shared by every input source
use serde::{Deserialize, Serialize};

use crate::drive::{PowerLimit, SpeedRamper, WheelTarget};
use crate::protocol::Packet;

/// Which producer currently owns the wheel targets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum InputMode {
    /// 2-D control surface, smoothed by the ramp ticker
    #[default]
    Joystick,
    /// Single speed axis, applied directly
    Slider,
}

impl InputMode {
    pub fn ramps(&self) -> bool {
        matches!(self, InputMode::Joystick)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandState {
    pub current: WheelTarget,
    pub target: WheelTarget,
    pub brake: bool,
    pub limit: PowerLimit,
    pub mode: InputMode,
    pub last_sent: Option<Packet>,
}

impl CommandState {
    pub fn new(mode: InputMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    /// Set new targets. Without ramping the wheels follow immediately.
    pub fn set_target(&mut self, target: WheelTarget) {
        self.target = target;
        if !self.mode.ramps() {
            self.current = target;
        }
    }

    /// One ramp tick; returns the updated current speeds
    pub fn ramp(&mut self, ramper: &SpeedRamper) -> WheelTarget {
        self.current = ramper.tick(self.current, self.target);
        self.current
    }

    /// Switch input producer; both wheels return to rest
    pub fn switch_mode(&mut self, mode: InputMode) {
        self.mode = mode;
        self.target = WheelTarget::zero();
        self.current = WheelTarget::zero();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_neutral() {
        let state = CommandState::new(InputMode::Joystick);
        assert_eq!(state.current, WheelTarget::zero());
        assert_eq!(state.target, WheelTarget::zero());
        assert!(!state.brake);
        assert_eq!(state.limit.factor(), 1.0);
        assert!(state.last_sent.is_none());
    }

    #[test]
    fn test_slider_target_applies_directly() {
        let mut state = CommandState::new(InputMode::Slider);
        state.set_target(WheelTarget::straight(120));
        assert_eq!(state.current, WheelTarget::new(120, 120));
    }

    #[test]
    fn test_joystick_target_waits_for_ramp() {
        let mut state = CommandState::new(InputMode::Joystick);
        state.set_target(WheelTarget::new(100, -100));
        assert_eq!(state.current, WheelTarget::zero());
        let current = state.ramp(&SpeedRamper::default());
        assert_eq!(current, WheelTarget::new(15, -15));
    }

    #[test]
    fn test_switch_mode_rests_wheels() {
        let mut state = CommandState::new(InputMode::Slider);
        state.set_target(WheelTarget::straight(-200));
        state.switch_mode(InputMode::Joystick);
        assert_eq!(state.mode, InputMode::Joystick);
        assert_eq!(state.current, WheelTarget::zero());
        assert_eq!(state.target, WheelTarget::zero());
    }
}
