// Tank-drive mixing for a two-wheel base
// Converts a 2-D offset on the control surface into left/right wheel targets.

use serde::{Deserialize, Serialize};

use crate::config::{LIMIT_STEPS, MAX_SPEED};

/// Pointer offset from the surface center, in surface units (y grows downward)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SurfaceOffset {
    pub dx: f32,
    pub dy: f32,
}

impl SurfaceOffset {
    pub fn new(dx: f32, dy: f32) -> Self {
        Self { dx, dy }
    }

    pub fn magnitude(&self) -> f32 {
        self.dx.hypot(self.dy)
    }

    /// Scale the offset down onto the disc of `radius`, keeping its direction
    pub fn clamped(self, radius: f32) -> Self {
        let magnitude = self.magnitude();
        if magnitude > radius && magnitude > 0.0 {
            let scale = radius / magnitude;
            Self::new(self.dx * scale, self.dy * scale)
        } else {
            self
        }
    }
}

/// Target speeds for the two wheels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WheelTarget {
    pub left: i32,
    pub right: i32,
}

impl WheelTarget {
    pub fn new(left: i32, right: i32) -> Self {
        Self {
            left: clamp_speed(left),
            right: clamp_speed(right),
        }
    }

    pub fn zero() -> Self {
        Self::default()
    }

    /// Both wheels at the same speed (single-axis control)
    pub fn straight(speed: i32) -> Self {
        Self::new(speed, speed)
    }
}

pub fn clamp_speed(speed: i32) -> i32 {
    speed.clamp(-MAX_SPEED, MAX_SPEED)
}

/// Normalized (nx, ny) inside the unit disc; "up" on the surface is forward
pub fn normalize(offset: SurfaceOffset, radius: f32) -> (f32, f32) {
    if radius <= 0.0 {
        return (0.0, 0.0);
    }
    let clamped = offset.clamped(radius);
    (clamped.dx / radius, -clamped.dy / radius)
}

/// Map a surface offset to wheel targets
///
/// # Arguments
/// * `offset` - Pointer offset from the surface center
/// * `radius` - Surface radius; offsets beyond it are clamped onto the disc
pub fn map(offset: SurfaceOffset, radius: f32) -> WheelTarget {
    let (nx, ny) = normalize(offset, radius);
    WheelTarget {
        left: mix(ny - nx),
        right: mix(ny + nx),
    }
}

fn mix(value: f32) -> i32 {
    let raw = (value * MAX_SPEED as f32).round() as i32;
    clamp_speed(raw)
}

/// Discrete power-limit selector (positions 1..=5)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerLimit(u8);

impl PowerLimit {
    pub const MIN_POSITION: u8 = 1;
    pub const MAX_POSITION: u8 = LIMIT_STEPS.len() as u8;

    /// Select a position, clamping out-of-range values onto the selector
    pub fn from_position(position: u8) -> Self {
        Self(position.clamp(Self::MIN_POSITION, Self::MAX_POSITION))
    }

    pub fn position(&self) -> u8 {
        self.0
    }

    pub fn factor(&self) -> f32 {
        LIMIT_STEPS[self.0.saturating_sub(1) as usize]
    }

    pub fn percent(&self) -> u32 {
        (self.factor() * 100.0).round() as u32
    }

    /// Scale a wheel speed by the limit
    pub fn apply(&self, speed: i32) -> i32 {
        (speed as f32 * self.factor()).round() as i32
    }
}

impl Default for PowerLimit {
    fn default() -> Self {
        Self(Self::MAX_POSITION)
    }
}
