// Speed ramping: moves current wheel speeds toward their targets
// by at most `step` per tick, so the base never jumps between speeds.

use crate::config::RAMP_STEP;

use super::mixer::WheelTarget;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeedRamper {
    step: i32,
}

impl SpeedRamper {
    pub fn new(step: i32) -> Self {
        Self { step: step.max(1) }
    }

    pub fn step(&self) -> i32 {
        self.step
    }

    /// Advance one wheel by a single tick, never overshooting the target
    pub fn advance(&self, current: i32, target: i32) -> i32 {
        if current < target {
            (current + self.step).min(target)
        } else if current > target {
            (current - self.step).max(target)
        } else {
            current
        }
    }

    /// Advance both wheels independently
    pub fn tick(&self, current: WheelTarget, target: WheelTarget) -> WheelTarget {
        WheelTarget {
            left: self.advance(current.left, target.left),
            right: self.advance(current.right, target.right),
        }
    }
}

impl Default for SpeedRamper {
    fn default() -> Self {
        Self::new(RAMP_STEP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reaches_full_speed_in_17_ticks() {
        let ramper = SpeedRamper::default();
        let mut current = 0;
        for tick in 1..=17 {
            current = ramper.advance(current, 255);
            assert!(current <= 255);
            if tick < 17 {
                assert!(current < 255, "reached target early at tick {}", tick);
            }
        }
        assert_eq!(current, 255);
        assert_eq!(ramper.advance(current, 255), 255);
    }

    #[test]
    fn test_never_overshoots() {
        let ramper = SpeedRamper::new(15);
        assert_eq!(ramper.advance(0, 10), 10);
        assert_eq!(ramper.advance(0, -7), -7);
        assert_eq!(ramper.advance(250, 255), 255);
        assert_eq!(ramper.advance(-250, -255), -255);
    }

    #[test]
    fn test_wheels_are_independent() {
        let ramper = SpeedRamper::default();
        let next = ramper.tick(WheelTarget::new(0, 100), WheelTarget::new(255, 0));
        assert_eq!(next, WheelTarget::new(15, 85));
    }

    #[test]
    fn test_reverse_direction() {
        let ramper = SpeedRamper::default();
        let mut current = 30;
        let mut ticks = 0;
        while current != -30 {
            current = ramper.advance(current, -30);
            ticks += 1;
        }
        assert_eq!(ticks, 4);
    }

    #[test]
    fn test_step_is_at_least_one() {
        assert_eq!(SpeedRamper::new(0).step(), 1);
    }
}
