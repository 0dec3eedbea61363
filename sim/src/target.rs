//! Target trajectory models and state propagation.
//!
//! Each target has a true planar state [px, py, vx, vy] and a `MotionSpec`
//! describing how it moves. The simulator steps each target forward in time.

use serde::{Deserialize, Serialize};

/// Describes target motion.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum MotionSpec {
    /// Constant velocity: no acceleration.
    ConstantVelocity,
    /// Constant turn rate. `omega` = yaw rate (rad/s).
    ConstantTurn { omega: f64 },
    /// Constant acceleration. `ax, ay` in units/s².
    ConstantAccel { ax: f64, ay: f64 },
    /// Switch motion model at given sim times.
    /// `segments` is sorted by time ascending: [(t_start, MotionSpec), ...].
    /// The active model is the last one whose t_start <= current_t.
    Segmented { segments: Vec<(f64, MotionSpec)> },
}

impl MotionSpec {
    /// Model in force at `t`; `None` before the first segment (coast as CV).
    fn active(&self, t: f64) -> Option<&MotionSpec> {
        match self {
            MotionSpec::Segmented { segments } => segments
                .iter()
                .filter(|(t_start, _)| *t_start <= t)
                .last()
                .and_then(|(_, m)| m.active(t)),
            other => Some(other),
        }
    }
}

/// A simulated target with ground-truth state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Target {
    /// Unique target ID (ground truth label)
    pub id: u64,
    /// True state [px, py, vx, vy]
    pub state: [f64; 4],
    pub motion: MotionSpec,
    /// Optional: target disappears at this time
    pub disappear_at: Option<f64>,
    /// Optional: target appears at this time (no detections before)
    pub appear_at: Option<f64>,
}

impl Target {
    pub fn new(id: u64, position: [f64; 2], velocity: [f64; 2], motion: MotionSpec) -> Self {
        Self {
            id,
            state: [position[0], position[1], velocity[0], velocity[1]],
            motion,
            disappear_at: None,
            appear_at: None,
        }
    }

    /// Restrict the target to `[appear, disappear)`.
    pub fn visible_between(mut self, appear: Option<f64>, disappear: Option<f64>) -> Self {
        self.appear_at = appear;
        self.disappear_at = disappear;
        self
    }

    /// Propagate true state by `dt` seconds according to its motion model.
    pub fn step(&mut self, t: f64, dt: f64) {
        let s = &mut self.state;
        match self.motion.active(t) {
            None | Some(MotionSpec::ConstantVelocity) | Some(MotionSpec::Segmented { .. }) => {
                s[0] += s[2] * dt;
                s[1] += s[3] * dt;
            }
            Some(MotionSpec::ConstantTurn { omega }) => {
                let v = s[2].hypot(s[3]);
                let heading = s[3].atan2(s[2]);
                let new_heading = heading + omega * dt;
                s[0] += v * heading.cos() * dt;
                s[1] += v * heading.sin() * dt;
                s[2] = v * new_heading.cos();
                s[3] = v * new_heading.sin();
            }
            Some(MotionSpec::ConstantAccel { ax, ay }) => {
                s[0] += s[2] * dt + 0.5 * ax * dt * dt;
                s[1] += s[3] * dt + 0.5 * ay * dt * dt;
                s[2] += ax * dt;
                s[3] += ay * dt;
            }
        }
    }

    /// True if target is active at time `t`.
    pub fn is_active(&self, t: f64) -> bool {
        if let Some(appear) = self.appear_at {
            if t < appear {
                return false;
            }
        }
        if let Some(disappear) = self.disappear_at {
            if t >= disappear {
                return false;
            }
        }
        true
    }

    pub fn position(&self) -> [f64; 2] {
        [self.state[0], self.state[1]]
    }

    pub fn velocity(&self) -> [f64; 2] {
        [self.state[2], self.state[3]]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn constant_velocity_step() {
        let mut t = Target::new(0, [0.0, 0.0], [2.0, -1.0], MotionSpec::ConstantVelocity);
        t.step(0.0, 0.5);
        assert_eq!(t.position(), [1.0, -0.5]);
    }

    #[test]
    fn turn_preserves_speed() {
        let mut t = Target::new(0, [0.0, 0.0], [3.0, 4.0], MotionSpec::ConstantTurn { omega: 0.3 });
        for i in 0..20 {
            t.step(i as f64 * 0.1, 0.1);
        }
        let v = t.velocity();
        assert_abs_diff_eq!(v[0].hypot(v[1]), 5.0, epsilon = 1e-9);
    }

    #[test]
    fn segments_switch_models() {
        let motion = MotionSpec::Segmented {
            segments: vec![
                (0.0, MotionSpec::ConstantVelocity),
                (1.0, MotionSpec::ConstantAccel { ax: 2.0, ay: 0.0 }),
            ],
        };
        let mut t = Target::new(0, [0.0, 0.0], [1.0, 0.0], motion);
        t.step(0.0, 1.0);
        assert_eq!(t.velocity(), [1.0, 0.0]);
        t.step(1.0, 1.0);
        assert_eq!(t.velocity(), [3.0, 0.0]);
    }

    #[test]
    fn visibility_window() {
        let t = Target::new(0, [0.0, 0.0], [0.0, 0.0], MotionSpec::ConstantVelocity)
            .visible_between(Some(2.0), Some(5.0));
        assert!(!t.is_active(1.0));
        assert!(t.is_active(2.0));
        assert!(!t.is_active(5.0));
    }
}
