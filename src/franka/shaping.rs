//! Turns the latest command into a rate-limited Cartesian velocity for every
//! 1 kHz tick of the control thread.

use std::time::Instant;

use nalgebra::{Isometry3, Vector3, Vector6};

/// Angular speed bound while tracking a pose, rad/s.
const MAX_ANGULAR_SPEED: f64 = 0.5;
/// Angular acceleration bound, rad/s^2.
const ANGULAR_ACCELERATION: f64 = 2.0;
/// Commanded speeds below this count as rest.
const REST_SPEED: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Target {
    Rest,
    Twist {
        twist: Vector6<f64>,
        acceleration: f64,
        until: Instant,
    },
    Track {
        pose: Isometry3<f64>,
        /// Inverse time constant of the tracking law, 1/s.
        gain: f64,
        max_speed: f64,
        acceleration: f64,
        until: Instant,
    },
}

/// Velocity state of one control session.
#[derive(Debug, Clone)]
pub(crate) struct Shaper {
    command: Vector6<f64>,
    target: Target,
    stopping: bool,
    /// Acceleration used while ramping down to rest.
    braking: f64,
}

fn clamp_norm(v: Vector3<f64>, limit: f64) -> Vector3<f64> {
    let norm = v.norm();
    if norm > limit && norm > 0.0 {
        v * (limit / norm)
    } else {
        v
    }
}

fn linear(v: &Vector6<f64>) -> Vector3<f64> {
    v.fixed_rows::<3>(0).into_owned()
}

fn angular(v: &Vector6<f64>) -> Vector3<f64> {
    v.fixed_rows::<3>(3).into_owned()
}

fn join(linear: Vector3<f64>, angular: Vector3<f64>) -> Vector6<f64> {
    Vector6::new(
        linear.x, linear.y, linear.z, angular.x, angular.y, angular.z,
    )
}

impl Shaper {
    pub(crate) fn new(braking: f64) -> Self {
        Self {
            command: Vector6::zeros(),
            target: Target::Rest,
            stopping: false,
            braking,
        }
    }

    pub(crate) fn set_target(&mut self, target: Target) {
        if !self.stopping {
            self.target = target;
        }
    }

    /// Ramp to rest and finish the session.
    pub(crate) fn stop(&mut self) {
        self.stopping = true;
        self.target = Target::Rest;
    }

    /// The session may end once a stop was requested and the arm is at rest.
    pub(crate) fn finished(&self) -> bool {
        self.stopping && self.command.norm() < REST_SPEED
    }

    pub(crate) fn command(&self) -> Vector6<f64> {
        self.command
    }

    /// Advance by `dt` seconds with the arm at `current`.
    pub(crate) fn step(&mut self, now: Instant, current: &Isometry3<f64>, dt: f64) -> Vector6<f64> {
        let (desired, acceleration) = match self.target {
            Target::Twist {
                twist,
                acceleration,
                until,
            } if now < until => (twist, acceleration),
            Target::Track {
                pose,
                gain,
                max_speed,
                acceleration,
                until,
            } if now < until => {
                let position_error = pose.translation.vector - current.translation.vector;
                let rotation_error = (pose.rotation * current.rotation.inverse()).scaled_axis();
                (
                    join(
                        clamp_norm(position_error * gain, max_speed),
                        clamp_norm(rotation_error * gain, MAX_ANGULAR_SPEED),
                    ),
                    acceleration,
                )
            }
            Target::Rest => (Vector6::zeros(), self.braking),
            _ => {
                self.target = Target::Rest;
                (Vector6::zeros(), self.braking)
            }
        };

        let linear_step = clamp_norm(
            linear(&desired) - linear(&self.command),
            acceleration * dt,
        );
        let angular_step = clamp_norm(
            angular(&desired) - angular(&self.command),
            ANGULAR_ACCELERATION * dt,
        );
        self.command += join(linear_step, angular_step);
        self.command
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::time::Duration;

    const DT: f64 = 0.001;

    fn twist_target(vz: f64, horizon: Duration) -> Target {
        Target::Twist {
            twist: Vector6::new(0.0, 0.0, vz, 0.0, 0.0, 0.0),
            acceleration: 1.0,
            until: Instant::now() + horizon,
        }
    }

    #[test]
    fn test_ramps_up_within_acceleration() {
        let mut shaper = Shaper::new(1.0);
        shaper.set_target(twist_target(0.05, Duration::from_secs(60)));
        let now = Instant::now();
        let first = shaper.step(now, &Isometry3::identity(), DT);
        assert_relative_eq!(first.z, 0.001, epsilon = 1e-12);
        for _ in 0..100 {
            shaper.step(now, &Isometry3::identity(), DT);
        }
        assert_relative_eq!(shaper.command().z, 0.05, epsilon = 1e-12);
    }

    #[test]
    fn test_expired_twist_brakes_to_rest() {
        let mut shaper = Shaper::new(1.0);
        shaper.set_target(twist_target(0.01, Duration::from_secs(60)));
        let now = Instant::now();
        for _ in 0..20 {
            shaper.step(now, &Isometry3::identity(), DT);
        }
        let later = now + Duration::from_secs(120);
        for _ in 0..20 {
            shaper.step(later, &Isometry3::identity(), DT);
        }
        assert_eq!(shaper.command(), Vector6::zeros());
        assert!(!shaper.finished());
        shaper.stop();
        assert!(shaper.finished());
    }

    #[test]
    fn test_tracking_moves_toward_target() {
        let mut shaper = Shaper::new(1.0);
        shaper.set_target(Target::Track {
            pose: Isometry3::translation(0.1, 0.0, 0.0),
            gain: 10.0,
            max_speed: 0.05,
            acceleration: 100.0,
            until: Instant::now() + Duration::from_secs(60),
        });
        let command = shaper.step(Instant::now(), &Isometry3::identity(), DT);
        assert_relative_eq!(command.x, 0.05, epsilon = 1e-12);
        assert_relative_eq!(command.y, 0.0);
    }

    #[test]
    fn test_stop_ignores_later_targets() {
        let mut shaper = Shaper::new(1.0);
        shaper.stop();
        shaper.set_target(twist_target(0.05, Duration::from_secs(60)));
        let command = shaper.step(Instant::now(), &Isometry3::identity(), DT);
        assert_eq!(command, Vector6::zeros());
        assert!(shaper.finished());
    }
}
