//! Force-guided approach: drive the tool along its Z axis until the sensed
//! force reaches a target.
//!
//! The loop is a PD law on the force error with a saturated proportional
//! term. It runs at a fixed rate, commands world-frame velocities that expire
//! after one period, and gives up after a time budget.

use std::time::Duration;

use nalgebra::{Vector3, Vector6};
use serde::{Deserialize, Serialize};
use tracing::{debug, debug_span, info, trace, warn};

use crate::cadence::{period, Cadence, Clock};
use crate::cancel::CancelToken;
use crate::frame::tool_to_world_vector;
use crate::session::Session;
use crate::{Kinematics, PainterError, Result, RobotInterface};

/// Gains and limits of the contact search.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ContactGains {
    /// Proportional gain, (m/s)/N. Negative so that missing force drives the tool forward.
    pub kp: f64,
    /// Derivative gain, (m/s)/(N/s).
    pub kd: f64,
    /// Bound on the commanded tool speed, m/s.
    pub max_speed: f64,
    /// Force error below which contact is declared, N.
    pub deadband: f64,
    /// Acceleration limit handed to the velocity command, m/s^2.
    pub acceleration: f64,
    pub rate_hz: f64,
    /// Give up after this many seconds without contact.
    pub timeout_secs: f64,
}

impl Default for ContactGains {
    fn default() -> Self {
        Self {
            kp: -0.005,
            kd: -0.00001,
            max_speed: 0.07,
            deadband: 0.1,
            acceleration: 0.5,
            rate_hz: 500.0,
            timeout_secs: 15.0,
        }
    }
}

impl ContactGains {
    pub fn dt(&self) -> Duration {
        period(self.rate_hz)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs)
    }

    /// Cycle budget matching the timeout at the nominal rate.
    pub fn max_cycles(&self) -> u64 {
        (self.timeout_secs * self.rate_hz).ceil() as u64
    }
}

/// Per-invocation loop memory.
#[derive(Debug, Clone, Default)]
pub struct ControlLoopState {
    pub previous_error: Option<f64>,
    /// Real time since the previous cycle started.
    pub since_previous: Duration,
    /// Real time since the loop started.
    pub elapsed: Duration,
}

/// Terminal state of a contact search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ContactOutcome {
    Contacted {
        cycles: u64,
        /// Tool-frame Z force when contact was declared, N.
        force: f64,
        elapsed: Duration,
    },
    TimedOut {
        cycles: u64,
        last_error: f64,
        elapsed: Duration,
    },
}

impl ContactOutcome {
    pub fn is_contact(&self) -> bool {
        matches!(self, Self::Contacted { .. })
    }

    pub fn cycles(&self) -> u64 {
        match self {
            Self::Contacted { cycles, .. } | Self::TimedOut { cycles, .. } => *cycles,
        }
    }

    /// Turn a timeout into [`PainterError::ContactNotFound`].
    pub fn require_contact(self, target_force: f64) -> Result<Self> {
        match self {
            Self::Contacted { .. } => Ok(self),
            Self::TimedOut {
                cycles,
                last_error,
                elapsed,
            } => Err(PainterError::ContactNotFound {
                target_force,
                cycles,
                elapsed_ms: elapsed.as_millis() as u64,
                last_error,
            }),
        }
    }
}

fn saturate(value: f64, limit: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(-limit, limit)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ContactController {
    gains: ContactGains,
}

impl ContactController {
    pub fn new(gains: ContactGains) -> Self {
        Self { gains }
    }

    pub fn gains(&self) -> &ContactGains {
        &self.gains
    }

    /// One PD update; returns the tool-frame Z speed.
    ///
    /// The derivative uses the measured cycle time and is skipped on the
    /// first cycle. The sum is bounded by `max_speed` as well as the
    /// proportional term.
    pub fn velocity_command(&self, loop_state: &mut ControlLoopState, error: f64) -> f64 {
        let derivative = match loop_state.previous_error {
            Some(previous) if !loop_state.since_previous.is_zero() => {
                (error - previous) / loop_state.since_previous.as_secs_f64()
            }
            _ => 0.0,
        };
        loop_state.previous_error = Some(error);

        let proportional = saturate(self.gains.kp * error, self.gains.max_speed);
        let damping = self.gains.kd * derivative;
        saturate(proportional + damping, self.gains.max_speed)
    }

    /// Approach the surface until the tool-frame Z force reaches `target_force`.
    ///
    /// Always leaves the robot stopped. A search that runs out of budget is
    /// returned as [`ContactOutcome::TimedOut`], not as an error.
    pub fn move_until_contact<R, K, C>(
        &self,
        session: &mut Session<R, K, C>,
        target_force: f64,
        cancel: &CancelToken,
    ) -> Result<ContactOutcome>
    where
        R: RobotInterface,
        K: Kinematics,
        C: Clock,
    {
        let span = debug_span!("contact", target_force);
        let _enter = span.enter();

        let outcome = session.guarded(|session| {
            let outcome = self.search(session, target_force, cancel)?;
            session
                .robot
                .stop_velocity()
                .map_err(PainterError::communication)?;
            Ok(outcome)
        })?;

        match outcome {
            ContactOutcome::Contacted { cycles, force, .. } => {
                info!(cycles, force, "contact established");
            }
            ContactOutcome::TimedOut {
                cycles, last_error, ..
            } => {
                warn!(cycles, last_error, "no contact within budget");
            }
        }
        Ok(outcome)
    }

    fn search<R, K, C>(
        &self,
        session: &mut Session<R, K, C>,
        target_force: f64,
        cancel: &CancelToken,
    ) -> Result<ContactOutcome>
    where
        R: RobotInterface,
        K: Kinematics,
        C: Clock,
    {
        let dt = self.gains.dt();
        let timeout = self.gains.timeout();
        let max_cycles = self.gains.max_cycles();
        let mut cadence = Cadence::new(&session.clock, dt);
        let mut loop_state = ControlLoopState::default();
        let mut last_error = f64::NAN;

        loop {
            cancel.check()?;
            loop_state.since_previous = cadence.begin(&session.clock);
            loop_state.elapsed = cadence.elapsed(&session.clock);
            if loop_state.elapsed >= timeout || cadence.cycles() > max_cycles {
                return Ok(ContactOutcome::TimedOut {
                    cycles: cadence.cycles() - 1,
                    last_error,
                    elapsed: loop_state.elapsed,
                });
            }

            let telemetry = session.telemetry()?;
            let force = telemetry.force_tool().z;
            let error = target_force - force;
            last_error = error;

            if error.abs() < self.gains.deadband {
                debug!(overruns = cadence.overruns(), "force within deadband");
                return Ok(ContactOutcome::Contacted {
                    cycles: cadence.cycles(),
                    force,
                    elapsed: loop_state.elapsed,
                });
            }

            let speed = self.velocity_command(&mut loop_state, error);
            let world = tool_to_world_vector(&telemetry.rotation, &Vector3::new(0.0, 0.0, speed));
            let twist = Vector6::new(world.x, world.y, world.z, 0.0, 0.0, 0.0);
            trace!(force, error, speed, "contact cycle");

            session
                .robot
                .command_velocity(&twist, self.gains.acceleration, dt)
                .map_err(PainterError::communication)?;

            cadence.finish(&session.clock);
        }
    }
}
