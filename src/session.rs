//! Exclusive ownership of the robot for one run.

use nalgebra::{Matrix3, Vector3};
use tracing::warn;

use crate::cadence::{Clock, SystemClock};
use crate::frame::{world_to_tool_vector, Pose, ToolTransform};
use crate::{PainterError, Result, RobotInterface, RobotState};
use crate::Kinematics;

/// Telemetry of one control cycle, never cached across cycles.
#[derive(Debug, Clone)]
pub struct Telemetry {
    pub state: RobotState,
    /// Tool orientation from the kinematic model.
    pub rotation: Matrix3<f64>,
}

impl Telemetry {
    pub fn pose(&self) -> &Pose {
        &self.state.tcp_pose
    }

    pub fn force_world(&self) -> Vector3<f64> {
        self.state.wrench.fixed_rows::<3>(0).into_owned()
    }

    /// Force rotated into the tool frame.
    pub fn force_tool(&self) -> Vector3<f64> {
        world_to_tool_vector(&self.rotation, &self.force_world())
    }

    /// Tool placement; a degenerate rotation is logged here.
    pub fn tool_transform(&self) -> ToolTransform {
        let tool = ToolTransform::new(&self.state.tcp_pose, &self.rotation);
        if let Some(degeneracy) = tool.degeneracy() {
            warn!(
                determinant = degeneracy.determinant,
                orthonormality_error = degeneracy.orthonormality_error,
                "tool rotation is not orthonormal, using pseudo-inverse"
            );
        }
        tool
    }
}

/// Robot, kinematic model and clock held together for a whole run.
///
/// Every component borrows the session mutably, so motion commands are
/// strictly sequenced.
pub struct Session<R, K, C = SystemClock> {
    pub robot: R,
    pub kinematics: K,
    pub clock: C,
    /// Nesting depth of [`Session::guarded`] calls.
    guard_depth: usize,
}

impl<R, K> Session<R, K, SystemClock> {
    pub fn new(robot: R, kinematics: K) -> Self {
        Self {
            robot,
            kinematics,
            clock: SystemClock,
            guard_depth: 0,
        }
    }
}

impl<R, K, C> Session<R, K, C>
where
    R: RobotInterface,
    K: Kinematics,
    C: Clock,
{
    pub fn with_clock(robot: R, kinematics: K, clock: C) -> Self {
        Self {
            robot,
            kinematics,
            clock,
            guard_depth: 0,
        }
    }

    /// Refresh robot state and derive the tool orientation.
    pub fn telemetry(&mut self) -> Result<Telemetry> {
        let state = self.robot.read_state().map_err(PainterError::communication)?;
        let rotation = self.kinematics.rotation(&state.joints);
        Ok(Telemetry { state, rotation })
    }

    /// Bring the robot to rest after a failure, ignoring further errors.
    pub fn halt(&mut self) {
        if let Err(e) = self.robot.stop_velocity() {
            warn!(error = %e, "failed to stop velocity command");
        }
        if let Err(e) = self.robot.stop_streaming() {
            warn!(error = %e, "failed to stop pose stream");
        }
    }

    /// Run `step`; on a communication failure or cancellation, halt the robot before returning the error.
    ///
    /// Nested calls leave the halt to the outermost one, so a failure stops
    /// the robot once.
    pub fn guarded<T>(&mut self, step: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.guard_depth += 1;
        let result = step(self);
        self.guard_depth -= 1;
        match result {
            Err(e @ (PainterError::Communication { .. } | PainterError::Cancelled))
                if self.guard_depth == 0 =>
            {
                self.halt();
                Err(e)
            }
            other => other,
        }
    }
}
