//! Kinematic stand-in for a robot arm.
//!
//! Positions jump to commanded targets, velocities are integrated over their
//! horizon and a horizontal spring plane produces contact force. Every
//! command is logged so runs can be inspected afterwards.

use std::time::Duration;

use nalgebra::{Matrix3, Vector3, Vector6};
use thiserror::Error;

use crate::frame::Pose;
use crate::{Connect, Kinematics, LinearMotion, RobotInterface, RobotState, ServoParams};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SimError {
    #[error("simulated link dropped after {0} state reads")]
    Disconnected(usize),
    #[error("expected {expected} joints, got {got}")]
    JointCount { expected: usize, got: usize },
}

/// Horizontal elastic plane at world height `height`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Surface {
    pub height: f64,
    /// N/m.
    pub stiffness: f64,
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub joints: Vec<f64>,
    pub tcp_pose: Pose,
    /// Where a joint move to any configuration leaves the tool.
    pub home_pose: Pose,
    pub surface: Option<Surface>,
    /// Constant force offset seen by the sensor until it is zeroed.
    pub force_bias: Vector3<f64>,
}

impl Default for SimConfig {
    fn default() -> Self {
        let down = Vector3::new(0.0, std::f64::consts::PI, 0.0);
        Self {
            joints: vec![0.0; 6],
            tcp_pose: Pose::new(Vector3::new(0.0, 0.0, 0.05), down),
            home_pose: Pose::new(Vector3::new(0.0, -0.3, 0.4), down),
            surface: Some(Surface {
                height: 0.0,
                stiffness: 2000.0,
            }),
            force_bias: Vector3::zeros(),
        }
    }
}

/// A command as received by the simulated robot.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    StopStreaming,
    StopVelocity,
    MoveJoints(Vec<f64>),
    MoveLinear {
        target: Pose,
        motion: LinearMotion,
    },
    Velocity {
        twist: Vector6<f64>,
        acceleration: f64,
        horizon: Duration,
    },
    StreamPose {
        target: Pose,
        horizon: Duration,
    },
    ZeroForceSensor,
}

#[derive(Debug, Clone)]
pub struct SimulatedRobot {
    config: SimConfig,
    joints: Vec<f64>,
    tcp: Pose,
    sensor_offset: Vector6<f64>,
    log: Vec<Command>,
    reads: usize,
    fail_reads_after: Option<usize>,
}

impl SimulatedRobot {
    pub fn new(config: SimConfig) -> Self {
        Self {
            joints: config.joints.clone(),
            tcp: config.tcp_pose,
            sensor_offset: Vector6::zeros(),
            log: Vec::new(),
            reads: 0,
            fail_reads_after: None,
            config,
        }
    }

    /// Make every state read after the first `reads` fail.
    pub fn fail_reads_after(mut self, reads: usize) -> Self {
        self.fail_reads_after = Some(reads);
        self
    }

    pub fn commands(&self) -> &[Command] {
        &self.log
    }

    pub fn tcp_pose(&self) -> Pose {
        self.tcp
    }

    pub fn joints(&self) -> &[f64] {
        &self.joints
    }

    /// Force the environment exerts on the tool, before sensor offset.
    fn raw_wrench(&self) -> Vector6<f64> {
        let mut force = self.config.force_bias;
        if let Some(surface) = self.config.surface {
            let depth = surface.height - self.tcp.position.z;
            if depth > 0.0 {
                force.z += surface.stiffness * depth;
            }
        }
        Vector6::new(force.x, force.y, force.z, 0.0, 0.0, 0.0)
    }
}

impl Connect for SimulatedRobot {
    type Config = SimConfig;
    type ConnectError = SimError;

    fn connect(connect_config: SimConfig) -> Result<Self, SimError> {
        Ok(Self::new(connect_config))
    }
}

impl RobotInterface for SimulatedRobot {
    type Error = SimError;

    fn read_state(&mut self) -> Result<RobotState, SimError> {
        if let Some(limit) = self.fail_reads_after {
            if self.reads >= limit {
                return Err(SimError::Disconnected(limit));
            }
        }
        self.reads += 1;
        Ok(RobotState {
            joints: self.joints.clone(),
            tcp_pose: self.tcp,
            wrench: self.raw_wrench() - self.sensor_offset,
        })
    }

    fn stop_streaming(&mut self) -> Result<(), SimError> {
        self.log.push(Command::StopStreaming);
        Ok(())
    }

    fn stop_velocity(&mut self) -> Result<(), SimError> {
        self.log.push(Command::StopVelocity);
        Ok(())
    }

    fn move_joints(&mut self, joints: &[f64]) -> Result<(), SimError> {
        if joints.len() != self.joints.len() {
            return Err(SimError::JointCount {
                expected: self.joints.len(),
                got: joints.len(),
            });
        }
        self.log.push(Command::MoveJoints(joints.to_vec()));
        self.joints = joints.to_vec();
        self.tcp = self.config.home_pose;
        Ok(())
    }

    fn move_linear(&mut self, target: &Pose, motion: LinearMotion) -> Result<(), SimError> {
        self.log.push(Command::MoveLinear {
            target: *target,
            motion,
        });
        self.tcp = *target;
        Ok(())
    }

    fn command_velocity(
        &mut self,
        twist: &Vector6<f64>,
        acceleration: f64,
        horizon: Duration,
    ) -> Result<(), SimError> {
        self.log.push(Command::Velocity {
            twist: *twist,
            acceleration,
            horizon,
        });
        self.tcp.position += twist.fixed_rows::<3>(0) * horizon.as_secs_f64();
        Ok(())
    }

    fn stream_pose(
        &mut self,
        target: &Pose,
        _servo: &ServoParams,
        horizon: Duration,
    ) -> Result<(), SimError> {
        self.log.push(Command::StreamPose {
            target: *target,
            horizon,
        });
        self.tcp = *target;
        Ok(())
    }

    fn zero_force_sensor(&mut self) -> Result<(), SimError> {
        self.log.push(Command::ZeroForceSensor);
        self.sensor_offset = self.raw_wrench();
        Ok(())
    }
}

/// Kinematic model reporting the same orientation for every configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedRotation(pub Matrix3<f64>);

impl FixedRotation {
    /// Tool Z pointing down the world Z axis.
    pub fn tool_down() -> Self {
        Self(Matrix3::new(-1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, -1.0))
    }
}

impl Kinematics for FixedRotation {
    fn rotation(&self, _joints: &[f64]) -> Matrix3<f64> {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_surface_pushes_back_when_pressed() {
        let mut robot = SimulatedRobot::new(SimConfig {
            tcp_pose: Pose::new(Vector3::new(0.0, 0.0, -0.002), Vector3::zeros()),
            ..Default::default()
        });
        let state = robot.read_state().unwrap();
        assert_relative_eq!(state.wrench[2], 4.0, epsilon = 1e-12);
    }

    #[test]
    fn test_zeroing_removes_bias() {
        let mut robot = SimulatedRobot::new(SimConfig {
            force_bias: Vector3::new(0.5, 0.0, -1.0),
            ..Default::default()
        });
        assert_relative_eq!(robot.read_state().unwrap().wrench[2], -1.0);
        robot.zero_force_sensor().unwrap();
        assert_relative_eq!(robot.read_state().unwrap().wrench.norm(), 0.0);
    }

    #[test]
    fn test_velocity_integrates_over_horizon() {
        let mut robot = SimulatedRobot::new(SimConfig::default());
        let start = robot.tcp_pose().position;
        robot
            .command_velocity(
                &Vector6::new(0.0, 0.0, -0.02, 0.0, 0.0, 0.0),
                0.5,
                Duration::from_millis(2),
            )
            .unwrap();
        assert_relative_eq!(robot.tcp_pose().position.z, start.z - 0.00004, epsilon = 1e-12);
    }

    #[test]
    fn test_read_failure_injection() {
        let mut robot = SimulatedRobot::new(SimConfig::default()).fail_reads_after(1);
        assert!(robot.read_state().is_ok());
        assert_eq!(robot.read_state(), Err(SimError::Disconnected(1)));
    }

    #[test]
    fn test_joint_move_goes_home() {
        let config = SimConfig::default();
        let home = config.home_pose;
        let mut robot = SimulatedRobot::new(config);
        robot.move_joints(&[0.1; 6]).unwrap();
        assert_eq!(robot.tcp_pose(), home);
        assert!(robot.move_joints(&[0.0; 7]).is_err());
    }
}
