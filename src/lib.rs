//! Force-guided painting on a planar canvas.
//!
//! The crate drives a robot arm tool into contact with a canvas and traces
//! pre-planned planar strokes across it, grouped by color with an operator
//! confirmation between color groups.
//!
//! Robots plug in through [`RobotInterface`] and [`Kinematics`]; a
//! [`session::Session`] owns both for the duration of a run.

use std::time::Duration;

use nalgebra::{Matrix3, Vector6};

pub mod cadence;
pub mod cancel;
pub mod config;
pub mod contact;
pub mod error;
#[cfg(feature = "franka")]
pub mod franka;
pub mod frame;
pub mod kinematics;
pub mod sequencer;
pub mod session;
pub mod sim;
pub mod streaming;
pub mod trajectory;

pub use error::{PainterError, Result};
pub use frame::Pose;

pub mod prelude {
    pub use crate::cadence::{Clock, ManualClock, SystemClock};
    pub use crate::cancel::CancelToken;
    pub use crate::contact::{ContactController, ContactGains, ContactOutcome};
    pub use crate::frame::{CanvasFrame, Pose, ToolTransform};
    pub use crate::sequencer::{DrawingSequencer, OperatorDecision, OperatorGate};
    pub use crate::session::Session;
    pub use crate::streaming::SplineExecutor;
    pub use crate::trajectory::{Trajectory, TrajectorySet};
    pub use crate::Connect;
    pub use crate::Kinematics;
    pub use crate::RobotInterface;
}

/// Backends that can be opened from a configuration value.
pub trait Connect: Sized {
    type Config;
    type ConnectError;
    fn connect(connect_config: Self::Config) -> std::result::Result<Self, Self::ConnectError>;
}

/// Snapshot of the robot produced by [`RobotInterface::read_state`].
#[derive(Debug, Clone, PartialEq)]
pub struct RobotState {
    /// Joint configuration in radians.
    pub joints: Vec<f64>,
    /// Tool center point in the world frame.
    pub tcp_pose: Pose,
    /// Force (N) and torque (Nm) at the tool, expressed in the world frame.
    pub wrench: Vector6<f64>,
}

/// Parameters of a point-to-point linear move.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearMotion {
    /// Tool speed in m/s.
    pub speed: f64,
    /// Tool acceleration in m/s^2.
    pub acceleration: f64,
    /// Wait for the move to finish before returning.
    pub blocking: bool,
}

impl LinearMotion {
    pub fn blocking(speed: f64, acceleration: f64) -> Self {
        Self {
            speed,
            acceleration,
            blocking: true,
        }
    }
}

/// Fixed tracking parameters of a streamed pose command.
#[derive(Debug, Clone, Copy, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct ServoParams {
    pub speed: f64,
    pub acceleration: f64,
    /// Look-ahead time in seconds used to smooth the streamed path.
    pub lookahead_time: f64,
    /// Proportional gain of the pose tracker.
    pub gain: f64,
}

impl Default for ServoParams {
    fn default() -> Self {
        Self {
            speed: 0.01,
            acceleration: 0.5,
            lookahead_time: 0.1,
            gain: 300.0,
        }
    }
}

/// Motion and telemetry surface of a robot arm.
///
/// Every call blocks until the backend has accepted (or, for blocking moves,
/// completed) the command. Any error is treated as fatal by the caller.
pub trait RobotInterface {
    type Error: std::error::Error + Send + Sync + 'static;

    fn read_state(&mut self) -> std::result::Result<RobotState, Self::Error>;

    /// Terminate an active pose stream.
    fn stop_streaming(&mut self) -> std::result::Result<(), Self::Error>;

    /// Decelerate an active velocity command to rest.
    fn stop_velocity(&mut self) -> std::result::Result<(), Self::Error>;

    /// Joint space move, always blocking.
    fn move_joints(&mut self, joints: &[f64]) -> std::result::Result<(), Self::Error>;

    fn move_linear(
        &mut self,
        target: &Pose,
        motion: LinearMotion,
    ) -> std::result::Result<(), Self::Error>;

    /// Cartesian twist in the world frame, valid for `horizon` only.
    fn command_velocity(
        &mut self,
        twist: &Vector6<f64>,
        acceleration: f64,
        horizon: Duration,
    ) -> std::result::Result<(), Self::Error>;

    /// Streamed pose target, superseded by the next call or expiring after `horizon`.
    fn stream_pose(
        &mut self,
        target: &Pose,
        servo: &ServoParams,
        horizon: Duration,
    ) -> std::result::Result<(), Self::Error>;

    fn zero_force_sensor(&mut self) -> std::result::Result<(), Self::Error>;
}

/// Maps a joint configuration to the tool orientation in the world frame.
pub trait Kinematics {
    fn rotation(&self, joints: &[f64]) -> Matrix3<f64>;
}

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence; otherwise `info`, or `debug` when `verbose`.
pub fn init_logging(verbose: bool) -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let default_level = if verbose { "debug" } else { "info" };
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_level)?,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true).with_level(true))
        .try_init()?;

    Ok(())
}
