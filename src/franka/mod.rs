//! Franka Emika arm through `libfranka-rs`.
//!
//! Joint moves and state reads use the robot directly. Velocity commands,
//! streamed poses and linear moves run inside a Cartesian velocity control
//! loop on a background thread that owns the robot until the motion is
//! stopped; commands reach it over a channel.

mod shaping;

use std::{
    sync::{
        mpsc::{channel, Sender, TryRecvError},
        Arc, Mutex,
    },
    thread::{self, spawn, JoinHandle},
    time::{Duration, Instant},
};

use franka::{
    exception::FrankaException, CartesianVelocities, MotionFinished, RealtimeConfig,
    RobotState as FrankaState,
};
use nalgebra::{Isometry3, Matrix4, Rotation3, Vector3, Vector6};
use thiserror::Error;
use tracing::{debug, info, warn};

use self::shaping::{Shaper, Target};
use crate::frame::Pose;
use crate::kinematics::DhChain;
use crate::{Connect, LinearMotion, RobotInterface, RobotState, ServoParams};

/// Control period of the realtime loop, s.
const CONTROL_PERIOD: f64 = 0.001;
/// Deceleration used when a command expires or a stop is requested, m/s^2.
const BRAKING: f64 = 1.0;
/// Fraction of the maximum joint speed used for joint moves.
const JOINT_SPEED_FACTOR: f64 = 0.2;
/// A linear move is done once within this distance of its target, m.
const POSITION_TOLERANCE: f64 = 5e-4;
const ORIENTATION_TOLERANCE: f64 = 5e-3;
/// Gain of the tracking law for linear moves, 1/s.
const LINEAR_MOVE_GAIN: f64 = 4.0;
/// Speed bound while tracking streamed poses, m/s.
const STREAM_SPEED_LIMIT: f64 = 0.25;
/// How often a linear move refreshes its target.
const LINEAR_MOVE_REFRESH: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum FrankaBackendError {
    #[error(transparent)]
    Franka(#[from] FrankaException),
    #[error("expected 7 joint values, got {0}")]
    JointCount(usize),
    #[error("control thread panicked")]
    ControlThreadLost,
    #[error("linear move did not converge within {0:?}")]
    MoveTimeout(Duration),
}

pub struct ConnectConfig {
    pub address: String,
    pub realtime: bool,
    pub logsize: Option<usize>,
}

impl ConnectConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            realtime: true,
            logsize: None,
        }
    }
}

enum ControlMsg {
    Target(Target),
    Stop,
}

/// Running velocity control loop.
struct ControlSession {
    sender: Sender<ControlMsg>,
    latest: Arc<Mutex<FrankaState>>,
    handle: JoinHandle<(franka::Robot, Result<(), FrankaException>)>,
}

enum Mode {
    Idle(franka::Robot),
    Moving(ControlSession),
    Lost,
}

pub struct Franka {
    mode: Mode,
    force_bias: Vector6<f64>,
}

fn isometry(o_t_ee: &[f64; 16]) -> Isometry3<f64> {
    let matrix = Matrix4::from_column_slice(o_t_ee);
    let rotation = Rotation3::from_matrix(&matrix.fixed_view::<3, 3>(0, 0).into_owned());
    Isometry3::from_parts(
        Vector3::new(o_t_ee[12], o_t_ee[13], o_t_ee[14]).into(),
        rotation.into(),
    )
}

fn pose_isometry(pose: &Pose) -> Isometry3<f64> {
    Isometry3::new(pose.position, pose.rotation)
}

impl Connect for Franka {
    type Config = ConnectConfig;
    type ConnectError = FrankaException;

    fn connect(connect_config: ConnectConfig) -> Result<Self, FrankaException> {
        let mut inner = franka::Robot::new(
            &connect_config.address,
            if connect_config.realtime {
                None
            } else {
                Some(RealtimeConfig::Ignore)
            },
            connect_config.logsize,
        )?;
        inner.set_collision_behavior(
            [100.; 7], [100.; 7], [100.; 7], [100.; 7], [100.; 6], [100.; 6], [100.; 6],
            [100.; 6],
        )?;
        info!(address = %connect_config.address, "connected to Franka");
        Ok(Franka {
            mode: Mode::Idle(inner),
            force_bias: Vector6::zeros(),
        })
    }
}

impl Franka {
    /// Kinematic model matching the reported joint angles.
    pub fn kinematics() -> DhChain {
        DhChain::panda()
    }

    fn raw_state(&mut self) -> Result<FrankaState, FrankaBackendError> {
        match &mut self.mode {
            Mode::Idle(robot) => Ok(robot.read_once()?),
            Mode::Moving(session) => Ok(session
                .latest
                .lock()
                .map_err(|_| FrankaBackendError::ControlThreadLost)?
                .clone()),
            Mode::Lost => Err(FrankaBackendError::ControlThreadLost),
        }
    }

    /// Start the velocity loop unless it is already running.
    fn ensure_moving(&mut self) -> Result<(), FrankaBackendError> {
        let mut robot = match std::mem::replace(&mut self.mode, Mode::Lost) {
            Mode::Idle(robot) => robot,
            moving @ Mode::Moving(_) => {
                self.mode = moving;
                return Ok(());
            }
            Mode::Lost => return Err(FrankaBackendError::ControlThreadLost),
        };
        let initial = match robot.read_once() {
            Ok(state) => state,
            Err(e) => {
                self.mode = Mode::Idle(robot);
                return Err(e.into());
            }
        };

        let (sender, receiver) = channel::<ControlMsg>();
        let latest = Arc::new(Mutex::new(initial));
        let shared = Arc::clone(&latest);
        debug!("starting velocity control");
        let handle = spawn(move || {
            let mut shaper = Shaper::new(BRAKING);
            let result = robot.control_cartesian_velocities(
                |state, _time| {
                    loop {
                        match receiver.try_recv() {
                            Ok(ControlMsg::Target(target)) => shaper.set_target(target),
                            Ok(ControlMsg::Stop) | Err(TryRecvError::Disconnected) => {
                                shaper.stop();
                                break;
                            }
                            Err(TryRecvError::Empty) => break,
                        }
                    }
                    if let Ok(mut latest) = shared.lock() {
                        *latest = state.clone();
                    }
                    let current = isometry(&state.O_T_EE);
                    let v = shaper.step(Instant::now(), &current, CONTROL_PERIOD);
                    let command = CartesianVelocities::new([v[0], v[1], v[2], v[3], v[4], v[5]], None);
                    if shaper.finished() {
                        command.motion_finished()
                    } else {
                        command
                    }
                },
                None,
                None,
                None,
            );
            (robot, result)
        });
        self.mode = Mode::Moving(ControlSession {
            sender,
            latest,
            handle,
        });
        Ok(())
    }

    fn send(&mut self, target: Target) -> Result<(), FrankaBackendError> {
        self.ensure_moving()?;
        if let Mode::Moving(session) = &self.mode {
            if session.sender.send(ControlMsg::Target(target)).is_ok() {
                return Ok(());
            }
        }
        // The loop ended on its own, most likely through a reflex.
        self.stop_motion()?;
        Err(FrankaBackendError::ControlThreadLost)
    }

    /// Ramp to rest, end the control loop and take the robot back.
    fn stop_motion(&mut self) -> Result<(), FrankaBackendError> {
        let session = match std::mem::replace(&mut self.mode, Mode::Lost) {
            Mode::Moving(session) => session,
            other => {
                self.mode = other;
                return Ok(());
            }
        };
        // A closed channel also stops the loop.
        let _ = session.sender.send(ControlMsg::Stop);
        let (mut robot, result) = session
            .handle
            .join()
            .map_err(|_| FrankaBackendError::ControlThreadLost)?;
        debug!("velocity control stopped");
        if let Err(e) = result {
            warn!(error = %e, "control loop ended with an error, recovering");
            let recovery = robot.automatic_error_recovery();
            self.mode = Mode::Idle(robot);
            recovery?;
            return Err(e.into());
        }
        self.mode = Mode::Idle(robot);
        Ok(())
    }
}

impl RobotInterface for Franka {
    type Error = FrankaBackendError;

    fn read_state(&mut self) -> Result<RobotState, FrankaBackendError> {
        let state = self.raw_state()?;
        let ee = isometry(&state.O_T_EE);
        Ok(RobotState {
            joints: state.q.to_vec(),
            tcp_pose: Pose::from_rotation(ee.translation.vector, &ee.rotation.to_rotation_matrix()),
            wrench: Vector6::from_row_slice(&state.O_F_ext_hat_K) - self.force_bias,
        })
    }

    fn stop_streaming(&mut self) -> Result<(), FrankaBackendError> {
        self.stop_motion()
    }

    fn stop_velocity(&mut self) -> Result<(), FrankaBackendError> {
        self.stop_motion()
    }

    fn move_joints(&mut self, joints: &[f64]) -> Result<(), FrankaBackendError> {
        let goal: [f64; 7] = joints
            .try_into()
            .map_err(|_| FrankaBackendError::JointCount(joints.len()))?;
        self.stop_motion()?;
        match &mut self.mode {
            Mode::Idle(robot) => Ok(robot.joint_motion(JOINT_SPEED_FACTOR, &goal)?),
            _ => Err(FrankaBackendError::ControlThreadLost),
        }
    }

    fn move_linear(&mut self, target: &Pose, motion: LinearMotion) -> Result<(), FrankaBackendError> {
        let goal = pose_isometry(target);
        let start = isometry(&self.raw_state()?.O_T_EE);
        let distance = (goal.translation.vector - start.translation.vector).norm();
        let budget = Duration::from_secs_f64(3.0 * distance / motion.speed + 2.0);
        let track = |until| Target::Track {
            pose: goal,
            gain: LINEAR_MOVE_GAIN,
            max_speed: motion.speed,
            acceleration: motion.acceleration,
            until,
        };

        if !motion.blocking {
            return self.send(track(Instant::now() + budget));
        }

        let started = Instant::now();
        loop {
            self.send(track(Instant::now() + LINEAR_MOVE_REFRESH * 10))?;
            thread::sleep(LINEAR_MOVE_REFRESH);
            let current = isometry(&self.raw_state()?.O_T_EE);
            let position_error = (goal.translation.vector - current.translation.vector).norm();
            let orientation_error = current.rotation.angle_to(&goal.rotation);
            if position_error < POSITION_TOLERANCE && orientation_error < ORIENTATION_TOLERANCE {
                return self.stop_motion();
            }
            if started.elapsed() > budget {
                self.stop_motion()?;
                return Err(FrankaBackendError::MoveTimeout(budget));
            }
        }
    }

    fn command_velocity(
        &mut self,
        twist: &Vector6<f64>,
        acceleration: f64,
        horizon: Duration,
    ) -> Result<(), FrankaBackendError> {
        self.send(Target::Twist {
            twist: *twist,
            acceleration,
            until: Instant::now() + horizon,
        })
    }

    /// Tracks the pose with a time constant of `servo.lookahead_time`.
    fn stream_pose(
        &mut self,
        target: &Pose,
        servo: &ServoParams,
        horizon: Duration,
    ) -> Result<(), FrankaBackendError> {
        self.send(Target::Track {
            pose: pose_isometry(target),
            gain: 1.0 / servo.lookahead_time.max(CONTROL_PERIOD),
            max_speed: STREAM_SPEED_LIMIT,
            acceleration: servo.acceleration,
            until: Instant::now() + horizon,
        })
    }

    fn zero_force_sensor(&mut self) -> Result<(), FrankaBackendError> {
        let state = self.raw_state()?;
        self.force_bias = Vector6::from_row_slice(&state.O_F_ext_hat_K);
        debug!(bias = ?self.force_bias.as_slice(), "external wrench bias updated");
        Ok(())
    }
}

impl Drop for Franka {
    fn drop(&mut self) {
        if let Err(e) = self.stop_motion() {
            warn!(error = %e, "failed to stop Franka on drop");
        }
    }
}
