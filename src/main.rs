//! Command-line entry point: paint a trajectory file, or draw a calibration
//! axis to check the canvas transform.

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use nalgebra::Vector3;
use tracing::{debug, info, warn};

use painter_rs::config::{PainterConfig, RobotBackend};
use painter_rs::frame::pose_above_surface;
use painter_rs::sequencer::ChannelGate;
use painter_rs::sim::{FixedRotation, SimConfig, SimulatedRobot, Surface};
use painter_rs::streaming::CanvasAxis;
use painter_rs::prelude::*;

#[derive(Parser)]
#[command(name = "painter")]
#[command(about = "Force-guided painting of planar strokes with a robot arm")]
#[command(version)]
struct Cli {
    /// Robot and canvas configuration (JSON)
    #[arg(short, long)]
    config: PathBuf,

    /// Strokes to paint (JSON)
    #[arg(short, long, required_unless_present = "axis")]
    trajectories: Option<PathBuf>,

    /// Also paint trajectories whose color is zero or negative
    #[arg(long)]
    all_colors: bool,

    /// Draw a short calibration stroke along one canvas axis instead of painting
    #[arg(long, value_enum)]
    axis: Option<Axis>,

    /// Abort if the operator does not confirm a color change within this many seconds
    #[arg(long)]
    operator_timeout: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum Axis {
    X,
    Y,
}

impl From<Axis> for CanvasAxis {
    fn from(axis: Axis) -> Self {
        match axis {
            Axis::X => CanvasAxis::X,
            Axis::Y => CanvasAxis::Y,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = PainterConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    painter_rs::init_logging(cli.verbose || config.verbose)?;

    let trajectories = match &cli.trajectories {
        Some(path) => Some(
            TrajectorySet::load(path).with_context(|| format!("loading {}", path.display()))?,
        ),
        None => None,
    };

    match config.robot {
        RobotBackend::Simulated => {
            let canvas = config.canvas_frame()?;
            let above = pose_above_surface(&canvas, config.height_padding + 0.05);
            let mut home = above;
            home.position += Vector3::new(0.0, 0.0, 0.2);
            let robot = SimulatedRobot::connect(SimConfig {
                joints: vec![0.0; config.home_position.len()],
                tcp_pose: above,
                home_pose: home,
                surface: Some(Surface {
                    height: canvas.origin().z,
                    stiffness: 2000.0,
                }),
                force_bias: Vector3::zeros(),
            })?;
            info!("using simulated robot");
            let session = Session::new(robot, FixedRotation::tool_down());
            run(session, &config, &cli, trajectories.as_ref())
        }
        RobotBackend::Franka => run_franka(&config, &cli, trajectories.as_ref()),
    }
}

#[cfg(feature = "franka")]
fn run_franka(config: &PainterConfig, cli: &Cli, trajectories: Option<&TrajectorySet>) -> Result<()> {
    use painter_rs::franka::{ConnectConfig, Franka};

    let robot = Franka::connect(ConnectConfig::new(config.ip.as_str()))?;
    let session = Session::new(robot, Franka::kinematics());
    run(session, config, cli, trajectories)
}

#[cfg(not(feature = "franka"))]
fn run_franka(_: &PainterConfig, _: &Cli, _: Option<&TrajectorySet>) -> Result<()> {
    bail!("this build has no Franka support, rebuild with `--features franka`")
}

fn run<R, K>(
    mut session: Session<R, K>,
    config: &PainterConfig,
    cli: &Cli,
    trajectories: Option<&TrajectorySet>,
) -> Result<()>
where
    R: RobotInterface,
    K: Kinematics,
{
    let executor = SplineExecutor::new(config.canvas_frame()?, config.linear_motion())
        .with_servo(config.servo)
        .with_rate(config.contact.rate_hz)
        .with_contact_force(config.contact_force)
        .with_retract_offset(config.retract_offset);
    let contact = ContactController::new(config.contact);
    let sequencer = DrawingSequencer::new(
        executor,
        contact,
        config.home_joints(),
        config.height_padding,
    )
    .force_all_colors(cli.all_colors);
    let cancel = CancelToken::new();

    sequencer.go_home(&mut session)?;
    sequencer.go_above_canvas(&mut session)?;

    if let Some(axis) = cli.axis {
        sequencer.reset_force_sensor(&mut session)?;
        sequencer
            .executor()
            .draw_axis(&mut session, sequencer.contact(), axis.into(), &cancel)?;
        sequencer.go_above_canvas(&mut session)?;
        sequencer.go_home(&mut session)?;
        return Ok(());
    }

    let Some(set) = trajectories else {
        bail!("no trajectories to paint");
    };
    info!(trajectories = set.len(), "starting drawing");

    let (sender, receiver) = channel();
    let mut gate = ChannelGate::new(receiver);
    if let Some(secs) = cli.operator_timeout {
        gate = gate.with_timeout(Duration::from_secs(secs));
    }
    spawn_operator_console(sender, gate.waiting(), cancel.clone());

    let outcome = sequencer.run(&mut session, set, &mut gate, &cancel);
    let report = sequencer.conclude(&mut session, outcome)?;
    info!(
        drawn = report.drawn.len(),
        skipped = report.skipped.len(),
        "done"
    );
    Ok(())
}

/// Read operator input from stdin.
///
/// At a color change an empty line continues and `q` aborts. While painting,
/// `q` cancels the run and other input is ignored.
fn spawn_operator_console(
    sender: Sender<OperatorDecision>,
    waiting: Arc<AtomicBool>,
    cancel: CancelToken,
) {
    thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            let quit = line.trim().eq_ignore_ascii_case("q");
            if !waiting.load(Ordering::SeqCst) {
                if quit {
                    warn!("cancelling the run");
                    cancel.cancel();
                } else {
                    debug!("no color change pending, input ignored");
                }
                continue;
            }
            let decision = if quit {
                OperatorDecision::Abort
            } else {
                OperatorDecision::Continue
            };
            if sender.send(decision).is_err() {
                break;
            }
        }
    });
}
