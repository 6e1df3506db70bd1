use std::{thread::sleep, time::Duration};

use nalgebra::Vector6;
use painter_rs::{
    config::PainterConfig,
    franka::{ConnectConfig, Franka},
    prelude::*,
    streaming::CanvasAxis,
};

fn main() -> anyhow::Result<()> {
    let path = std::env::args().nth(1).unwrap_or_else(|| "config.json".into());
    let config = PainterConfig::load(&path)?;
    painter_rs::init_logging(true)?;

    let mut robot = Franka::connect(ConnectConfig {
        address: config.ip.clone(),
        realtime: false,
        logsize: None,
    })?;

    // Short jog up and back down to check the velocity loop.
    let up = Vector6::new(0.0, 0.0, 0.02, 0.0, 0.0, 0.0);
    for _ in 0..30 {
        robot.command_velocity(&up, 0.5, Duration::from_millis(150))?;
        sleep(Duration::from_secs_f64(0.1));
    }
    for _ in 0..30 {
        robot.command_velocity(&-up, 0.5, Duration::from_millis(150))?;
        sleep(Duration::from_secs_f64(0.1));
    }
    robot.stop_velocity()?;

    let mut session = Session::new(robot, Franka::kinematics());
    let executor = SplineExecutor::new(config.canvas_frame()?, config.linear_motion())
        .with_contact_force(config.contact_force)
        .with_retract_offset(config.retract_offset);
    let sequencer = DrawingSequencer::new(
        executor,
        ContactController::new(config.contact),
        config.home_joints(),
        config.height_padding,
    );
    let cancel = CancelToken::new();

    sequencer.go_above_canvas(&mut session)?;
    sequencer.reset_force_sensor(&mut session)?;
    for axis in [CanvasAxis::X, CanvasAxis::Y] {
        sequencer
            .executor()
            .draw_axis(&mut session, sequencer.contact(), axis, &cancel)?;
        sequencer.go_above_canvas(&mut session)?;
    }
    sequencer.go_home(&mut session)?;
    Ok(())
}
