//! Painting one stroke: touch down, stream the path at a fixed rate, lift off.

use std::time::Duration;

use nalgebra::Point2;
use tracing::{debug, trace};

use crate::cadence::{period, Cadence, Clock};
use crate::cancel::CancelToken;
use crate::contact::{ContactController, ContactOutcome};
use crate::frame::{project_canvas_point, CanvasFrame};
use crate::session::Session;
use crate::{Kinematics, LinearMotion, PainterError, Result, RobotInterface, ServoParams};

/// Canvas axis for [`SplineExecutor::draw_axis`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanvasAxis {
    X,
    Y,
}

impl CanvasAxis {
    fn point(self, length: f64) -> Point2<f64> {
        match self {
            Self::X => Point2::new(length, 0.0),
            Self::Y => Point2::new(0.0, length),
        }
    }
}

/// Length of the calibration stroke drawn by [`SplineExecutor::draw_axis`], m.
pub const AXIS_LENGTH: f64 = 0.03;

/// Summary of one painted stroke.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrokeReport {
    pub streamed: usize,
    pub contact_cycles: u64,
    pub overruns: u64,
}

#[derive(Debug, Clone)]
pub struct SplineExecutor {
    canvas: CanvasFrame,
    linear: LinearMotion,
    servo: ServoParams,
    rate_hz: f64,
    contact_force: f64,
    retract_offset: f64,
}

impl SplineExecutor {
    pub fn new(canvas: CanvasFrame, linear: LinearMotion) -> Self {
        Self {
            canvas,
            linear,
            servo: ServoParams::default(),
            rate_hz: 500.0,
            contact_force: -4.0,
            retract_offset: -0.02,
        }
    }

    pub fn with_servo(mut self, servo: ServoParams) -> Self {
        self.servo = servo;
        self
    }

    pub fn with_rate(mut self, rate_hz: f64) -> Self {
        self.rate_hz = rate_hz;
        self
    }

    pub fn with_contact_force(mut self, force: f64) -> Self {
        self.contact_force = force;
        self
    }

    pub fn with_retract_offset(mut self, offset: f64) -> Self {
        self.retract_offset = offset;
        self
    }

    pub fn canvas(&self) -> &CanvasFrame {
        &self.canvas
    }

    pub fn linear(&self) -> LinearMotion {
        self.linear
    }

    pub fn dt(&self) -> Duration {
        period(self.rate_hz)
    }

    /// Paint `points` in order.
    ///
    /// The tool moves at its current height to above the first point, pushes
    /// down until the contact force is reached and then follows the remaining
    /// points on the surface. Afterwards it lifts by the retraction offset
    /// with a blocking linear move.
    pub fn draw<R, K, C>(
        &self,
        session: &mut Session<R, K, C>,
        contact: &ContactController,
        points: &[Point2<f64>],
        cancel: &CancelToken,
    ) -> Result<StrokeReport>
    where
        R: RobotInterface,
        K: Kinematics,
        C: Clock,
    {
        let (first, rest) = points
            .split_first()
            .ok_or_else(|| PainterError::malformed(None, "trajectory has no points"))?;
        let last = rest.last().unwrap_or(first);

        session.guarded(|session| {
            let contact_cycles = self.touch_down(session, contact, first, cancel)?.cycles();

            let dt = self.dt();
            let mut cadence = Cadence::new(&session.clock, dt);
            for point in rest {
                cancel.check()?;
                cadence.begin(&session.clock);

                let telemetry = session.telemetry()?;
                let target =
                    project_canvas_point(&self.canvas, &telemetry.tool_transform(), point, 0.0);
                trace!(x = point.x, y = point.y, z = target.position.z, "stream point");
                session
                    .robot
                    .stream_pose(&target, &self.servo, dt)
                    .map_err(PainterError::communication)?;

                cadence.finish(&session.clock);
            }
            session
                .robot
                .stop_streaming()
                .map_err(PainterError::communication)?;

            self.lift_off(session, last)?;

            let report = StrokeReport {
                streamed: rest.len(),
                contact_cycles,
                overruns: cadence.overruns(),
            };
            debug!(
                streamed = report.streamed,
                overruns = report.overruns,
                "stroke finished"
            );
            Ok(report)
        })
    }

    /// Calibration stroke: touch down at the canvas origin and slide
    /// [`AXIS_LENGTH`] along one canvas axis with a linear move.
    pub fn draw_axis<R, K, C>(
        &self,
        session: &mut Session<R, K, C>,
        contact: &ContactController,
        axis: CanvasAxis,
        cancel: &CancelToken,
    ) -> Result<()>
    where
        R: RobotInterface,
        K: Kinematics,
        C: Clock,
    {
        let origin = Point2::origin();
        let end = axis.point(AXIS_LENGTH);
        session.guarded(|session| {
            self.touch_down(session, contact, &origin, cancel)?;

            let telemetry = session.telemetry()?;
            let target = project_canvas_point(&self.canvas, &telemetry.tool_transform(), &end, 0.0);
            session
                .robot
                .move_linear(&target, self.linear)
                .map_err(PainterError::communication)?;

            self.lift_off(session, &end)
        })
    }

    /// Move above `point` at the current tool height and search for contact.
    fn touch_down<R, K, C>(
        &self,
        session: &mut Session<R, K, C>,
        contact: &ContactController,
        point: &Point2<f64>,
        cancel: &CancelToken,
    ) -> Result<ContactOutcome>
    where
        R: RobotInterface,
        K: Kinematics,
        C: Clock,
    {
        let telemetry = session.telemetry()?;
        let approach = project_canvas_point(&self.canvas, &telemetry.tool_transform(), point, 0.0);
        debug!(
            x = approach.position.x,
            y = approach.position.y,
            z = approach.position.z,
            "approach"
        );
        session
            .robot
            .move_linear(&approach, self.linear)
            .map_err(PainterError::communication)?;

        contact
            .move_until_contact(session, self.contact_force, cancel)?
            .require_contact(self.contact_force)
    }

    fn lift_off<R, K, C>(&self, session: &mut Session<R, K, C>, point: &Point2<f64>) -> Result<()>
    where
        R: RobotInterface,
        K: Kinematics,
        C: Clock,
    {
        let telemetry = session.telemetry()?;
        let lift = project_canvas_point(
            &self.canvas,
            &telemetry.tool_transform(),
            point,
            self.retract_offset,
        );
        session
            .robot
            .move_linear(&lift, self.linear)
            .map_err(PainterError::communication)
    }
}
