//! Drawing a whole [`TrajectorySet`], one color group after another.
//!
//! Between color groups the tool goes above the canvas, then home, and the
//! run waits for the operator to swap the brush. That wait is the only
//! human-in-the-loop point of a run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, info_span, warn};

use crate::cadence::Clock;
use crate::cancel::CancelToken;
use crate::contact::ContactController;
use crate::frame::{pose_above_surface, Pose};
use crate::session::Session;
use crate::streaming::{SplineExecutor, StrokeReport};
use crate::trajectory::TrajectorySet;
use crate::{Kinematics, PainterError, Result, RobotInterface};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorDecision {
    Continue,
    Abort,
}

/// Source of the operator's answer at a color change.
pub trait OperatorGate {
    /// Block until the operator has swapped from `from` to `to`.
    fn confirm_color_change(
        &mut self,
        from: i64,
        to: i64,
        cancel: &CancelToken,
    ) -> Result<OperatorDecision>;
}

impl<F> OperatorGate for F
where
    F: FnMut(i64, i64) -> OperatorDecision,
{
    fn confirm_color_change(
        &mut self,
        from: i64,
        to: i64,
        cancel: &CancelToken,
    ) -> Result<OperatorDecision> {
        cancel.check()?;
        Ok(self(from, to))
    }
}

/// Operator answers delivered over a channel.
///
/// The wait polls the cancel token; a closed channel counts as an abort.
#[derive(Debug)]
pub struct ChannelGate {
    receiver: Receiver<OperatorDecision>,
    poll: Duration,
    timeout: Option<Duration>,
    waiting: Arc<AtomicBool>,
}

impl ChannelGate {
    pub fn new(receiver: Receiver<OperatorDecision>) -> Self {
        Self {
            receiver,
            poll: Duration::from_millis(100),
            timeout: None,
            waiting: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Give up waiting after `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set while a color change is waiting for an answer.
    ///
    /// Lets the sending side tell an answer apart from input that arrives
    /// while the robot is painting.
    pub fn waiting(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.waiting)
    }

    fn wait(&mut self, cancel: &CancelToken) -> Result<OperatorDecision> {
        let started = Instant::now();
        loop {
            cancel.check()?;
            let wait = match self.timeout {
                Some(timeout) => {
                    let waited = started.elapsed();
                    if waited >= timeout {
                        return Err(PainterError::OperatorTimeout {
                            waited_ms: waited.as_millis() as u64,
                        });
                    }
                    self.poll.min(timeout - waited)
                }
                None => self.poll,
            };
            match self.receiver.recv_timeout(wait) {
                Ok(decision) => return Ok(decision),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Ok(OperatorDecision::Abort),
            }
        }
    }
}

impl OperatorGate for ChannelGate {
    fn confirm_color_change(
        &mut self,
        from: i64,
        to: i64,
        cancel: &CancelToken,
    ) -> Result<OperatorDecision> {
        info!(from, to, "waiting for operator to change color");
        self.waiting.store(true, Ordering::SeqCst);
        let decision = self.wait(cancel);
        self.waiting.store(false, Ordering::SeqCst);
        decision
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerState {
    Idle,
    ChangingColor { from: i64, to: i64 },
    Streaming { index: usize, color: i64 },
    Done,
}

/// What a finished run did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrawingReport {
    pub drawn: Vec<usize>,
    pub skipped: Vec<usize>,
    pub color_changes: Vec<(i64, i64)>,
    pub strokes: Vec<StrokeReport>,
    pub transitions: Vec<SequencerState>,
}

impl DrawingReport {
    fn enter(&mut self, state: SequencerState) {
        debug!(?state, "sequencer transition");
        self.transitions.push(state);
    }
}

#[derive(Debug, Clone)]
pub struct DrawingSequencer {
    executor: SplineExecutor,
    contact: ContactController,
    home_joints: Vec<f64>,
    above_canvas: Pose,
    force_all_colors: bool,
    settle: Duration,
}

impl DrawingSequencer {
    pub fn new(
        executor: SplineExecutor,
        contact: ContactController,
        home_joints: Vec<f64>,
        height_padding: f64,
    ) -> Self {
        let above_canvas = pose_above_surface(executor.canvas(), height_padding);
        Self {
            executor,
            contact,
            home_joints,
            above_canvas,
            force_all_colors: false,
            settle: Duration::from_secs(1),
        }
    }

    /// Also draw trajectories whose color is `<= 0`.
    pub fn force_all_colors(mut self, force: bool) -> Self {
        self.force_all_colors = force;
        self
    }

    /// Pause before and after zeroing the force sensor.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn executor(&self) -> &SplineExecutor {
        &self.executor
    }

    pub fn contact(&self) -> &ContactController {
        &self.contact
    }

    pub fn above_canvas(&self) -> &Pose {
        &self.above_canvas
    }

    pub fn go_home<R, K, C>(&self, session: &mut Session<R, K, C>) -> Result<()>
    where
        R: RobotInterface,
        K: Kinematics,
        C: Clock,
    {
        info!("going home");
        session.guarded(|session| {
            session
                .robot
                .stop_streaming()
                .map_err(PainterError::communication)?;
            session
                .robot
                .move_joints(&self.home_joints)
                .map_err(PainterError::communication)
        })
    }

    pub fn go_above_canvas<R, K, C>(&self, session: &mut Session<R, K, C>) -> Result<()>
    where
        R: RobotInterface,
        K: Kinematics,
        C: Clock,
    {
        info!("going above canvas");
        let linear = self.executor.linear();
        session.guarded(|session| {
            session
                .robot
                .stop_streaming()
                .map_err(PainterError::communication)?;
            session
                .robot
                .move_linear(&self.above_canvas, linear)
                .map_err(PainterError::communication)
        })
    }

    /// Zero the force sensor with the arm at rest.
    pub fn reset_force_sensor<R, K, C>(&self, session: &mut Session<R, K, C>) -> Result<()>
    where
        R: RobotInterface,
        K: Kinematics,
        C: Clock,
    {
        debug!("resetting force sensor");
        session.clock.sleep(self.settle);
        session
            .robot
            .zero_force_sensor()
            .map_err(PainterError::communication)?;
        session.clock.sleep(self.settle);
        Ok(())
    }

    /// Draw every trajectory of `set` in order.
    ///
    /// Stops at the first failed stroke. The tool is not sent home at the end.
    pub fn run<R, K, C>(
        &self,
        session: &mut Session<R, K, C>,
        set: &TrajectorySet,
        operator: &mut impl OperatorGate,
        cancel: &CancelToken,
    ) -> Result<DrawingReport>
    where
        R: RobotInterface,
        K: Kinematics,
        C: Clock,
    {
        let mut report = DrawingReport::default();
        report.enter(SequencerState::Idle);

        let result = session.guarded(|session| {
            self.run_inner(session, set, operator, cancel, &mut report)
        });
        match result {
            Ok(()) => {
                report.enter(SequencerState::Done);
                info!(
                    drawn = report.drawn.len(),
                    skipped = report.skipped.len(),
                    color_changes = report.color_changes.len(),
                    "drawing finished"
                );
                Ok(report)
            }
            Err(e) => {
                error!(error = %e, drawn = report.drawn.len(), "drawing stopped");
                Err(e)
            }
        }
    }

    /// Leave the canvas after [`DrawingSequencer::run`] and pass its outcome on.
    ///
    /// The tool goes above the canvas and home after a finished run, a missed
    /// contact or a cancellation. After an operator abort or timeout it is
    /// already home, and after a communication failure nothing more is sent,
    /// so those outcomes move nothing. The run's own error always wins over a
    /// failure while retracting.
    pub fn conclude<R, K, C>(
        &self,
        session: &mut Session<R, K, C>,
        outcome: Result<DrawingReport>,
    ) -> Result<DrawingReport>
    where
        R: RobotInterface,
        K: Kinematics,
        C: Clock,
    {
        let retract = match &outcome {
            Ok(_) => true,
            Err(e) => matches!(
                e,
                PainterError::ContactNotFound { .. } | PainterError::Cancelled
            ),
        };
        if !retract {
            return outcome;
        }

        let moved = self
            .go_above_canvas(session)
            .and_then(|()| self.go_home(session));
        match (outcome, moved) {
            (Ok(report), Ok(())) => Ok(report),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), moved) => {
                if let Err(retract_error) = moved {
                    warn!(error = %retract_error, "could not return home after a failed run");
                }
                Err(e)
            }
        }
    }

    fn run_inner<R, K, C>(
        &self,
        session: &mut Session<R, K, C>,
        set: &TrajectorySet,
        operator: &mut impl OperatorGate,
        cancel: &CancelToken,
        report: &mut DrawingReport,
    ) -> Result<()>
    where
        R: RobotInterface,
        K: Kinematics,
        C: Clock,
    {
        self.reset_force_sensor(session)?;

        let Some(first) = set.first() else {
            return Ok(());
        };
        let mut current_color = first.color();
        let total = set.len();

        for (index, trajectory) in set.iter().enumerate() {
            cancel.check()?;
            session
                .robot
                .zero_force_sensor()
                .map_err(PainterError::communication)?;

            let color = trajectory.color();
            if trajectory.is_sentinel() && !self.force_all_colors {
                debug!(index, color, "skipping trajectory");
                report.skipped.push(index);
                continue;
            }

            if color != current_color {
                report.enter(SequencerState::ChangingColor {
                    from: current_color,
                    to: color,
                });
                self.go_above_canvas(session)?;
                self.go_home(session)?;
                info!(finished = current_color, next = color, "color group done");
                match operator.confirm_color_change(current_color, color, cancel)? {
                    OperatorDecision::Continue => {}
                    OperatorDecision::Abort => {
                        return Err(PainterError::OperatorAbort {
                            from_color: current_color,
                            to_color: color,
                        });
                    }
                }
                report.color_changes.push((current_color, color));
                current_color = color;
                self.go_above_canvas(session)?;
            }

            report.enter(SequencerState::Streaming { index, color });
            let span = info_span!("trajectory", index, color);
            let _enter = span.enter();
            info!("trajectory {}/{}", index + 1, total);

            let stroke = self
                .executor
                .draw(session, &self.contact, trajectory.points(), cancel)?;
            report.drawn.push(index);
            report.strokes.push(stroke);
        }
        Ok(())
    }
}
