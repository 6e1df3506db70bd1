//! Fixed-rate cycle discipline.
//!
//! A cycle that finishes early is padded with a sleep up to `dt`; a cycle
//! that overruns proceeds immediately. The backlog never carries over to the
//! next cycle.

use std::cell::Cell;
use std::time::{Duration, Instant};

/// Time source of the control loops.
pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// Wall clock backed by [`std::thread::sleep`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Virtual clock: `sleep` advances time instantly.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Cell<Duration>,
    slept: Cell<Duration>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Cell::new(Duration::ZERO),
            slept: Cell::new(Duration::ZERO),
        }
    }

    /// Simulate work taking `duration`.
    pub fn advance(&self, duration: Duration) {
        self.offset.set(self.offset.get() + duration);
    }

    pub fn elapsed(&self) -> Duration {
        self.offset.get()
    }

    /// Total time spent in `sleep`.
    pub fn total_slept(&self) -> Duration {
        self.slept.get()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.offset.get()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
        self.slept.set(self.slept.get() + duration);
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> Instant {
        (**self).now()
    }

    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration)
    }
}

/// Sleep needed to pad a cycle that took `elapsed` up to `dt`.
pub fn pad_duration(dt: Duration, elapsed: Duration) -> Duration {
    dt.saturating_sub(elapsed)
}

/// Control period for a rate in Hz.
pub fn period(rate_hz: f64) -> Duration {
    Duration::from_secs_f64(1.0 / rate_hz)
}

/// How a cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleEnd {
    pub busy: Duration,
    pub slept: Duration,
}

impl CycleEnd {
    pub fn overran(&self) -> bool {
        self.slept.is_zero()
    }
}

/// Cycle timer for one loop invocation.
///
/// The clock is passed per call so the loop can keep borrowing the rest of
/// its session mutably.
#[derive(Debug)]
pub struct Cadence {
    dt: Duration,
    started: Instant,
    cycle_start: Instant,
    cycles: u64,
    overruns: u64,
}

impl Cadence {
    pub fn new(clock: &impl Clock, dt: Duration) -> Self {
        let now = clock.now();
        Self {
            dt,
            started: now,
            cycle_start: now,
            cycles: 0,
            overruns: 0,
        }
    }

    pub fn dt(&self) -> Duration {
        self.dt
    }

    /// Mark the start of a cycle; returns the real time since the previous start.
    pub fn begin(&mut self, clock: &impl Clock) -> Duration {
        let previous_start = self.cycle_start;
        self.cycle_start = clock.now();
        self.cycles += 1;
        self.cycle_start.duration_since(previous_start)
    }

    /// Pad the current cycle up to `dt`.
    pub fn finish(&mut self, clock: &impl Clock) -> CycleEnd {
        let busy = clock.now().duration_since(self.cycle_start);
        let slept = pad_duration(self.dt, busy);
        if slept.is_zero() {
            self.overruns += 1;
            tracing::trace!(busy_us = busy.as_micros() as u64, "control cycle overran");
        } else {
            clock.sleep(slept);
        }
        CycleEnd { busy, slept }
    }

    /// Time since the loop was created.
    pub fn elapsed(&self, clock: &impl Clock) -> Duration {
        clock.now().duration_since(self.started)
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn overruns(&self) -> u64 {
        self.overruns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DT: Duration = Duration::from_millis(2);

    #[test]
    fn test_pad_duration() {
        assert_eq!(pad_duration(DT, Duration::from_micros(1500)), Duration::from_micros(500));
        assert_eq!(pad_duration(DT, Duration::from_micros(2500)), Duration::ZERO);
        assert_eq!(pad_duration(DT, DT), Duration::ZERO);
    }

    #[test]
    fn test_period() {
        assert_eq!(period(500.0), DT);
    }

    #[test]
    fn test_early_cycle_is_padded() {
        let clock = ManualClock::new();
        let mut cadence = Cadence::new(&clock, DT);

        cadence.begin(&clock);
        clock.advance(Duration::from_micros(1500));
        let end = cadence.finish(&clock);

        assert_eq!(end.busy, Duration::from_micros(1500));
        assert_eq!(end.slept, Duration::from_micros(500));
        assert!(!end.overran());
        assert_eq!(clock.elapsed(), DT);
    }

    #[test]
    fn test_overrun_cycle_does_not_sleep_or_compound() {
        let clock = ManualClock::new();
        let mut cadence = Cadence::new(&clock, DT);

        cadence.begin(&clock);
        clock.advance(Duration::from_micros(2500));
        let end = cadence.finish(&clock);
        assert_eq!(end.busy, Duration::from_micros(2500));
        assert_eq!(end.slept, Duration::ZERO);
        assert!(end.overran());

        // The next cycle gets a full period again.
        let since_previous = cadence.begin(&clock);
        assert_eq!(since_previous, Duration::from_micros(2500));
        clock.advance(Duration::from_micros(500));
        let end = cadence.finish(&clock);
        assert_eq!(end.slept, Duration::from_micros(1500));

        assert_eq!(cadence.cycles(), 2);
        assert_eq!(cadence.overruns(), 1);
        assert_eq!(clock.total_slept(), Duration::from_micros(1500));
    }

    #[test]
    fn test_begin_reports_actual_cycle_time() {
        let clock = ManualClock::new();
        let mut cadence = Cadence::new(&clock, DT);
        assert_eq!(cadence.begin(&clock), Duration::ZERO);
        cadence.finish(&clock);
        assert_eq!(cadence.begin(&clock), DT);
        assert_eq!(cadence.elapsed(&clock), DT);
    }
}
