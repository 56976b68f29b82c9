//! The event-driver seam.
//!
//! The scheduler multiplexes tasks; everything that can make a suspended
//! task runnable again from the outside world (sockets, timers, signals)
//! lives behind [`EventDriver`]. The scheduler alternates between draining
//! its run queue and handing control to the driver, and the driver's
//! [`ExitReason`] tells it whether to keep going.

use std::time::Duration;

/// Outcome of one event-processing call, and of the scheduler's drive cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// A manual shutdown was requested.
    Exited,
    /// No tasks or event sources remain.
    OutOfWaiters,
    /// The deadline elapsed without any event becoming ready.
    Timeout,
    /// Events were processed.
    Idle,
}

/// External source of wakeups, polled between run-queue drain rounds.
pub trait EventDriver {
    /// Processes pending events, blocking for at most `timeout`
    /// (`None` blocks until an event arrives).
    ///
    /// Implementations may wake tasks (for example by emitting a
    /// [`ManualEvent`](crate::sync::ManualEvent)) but must not re-enter the
    /// scheduler's drive cycle.
    fn process_events(&mut self, timeout: Option<Duration>) -> ExitReason;
}

/// Driver with no event sources, for programs that only run tasks.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdleDriver;

impl EventDriver for IdleDriver {
    fn process_events(&mut self, _timeout: Option<Duration>) -> ExitReason {
        ExitReason::OutOfWaiters
    }
}
