//! A cooperative, single-threaded fiber runtime.
//!
//! Many lightweight tasks are multiplexed onto one OS thread by suspending
//! and resuming stack-switched fibers. Scheduling is strictly cooperative: a
//! task runs until it yields, waits, or finishes, and external wakeups come
//! from a pluggable event driver polled between scheduling rounds.
//!
//! ```
//! use weft::runtime::{self, IdleDriver};
//!
//! let exit = runtime::start(
//!     Box::new(IdleDriver),
//!     |rounds: u32| {
//!         let child = runtime::spawn(
//!             |rounds: u32| {
//!                 for _ in 0..rounds {
//!                     runtime::yield_now().unwrap();
//!                 }
//!             },
//!             rounds,
//!         );
//!         child.join().unwrap();
//!     },
//!     3,
//! );
//! assert_eq!(exit, runtime::ExitReason::OutOfWaiters);
//! ```

pub mod runtime;
pub mod sync;

/// The current task was asked to stop.
///
/// Delivered by interruptible suspension points ([`runtime::yield_now`],
/// waits, joins) after another task called
/// [`Task::interrupt`](runtime::Task::interrupt) on this one. Catchable: a
/// task that handles the error keeps running, and a later interrupt re-arms
/// normally.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("task was interrupted")]
pub struct Interrupted;
