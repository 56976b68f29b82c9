//! The cooperative fiber scheduler.
//!
//! One runtime per thread multiplexes many tasks onto that thread by
//! suspending and resuming stack-switched fibers. Tasks run until they
//! yield, hibernate, switch to another task, or finish; between drain
//! rounds the scheduler hands control to an external [`EventDriver`] so
//! outside wakeups (I/O, timers) can make suspended tasks runnable again.
//!
//! The run queue is drained in rounds bounded by a sentinel marker: fibers
//! that re-enqueue themselves during a round run in the next one, so a
//! yield-looping task cannot starve the driver.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use slab::Slab;

use crate::Interrupted;

mod context_switch;
mod driver;
mod fiber;
mod fls;
mod queue;
mod spawn;
mod stack;
mod task;
mod tls;

pub use driver::{EventDriver, ExitReason, IdleDriver};
pub use fls::TaskLocal;
pub use task::{set_task_event_hook, Task, TaskEvent, TaskEventHook};

use context_switch::Continuation;
use fiber::{FiberId, TaskFiber};
use queue::FiberQueue;
use spawn::TaskFuncInfo;
use stack::Stack;

#[cfg(target_pointer_width = "64")]
const DEFAULT_TASK_STACK_SIZE: usize = 16 * 1024 * 1024;
#[cfg(not(target_pointer_width = "64"))]
const DEFAULT_TASK_STACK_SIZE: usize = 512 * 1024;

static TASK_STACK_SIZE: AtomicUsize = AtomicUsize::new(DEFAULT_TASK_STACK_SIZE);

/// Sets the stack size for fibers allocated after this call. Stacks are
/// demand-paged, so generous sizes only consume address space up front.
pub fn set_task_stack_size(bytes: usize) {
    TASK_STACK_SIZE.store(bytes, Ordering::Relaxed);
}

fn task_stack_size() -> usize {
    TASK_STACK_SIZE.load(Ordering::Relaxed)
}

/// Identity of one runtime install, stamped into every handle it creates.
///
/// Each thread may host its own runtime, and a fiber id is only meaningful
/// inside the arena that allocated it; the identity check is what turns a
/// handle carried to the wrong runtime into a loud contract violation
/// instead of a silent read of an unrelated fiber. The default (zero) value
/// belongs to the null handle and never matches an installed runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub(crate) struct RuntimeId(u64);

impl RuntimeId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        RuntimeId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Per-thread scheduler state: the fiber arena, the runnable queue, and the
/// continuation of the thread context that drives them.
pub(crate) struct RuntimeState {
    pub(crate) id: RuntimeId,
    pub(crate) fibers: Slab<TaskFiber>,
    run_queue: FiberQueue,
    marker: FiberId,
    pub(crate) free_fibers: Vec<FiberId>,
    /// The fiber executing right now, while the thread is inside one.
    pub(crate) current: Option<FiberId>,
    /// Where suspending fibers return to: the drive loop, or whatever
    /// non-task code resumed them directly.
    scheduler_ctx: Continuation,
    /// Taken out for the duration of every driver call so the driver can
    /// call back into the runtime.
    event_driver: Option<Box<dyn EventDriver>>,
    pub(crate) event_loop_running: bool,
}

impl RuntimeState {
    fn new(event_driver: Box<dyn EventDriver>) -> Self {
        let mut fibers = Slab::new();
        let marker = FiberId(fibers.insert(TaskFiber::marker()));
        RuntimeState {
            id: RuntimeId::next(),
            fibers,
            run_queue: FiberQueue::new(),
            marker,
            free_fibers: Vec::new(),
            current: None,
            scheduler_ctx: Continuation::null(),
            event_driver: Some(event_driver),
            event_loop_running: false,
        }
    }

    fn alloc_fiber(&mut self) -> FiberId {
        let stack = Stack::new(task_stack_size()).expect("failed to allocate a fiber stack");
        // safety: fresh stack, and fiber_main never returns
        let continuation = unsafe { context_switch::prepare_stack(stack.base(), fiber::fiber_main) };
        FiberId(self.fibers.insert(TaskFiber::new(stack, continuation)))
    }

    pub(crate) fn dequeue_if_queued(&mut self, id: FiberId) {
        if self.fibers[id.0].queue.is_some() {
            self.run_queue.remove(&mut self.fibers, id);
        }
    }

    /// Handle operations only work on the thread whose runtime created the
    /// handle; a handle reaching any other runtime is a contract violation.
    pub(crate) fn assert_owns(&self, task: &Task) {
        assert_eq!(
            task.runtime, self.id,
            "handle belongs to a different runtime"
        );
    }
}

/// True when called from inside a running task.
pub(crate) fn in_task() -> bool {
    tls::try_runtime(|runtime| {
        runtime
            .current
            .map_or(false, |id| runtime.fibers[id.0].running)
    })
    .unwrap_or(false)
}

/// Jumps into a suspended fiber; returns when it suspends again.
fn resume_fiber(id: FiberId) {
    let (save, to) = tls::runtime(|runtime| {
        debug_assert!(runtime.current.is_none(), "resume while a fiber is running");
        runtime.current = Some(id);
        (
            &mut runtime.scheduler_ctx as *mut Continuation,
            &runtime.fibers[id.0].continuation as *const Continuation,
        )
    });
    // safety: both continuations are valid; the pointers target the
    // thread-local runtime state, which does not move while we switch
    unsafe { context_switch::jump(save, to) };
    tls::runtime(|runtime| runtime.current = None);
}

/// Suspends the current fiber back into the scheduler context.
pub(crate) fn suspend_current() {
    let (save, to) = tls::runtime(|runtime| {
        let id = runtime.current.expect("suspend outside a fiber");
        (
            &mut runtime.fibers[id.0].continuation as *mut Continuation,
            &runtime.scheduler_ctx as *const Continuation,
        )
    });
    // safety: the scheduler context is live; it resumed this fiber
    unsafe { context_switch::jump(save, to) };
}

/// Cooperatively yields to the other runnable tasks, enqueueing the current
/// task at the back of the run queue.
///
/// Checks for a pending interrupt both before suspending and after
/// resuming. Outside a task this is a no-op, as is yielding while already
/// scheduled to run (so wakeups are not double-booked).
pub fn yield_now() -> Result<(), Interrupted> {
    if !in_task() {
        return Ok(());
    }
    check_interrupt()?;
    if enqueue_current_at_back() {
        return Ok(());
    }
    let this = Task::current();
    task::emit_task_event(TaskEvent::Yield, this);
    suspend_current();
    task::emit_task_event(TaskEvent::Resume, this);
    check_interrupt()
}

/// [`yield_now`] without the interrupt checks; a pending interrupt stays
/// armed for the next interruptible suspension point.
pub fn yield_uninterruptible() {
    if !in_task() {
        return;
    }
    if enqueue_current_at_back() {
        return;
    }
    suspend_current();
}

/// Returns true when the current fiber was already queued.
fn enqueue_current_at_back() -> bool {
    tls::runtime(|runtime| {
        let id = runtime.current.unwrap();
        if runtime.fibers[id.0].queue.is_some() {
            return true;
        }
        let RuntimeState {
            run_queue, fibers, ..
        } = runtime;
        run_queue.push_back(fibers, id);
        false
    })
}

/// Suspends the current task without re-enqueueing it. The caller must have
/// arranged a wakeup (a wait list, [`switch_to`], an event emit).
///
/// Outside a task, drives one round of the event loop instead, so non-task
/// code can wait for tasks to make progress.
pub fn hibernate() {
    if in_task() {
        suspend_current();
    } else {
        schedule();
        let _ = drive_events(Some(Duration::ZERO));
    }
}

/// Immediately resumes `task`, scheduling the caller to run right after it.
///
/// A null or stale handle, or switching to the current task, is a no-op.
/// From outside a task the target is resumed directly, blocking the caller
/// until the target suspends.
pub fn switch_to(task: Task) {
    let Some(target) = task.fiber else { return };
    let live = tls::runtime(|runtime| {
        runtime.assert_owns(&task);
        runtime.fibers.get(target.0).map_or(false, |fiber| {
            fiber.generation == task.generation && (fiber.running || fiber.task_func.is_some())
        })
    });
    if !live {
        return;
    }

    if !in_task() {
        // un-book any pending wakeup; the direct resume supersedes it
        tls::runtime(|runtime| runtime.dequeue_if_queued(target));
        resume_fiber(target);
        return;
    }

    let current = tls::runtime(|runtime| runtime.current.unwrap());
    if current == target {
        return;
    }
    tls::runtime(|runtime| {
        // re-prioritize the target even if it was already scheduled, and
        // slot the caller in directly behind it
        runtime.dequeue_if_queued(target);
        runtime.dequeue_if_queued(current);
        let RuntimeState {
            run_queue, fibers, ..
        } = runtime;
        run_queue.push_front(fibers, current);
        run_queue.push_front(fibers, target);
    });
    suspend_current();
}

/// Consumes a pending interrupt on the current task, if any.
///
/// Wait primitives proxy through this at their suspension points; anything
/// else that wants to be cancellable can too.
pub fn check_interrupt() -> Result<(), Interrupted> {
    if !in_task() {
        return Ok(());
    }
    tls::runtime(|runtime| {
        let id = runtime.current.unwrap();
        let fiber = &mut runtime.fibers[id.0];
        if fiber.interrupt {
            fiber.interrupt = false;
            Err(Interrupted)
        } else {
            Ok(())
        }
    })
}

/// Like [`check_interrupt`], but invokes `cleanup` instead of surfacing the
/// interrupt as an error. For guard layers that must unwind by hand.
pub fn check_interrupt_or(cleanup: impl FnOnce()) {
    if check_interrupt().is_err() {
        cleanup();
    }
}

/// Schedules `task` to run if it is alive and not already queued or
/// running. Used by wait primitives to deliver wakeups; stale handles and
/// self-wakes are ignored.
pub(crate) fn wake(task: Task) {
    let Some(id) = task.fiber else { return };
    tls::runtime(|runtime| {
        runtime.assert_owns(&task);
        if runtime.current == Some(id) {
            return;
        }
        let Some(fiber) = runtime.fibers.get(id.0) else {
            return;
        };
        if fiber.generation != task.generation || !fiber.running || fiber.queue.is_some() {
            return;
        }
        let RuntimeState {
            run_queue, fibers, ..
        } = runtime;
        run_queue.push_back(fibers, id);
    });
}

/// Drains one round of the run queue: every fiber that was queued at round
/// entry is resumed at most once. Fibers enqueued during the round (a
/// yielding task re-queueing itself, wakeups) sit behind the round marker
/// and run next round. Returns whether the queue is non-empty afterwards.
pub fn schedule() -> bool {
    tls::runtime(|runtime| {
        let RuntimeState {
            run_queue,
            fibers,
            marker,
            ..
        } = runtime;
        run_queue.push_back(fibers, *marker);
    });
    loop {
        let next = tls::runtime(|runtime| {
            if runtime.run_queue.is_empty() {
                // the marker bounds the round, so this cannot happen unless
                // the queue was corrupted
                debug_assert!(false, "run queue lost its round marker");
                log::error!("run queue lost its round marker; abandoning the drain round");
                return None;
            }
            let RuntimeState {
                run_queue, fibers, ..
            } = runtime;
            Some(run_queue.pop_front(fibers))
        });
        match next {
            None => return false,
            Some(id) => {
                if tls::runtime(|runtime| id == runtime.marker) {
                    break;
                }
                resume_fiber(id);
            }
        }
    }
    tls::runtime(|runtime| !runtime.run_queue.is_empty())
}

/// Calls the event driver with the runtime borrow released, so the driver
/// can wake tasks.
fn drive_events(timeout: Option<Duration>) -> ExitReason {
    let mut driver = tls::runtime(|runtime| {
        runtime
            .event_driver
            .take()
            .expect("event driver re-entered the drive cycle")
    });
    let reason = driver.process_events(timeout);
    tls::runtime(|runtime| runtime.event_driver = Some(driver));
    reason
}

/// Drives tasks and events without blocking: alternates run-queue drain
/// rounds with non-blocking driver polls until the driver reports a
/// shutdown or nothing remains runnable.
pub fn process() -> ExitReason {
    let mut any_events = false;
    loop {
        schedule();
        let reason = drive_events(Some(Duration::ZERO));
        let queue_empty = tls::runtime(|runtime| runtime.run_queue.is_empty());
        match reason {
            ExitReason::Exited => return ExitReason::Exited,
            ExitReason::OutOfWaiters => {
                if queue_empty {
                    return ExitReason::OutOfWaiters;
                }
            }
            ExitReason::Timeout => {
                if queue_empty {
                    return if any_events {
                        ExitReason::Idle
                    } else {
                        ExitReason::Timeout
                    };
                }
            }
            ExitReason::Idle => {
                any_events = true;
                if queue_empty {
                    return ExitReason::Idle;
                }
            }
        }
    }
}

/// Like [`process`], but when nothing is runnable and no events are
/// pending, blocks in the driver once for the next event.
pub fn wait_and_process() -> ExitReason {
    match process() {
        ExitReason::Timeout => {}
        reason => return reason,
    }
    if let ExitReason::Exited = drive_events(None) {
        return ExitReason::Exited;
    }
    match process() {
        // the blocking call already waited a full deadline; report the
        // cycle as idle rather than looping the caller on timeouts
        ExitReason::Timeout => ExitReason::Idle,
        reason => reason,
    }
}

fn run_event_loop() -> ExitReason {
    tls::runtime(|runtime| runtime.event_loop_running = true);
    loop {
        match wait_and_process() {
            reason @ (ExitReason::Exited | ExitReason::OutOfWaiters) => {
                log::debug!("event loop finished: {reason:?}");
                return reason;
            }
            ExitReason::Timeout | ExitReason::Idle => {}
        }
    }
}

/// Spawns a task that calls `f(args)`, starting it immediately: the task
/// runs on its fiber until its first suspension point before `spawn`
/// returns. Fibers are pooled and reused across tasks.
///
/// The callable and arguments are moved into fixed inline buffers, so
/// spawning never heap-allocates. Callables are limited to two captured
/// machine words and argument payloads to 128 bytes, checked at compile
/// time:
///
/// ```
/// use weft::runtime::{spawn, start, IdleDriver};
///
/// start(
///     Box::new(IdleDriver),
///     |_: ()| {
///         spawn(
///             |payload: [u8; 128]| assert_eq!(payload[9], 9),
///             core::array::from_fn(|i| i as u8),
///         );
///     },
///     (),
/// );
/// ```
///
/// One byte over the limit fails to build:
///
/// ```compile_fail
/// use weft::runtime::{spawn, start, IdleDriver};
///
/// start(
///     Box::new(IdleDriver),
///     |_: ()| {
///         spawn(|payload: [u8; 129]| drop(payload), [0u8; 129]);
///     },
///     (),
/// );
/// ```
pub fn spawn<F, A>(f: F, args: A) -> Task
where
    F: FnOnce(A) + 'static,
    A: 'static,
{
    let info = TaskFuncInfo::pack(f, args);
    let task = tls::runtime(|runtime| {
        let id = runtime
            .free_fibers
            .pop()
            .unwrap_or_else(|| runtime.alloc_fiber());
        let fiber = &mut runtime.fibers[id.0];
        debug_assert!(fiber.task_func.is_none() && !fiber.running);
        fiber.task_func = Some(info);
        Task::of(id, fiber.generation, runtime.id)
    });
    task::emit_task_event(TaskEvent::PreStart, task);
    switch_to(task);
    task::emit_task_event(TaskEvent::PostStart, task);
    task
}

/// Installs a runtime on this thread, spawns `f(args)` as the root task,
/// and drives the event loop until the driver reports a shutdown or no
/// tasks and event sources remain. Returns the final [`ExitReason`].
///
/// Panics when a runtime is already running on this thread.
///
/// ```
/// use weft::runtime::{start, ExitReason, IdleDriver};
///
/// let exit = start(Box::new(IdleDriver), |greeting: &str| assert_eq!(greeting, "hi"), "hi");
/// assert_eq!(exit, ExitReason::OutOfWaiters);
/// ```
pub fn start<F, A>(event_driver: Box<dyn EventDriver>, f: F, args: A) -> ExitReason
where
    F: FnOnce(A) + 'static,
    A: 'static,
{
    tls::exclusive_runtime(RuntimeState::new(event_driver), || {
        spawn(f, args);
        run_event_loop()
    })
}
