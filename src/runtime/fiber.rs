//! Reusable task fibers.
//!
//! A fiber is one execution stack that runs a sequence of task invocations.
//! Between tasks it parks in the scheduler's free-list with no work assigned;
//! a spawner hands it a [`TaskFuncInfo`] and resumes it. When an invocation
//! ends the fiber bumps its generation counter, which silently invalidates
//! every outstanding handle to the finished task.

use std::any::Any;
use std::hint;
use std::panic;
use std::rc::Rc;

use crate::sync::ManualEvent;

use super::context_switch::Continuation;
use super::fls::FlsStorage;
use super::queue::QueueId;
use super::spawn::TaskFuncInfo;
use super::stack::Stack;
use super::task::{self, Task, TaskEvent};
use super::tls;

/// Index of a fiber in the runtime's arena. Fibers are never removed, so an
/// id stays valid for the runtime's lifetime; pair it with the generation
/// counter to identify a single task instance.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct FiberId(pub(crate) usize);

pub(crate) struct TaskFiber {
    /// `None` only for the round marker, which is never resumed.
    pub(crate) stack: Option<Stack>,
    /// Where the fiber left off; valid while the fiber is suspended.
    pub(crate) continuation: Continuation,
    /// Incremented when a task instance ends. Handles carrying an older
    /// value refer to a terminated task and all their operations are no-ops.
    pub(crate) generation: u64,
    /// True from task start to task end.
    pub(crate) running: bool,
    /// Pending cancellation request, consumed at the next interruptible
    /// suspension point (or silently on task exit).
    pub(crate) interrupt: bool,
    pub(crate) prev: Option<FiberId>,
    pub(crate) next: Option<FiberId>,
    pub(crate) queue: Option<QueueId>,
    /// Broadcast when the current task instance ends; joiners wait here.
    pub(crate) on_exit: Rc<ManualEvent>,
    pub(crate) fls: Rc<FlsStorage>,
    /// The next invocation to run, set by the spawn layer.
    pub(crate) task_func: Option<TaskFuncInfo>,
}

impl TaskFiber {
    pub(crate) fn new(stack: Stack, continuation: Continuation) -> Self {
        TaskFiber {
            stack: Some(stack),
            continuation,
            generation: 0,
            running: false,
            interrupt: false,
            prev: None,
            next: None,
            queue: None,
            on_exit: Rc::new(ManualEvent::new()),
            fls: Rc::new(FlsStorage::new()),
            task_func: None,
        }
    }

    /// The sentinel inserted at the back of the run queue to bound one
    /// drain round. It owns no stack and is never resumed.
    pub(crate) fn marker() -> Self {
        TaskFiber {
            stack: None,
            continuation: Continuation::null(),
            generation: 0,
            running: false,
            interrupt: false,
            prev: None,
            next: None,
            queue: None,
            on_exit: Rc::new(ManualEvent::new()),
            fls: Rc::new(FlsStorage::new()),
            task_func: None,
        }
    }
}

/// Entry point of every fiber stack: run task invocations forever.
pub(crate) extern "C" fn fiber_main() -> ! {
    loop {
        // park until the spawn layer assigns work
        loop {
            let has_work = tls::runtime(|runtime| {
                let id = runtime.current.expect("fiber running without identity");
                runtime.fibers[id.0].task_func.is_some()
            });
            if has_work {
                break;
            }
            log::trace!("fiber resumed without work; parking again");
            super::suspend_current();
        }

        let (info, this) = tls::runtime(|runtime| {
            let runtime_id = runtime.id;
            let id = runtime.current.unwrap();
            let fiber = &mut runtime.fibers[id.0];
            fiber.running = true;
            let info = fiber.task_func.take().unwrap();
            let this = Task::of(id, fiber.generation, runtime_id);
            (info, this)
        });

        task::emit_task_event(TaskEvent::Start, this);

        // a task spawned before the event loop runs parks once first
        if !tls::runtime(|runtime| runtime.event_loop_running) {
            super::yield_uninterruptible();
        }

        let result = panic::catch_unwind(panic::AssertUnwindSafe(|| info.invoke()));
        hint::black_box(&result); // removing this causes a segfault in release mode

        match &result {
            Ok(()) => task::emit_task_event(TaskEvent::End, this),
            Err(payload) => {
                task::emit_task_event(TaskEvent::Fail, this);
                log::error!(
                    "task {} terminated with unhandled panic: {}",
                    this.debug_id(),
                    panic_message(payload.as_ref()),
                );
            }
        }
        drop(result);

        // task teardown: wake joiners, drop locals, invalidate handles
        let (on_exit, fls) = tls::runtime(|runtime| {
            let id = runtime.current.unwrap();
            let fiber = &mut runtime.fibers[id.0];
            fiber.interrupt = false;
            (fiber.on_exit.clone(), fiber.fls.clone())
        });
        on_exit.emit();
        tls::runtime(|runtime| {
            let id = runtime.current.unwrap();
            runtime.dequeue_if_queued(id);
        });
        fls.destroy_all();
        tls::runtime(|runtime| {
            let id = runtime.current.unwrap();
            let fiber = &mut runtime.fibers[id.0];
            fiber.running = false;
            fiber.generation += 1;
            runtime.free_fibers.push(id);
        });

        super::suspend_current();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
