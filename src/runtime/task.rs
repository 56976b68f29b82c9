//! Task handles.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::Interrupted;

use super::fiber::FiberId;
use super::tls;
use super::RuntimeId;

/// Lightweight handle to one task instance: a fiber plus the generation the
/// task started with. Handles stay valid forever; once the task ends the
/// generation no longer matches and every operation becomes a cheap no-op.
///
/// Handles are plain data and may be copied or sent anywhere, but their
/// operations only work on the thread whose runtime created the handle.
/// Each handle carries its creating runtime's identity, and using it with
/// no runtime or with a different one (another thread's, or a later install
/// on the same thread) panics instead of touching an unrelated fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Task {
    pub(crate) fiber: Option<FiberId>,
    pub(crate) generation: u64,
    pub(crate) runtime: RuntimeId,
}

impl Task {
    /// The task currently executing, or the null handle outside any task.
    pub fn current() -> Task {
        tls::try_runtime(|runtime| {
            runtime
                .current
                .filter(|id| runtime.fibers[id.0].running)
                .map(|id| Task::of(id, runtime.fibers[id.0].generation, runtime.id))
        })
        .flatten()
        .unwrap_or_default()
    }

    pub(crate) fn of(fiber: FiberId, generation: u64, runtime: RuntimeId) -> Task {
        Task {
            fiber: Some(fiber),
            generation,
            runtime,
        }
    }

    /// True for the default handle, which refers to no task.
    pub fn is_null(&self) -> bool {
        self.fiber.is_none()
    }

    /// True while the task instance this handle was taken from is alive.
    pub fn running(&self) -> bool {
        let Some(id) = self.fiber else { return false };
        tls::runtime(|runtime| {
            runtime.assert_owns(self);
            runtime
                .fibers
                .get(id.0)
                .map_or(false, |fiber| {
                    fiber.running && fiber.generation == self.generation
                })
        })
    }

    /// Blocks the calling task until this task instance ends. Returns
    /// immediately when the handle is null or stale.
    pub fn join(&self) -> Result<(), Interrupted> {
        let Some(id) = self.fiber else { return Ok(()) };
        loop {
            let on_exit = tls::runtime(|runtime| {
                runtime.assert_owns(self);
                runtime.fibers.get(id.0).and_then(|fiber| {
                    if fiber.running && fiber.generation == self.generation {
                        Some(fiber.on_exit.clone())
                    } else {
                        None
                    }
                })
            });
            match on_exit {
                None => return Ok(()),
                Some(on_exit) => on_exit.wait()?,
            }
        }
    }

    /// Requests cooperative cancellation: the task observes [`Interrupted`]
    /// at its next interruptible suspension point. No-op on a null or stale
    /// handle. A task must not interrupt itself, and interrupts cannot cross
    /// threads: the caller must be on the fiber's owning thread, anywhere
    /// else panics.
    pub fn interrupt(&self) {
        if !self.running() {
            // running() has already rejected a foreign-runtime handle; a
            // same-runtime stale handle is a silent no-op
            return;
        }
        assert_ne!(*self, Task::current(), "a task cannot interrupt itself");
        let id = self.fiber.unwrap();
        tls::runtime(|runtime| runtime.fibers[id.0].interrupt = true);
        // switch over so the target reaches its next suspension point now
        super::switch_to(*self);
    }

    /// Stable 4-character digest of this handle, for log correlation.
    pub fn debug_id(&self) -> String {
        let mut hasher = DefaultHasher::new();
        (self.fiber.map(|id| id.0), self.generation).hash(&mut hasher);
        let digest = hasher.finish().to_le_bytes();
        base64::encode_config(&digest[..3], base64::URL_SAFE_NO_PAD)
    }
}

/// Scheduling milestones reported to the debug hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEvent {
    /// Emitted by the spawner before the task first runs.
    PreStart,
    /// Emitted by the spawner after spawning returned.
    PostStart,
    /// The task invocation is about to begin on its fiber.
    Start,
    /// The task is about to yield control.
    Yield,
    /// The task resumed after a yield.
    Resume,
    /// The task invocation returned.
    End,
    /// The task invocation panicked.
    Fail,
}

/// Debug instrumentation hook. Must not panic.
pub type TaskEventHook = fn(TaskEvent, Task);

static TASK_EVENT_HOOK: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());

/// Installs (or with `None` removes) the process-global task event hook.
pub fn set_task_event_hook(hook: Option<TaskEventHook>) {
    let raw = match hook {
        Some(hook) => hook as *mut (),
        None => ptr::null_mut(),
    };
    TASK_EVENT_HOOK.store(raw, Ordering::Release);
}

pub(crate) fn emit_task_event(event: TaskEvent, task: Task) {
    let raw = TASK_EVENT_HOOK.load(Ordering::Acquire);
    if !raw.is_null() {
        // safety: only ever stores a TaskEventHook
        let hook: TaskEventHook = unsafe { mem::transmute(raw) };
        hook(event, task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_handle_is_default() {
        let task = Task::default();

        assert!(task.is_null());
        assert_eq!(task, Task::default());
    }

    #[test]
    fn current_outside_any_task_is_null() {
        assert!(Task::current().is_null());
    }

    #[test]
    fn debug_id_is_stable_and_short() {
        let runtime = RuntimeId::next();
        let task = Task::of(FiberId(3), 7, runtime);

        assert_eq!(task.debug_id(), task.debug_id());
        assert_eq!(task.debug_id().len(), 4);
        assert_ne!(task.debug_id(), Task::of(FiberId(3), 8, runtime).debug_id());
        assert_ne!(task.debug_id(), Task::default().debug_id());
    }
}
