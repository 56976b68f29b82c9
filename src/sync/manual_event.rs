//! A broadcast condition for tasks.

use std::cell::{Cell, RefCell};
use std::mem;

use crate::runtime::{self, Task};
use crate::Interrupted;

/// A broadcast condition: [`wait`](ManualEvent::wait) suspends the current
/// task until the next [`emit`](ManualEvent::emit), which wakes every
/// waiter at once.
///
/// Waits are re-checking loops keyed on an emit counter, so spurious wakeups
/// (a waker that fires after the waiter already moved on) are absorbed.
/// Waiting outside a task drives the event loop instead of suspending, which
/// lets non-task code block on task completion.
#[derive(Debug, Default)]
pub struct ManualEvent {
    emit_count: Cell<u64>,
    waiters: RefCell<Vec<Task>>,
}

impl ManualEvent {
    pub fn new() -> Self {
        ManualEvent::default()
    }

    /// Number of emits so far; waits complete when this advances.
    pub fn emit_count(&self) -> u64 {
        self.emit_count.get()
    }

    /// Suspends until the next emit. Interruptible.
    pub fn wait(&self) -> Result<(), Interrupted> {
        runtime::check_interrupt()?;
        self.wait_inner(true)
    }

    /// Suspends until the next emit, deferring any pending interrupt to the
    /// caller's next interruptible suspension point.
    pub fn wait_uninterruptible(&self) {
        let _ = self.wait_inner(false);
    }

    fn wait_inner(&self, interruptible: bool) -> Result<(), Interrupted> {
        let target = self.emit_count.get();
        while self.emit_count.get() == target {
            if runtime::in_task() {
                self.waiters.borrow_mut().push(Task::current());
            }
            runtime::hibernate();
            if interruptible {
                runtime::check_interrupt()?;
            }
        }
        Ok(())
    }

    /// Wakes every waiter registered since the last emit.
    pub fn emit(&self) {
        self.emit_count.set(self.emit_count.get().wrapping_add(1));
        let waiters = mem::take(&mut *self.waiters.borrow_mut());
        for task in waiters {
            runtime::wake(task);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use crate::runtime::{spawn, start, yield_now, IdleDriver};

    use super::*;

    #[test]
    fn emit_without_waiters_only_counts() {
        let event = ManualEvent::new();

        event.emit();
        event.emit();

        assert_eq!(event.emit_count(), 2);
    }

    #[test]
    fn emit_wakes_every_waiter() {
        let woken = Rc::new(Cell::new(0u32));

        start(
            Box::new(IdleDriver),
            |woken: Rc<Cell<u32>>| {
                let gate = Rc::new(ManualEvent::new());
                for _ in 0..2 {
                    spawn(
                        |(gate, woken): (Rc<ManualEvent>, Rc<Cell<u32>>)| {
                            gate.wait().unwrap();
                            woken.set(woken.get() + 1);
                        },
                        (gate.clone(), woken.clone()),
                    );
                }

                gate.emit();
                yield_now().unwrap();
            },
            woken.clone(),
        );

        assert_eq!(woken.get(), 2);
    }

    #[test]
    fn waiters_registered_after_emit_wait_for_the_next_one() {
        let stages = Rc::new(Cell::new((0u64, 0u64)));

        start(
            Box::new(IdleDriver),
            |stages: Rc<Cell<(u64, u64)>>| {
                let gate = Rc::new(ManualEvent::new());
                gate.emit(); // nobody is waiting yet

                let waiter = spawn(
                    |(gate, stages): (Rc<ManualEvent>, Rc<Cell<(u64, u64)>>)| {
                        let before = gate.emit_count();
                        gate.wait().unwrap();
                        stages.set((before, gate.emit_count()));
                    },
                    (gate.clone(), stages.clone()),
                );

                gate.emit();
                waiter.join().unwrap();
            },
            stages.clone(),
        );

        let (before, after) = stages.get();
        assert_eq!(before, 1);
        assert_eq!(after, 2);
    }
}
