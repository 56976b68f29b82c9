//! Thread-local access to the runtime state.

use std::cell::RefCell;

/// Cache padded to avoid a potential performance hit due to false sharing.
#[repr(align(128))]
struct Runtime(RefCell<Option<super::RuntimeState>>);

thread_local! {
    /// Each thread hosts at most one runtime.
    static RUNTIME: Runtime = Runtime(RefCell::new(None));
}

/// Installs `state` as this thread's runtime for the duration of the closure.
pub(crate) fn exclusive_runtime<T>(state: super::RuntimeState, f: impl FnOnce() -> T) -> T {
    RUNTIME.with(|thread_local| {
        let mut cell = thread_local.0.borrow_mut();
        assert!(
            cell.is_none(),
            "a runtime is already running on this thread"
        );
        *cell = Some(state);
    });

    let output = f();

    RUNTIME.with(|thread_local| {
        // take first, drop after the borrow is released: dropping the state
        // runs fiber-local destructors that may look the runtime up again
        let state = thread_local.0.borrow_mut().take();
        drop(state);
    });

    output
}

/// Runs a closure with a reference to the active runtime state.
///
/// Panics when the thread has no runtime. This alone does not pin a task
/// handle to its owning thread, since another thread may host a runtime of
/// its own: callers resolving a handle's fiber id must also verify the
/// handle's runtime identity (`RuntimeState::assert_owns`) before indexing
/// the arena.
pub(crate) fn runtime<T>(f: impl FnOnce(&mut super::RuntimeState) -> T) -> T {
    RUNTIME.with(|thread_local| {
        let mut cell = thread_local.0.borrow_mut();
        let runtime = cell.as_mut().expect("no runtime running on this thread");
        f(runtime)
    })
}

/// Like [`runtime`], but returns `None` instead of panicking when the thread
/// has no runtime.
pub(crate) fn try_runtime<T>(f: impl FnOnce(&mut super::RuntimeState) -> T) -> Option<T> {
    RUNTIME.with(|thread_local| {
        let mut cell = thread_local.0.borrow_mut();
        cell.as_mut().map(f)
    })
}
