//! Heap-free task descriptors.
//!
//! A [`TaskFuncInfo`] carries everything a fiber needs to run one task
//! invocation: a callable and its argument, moved into two fixed inline
//! buffers, plus monomorphized thunks to invoke or discard them. Spawning
//! therefore never allocates; the descriptor is written straight into the
//! fiber that will run it.

use std::marker::PhantomData;
use std::mem::{self, MaybeUninit};
use std::ptr;

/// Captured callables fit in two machine words.
pub(crate) const MAX_CALLABLE_BYTES: usize = 2 * mem::size_of::<usize>();

/// Argument payloads fit in 128 bytes.
pub(crate) const MAX_ARG_BYTES: usize = 128;

/// Both buffers are 16-aligned; payloads above that are rejected.
const PAYLOAD_ALIGN: usize = 16;

#[repr(C, align(16))]
struct CallableBuf([MaybeUninit<u8>; MAX_CALLABLE_BYTES]);

#[repr(C, align(16))]
struct ArgBuf([MaybeUninit<u8>; MAX_ARG_BYTES]);

/// Post-monomorphization check; referencing `CHECK` makes an oversized or
/// overaligned payload a compile error at the spawn site.
struct PayloadFits<F, A>(PhantomData<(F, A)>);

impl<F, A> PayloadFits<F, A> {
    const CHECK: () = {
        assert!(
            mem::size_of::<F>() <= MAX_CALLABLE_BYTES,
            "spawned callable captures more than two machine words; box the state or pass it as the argument"
        );
        assert!(
            mem::size_of::<A>() <= MAX_ARG_BYTES,
            "spawn argument payload exceeds 128 bytes"
        );
        assert!(
            mem::align_of::<F>() <= PAYLOAD_ALIGN && mem::align_of::<A>() <= PAYLOAD_ALIGN,
            "spawn payload alignment exceeds 16"
        );
    };
}

/// Descriptor of the next task invocation on a fiber.
pub(crate) struct TaskFuncInfo {
    call: unsafe fn(*mut TaskFuncInfo),
    drop_payload: unsafe fn(*mut TaskFuncInfo),
    callable: CallableBuf,
    args: ArgBuf,
}

impl TaskFuncInfo {
    pub(crate) fn pack<F, A>(f: F, args: A) -> Self
    where
        F: FnOnce(A) + 'static,
        A: 'static,
    {
        let () = PayloadFits::<F, A>::CHECK;

        let mut info = TaskFuncInfo {
            call: call_thunk::<F, A>,
            drop_payload: drop_thunk::<F, A>,
            callable: CallableBuf([MaybeUninit::uninit(); MAX_CALLABLE_BYTES]),
            args: ArgBuf([MaybeUninit::uninit(); MAX_ARG_BYTES]),
        };
        // safety: the payload check bounds size and alignment of F and A
        unsafe {
            (info.callable.0.as_mut_ptr() as *mut F).write(f);
            (info.args.0.as_mut_ptr() as *mut A).write(args);
        }
        info
    }

    /// Runs the packed callable, consuming the descriptor.
    pub(crate) fn invoke(self) {
        // the thunk moves the payload out, so the destructor must not run
        let mut this = mem::ManuallyDrop::new(self);
        unsafe { (this.call)(&mut *this as *mut TaskFuncInfo) }
    }
}

impl Drop for TaskFuncInfo {
    fn drop(&mut self) {
        // only reached when the descriptor was never invoked
        unsafe { (self.drop_payload)(self) }
    }
}

unsafe fn call_thunk<F: FnOnce(A), A>(info: *mut TaskFuncInfo) {
    let f = ((*info).callable.0.as_ptr() as *const F).read();
    let args = ((*info).args.0.as_ptr() as *const A).read();
    f(args)
}

unsafe fn drop_thunk<F, A>(info: *mut TaskFuncInfo) {
    ptr::drop_in_place((*info).callable.0.as_mut_ptr() as *mut F);
    ptr::drop_in_place((*info).args.0.as_mut_ptr() as *mut A);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn invoke_calls_with_args() {
        let seen = Rc::new(Cell::new(0));
        let info = TaskFuncInfo::pack(
            |(seen, value): (Rc<Cell<i32>>, i32)| seen.set(value),
            (seen.clone(), 42),
        );

        info.invoke();

        assert_eq!(seen.get(), 42);
    }

    #[test]
    fn invoke_releases_payload() {
        let tracker = Rc::new(());
        let info = TaskFuncInfo::pack(|held: Rc<()>| drop(held), tracker.clone());

        info.invoke();

        assert_eq!(Rc::strong_count(&tracker), 1);
    }

    #[test]
    fn drop_without_invoke_releases_payload() {
        let tracker = Rc::new(());
        let info = TaskFuncInfo::pack(|_: Rc<()>| (), tracker.clone());

        drop(info);

        assert_eq!(Rc::strong_count(&tracker), 1);
    }

    #[test]
    fn full_width_payload_fits() {
        let seen = Rc::new(Cell::new(false));
        let seen_inner = seen.clone();
        let info = TaskFuncInfo::pack(
            move |payload: [u8; MAX_ARG_BYTES]| {
                assert!(payload.iter().all(|&b| b == 7));
                seen_inner.set(true);
            },
            [7u8; MAX_ARG_BYTES],
        );

        info.invoke();

        assert!(seen.get());
    }
}
