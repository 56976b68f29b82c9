//! Guard-paged fiber stacks.

use std::{ffi, io, ptr};

/// An anonymous mapping used as a fiber stack.
///
/// Demand paging means physical memory is only committed as the fiber
/// actually touches pages, so large default sizes are cheap. The lowest page
/// is a guard page; overflowing the stack faults instead of corrupting
/// neighboring memory.
#[derive(Debug)]
pub(crate) struct Stack {
    pointer: *mut u8,
    length: usize,
}

impl Stack {
    /// Allocates a stack with at least `usable_bytes` of usable space,
    /// rounded up to whole pages, plus one guard page below it.
    pub(crate) fn new(usable_bytes: usize) -> io::Result<Self> {
        let page_size = page_size();
        let usable = usable_bytes.max(page_size).next_multiple_of(page_size);
        let length = usable + page_size;

        let pointer = unsafe {
            libc::mmap(
                ptr::null_mut(),
                length,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if pointer == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        // if guarding fails the mapping is cleaned up by Stack's drop
        let stack = Stack {
            pointer: pointer as *mut u8,
            length,
        };

        // lowest addresses, since the stack grows downward
        let result = unsafe { libc::mprotect(pointer, page_size, libc::PROT_NONE) };
        if result == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(stack)
    }

    /// Upper end of the mapping; the first usable byte is just below it.
    pub(crate) fn base(&self) -> *mut u8 {
        // safety: one past the end of the same allocation
        unsafe { self.pointer.add(self.length) }
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        let result = unsafe { libc::munmap(self.pointer as *mut ffi::c_void, self.length) };
        debug_assert_eq!(result, 0);
    }
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_and_writes() {
        let stack = Stack::new(4096).unwrap();
        unsafe {
            let pointer = stack.base().sub(1);
            pointer.write(123);
            assert_eq!(pointer.read(), 123);
        }
    }

    #[test]
    fn rounds_up_to_whole_pages() {
        let page = page_size();
        let stack = Stack::new(1).unwrap();
        assert_eq!(stack.length % page, 0);
        // one usable page plus the guard page
        assert_eq!(stack.length, 2 * page);
    }
}
