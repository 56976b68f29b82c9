//! Fiber-local storage.
//!
//! Every [`TaskLocal`] registers once, process-wide, and receives a stable
//! byte offset into a flat per-fiber buffer plus a slot id. Fibers grow their
//! buffer lazily the first time a slot past its end is touched; a slot's
//! value is constructed in place on first access within a task and dropped
//! when the task ends. The bytes themselves are retained across task
//! instances, so a long-lived fiber stops allocating once it has seen every
//! slot.
//!
//! Outside a task, access falls through to a thread-local dummy storage so
//! library code can touch its locals from any context.

use std::cell::{Cell, RefCell};
use std::mem;
use std::ptr;
use std::rc::Rc;
use std::slice;
use std::sync::Mutex;

use once_cell::sync::OnceCell;

use super::tls;

/// Slot sizes are padded to this, and slot values may not require more.
const SLOT_ALIGN: usize = 8;

/// Extra bytes mapped in per growth, so bursts of new slots rarely regrow.
const STORAGE_HEADROOM_BYTES: usize = 128;

/// Extra bits per bitset growth.
const BITS_HEADROOM: usize = 64;

struct SlotMeta {
    offset: usize,
    dtor: Option<unsafe fn(*mut u8)>,
}

struct Registry {
    /// Bytes reserved so far; the next slot starts here.
    fill: usize,
    slots: Vec<SlotMeta>,
}

/// Process-wide slot registry. Offsets are permanent once assigned.
static REGISTRY: Mutex<Registry> = Mutex::new(Registry {
    fill: 0,
    slots: Vec::new(),
});

#[derive(Debug, Clone, Copy)]
struct Slot {
    offset: usize,
    id: usize,
}

/// A value with one instance per task (and one per non-task thread context).
///
/// Declare as a `static`; the slot registers itself on first access:
///
/// ```
/// use weft::runtime::TaskLocal;
///
/// static REQUEST_NAME: TaskLocal<String> = TaskLocal::new(String::new);
///
/// REQUEST_NAME.with(|name| name.push_str("outside any task"));
/// assert_eq!(REQUEST_NAME.get(), "outside any task");
/// ```
pub struct TaskLocal<T: 'static> {
    init: fn() -> T,
    slot: OnceCell<Slot>,
}

impl<T: 'static> TaskLocal<T> {
    /// A task-local whose per-instance value starts as `init()`.
    pub const fn new(init: fn() -> T) -> Self {
        TaskLocal {
            init,
            slot: OnceCell::new(),
        }
    }

    fn slot(&self) -> Slot {
        *self.slot.get_or_init(|| {
            assert!(
                mem::align_of::<T>() <= SLOT_ALIGN,
                "task-local values must not require alignment above 8"
            );
            let mut registry = REGISTRY.lock().unwrap();
            let offset = registry.fill;
            let id = registry.slots.len();
            // zero-sized values still claim a word so every slot has an
            // in-bounds address
            registry.fill += mem::size_of::<T>().next_multiple_of(SLOT_ALIGN).max(SLOT_ALIGN);
            registry.slots.push(SlotMeta {
                offset,
                dtor: if mem::needs_drop::<T>() {
                    Some(drop_slot::<T>)
                } else {
                    None
                },
            });
            Slot { offset, id }
        })
    }

    /// Calls `f` with the current task's instance of the value,
    /// constructing it first if this task has not touched it yet.
    ///
    /// Panics on re-entrant access to the same slot, like a `RefCell`.
    pub fn with<R>(&'static self, f: impl FnOnce(&mut T) -> R) -> R {
        let slot = self.slot();
        let storage = current_storage();
        let fill = REGISTRY.lock().unwrap().fill;
        storage.ensure_capacity(fill, slot.id + 1);

        let _borrow = storage.borrow_slot(slot.id);
        let value = storage.slot_ptr(slot.offset) as *mut T;
        // safety: in bounds after ensure_capacity; uniqueness is enforced by
        // the per-slot borrow flag, and the buffer cannot move while any
        // borrow is live
        unsafe {
            if !storage.initialized.borrow().get(slot.id) {
                value.write((self.init)());
                storage.initialized.borrow_mut().set(slot.id);
            }
            f(&mut *value)
        }
    }

    /// Replaces the current task's instance of the value.
    pub fn set(&'static self, value: T) {
        self.with(|slot| *slot = value);
    }

    /// Clones the current task's instance of the value out.
    pub fn get(&'static self) -> T
    where
        T: Clone,
    {
        self.with(|slot| slot.clone())
    }
}

unsafe fn drop_slot<T>(value: *mut u8) {
    ptr::drop_in_place(value as *mut T)
}

/// One fiber's storage: the flat value buffer and its per-instance bits.
///
/// The buffer is a raw allocation rather than a `Vec` so that handing out
/// slot pointers never creates an intermediate reference to the whole
/// buffer.
pub(crate) struct FlsStorage {
    buffer: Cell<*mut u64>,
    capacity_words: Cell<usize>,
    /// Which slots hold a live value in the current task instance.
    initialized: RefCell<BitSet>,
    /// Which slots are handed out as `&mut` right now.
    borrowed: RefCell<BitSet>,
    /// Live borrows; the buffer must not move while this is non-zero.
    borrow_depth: Cell<usize>,
}

impl FlsStorage {
    pub(crate) fn new() -> Self {
        FlsStorage {
            buffer: Cell::new(ptr::null_mut()),
            capacity_words: Cell::new(0),
            initialized: RefCell::new(BitSet::default()),
            borrowed: RefCell::new(BitSet::default()),
            borrow_depth: Cell::new(0),
        }
    }

    fn ensure_capacity(&self, fill_bytes: usize, slot_count: usize) {
        if self.capacity_words.get() * 8 < fill_bytes {
            assert_eq!(
                self.borrow_depth.get(),
                0,
                "task-local storage grew during another task-local access"
            );
            let new_words = (fill_bytes + STORAGE_HEADROOM_BYTES).div_ceil(8);
            let mut grown = vec![0u64; new_words].into_boxed_slice();
            let old_words = self.capacity_words.get();
            if old_words > 0 {
                // safety: both regions are live and old_words <= new_words
                unsafe {
                    ptr::copy_nonoverlapping(self.buffer.get(), grown.as_mut_ptr(), old_words);
                }
                self.free_buffer();
            }
            self.capacity_words.set(grown.len());
            self.buffer.set(Box::into_raw(grown) as *mut u64);
        }
        self.initialized
            .borrow_mut()
            .grow_to(slot_count + BITS_HEADROOM);
        self.borrowed
            .borrow_mut()
            .grow_to(slot_count + BITS_HEADROOM);
    }

    fn slot_ptr(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset < self.capacity_words.get() * 8);
        // safety: in bounds of the live buffer allocation
        unsafe { (self.buffer.get() as *mut u8).add(offset) }
    }

    fn free_buffer(&self) {
        let words = self.capacity_words.get();
        if words > 0 {
            // safety: reconstructs the box produced in ensure_capacity
            unsafe {
                drop(Box::from_raw(slice::from_raw_parts_mut(
                    self.buffer.get(),
                    words,
                )));
            }
            self.buffer.set(ptr::null_mut());
            self.capacity_words.set(0);
        }
    }

    fn borrow_slot(&self, id: usize) -> SlotBorrow<'_> {
        {
            let mut borrowed = self.borrowed.borrow_mut();
            assert!(
                !borrowed.get(id),
                "task-local value is already borrowed in this task"
            );
            borrowed.set(id);
        }
        self.borrow_depth.set(self.borrow_depth.get() + 1);
        SlotBorrow { storage: self, id }
    }

    /// Drops every live slot value and clears the initialized bits. The
    /// buffer itself is retained for the fiber's next task.
    pub(crate) fn destroy_all(&self) {
        let live: Vec<usize> = self.initialized.borrow().ones().collect();
        for id in live {
            self.initialized.borrow_mut().clear(id);
            let (offset, dtor) = {
                let registry = REGISTRY.lock().unwrap();
                (registry.slots[id].offset, registry.slots[id].dtor)
            };
            if let Some(dtor) = dtor {
                // hold a borrow for the duration so a destructor that grows
                // the storage trips the growth guard instead of moving the
                // buffer out from under us
                let _borrow = self.borrow_slot(id);
                unsafe { dtor(self.slot_ptr(offset)) };
            }
        }
    }
}

impl Drop for FlsStorage {
    fn drop(&mut self) {
        self.destroy_all();
        self.free_buffer();
    }
}

struct SlotBorrow<'a> {
    storage: &'a FlsStorage,
    id: usize,
}

impl Drop for SlotBorrow<'_> {
    fn drop(&mut self) {
        self.storage.borrowed.borrow_mut().clear(self.id);
        self.storage
            .borrow_depth
            .set(self.storage.borrow_depth.get() - 1);
    }
}

thread_local! {
    /// Storage for task-local access outside any task.
    static DUMMY_STORAGE: Rc<FlsStorage> = Rc::new(FlsStorage::new());
}

fn current_storage() -> Rc<FlsStorage> {
    tls::try_runtime(|runtime| runtime.current.map(|id| runtime.fibers[id.0].fls.clone()))
        .flatten()
        .unwrap_or_else(|| DUMMY_STORAGE.with(Rc::clone))
}

/// Growable bitset over a word vector.
#[derive(Debug, Default)]
struct BitSet {
    words: Vec<u64>,
}

impl BitSet {
    fn grow_to(&mut self, bits: usize) {
        let words = bits.div_ceil(64);
        if words > self.words.len() {
            self.words.resize(words, 0);
        }
    }

    fn get(&self, bit: usize) -> bool {
        self.words
            .get(bit / 64)
            .map_or(false, |word| word & (1 << (bit % 64)) != 0)
    }

    fn set(&mut self, bit: usize) {
        self.words[bit / 64] |= 1 << (bit % 64);
    }

    fn clear(&mut self, bit: usize) {
        if let Some(word) = self.words.get_mut(bit / 64) {
            *word &= !(1 << (bit % 64));
        }
    }

    fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(index, &word)| {
            (0..64).filter_map(move |bit| {
                if word & (1 << bit) != 0 {
                    Some(index * 64 + bit)
                } else {
                    None
                }
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitset_set_get_clear() {
        let mut bits = BitSet::default();
        bits.grow_to(130);

        bits.set(0);
        bits.set(65);
        bits.set(129);

        assert!(bits.get(0) && bits.get(65) && bits.get(129));
        assert!(!bits.get(1) && !bits.get(64));
        assert_eq!(bits.ones().collect::<Vec<_>>(), [0, 65, 129]);

        bits.clear(65);
        assert!(!bits.get(65));
        assert_eq!(bits.ones().collect::<Vec<_>>(), [0, 129]);
    }

    #[test]
    fn out_of_range_reads_are_false() {
        let bits = BitSet::default();
        assert!(!bits.get(1000));
    }

    #[test]
    fn works_outside_any_task() {
        static COUNTER: TaskLocal<u32> = TaskLocal::new(|| 7);

        assert_eq!(COUNTER.get(), 7);
        COUNTER.set(8);
        COUNTER.with(|value| *value += 1);
        assert_eq!(COUNTER.get(), 9);
    }

    #[test]
    fn offsets_are_padded_to_eight_bytes() {
        static A: TaskLocal<u8> = TaskLocal::new(|| 0);
        static B: TaskLocal<u8> = TaskLocal::new(|| 0);

        // touch both to force registration
        A.get();
        B.get();

        let a = A.slot();
        let b = B.slot();
        assert_eq!(a.offset % 8, 0);
        assert_eq!(b.offset % 8, 0);
        assert_ne!(a.offset, b.offset);
    }

    #[test]
    fn destroy_all_runs_destructors_and_resets() {
        use std::rc::Rc;

        static HELD: TaskLocal<Option<Rc<()>>> = TaskLocal::new(|| None);

        let tracker = Rc::new(());
        HELD.set(Some(tracker.clone()));
        assert_eq!(Rc::strong_count(&tracker), 2);

        DUMMY_STORAGE.with(|dummy| dummy.destroy_all());
        assert_eq!(Rc::strong_count(&tracker), 1);

        // the slot re-initializes on next access
        assert!(HELD.get().is_none());
    }

    #[test]
    #[should_panic(expected = "alignment")]
    fn overaligned_values_are_rejected() {
        #[repr(align(16))]
        #[derive(Clone)]
        struct Wide([u8; 16]);

        static WIDE: TaskLocal<Wide> = TaskLocal::new(|| Wide([0; 16]));
        WIDE.with(|_| ());
    }

    #[test]
    #[should_panic(expected = "already borrowed")]
    fn reentrant_access_panics() {
        static NESTED: TaskLocal<u32> = TaskLocal::new(|| 0);

        NESTED.with(|_| NESTED.with(|_| ()));
    }

    #[test]
    fn distinct_locals_nest() {
        static OUTER: TaskLocal<u32> = TaskLocal::new(|| 1);
        static INNER: TaskLocal<u32> = TaskLocal::new(|| 2);

        // pre-register so the nested access does not need to grow storage
        INNER.get();
        let total = OUTER.with(|outer| INNER.with(|inner| *outer + *inner));
        assert_eq!(total, 3);
    }
}
