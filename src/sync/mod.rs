//! Synchronization primitives for tasks.

mod manual_event;

pub use manual_event::ManualEvent;
