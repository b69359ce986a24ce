//! Synchronization primitives that get swapped out for [loom] ones
//! when building with `--cfg loom`
//!
//! Everything that takes part in the free list protocol must come from here,
//! otherwise loom cannot see it.

#[cfg(loom)]
pub use loom::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicUsize};
#[cfg(not(loom))]
pub use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicUsize};

#[cfg(loom)]
pub use loom::sync::Mutex;
#[cfg(not(loom))]
pub use std::sync::Mutex;

#[cfg(loom)]
pub fn spin_hint() {
    loom::thread::yield_now();
}
#[cfg(not(loom))]
pub fn spin_hint() {
    std::hint::spin_loop();
}

#[cfg(loom)]
pub fn yield_now() {
    loom::thread::yield_now();
}
#[cfg(not(loom))]
pub fn yield_now() {
    std::thread::yield_now();
}
