#[cfg(loom)]
pub use loom::sync::atomic::{fence, AtomicU32, AtomicUsize};
#[cfg(not(loom))]
pub use std::sync::atomic::{fence, AtomicU32, AtomicUsize};

#[cfg(loom)]
pub fn thread_yield() {
    loom::thread::yield_now();
}
#[cfg(not(loom))]
pub fn thread_yield() {
    std::thread::yield_now();
}
