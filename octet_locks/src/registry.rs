//! Registry of live thread-info blocks
//!
//! Read-shared objects have anonymous readers: nothing records who is
//! reading what. A writer that wants such an object exclusively therefore
//! asks permission from *every* live thread. This module keeps the set of
//! live threads behind an ordinary mutex; it is the one piece of the
//! protocol that is not lock-free, and it is only touched on per-thread
//! init/teardown and on the (rare) shared-to-exclusive transition.

use std::hash::{Hash, Hasher};
use std::ptr;
use std::sync::{Mutex, OnceLock};

use rustc_hash::FxHashSet;

use crate::thread_info::{ping, ThreadInfo};

/// Registry key: thread-info blocks compare and hash by address.
#[derive(Clone, Copy)]
struct ByAddr(&'static ThreadInfo);

impl PartialEq for ByAddr {
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self.0, other.0)
    }
}
impl Eq for ByAddr {}
impl Hash for ByAddr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.0 as *const ThreadInfo as usize).hash(state);
    }
}

fn active_threads() -> &'static Mutex<FxHashSet<ByAddr>> {
    static ACTIVE_THREADS: OnceLock<Mutex<FxHashSet<ByAddr>>> = OnceLock::new();
    ACTIVE_THREADS.get_or_init(|| Mutex::new(FxHashSet::default()))
}

pub(crate) fn register(info: &'static ThreadInfo) {
    active_threads().lock().unwrap().insert(ByAddr(info));
}

pub(crate) fn deregister(info: &'static ThreadInfo) {
    let removed = active_threads().lock().unwrap().remove(&ByAddr(info));
    assert!(removed, "deregistering a thread that was never registered");
}

/// Ping every live thread except `me`.
///
/// The registry stays locked for the duration of the broadcast so threads
/// cannot appear or vanish mid-sweep. Returns the `(peer, response count)`
/// pairs that still need awaiting; peers that were already blocked have
/// implicitly granted and are dropped from the list. Awaiting happens at
/// the caller, after the mutex is released.
pub(crate) fn ping_peers(me: &ThreadInfo) -> Vec<(&'static ThreadInfo, u32)> {
    let set = active_threads().lock().unwrap();
    let mut pending = Vec::with_capacity(set.len());
    for &ByAddr(peer) in set.iter() {
        if ptr::eq(peer, me) {
            continue;
        }
        let (desired, was_blocked) = ping(peer);
        if !was_blocked {
            pending.push((peer, desired));
        }
    }
    pending
}
