//! Biased per-object locks with an ownership-transfer slow path
//!
//! Every protected object carries one pointer-sized atomic word encoding
//! who may touch it:
//!
//! - `0` = read-shared: any thread may read
//! - `1` = intermediate: an ownership transfer is in flight
//! - anything else is a tagged pointer to the owner's
//!   [ThreadInfo](crate::thread_info::ThreadInfo):
//!     - low bit clear = write-exclusive (the owner may read and write)
//!     - low bit set = read-exclusive (the owner may read)
//!
//! The word is the single source of truth for ownership; it only ever
//! changes through atomic stores or compare-exchanges. The bias is that an
//! owning thread re-acquires with one relaxed load and a compare, never a
//! read-modify-write. Taking an object away from its owner goes through
//! the intermediate sentinel plus the request/response handshake in
//! [crate::thread_info], which is also what carries the previous owner's
//! writes over to the new one.
//!
//! Without the `read-shared` feature only the two owner states exist and
//! read barriers are literally write barriers.

use std::cell::UnsafeCell;
use std::fmt::Debug;
use std::ptr;
use std::sync::atomic::Ordering;

use tracing::Level;

use crate::loom_testing::*;
use crate::ordering::ord;
use crate::thread_info::{self, notify_one, ThreadInfo};
use crate::util::TraceAddr;

/// Read-shared sentinel word
const RDSH: usize = 0;
/// Mid-transfer sentinel word
const INTERMEDIATE: usize = 1;
/// Low bit of an owner word: set for read-exclusive, clear for
/// write-exclusive
const RDEX_BIT: usize = 1;

/// Whether `word` is the read-shared state
pub(crate) const fn is_rdsh(word: usize) -> bool {
    word == RDSH
}
/// Whether `word` is the intermediate (transfer in flight) state
pub(crate) const fn is_intermediate(word: usize) -> bool {
    word == INTERMEDIATE
}
/// Write-exclusive: a non-null owner pointer with the tag bit clear
pub(crate) const fn is_wrex(word: usize) -> bool {
    word != RDSH && word & RDEX_BIT == 0
}
/// Read-exclusive: tag bit set, except that `1` itself is the intermediate
/// sentinel, not an owner word
pub(crate) const fn is_rdex(word: usize) -> bool {
    word != INTERMEDIATE && word & RDEX_BIT != 0
}

/// Owner encoded in `word`; null for the sentinel states
fn owner_of(word: usize) -> *const ThreadInfo {
    (word & !RDEX_BIT) as *const ThreadInfo
}
fn wrex(owner: &ThreadInfo) -> usize {
    owner as *const ThreadInfo as usize
}
fn rdex(owner: &ThreadInfo) -> usize {
    wrex(owner) | RDEX_BIT
}

/// A biased per-object lock.
///
/// Acquire methods never fail and never time out; they return whether the
/// calling thread granted any *other* thread's request while waiting,
/// which is how [lock_all](crate::multi_lock::lock_all) detects that an
/// earlier lock from its batch may have been lost. There is no release
/// method: ownership is kept until another thread asks for it (or
/// [force_unlock](Self::force_unlock) donates it back).
pub struct Lock {
    state: AtomicUsize,
}

impl Lock {
    /// A fresh lock, write-exclusively owned by the permanently blocked
    /// dead thread. The first access by any live thread takes the slow
    /// path, which is the uniform correct behavior.
    pub fn new() -> Self {
        Self {
            state: AtomicUsize::new(wrex(thread_info::dead_thread())),
        }
    }

    /// Acquire in write-exclusive mode.
    pub fn write_lock(&self) -> bool {
        #[cfg(feature = "statistics")]
        crate::stats::record(|stats| stats.write_barriers += 1);

        let me = thread_info::current();
        // order: the only value that lets us stay on the fast path is one
        // this thread wrote itself, so there is nothing to acquire; any
        // other value sends us to the slow path, whose compare-exchange
        // synchronizes properly.
        let state = self.state.load(ord(Ordering::Relaxed));
        if state != wrex(me) {
            return write_slow_path(me, self);
        }
        // Fast path: already ours. Nothing was granted.
        false
    }

    /// Acquire in a read mode (read-exclusive or read-shared, whichever the
    /// slow path finds appropriate).
    ///
    /// Without the `read-shared` feature all holds are exclusive and this
    /// is exactly [write_lock](Self::write_lock).
    #[cfg(not(feature = "read-shared"))]
    pub fn read_lock(&self) -> bool {
        self.write_lock()
    }

    /// Acquire in a read mode (read-exclusive or read-shared, whichever the
    /// slow path finds appropriate).
    #[cfg(feature = "read-shared")]
    pub fn read_lock(&self) -> bool {
        #[cfg(feature = "statistics")]
        crate::stats::record(|stats| stats.read_barriers += 1);

        let me = thread_info::current();
        let state = self.state.load(ord(Ordering::SeqCst));
        if !ptr::eq(owner_of(state), me) {
            if is_rdsh(state) {
                // order: the word may have been published by another
                // thread; pick up everything that happened-before the
                // object went read-shared.
                fence(ord(Ordering::Acquire));
            } else {
                return read_slow_path(me, self);
            }
        }
        false
    }

    /// Best-effort donation back to the dead-thread owner (testing hook,
    /// for driving up contention in experiments).
    ///
    /// Another thread may have marked the word intermediate or claimed it
    /// outright, so this only compare-exchanges if we still own it and
    /// ignores failure. Callers get no guarantee about the final state and
    /// must not rely on this for correctness.
    pub fn force_unlock(&self) {
        let me = thread_info::current();
        let state = self.state.load(ord(Ordering::Relaxed));
        if ptr::eq(owner_of(state), me) {
            let unlocked = wrex(thread_info::dead_thread());
            let _ = self
                .state
                .compare_exchange(state, unlocked, Ordering::SeqCst, Ordering::SeqCst);
        }
    }
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for Lock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let word = self.state.load(Ordering::Relaxed);
        let mode = if is_rdsh(word) {
            "RdSh"
        } else if is_intermediate(word) {
            "Intermediate"
        } else if is_wrex(word) {
            "WrEx"
        } else {
            "RdEx"
        };
        f.debug_struct("Lock")
            .field("mode", &mode)
            .field("owner", &TraceAddr::from(owner_of(word)))
            .finish()
    }
}

/// Spin until the word is ours to transition: compare-exchange any settled
/// state to the intermediate sentinel and return the displaced word (never
/// [INTERMEDIATE]).
///
/// Between attempts we yield to the scheduler and grant our own pending
/// requests; two threads each spinning on a lock the other holds would
/// otherwise deadlock.
fn lock_intermediate(me: &ThreadInfo, lock: &Lock) -> usize {
    // order: whatever we read here is re-checked by the compare-exchange.
    let mut prev = lock.state.load(ord(Ordering::Relaxed));
    loop {
        if !is_intermediate(prev)
            && lock
                .state
                .compare_exchange_weak(prev, INTERMEDIATE, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            break;
        }
        // Yielding here, rather than exponential backoff, wins big when
        // there are more threads than cores.
        thread_yield();
        me.handle_requests(false);
        prev = lock.state.load(ord(Ordering::Relaxed));
    }
    debug_assert!(!is_intermediate(prev));
    prev
}

/// Transfer `lock` into write-exclusive ownership of `me`.
///
/// Returns whether `me` granted any requests while waiting, i.e. whether
/// locks other than this one may have been relinquished.
fn write_slow_path(me: &'static ThreadInfo, lock: &Lock) -> bool {
    #[cfg(feature = "statistics")]
    crate::stats::record(|stats| stats.slow_writes += 1);

    let tracing_span =
        tracing::span!(Level::TRACE, "write_slow_path", lock = ?TraceAddr::from(lock));
    let _span_enter = tracing_span.enter();

    // order: nobody else writes our response count; a plain snapshot is
    // enough to detect grants made while we wait.
    let before = me.responses_relaxed();

    let prev = lock_intermediate(me, lock);

    #[cfg(feature = "read-shared")]
    let prev_was_shared = is_rdsh(prev);
    #[cfg(not(feature = "read-shared"))]
    let prev_was_shared = false;

    if prev_was_shared {
        #[cfg(feature = "read-shared")]
        {
            // Readers of a shared object are anonymous: ping every live
            // thread, then wait for each unblocked one in turn.
            tracing::event!(Level::TRACE, "revoking read-shared");
            for (peer, desired) in crate::registry::ping_peers(me) {
                thread_info::await_response(me, peer, desired);
            }
        }
    } else {
        debug_assert!(!is_rdsh(prev));
        let owner = owner_of(prev);
        if !ptr::eq(owner, me) {
            // safety: thread-info blocks are leaked, so an owner pointer
            // pulled out of a lock word is always dereferenceable
            notify_one(me, unsafe { &*owner });
        } else {
            // The only legal way to meet ourselves on the slow path is
            // upgrading our own read-exclusive hold.
            assert!(is_rdex(prev) && prev == rdex(me));
        }
    }

    // order: the compare-exchange to intermediate already synchronized
    // with the previous owner; this store just hands the object to
    // ourselves.
    lock.state.store(wrex(me), ord(Ordering::Relaxed));
    tracing::event!(Level::TRACE, "write-exclusive acquired");

    let after = me.responses_relaxed();
    before != after
}

/// Transfer `lock` into a readable state for `me`: read-exclusive if a
/// writer held it, read-shared if it was already being read.
#[cfg(feature = "read-shared")]
fn read_slow_path(me: &'static ThreadInfo, lock: &Lock) -> bool {
    #[cfg(feature = "statistics")]
    crate::stats::record(|stats| stats.slow_reads += 1);

    let tracing_span =
        tracing::span!(Level::TRACE, "read_slow_path", lock = ?TraceAddr::from(lock));
    let _span_enter = tracing_span.enter();

    let before = me.responses_relaxed();

    let prev = lock_intermediate(me, lock);

    if is_rdsh(prev) {
        // Another thread re-shared the object while we queued for the
        // intermediate word (we entered the slow path because some reader
        // held it exclusively, and a third reader promoted it first).
        // Put it back the way it was.
        lock.state.store(RDSH, Ordering::SeqCst);
    } else if is_rdex(prev) {
        // A second reader generalizes an exclusive read hold to
        // read-shared; the existing reader keeps its rights.
        debug_assert!(!ptr::eq(owner_of(prev), me));
        lock.state.store(RDSH, Ordering::SeqCst);
    } else {
        debug_assert!(is_wrex(prev));
        let owner = owner_of(prev);
        debug_assert!(!ptr::eq(owner, me));
        // safety: see write_slow_path
        notify_one(me, unsafe { &*owner });
        lock.state.store(rdex(me), Ordering::SeqCst);
    }
    tracing::event!(Level::TRACE, "readable state acquired");

    let after = me.responses_relaxed();
    before != after
}

/// A value guarded by a [Lock].
///
/// The lock does not hand out RAII guards; callers bracket accesses with
/// [read_lock](Lock::read_lock)/[write_lock](Lock::write_lock) (usually via
/// [lock_all](crate::multi_lock::lock_all)) and promise, through the unsafe
/// accessors, that they hold the object in a strong enough mode on the
/// current thread.
pub struct Protected<T> {
    lock: Lock,
    payload: UnsafeCell<T>,
}

// safety: shared-xor-mutable access to the payload is enforced by the lock
// protocol instead of the type system
unsafe impl<T: Send + Sync> Send for Protected<T> {}
unsafe impl<T: Send + Sync> Sync for Protected<T> {}

impl<T> Protected<T> {
    pub fn new(payload: T) -> Self {
        Self {
            lock: Lock::new(),
            payload: UnsafeCell::new(payload),
        }
    }

    /// The lock word guarding the payload.
    pub fn lock(&self) -> &Lock {
        &self.lock
    }

    /// Borrow the payload for reading.
    ///
    /// # Safety
    ///
    /// The calling thread must hold [lock](Self::lock) in a read or write
    /// mode, and the borrow must end before ownership is given up.
    pub unsafe fn value(&self) -> &T {
        &*self.payload.get()
    }

    /// Borrow the payload for writing.
    ///
    /// # Safety
    ///
    /// The calling thread must hold [lock](Self::lock) in write-exclusive
    /// mode, no other borrow of the payload may be live, and the borrow
    /// must end before ownership is given up.
    pub unsafe fn value_mut(&self) -> &mut T {
        &mut *self.payload.get()
    }

    /// Exclusive access through an exclusive borrow needs no locking.
    pub fn get_mut(&mut self) -> &mut T {
        self.payload.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.payload.into_inner()
    }
}

impl<T: Debug> Debug for Protected<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // the payload is not safely readable without the lock; show only
        // the lock word
        f.debug_struct("Protected").field("lock", &self.lock).finish()
    }
}

#[cfg(test)]
mod tests;
