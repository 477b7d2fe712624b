//! Per-thread request/response blocks and the thread lifecycle surface
//!
//! Every thread participating in the lock protocol owns exactly one
//! [ThreadInfo], reachable through a thread-local pointer. It tracks three
//! things:
//!
//! 1. how many times other threads have asked this one to give up locks
//!    (the *request* count),
//! 2. whether this thread is currently blocked, meaning any request is
//!    implicitly granted on arrival,
//! 3. how many requests this thread has agreed to (the *response* count).
//!
//! `requests > responses` means there are peers waiting on us. The request
//! count and the blocked flag share one 32-bit word: the count lives in the
//! upper 31 bits, the flag in the low bit, so a single fetch-add both files
//! a request and learns whether the target had pre-granted it. The word
//! pair is the only cross-thread channel of the protocol: a waiter loads
//! `responses` with acquire and pairs with the owner's release store in
//! [handle_requests](ThreadInfo::handle_requests), which is what carries
//! every write the owner made under its locks over to the thief.
//!
//! Blocks are allocated once per thread and never freed: lock words keep
//! raw pointers to them (see [crate::lock_ops]), and those must stay
//! dereferenceable after the OS thread is long gone.

use std::cell::Cell;
use std::fmt::Debug;
use std::sync::atomic::Ordering;
use std::sync::OnceLock;

use tracing::Level;

use crate::loom_testing::*;
use crate::ordering::ord;
use crate::util::TraceAddr;

/// Low bit of `requests`: set while the owner has pre-agreed to every
/// request (it is exiting, or sleeping in multi-lock backoff)
const BLOCKED_FLAG: u32 = 1;
/// The request count is 31 bits wide; refuse to go anywhere near wraparound
const REQUEST_LIMIT: u32 = (1 << 31) - 4;

/// One thread's half of the ownership-transfer handshake
///
/// The two counters sit on separate cache lines: peers hammer `requests`
/// with read-modify-writes while the owner republishes `responses`, and
/// neither side should pay for the other's traffic.
#[repr(C, align(64))]
pub struct ThreadInfo {
    /// Acquire requests received from other threads, shifted left one bit,
    /// plus [BLOCKED_FLAG]. Any thread may RMW this.
    requests: AtomicU32,
    _pad: [u8; 60],
    /// Requests this thread has agreed to. Only the owning thread ever
    /// stores here; peers load it to learn their request was granted.
    responses: AtomicU32,
}

// The lock word encoding steals the low pointer bit (see crate::lock_ops).
const _: () = assert!(std::mem::align_of::<ThreadInfo>() >= 2);

impl ThreadInfo {
    pub(crate) fn new(start_blocked: bool) -> Self {
        Self {
            requests: AtomicU32::new(start_blocked as u32),
            _pad: [0; 60],
            responses: AtomicU32::new(0),
        }
    }

    /// Agree to every request received so far, relinquishing every lock
    /// this thread currently owns, and additionally enter the blocked state
    /// if `should_block` is set.
    ///
    /// Calling this while already blocked is a protocol error
    /// ([unblock](Self::unblock) must come first).
    pub(crate) fn handle_requests(&self, should_block: bool) {
        let prev = self
            .requests
            .fetch_or(should_block as u32, ord(Ordering::AcqRel));
        assert!(prev & BLOCKED_FLAG == 0, "handle_requests while blocked");

        // order: waiters poll `responses` with acquire; the release here
        // makes everything we wrote while owning our locks visible to
        // whoever observes the new count.
        self.responses.store(prev >> 1, ord(Ordering::Release));
    }

    /// Leave the blocked state entered by `handle_requests(true)`.
    pub(crate) fn unblock(&self) {
        self.requests.fetch_and(!BLOCKED_FLAG, ord(Ordering::AcqRel));
    }

    /// Plain snapshot of the response count.
    ///
    /// Only this thread ever stores `responses`, so a relaxed load is
    /// enough when the caller is the owner comparing before/after.
    pub(crate) fn responses_relaxed(&self) -> u32 {
        self.responses.load(ord(Ordering::Relaxed))
    }
}

impl Debug for ThreadInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let requests = self.requests.load(Ordering::Relaxed);
        f.debug_struct("ThreadInfo")
            .field("@addr", &TraceAddr::from(self))
            .field("requests", &(requests >> 1))
            .field("blocked", &(requests & BLOCKED_FLAG != 0))
            .field("responses", &self.responses.load(Ordering::Relaxed))
            .finish()
    }
}

/// File a request with `owner`: "give up everything you hold".
///
/// Returns the response count that will signal the grant, and whether the
/// owner was already blocked at the time of the ping. A blocked owner has
/// pre-granted, so there is nothing to wait for; we still bump the count,
/// because the owner wants to know on wakeup whether anything was taken.
pub(crate) fn ping(owner: &ThreadInfo) -> (u32, bool) {
    let req = owner.requests.fetch_add(2, ord(Ordering::AcqRel)) + 2;
    assert!(req < REQUEST_LIMIT, "request counter overflow");

    let was_blocked = req & BLOCKED_FLAG != 0;
    tracing::event!(
        Level::TRACE,
        owner = ?TraceAddr::from(owner),
        was_blocked,
        "ping"
    );
    (req >> 1, was_blocked)
}

/// Spin until `owner` has granted at least `desired` requests.
///
/// Grants our own pending requests between polls; two threads waiting on
/// each other's locks would otherwise deadlock.
pub(crate) fn await_response(me: &ThreadInfo, owner: &ThreadInfo, desired: u32) {
    // order: pairs with the release store in handle_requests; once the
    // count is visible, so is everything the owner wrote before granting.
    let mut responses = owner.responses.load(ord(Ordering::Acquire));
    while responses < desired {
        thread_yield();
        me.handle_requests(false);
        responses = owner.responses.load(ord(Ordering::Acquire));
    }
}

/// Round-trip handshake with the owner of a lock we are about to take.
pub(crate) fn notify_one(me: &ThreadInfo, owner: &ThreadInfo) {
    debug_assert!(!std::ptr::eq(me, owner));

    let (desired, was_blocked) = ping(owner);
    // The owner always responds before blocking, so the flag only needs
    // checking once, at ping time.
    if !was_blocked {
        await_response(me, owner, desired);
    }
}

thread_local! {
    static MY_THREAD_INFO: Cell<Option<&'static ThreadInfo>> = const { Cell::new(None) };
}

/// The calling thread's info block.
///
/// Panics if [init_per_thread] has not run on this thread; using a barrier
/// without it is a programmer error with no recovery.
pub(crate) fn current() -> &'static ThreadInfo {
    MY_THREAD_INFO
        .with(|info| info.get())
        .expect("octet_locks::init_per_thread was not called on this thread")
}

/// Whether [init_per_thread] has run on the calling thread.
pub fn is_initialized() -> bool {
    MY_THREAD_INFO.with(|info| info.get().is_some())
}

/// The designated owner of freshly created locks: a permanently blocked
/// thread that never runs, so the first real access to any lock goes down
/// the slow path and claims ownership through the full protocol.
pub(crate) fn dead_thread() -> &'static ThreadInfo {
    static DEAD_THREAD: OnceLock<&'static ThreadInfo> = OnceLock::new();
    DEAD_THREAD.get_or_init(|| Box::leak(Box::new(ThreadInfo::new(true))))
}

/// Set up the calling thread for barrier use. Must be called exactly once
/// per OS thread, before its first barrier.
pub fn init_per_thread() {
    MY_THREAD_INFO.with(|slot| {
        assert!(
            slot.get().is_none(),
            "init_per_thread called twice on one thread"
        );
        // Deliberately leaked: lock words may name this block forever.
        let info: &'static ThreadInfo = Box::leak(Box::new(ThreadInfo::new(false)));
        slot.set(Some(info));

        #[cfg(feature = "read-shared")]
        crate::registry::register(info);

        tracing::event!(Level::TRACE, thread_info = ?TraceAddr::from(info), "init_per_thread");
    });
}

/// Tear down the calling thread's participation in the protocol.
///
/// Marks the thread permanently blocked, so every lock it still owns can be
/// taken without a response. The info block itself stays allocated; lock
/// words out there still point at it.
pub fn shutdown_per_thread() {
    let me = current();
    me.handle_requests(true);

    #[cfg(feature = "read-shared")]
    crate::registry::deregister(me);

    #[cfg(feature = "statistics")]
    {
        let stats = crate::stats::thread_stats();
        tracing::debug!(thread_info = ?TraceAddr::from(me), ?stats, "barrier statistics");
    }

    tracing::event!(Level::TRACE, thread_info = ?TraceAddr::from(me), "shutdown_per_thread");
}

/// Politeness call: grant every pending request (giving up whichever locks
/// other threads asked for) without blocking.
pub fn yield_now() {
    current().handle_requests(false);
}
