//! Acquiring several locks at once
//!
//! There is no global lock ordering to lean on, and none is needed: the
//! barriers never block while *holding* anything (a thread stuck in a slow
//! path keeps granting incoming requests), so cycles cannot wedge. What can
//! happen is that granting a peer's request costs us a lock we took
//! earlier in the same batch. The strategy is optimistic retry: take the
//! locks in sequence, and if any acquisition after the first reports that
//! requests were granted meanwhile, start over. Persistent contention
//! escalates to exponentially growing sleeps taken in the blocked state,
//! so every peer waiting on us gets through and livelock is ruled out.

use std::thread;
use std::time::Duration;

use tracing::Level;

use crate::lock_ops::Lock;
use crate::thread_info;

/// Plain retries before the first backoff sleep
const BACKOFF_RETRIES: usize = 5;
/// Number of further retries over which the sleep keeps doubling
const BACKOFF_EXPLIMIT: usize = 13;

/// Requested hold strength for one lock in a [lock_all] batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Read,
    Write,
}

fn try_lock_one(lock: &Lock, mode: Mode) -> bool {
    match mode {
        Mode::Read => lock.read_lock(),
        Mode::Write => lock.write_lock(),
    }
}

/// Acquire every listed lock in its requested mode.
///
/// On return, all listed locks are held by the calling thread. Locks *not*
/// in the list may have been given away in the process. Callers must dedupe
/// the list themselves: passing the same lock twice with [Mode::Write]
/// makes the caller's own read-modify-write self-aliasing, and nothing
/// here detects it.
pub fn lock_all(locks: &[(&Lock, Mode)]) {
    let Some((&(first, first_mode), rest)) = locks.split_first() else {
        return;
    };
    let me = thread_info::current();

    let mut retries = 0usize;
    let mut backoff_us = 1u64;
    loop {
        // Whatever we lost while acquiring the first lock is immaterial:
        // nothing from this batch is held yet.
        let _ = try_lock_one(first, first_mode);

        let mut restart = false;
        for &(lock, mode) in rest {
            // No short-circuit: every listed lock gets (re)acquired each
            // round, lost or not.
            restart |= try_lock_one(lock, mode);
        }
        if !restart {
            return;
        }

        // The grant we observed may concern some lock from an earlier
        // batch that nobody cares about any more; in that (common) case
        // the retry is a handful of straight fast paths.
        retries += 1;
        if retries > BACKOFF_RETRIES {
            if retries < BACKOFF_RETRIES + BACKOFF_EXPLIMIT {
                backoff_us *= 2;
            }
            #[cfg(feature = "statistics")]
            crate::stats::record(|stats| stats.multi_lock_backoffs += 1);
            tracing::event!(Level::TRACE, backoff_us, retries, "multi-lock backoff");

            // Sleep blocked: anyone waiting on one of our locks can take
            // it without a response from us.
            me.handle_requests(true);
            thread::sleep(Duration::from_micros(backoff_us));
            me.unblock();
        }
    }
}
