//! Per-thread barrier statistics
//!
//! Counts fast vs. slow paths so experiments can tell whether the bias is
//! paying off. Kept in plain thread-local cells: only the owning thread
//! ever updates its counters, so there is nothing to synchronize.

use std::cell::Cell;

/// Counters for the calling thread, all monotonic.
#[derive(Clone, Copy, Debug, Default)]
pub struct BarrierStats {
    /// Write barriers executed (fast or slow)
    pub write_barriers: u64,
    /// Write barriers that took the slow path
    pub slow_writes: u64,
    /// Read barriers executed (fast or slow)
    pub read_barriers: u64,
    /// Read barriers that took the slow path
    pub slow_reads: u64,
    /// Multi-lock retries that escalated to a blocked sleep
    pub multi_lock_backoffs: u64,
}

thread_local! {
    static BARRIER_STATS: Cell<BarrierStats> = const { Cell::new(BarrierStats::zeroed()) };
}

impl BarrierStats {
    const fn zeroed() -> Self {
        Self {
            write_barriers: 0,
            slow_writes: 0,
            read_barriers: 0,
            slow_reads: 0,
            multi_lock_backoffs: 0,
        }
    }
}

/// Snapshot of the calling thread's counters.
pub fn thread_stats() -> BarrierStats {
    BARRIER_STATS.with(|stats| stats.get())
}

pub(crate) fn record(bump: impl FnOnce(&mut BarrierStats)) {
    BARRIER_STATS.with(|stats| {
        let mut current = stats.get();
        bump(&mut current);
        stats.set(current);
    });
}
