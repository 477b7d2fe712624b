//! Biased per-object reader/writer locks
//!
//! An implementation of the ownership-transfer ("barrier") protocol from
//! Bond et al.,
//! [OCTET: Capturing and Controlling Cross-Thread Dependencies Efficiently](https://dl.acm.org/doi/10.1145/2509136.2509519)
//! (OOPSLA 2013). Each lock biases itself toward the thread that last
//! acquired it: that thread re-enters with a single relaxed load and a
//! compare, no atomic read-modify-write. Moving ownership between threads
//! is the expensive case and runs a cooperative request/response handshake
//! with the previous owner through per-thread counters.
//!
//! Threads call [init_per_thread] before their first barrier and
//! [shutdown_per_thread] on their way out; in between, [Lock::read_lock],
//! [Lock::write_lock] and [lock_all] acquire, [yield_now] hands pending
//! requests to waiting peers, and ownership is otherwise kept until
//! somebody asks for it. These are not fair locks, and acquisition never
//! times out.
//!
//! Cargo features (all off by default):
//! - `read-shared`: distinct read barriers and the read-shared lock state,
//!   plus the registry of live threads a writer must consult to revoke it
//! - `statistics`: per-thread fast/slow path counters (see [stats])
//! - `sequential`: force every atomic access to sequential consistency,
//!   for falsifying suspected memory-ordering bugs

mod loom_testing;
mod ordering;
mod util;

pub mod lock_ops;
pub mod multi_lock;
pub mod thread_info;

#[cfg(feature = "read-shared")]
mod registry;
#[cfg(feature = "statistics")]
pub mod stats;

pub use lock_ops::{Lock, Protected};
pub use multi_lock::{lock_all, Mode};
pub use thread_info::{init_per_thread, is_initialized, shutdown_per_thread, yield_now};
