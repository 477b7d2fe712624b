//! Memory-order selection for the `sequential` debugging switch
//!
//! Every atomic access in this crate routes its ordering through [ord] so
//! that the whole protocol can be forced to sequential consistency in one
//! place. If the locks stop guaranteeing mutual exclusion, rebuilding with
//! `--features sequential` tells you whether a too-weak ordering is the
//! culprit.

use std::sync::atomic::Ordering;

#[inline(always)]
pub(crate) const fn ord(preferred: Ordering) -> Ordering {
    if cfg!(feature = "sequential") {
        Ordering::SeqCst
    } else {
        preferred
    }
}
