use super::*;

#[cfg(not(loom))]
use std::sync::atomic::AtomicBool;

#[cfg(not(loom))]
use rand::{Rng, SeedableRng};

#[cfg(not(loom))]
use crate::multi_lock::{lock_all, Mode};

/// Run a test body on its own initialized thread, with a clean shutdown.
///
/// Shutting down matters: a thread that inits and then goes silent without
/// blocking would stall every later read-shared revocation in this process.
#[cfg(not(loom))]
fn with_thread<F: FnOnce() + Send>(f: F) {
    std::thread::scope(|scope| {
        scope.spawn(move || {
            crate::init_per_thread();
            f();
            crate::shutdown_per_thread();
        });
    });
}

#[cfg(not(loom))]
#[test]
fn lock_word_predicates() {
    let info = ThreadInfo::new(false);
    let word_wrex = wrex(&info);
    let word_rdex = rdex(&info);

    assert!(is_rdsh(RDSH));
    assert!(!is_rdsh(word_wrex));
    assert!(is_intermediate(INTERMEDIATE));
    assert!(is_wrex(word_wrex) && !is_wrex(word_rdex) && !is_wrex(RDSH));
    assert!(is_rdex(word_rdex) && !is_rdex(word_wrex));
    // `1` is the intermediate sentinel, not a read-exclusive owner
    assert!(!is_rdex(INTERMEDIATE));

    assert!(ptr::eq(owner_of(word_wrex), &info));
    assert!(ptr::eq(owner_of(word_rdex), &info));
    assert!(owner_of(RDSH).is_null());
}

#[cfg(not(loom))]
#[test]
fn first_access_steals_from_dead_thread() {
    with_thread(|| {
        let me = thread_info::current();
        let lock = Lock::new();

        let fresh = lock.state.load(Ordering::Relaxed);
        assert!(is_wrex(fresh));
        assert!(!ptr::eq(owner_of(fresh), me));

        // the dead thread is permanently blocked, so the steal completes
        // without waiting and without any of our requests being granted
        assert!(!lock.write_lock());
        assert_eq!(lock.state.load(Ordering::Relaxed), wrex(me));

        // now biased toward us: re-entry is free
        assert!(!lock.write_lock());
        assert_eq!(lock.state.load(Ordering::Relaxed), wrex(me));
    });
}

#[cfg(not(loom))]
#[test]
fn force_unlock_then_relock_roundtrip() {
    with_thread(|| {
        let me = thread_info::current();
        let lock = Lock::new();
        lock.write_lock();
        assert_eq!(lock.state.load(Ordering::Relaxed), wrex(me));

        lock.force_unlock();
        let word = lock.state.load(Ordering::Relaxed);
        assert!(is_wrex(word));
        assert!(!ptr::eq(owner_of(word), me));

        lock.write_lock();
        assert_eq!(lock.state.load(Ordering::Relaxed), wrex(me));
    });
}

#[cfg(not(loom))]
#[test]
fn force_unlock_of_unowned_lock_is_a_noop() {
    with_thread(|| {
        let lock = Lock::new();
        let before = lock.state.load(Ordering::Relaxed);
        lock.force_unlock();
        assert_eq!(lock.state.load(Ordering::Relaxed), before);
    });
}

#[cfg(not(loom))]
#[test]
fn yield_now_without_requests() {
    with_thread(|| {
        crate::yield_now();
        crate::yield_now();
    });
}

#[cfg(not(loom))]
#[test]
fn lock_all_empty_and_single() {
    with_thread(|| {
        let me = thread_info::current();

        lock_all(&[]);

        let lock = Lock::new();
        lock_all(&[(&lock, Mode::Write)]);
        assert_eq!(lock.state.load(Ordering::Relaxed), wrex(me));
    });
}

#[cfg(not(loom))]
#[test]
fn stolen_lock_carries_the_owners_writes() {
    let object = Protected::new(0u64);
    let ready = AtomicBool::new(false);

    std::thread::scope(|scope| {
        let object = &object;
        let ready = &ready;

        // victim: takes the object, writes, then keeps granting until the
        // thief has taken it away
        scope.spawn(move || {
            crate::init_per_thread();
            let me = thread_info::current();
            object.lock().write_lock();
            // safety: write-exclusive hold
            unsafe { *object.value_mut() = 12345 };
            ready.store(true, Ordering::SeqCst);
            while object.lock().state.load(Ordering::Relaxed) == wrex(me) {
                crate::yield_now();
                std::thread::yield_now();
            }
            crate::shutdown_per_thread();
        });

        // thief: waits for the write, then steals the object
        scope.spawn(move || {
            crate::init_per_thread();
            while !ready.load(Ordering::SeqCst) {
                std::thread::yield_now();
            }
            object.lock().write_lock();
            // safety: write-exclusive hold; the previous owner's write
            // must have come across with the handoff
            assert_eq!(unsafe { *object.value() }, 12345);
            crate::shutdown_per_thread();
        });
    });

    let mut object = object;
    assert_eq!(*object.get_mut(), 12345);
}

#[cfg(not(loom))]
#[test]
fn concurrent_transfers_keep_balance() {
    const NTHREADS: usize = 4;
    const NITERS: usize = 2000;
    const NACCOUNTS: usize = 8;

    let accounts: Vec<Protected<i64>> = (0..NACCOUNTS).map(|_| Protected::new(0)).collect();

    std::thread::scope(|scope| {
        for thread_num in 0..NTHREADS {
            let accounts = &accounts;
            scope.spawn(move || {
                crate::init_per_thread();
                let mut rng = rand::rngs::StdRng::seed_from_u64(thread_num as u64);
                let mut done = 0;
                while done < NITERS {
                    let from = rng.gen_range(0..NACCOUNTS);
                    let to = rng.gen_range(0..NACCOUNTS);
                    // the read-modify-write below self-aliases when the
                    // accounts coincide; redraw
                    if from == to {
                        continue;
                    }
                    done += 1;

                    lock_all(&[
                        (accounts[from].lock(), Mode::Write),
                        (accounts[to].lock(), Mode::Write),
                    ]);
                    // safety: both accounts write-locked, from != to
                    unsafe {
                        *accounts[from].value_mut() -= 1;
                        *accounts[to].value_mut() += 1;
                    }
                }
                crate::shutdown_per_thread();
            });
        }
    });

    let mut accounts = accounts;
    let sum: i64 = accounts.iter_mut().map(|account| *account.get_mut()).sum();
    assert_eq!(sum, 0);
}

#[cfg(all(not(loom), feature = "statistics"))]
#[test]
fn fast_path_reacquisition_is_free() {
    with_thread(|| {
        let lock = Lock::new();

        let before = crate::stats::thread_stats();
        lock.write_lock(); // slow: steals from the dead thread
        for _ in 0..10 {
            lock.write_lock(); // all fast
        }
        let after = crate::stats::thread_stats();

        assert_eq!(after.slow_writes - before.slow_writes, 1);
        assert_eq!(after.write_barriers - before.write_barriers, 11);
    });
}

#[cfg(all(not(loom), feature = "read-shared"))]
#[test]
fn read_fast_path_on_shared_word() {
    with_thread(|| {
        let lock = Lock::new();
        lock.state.store(RDSH, Ordering::SeqCst);
        // read-shared is readable by anyone without a transition
        assert!(!lock.read_lock());
        assert!(is_rdsh(lock.state.load(Ordering::Relaxed)));
    });
}

#[cfg(all(not(loom), feature = "read-shared"))]
#[test]
fn readers_promote_to_read_shared_and_writer_revokes() {
    let object = Protected::new(5i64);
    let readers_done = AtomicUsize::new(0);
    let writer_done = AtomicBool::new(false);

    std::thread::scope(|scope| {
        let object = &object;
        let readers_done = &readers_done;
        let writer_done = &writer_done;

        for _ in 0..2 {
            scope.spawn(move || {
                crate::init_per_thread();
                object.lock().read_lock();
                // safety: read hold
                assert_eq!(unsafe { *object.value() }, 5);
                readers_done.fetch_add(1, Ordering::SeqCst);
                // grant until the writer is through
                while !writer_done.load(Ordering::SeqCst) {
                    crate::yield_now();
                    std::thread::yield_now();
                }
                crate::shutdown_per_thread();
            });
        }

        scope.spawn(move || {
            crate::init_per_thread();
            while readers_done.load(Ordering::SeqCst) < 2 {
                std::thread::yield_now();
            }
            // whichever reader finished second generalized the hold
            assert!(is_rdsh(object.lock().state.load(Ordering::Relaxed)));

            object.lock().write_lock();
            // safety: write-exclusive hold
            unsafe { *object.value_mut() = 6 };
            writer_done.store(true, Ordering::SeqCst);
            crate::shutdown_per_thread();
        });
    });

    let mut object = object;
    assert_eq!(*object.get_mut(), 6);
}

#[cfg(loom)]
#[test]
fn loom_two_thieves_one_blocked_owner() {
    loom::model(|| {
        let owner: &'static ThreadInfo = Box::leak(Box::new(ThreadInfo::new(true)));
        let lock: &'static Lock = Box::leak(Box::new(Lock {
            state: AtomicUsize::new(wrex(owner)),
        }));
        let thief_1: &'static ThreadInfo = Box::leak(Box::new(ThreadInfo::new(false)));
        let thief_2: &'static ThreadInfo = Box::leak(Box::new(ThreadInfo::new(false)));

        let t1 = loom::thread::spawn(move || {
            write_slow_path(thief_1, lock);
            // leave the protocol; the other thief may steal from us freely
            thief_1.handle_requests(true);
        });
        let t2 = loom::thread::spawn(move || {
            write_slow_path(thief_2, lock);
            thief_2.handle_requests(true);
        });
        t1.join().unwrap();
        t2.join().unwrap();

        // exactly one of the two ends up the owner, write-exclusively
        let word = lock.state.load(Ordering::Relaxed);
        assert!(is_wrex(word));
        assert!(ptr::eq(owner_of(word), thief_1) || ptr::eq(owner_of(word), thief_2));
    });
}

#[cfg(loom)]
#[test]
fn loom_handoff_races_with_owner_blocking() {
    loom::model(|| {
        let owner: &'static ThreadInfo = Box::leak(Box::new(ThreadInfo::new(false)));
        let lock: &'static Lock = Box::leak(Box::new(Lock {
            state: AtomicUsize::new(wrex(owner)),
        }));
        let thief: &'static ThreadInfo = Box::leak(Box::new(ThreadInfo::new(false)));

        let t_owner = loom::thread::spawn(move || {
            // the owner retires; whether the thief's ping lands before or
            // after this, it must get through
            owner.handle_requests(true);
        });
        let t_thief = loom::thread::spawn(move || {
            write_slow_path(thief, lock);
            assert_eq!(lock.state.load(Ordering::Relaxed), wrex(thief));
        });
        t_owner.join().unwrap();
        t_thief.join().unwrap();
    });
}

#[cfg(loom)]
#[test]
fn loom_upgrade_own_read_hold() {
    loom::model(|| {
        let me: &'static ThreadInfo = Box::leak(Box::new(ThreadInfo::new(false)));
        let lock: &'static Lock = Box::leak(Box::new(Lock {
            state: AtomicUsize::new(rdex(me)),
        }));
        assert!(!write_slow_path(me, lock));
        assert_eq!(lock.state.load(Ordering::Relaxed), wrex(me));
    });
}

#[cfg(all(loom, feature = "read-shared"))]
#[test]
fn loom_read_steal_and_generalize() {
    loom::model(|| {
        let owner: &'static ThreadInfo = Box::leak(Box::new(ThreadInfo::new(true)));
        let lock: &'static Lock = Box::leak(Box::new(Lock {
            state: AtomicUsize::new(wrex(owner)),
        }));
        let me: &'static ThreadInfo = Box::leak(Box::new(ThreadInfo::new(false)));

        // stealing a write-held object for reading leaves it read-exclusive
        assert!(!read_slow_path(me, lock));
        assert_eq!(lock.state.load(Ordering::Relaxed), rdex(me));

        // a foreign read-exclusive hold generalizes to read-shared
        let other: &'static ThreadInfo = Box::leak(Box::new(ThreadInfo::new(false)));
        lock.state.store(rdex(other), Ordering::Relaxed);
        read_slow_path(me, lock);
        assert!(is_rdsh(lock.state.load(Ordering::Relaxed)));
    });
}
