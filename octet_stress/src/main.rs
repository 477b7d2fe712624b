//! Account-transfer stress driver for the biased locks
//!
//! Creates an array of accounts, all starting at zero. Worker threads
//! repeatedly pick two accounts to transfer one unit between (both
//! write-locked) and a third to merely read. If the locks enforce mutual
//! exclusion, the sum over all accounts at the end is exactly zero; the
//! process exits non-zero otherwise.
//!
//! Positional arguments: `num_threads num_iterations num_accounts`, each a
//! positive integer (missing ones fall back to 10 / 10000 / 10).
//!
//! Build-time variants:
//! - `unlock-each-iter`: donate all three locks back after every
//!   iteration, driving every barrier down the slow path
//! - `do-yield`: grant pending peer requests at the end of each iteration

use std::env;
use std::error::Error;
use std::fmt::{self, Display};
use std::num::ParseIntError;
use std::thread;
use std::time::Instant;

use octet_locks::{init_per_thread, lock_all, shutdown_per_thread, Mode, Protected};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Debug)]
enum StressError {
    BadArgument(ParseIntError),
    Unbalanced(i64),
}

impl Display for StressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StressError::BadArgument(e) => write!(f, "bad argument: {}", e),
            StressError::Unbalanced(sum) => {
                write!(f, "accounts sum to {} instead of 0, mutual exclusion broken", sum)
            }
        }
    }
}

impl Error for StressError {}

impl From<ParseIntError> for StressError {
    fn from(value: ParseIntError) -> Self {
        Self::BadArgument(value)
    }
}

#[derive(Debug, Clone, Copy)]
struct Settings {
    num_threads: usize,
    num_iterations: usize,
    num_accounts: usize,
}

impl Settings {
    fn from_args() -> Result<Self, StressError> {
        let args: Vec<String> = env::args().collect();
        let mut settings = Settings {
            num_threads: 10,
            num_iterations: 10_000,
            num_accounts: 10,
        };
        if let Some(arg) = args.get(1) {
            settings.num_threads = arg.parse::<usize>()?.max(1);
        }
        if let Some(arg) = args.get(2) {
            settings.num_iterations = arg.parse::<usize>()?.max(1);
        }
        if let Some(arg) = args.get(3) {
            settings.num_accounts = arg.parse::<usize>()?.max(1);
        }
        Ok(settings)
    }
}

/// One worker: transfer a unit between two random accounts and read a
/// third, `num_iterations` times.
fn futz(thread_num: usize, settings: Settings, accounts: &[Protected<i64>]) {
    init_per_thread();

    // A single account has no non-aliasing pair to transfer between.
    if settings.num_accounts < 2 {
        shutdown_per_thread();
        return;
    }

    let mut rng = StdRng::seed_from_u64(100 * thread_num as u64);
    let mut done = 0;
    while done < settings.num_iterations {
        let from = rng.gen_range(0..settings.num_accounts);
        let to = rng.gen_range(0..settings.num_accounts);
        let extra = rng.gen_range(0..settings.num_accounts);

        // The read-modify-write below self-aliases when from == to; redraw.
        // (The extra account may overlap either; it is only read.)
        if from == to {
            continue;
        }
        done += 1;

        lock_all(&[
            (accounts[from].lock(), Mode::Write),
            (accounts[to].lock(), Mode::Write),
            (accounts[extra].lock(), Mode::Read),
        ]);

        // safety: from/to are write-locked by us and distinct; extra is
        // read-locked, and each borrow ends within its own statement, so
        // an extra that aliases from or to never overlaps a live borrow
        let _extra_balance = unsafe { *accounts[extra].value() };
        unsafe {
            let from_balance = *accounts[from].value();
            let to_balance = *accounts[to].value();
            *accounts[to].value_mut() = to_balance + 1;
            *accounts[from].value_mut() = from_balance - 1;
        }

        #[cfg(feature = "unlock-each-iter")]
        {
            accounts[to].lock().force_unlock();
            accounts[from].lock().force_unlock();
            accounts[extra].lock().force_unlock();
        }

        #[cfg(feature = "do-yield")]
        octet_locks::yield_now();
    }

    shutdown_per_thread();
}

/// Run the whole workload and return the final sum over all accounts.
fn run(settings: Settings) -> i64 {
    let mut accounts: Vec<Protected<i64>> = (0..settings.num_accounts)
        .map(|_| Protected::new(0))
        .collect();

    let accounts_ref = accounts.as_slice();
    thread::scope(|scope| {
        for thread_num in 0..settings.num_threads {
            scope.spawn(move || futz(thread_num, settings, accounts_ref));
        }
    });

    accounts.iter_mut().map(|account| *account.get_mut()).sum()
}

fn main() -> Result<(), StressError> {
    let settings = Settings::from_args()?;

    println!(
        "Compiled settings: read_shared={} statistics={} sequential={} unlock_each_iter={} do_yield={}",
        cfg!(feature = "read-shared"),
        cfg!(feature = "statistics"),
        cfg!(feature = "sequential"),
        cfg!(feature = "unlock-each-iter"),
        cfg!(feature = "do-yield"),
    );
    println!(
        "Run-time settings: num_threads={} num_iterations={} num_accounts={}",
        settings.num_threads, settings.num_iterations, settings.num_accounts,
    );

    let start = Instant::now();
    let sum = run(settings);
    println!("{}ms", start.elapsed().as_millis());

    if sum != 0 {
        return Err(StressError::Unbalanced(sum));
    }
    println!("balance check passed");
    Ok(())
}
