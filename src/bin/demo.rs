//! Demonstrates an ordered and an unordered map over a small worker pool.

use std::num::NonZeroUsize;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use procmap::{register_worker_fn, task::MapFn, Pool};

#[derive(Parser, Debug)]
struct Args {
    /// Number of worker processes.
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Upper bound of the input range (exclusive).
    #[arg(long, default_value_t = 10)]
    count: i64,

    /// Per-task timeout in milliseconds. Unset means unbounded.
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Deliver results in completion order instead of input order.
    #[arg(long)]
    unordered: bool,
}

struct SlowSquare;

impl MapFn for SlowSquare {
    type Args = i64;
    type Output = i64;
    const NAME: &'static str = "procmap_demo::slow_square";

    fn call(x: i64) -> Result<i64, String> {
        // A varying sleep makes the unordered mode's reordering visible.
        thread::sleep(Duration::from_millis((x % 4) as u64 * 20));
        Ok(x * x)
    }
}

register_worker_fn!(SlowSquare);

pub fn main() -> Result<()> {
    procmap::init();
    env_logger::init();

    let args = Args::parse();

    let mut pool = Pool::<SlowSquare>::new(
        NonZeroUsize::new(args.workers),
        args.timeout_ms.map(Duration::from_millis),
    );
    pool.start().context("failed to start worker pool")?;

    let inputs = 0..args.count;

    let outcomes: Vec<_> = if args.unordered {
        pool.imap_unordered(inputs)
            .context("failed to start map")?
            .collect::<Result<Vec<_>, _>>()
            .context("map aborted")?
    } else {
        pool.imap(inputs)
            .context("failed to start map")?
            .collect::<Result<Vec<_>, _>>()
            .context("map aborted")?
    };

    pool.stop().context("failed to stop worker pool")?;

    for outcome in outcomes {
        println!("{outcome:?}");
    }

    Ok(())
}
