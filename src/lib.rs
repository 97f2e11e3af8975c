//! Parallel map over a fixed pool of isolated worker processes.
//!
//! A [`pool::Pool`] executes a single registered [`task::MapFn`] across
//! `pool_size` worker processes, pulling arguments from a lazy input
//! iterable and yielding [`task::Outcome`] values back as a lazy stream,
//! either in input order ([`pool::Pool::imap`]) or completion order
//! ([`pool::Pool::imap_unordered`]). Each task may be given a wall-clock
//! timeout; a worker that exceeds it is replaced.
//!
//! ```no_run
//! use procmap::{register_worker_fn, task::MapFn, pool::Pool};
//!
//! struct Square;
//!
//! impl MapFn for Square {
//!     type Args = i64;
//!     type Output = i64;
//!     const NAME: &'static str = "examples::square";
//!
//!     fn call(x: i64) -> Result<i64, String> {
//!         Ok(x * x)
//!     }
//! }
//!
//! register_worker_fn!(Square);
//!
//! fn main() {
//!     procmap::init();
//!
//!     let mut pool = Pool::<Square>::new(None, None);
//!     pool.start().unwrap();
//!     let results: Result<Vec<_>, _> = pool.imap(0i64..10).unwrap().collect();
//!     pool.stop().unwrap();
//!     println!("{results:?}");
//! }
//! ```

pub mod error;
pub mod pool;
pub mod registry;
pub mod scoped;
pub mod task;
pub mod wire;

pub(crate) mod ipc;
pub(crate) mod isolator;
pub mod worker;

#[doc(hidden)]
pub use inventory;

pub use error::DispatchError;
pub use pool::Pool;
pub use scoped::{with_pool, BoundMapper};
pub use task::{MapFn, Outcome};
pub use worker::init;
