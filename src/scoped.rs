//! Scoped acquisition and a bound-mapper convenience wrapper (C8).

use std::marker::PhantomData;
use std::num::NonZeroUsize;
use std::time::Duration;

use crate::error::DispatchError;
use crate::pool::Pool;
use crate::task::{MapFn, Outcome};

/// Starts a pool, runs `body` with it, and stops it again even if `body`
/// panics. Mirrors how [`crate::pool::Pool`]'s own `Drop` implementation
/// guarantees worker cleanup, but also guarantees `start`/`stop` pairing for
/// callers who don't want to manage the pool's lifecycle themselves.
pub fn with_pool<F, R>(
    pool_size: Option<NonZeroUsize>,
    timeout: Option<Duration>,
    body: impl FnOnce(&mut Pool<F>) -> R,
) -> Result<R, DispatchError>
where
    F: MapFn,
{
    let mut pool = Pool::<F>::new(pool_size, timeout);
    pool.start()?;

    struct StopGuard<'p, F: MapFn>(&'p mut Pool<F>);

    impl<'p, F: MapFn> Drop for StopGuard<'p, F> {
        fn drop(&mut self) {
            let _ = self.0.stop();
        }
    }

    let result = {
        let guard = StopGuard(&mut pool);
        body(guard.0)
    };

    Ok(result)
}

/// Binds a worker function and pool configuration together into a value
/// that can be called directly with an iterable, combining `start` + map +
/// `stop` into one call.
#[derive(Debug)]
pub struct BoundMapper<F: MapFn> {
    pool_size: Option<NonZeroUsize>,
    timeout: Option<Duration>,
    _marker: PhantomData<F>,
}

impl<F: MapFn> BoundMapper<F> {
    pub fn new(pool_size: Option<NonZeroUsize>, timeout: Option<Duration>) -> Self {
        Self {
            pool_size,
            timeout,
            _marker: PhantomData,
        }
    }

    /// Runs `inputs` through a scoped pool and collects every outcome in
    /// input order.
    pub fn map_ordered<I>(&self, inputs: I) -> Result<Vec<Outcome<F::Output>>, DispatchError>
    where
        I: IntoIterator<Item = F::Args>,
        I::IntoIter: 'static,
    {
        with_pool::<F, _>(self.pool_size, self.timeout, |pool| {
            pool.imap(inputs)?.collect::<Result<Vec<_>, _>>()
        })?
    }

    /// Runs `inputs` through a scoped pool and collects every outcome in
    /// completion order.
    pub fn map_unordered<I>(&self, inputs: I) -> Result<Vec<Outcome<F::Output>>, DispatchError>
    where
        I: IntoIterator<Item = F::Args>,
        I::IntoIter: 'static,
    {
        with_pool::<F, _>(self.pool_size, self.timeout, |pool| {
            pool.imap_unordered(inputs)?.collect::<Result<Vec<_>, _>>()
        })?
    }
}
