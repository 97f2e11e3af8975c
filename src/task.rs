use serde::de::DeserializeOwned;
use serde::Serialize;

/// A function that can be executed in a worker process.
///
/// `Args` is the concrete argument type the function is called with: a bare
/// type for a unary function, a tuple for a multi-argument one. There is no
/// runtime scalar-vs-tuple normalisation step; the argument shape is fixed by
/// this associated type.
///
/// Implementors must be registered with [`crate::register_worker_fn!`] so
/// that a freshly spawned worker process, which shares no memory with the
/// process that created the pool, can look the function up by [`Self::NAME`]
/// and invoke it.
pub trait MapFn: Send + Sync + 'static {
    /// Argument type passed to [`Self::call`].
    type Args: Serialize + DeserializeOwned + Send + 'static;
    /// Return type produced by [`Self::call`].
    type Output: Serialize + DeserializeOwned + Send + 'static;

    /// Stable name this function is registered under. Must be unique among
    /// every `MapFn` reachable in the binary.
    const NAME: &'static str;

    /// Runs the function. An `Err` is delivered to the caller as
    /// [`Outcome::WorkerError`] rather than aborting the pool.
    fn call(args: Self::Args) -> Result<Self::Output, String>;
}

/// Outcome of a single task, keyed implicitly by the task id it was
/// submitted with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<O> {
    /// The function returned successfully.
    Value(O),
    /// The task exceeded its configured timeout. The worker that was running
    /// it has been replaced.
    Timeout,
    /// The function returned an error, or its argument/return payload could
    /// not be decoded.
    WorkerError(String),
}

impl<O> Outcome<O> {
    /// Returns the contained value, or `None` for `Timeout`/`WorkerError`.
    pub fn value(self) -> Option<O> {
        match self {
            Self::Value(value) => Some(value),
            Self::Timeout | Self::WorkerError(_) => None,
        }
    }

    pub fn is_value(&self) -> bool {
        matches!(self, Self::Value(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    pub fn is_worker_error(&self) -> bool {
        matches!(self, Self::WorkerError(_))
    }
}
