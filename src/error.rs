use std::fmt;

/// Errors that abort a map operation outright, as opposed to per-task
/// outcomes ([`crate::task::Outcome`]) which are delivered as values so that
/// every input is accounted for.
#[derive(Debug)]
pub enum DispatchError {
    /// The input iterable itself produced an error (only reachable through
    /// [`crate::pool::Pool::try_imap`] / `try_imap_unordered`).
    MalformedInput(String),
    /// A worker died without producing a result, or some other part of the
    /// pool's plumbing failed.
    PoolFailure(String),
    /// A map call was attempted while another one was already in progress on
    /// the same pool.
    ConcurrentMisuse,
    /// `start` was called on a pool that is already started.
    AlreadyStarted,
    /// `stop` or a map method was called on a pool that has not been started.
    NotStarted,
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedInput(message) => write!(f, "malformed input: {message}"),
            Self::PoolFailure(message) => write!(f, "worker pool failure: {message}"),
            Self::ConcurrentMisuse => {
                write!(f, "pool is already processing another map call")
            }
            Self::AlreadyStarted => write!(f, "pool has already been started"),
            Self::NotStarted => write!(f, "pool has not been started"),
        }
    }
}

impl std::error::Error for DispatchError {}
