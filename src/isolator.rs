//! Runs a single function call on a helper thread so that it can be timed
//! out without cooperation from the call itself.

use std::any::Any;
use std::panic;
use std::thread;
use std::time::Duration;

use crate::task::Outcome;

/// Calls `f` on a dedicated thread and waits for it with `timeout` (`None`
/// waits forever). On timeout, the helper thread is left running and
/// detached rather than joined or cancelled — there is no safe way to cancel
/// arbitrary user code from the outside, so the caller (the worker runtime)
/// is expected to exit the whole process shortly after seeing [`Outcome::Timeout`].
pub(crate) fn run_with_timeout<O>(
    f: impl FnOnce() -> Result<O, String> + Send + 'static,
    timeout: Option<Duration>,
) -> Outcome<O>
where
    O: Send + 'static,
{
    let (result_tx, result_rx) = crossbeam_channel::bounded(1);

    let _ = thread::spawn(move || {
        let outcome = match panic::catch_unwind(panic::AssertUnwindSafe(f)) {
            Ok(result) => result,
            Err(cause) => Err(panic_message(&*cause)),
        };
        // The receiving end may already be gone (timed out and dropped);
        // that's fine, there is nobody left to deliver the result to.
        let _ = result_tx.send(outcome);
    });

    let received = match timeout {
        Some(deadline) => result_rx.recv_timeout(deadline).ok(),
        None => result_rx.recv().ok(),
    };

    match received {
        Some(Ok(value)) => Outcome::Value(value),
        Some(Err(message)) => Outcome::WorkerError(message),
        None => Outcome::Timeout,
    }
}

fn panic_message(cause: &(dyn Any + Send)) -> String {
    if let Some(message) = cause.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = cause.downcast_ref::<String>() {
        message.clone()
    } else {
        "worker function panicked with a non-string payload".to_string()
    }
}
