//! The worker runtime (C3): the loop that runs inside a re-exec'd child
//! process, and the bootstrap that gets it there.

use std::env;
use std::process;
use std::time::Duration;

use ipc_channel::ipc::{self, IpcSender};

use crate::ipc::{WireInstruction, WireResult};
use crate::isolator;
use crate::registry;
use crate::task::Outcome;

pub(crate) const BOOTSTRAP_ENV: &str = "PROCMAP_BOOTSTRAP_SERVER";
pub(crate) const TIMEOUT_ENV_MS: &str = "PROCMAP_TIMEOUT_MS";
pub(crate) const FN_NAME_ENV: &str = "PROCMAP_FN_NAME";

/// Must be called as the first statement of `main` in any binary that spawns
/// a [`crate::pool::Pool`]. If the current process was re-exec'd as a
/// worker, this runs the worker loop and never returns; otherwise it is a
/// no-op.
pub fn init() {
    if env::var(BOOTSTRAP_ENV).is_err() {
        return;
    }
    run_worker_and_exit();
}

fn run_worker_and_exit() -> ! {
    match run_worker() {
        Ok(()) => process::exit(0),
        Err(message) => {
            log::error!("worker exiting after fatal error: {message}");
            process::exit(1);
        }
    }
}

fn run_worker() -> Result<(), String> {
    let server_name = env::var(BOOTSTRAP_ENV).map_err(|_| "missing bootstrap env var".to_string())?;
    let timeout = env::var(TIMEOUT_ENV_MS)
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .map(Duration::from_millis);
    let fn_name = env::var(FN_NAME_ENV).map_err(|_| "missing worker function name env var".to_string())?;
    let descriptor = registry::lookup(&fn_name)?;

    let (task_tx, task_rx) =
        ipc::channel::<WireInstruction>().map_err(|err| err.to_string())?;
    let bootstrap_tx: IpcSender<IpcSender<WireInstruction>> =
        IpcSender::connect(server_name).map_err(|err| err.to_string())?;
    bootstrap_tx.send(task_tx).map_err(|err| err.to_string())?;

    let result_tx = match task_rx.recv().map_err(|err| err.to_string())? {
        WireInstruction::Init { result_tx } => result_tx,
        _ => return Err("expected Init as the first instruction".to_string()),
    };

    log::trace!("worker bootstrapped, entering task loop");

    loop {
        let instruction = match task_rx.recv() {
            Ok(instruction) => instruction,
            Err(_) => {
                log::trace!("task channel disconnected, exiting");
                return Ok(());
            }
        };

        match instruction {
            WireInstruction::Task { id, payload } => {
                let invoke = descriptor.invoke;
                let wire = match isolator::run_with_timeout(move || invoke(&payload), timeout) {
                    Outcome::Value(bytes) => WireResult::Value {
                        task_id: id,
                        payload: bytes,
                    },
                    Outcome::WorkerError(message) => WireResult::Failed { task_id: id, message },
                    Outcome::Timeout => WireResult::TimedOut { task_id: id },
                };

                let is_timeout = matches!(wire, WireResult::TimedOut { .. });
                let _ = result_tx.send(wire);

                if is_timeout {
                    log::trace!("task {id} timed out, exiting");
                    return Ok(());
                }
            }
            WireInstruction::Poison => {
                let _ = result_tx.send(WireResult::Acknowledge);
                return Ok(());
            }
            WireInstruction::Init { .. } => {
                return Err("received a second Init instruction".to_string());
            }
        }
    }
}

#[cfg(feature = "test-support")]
#[ctor::ctor]
fn auto_init() {
    init();
}
