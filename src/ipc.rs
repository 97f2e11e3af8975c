//! The envelope types that actually travel over `ipc-channel` pipes between
//! the pool and its worker processes.

use ipc_channel::ipc::IpcSender;
use serde::{Deserialize, Serialize};

/// Sent from the pool to a worker's dedicated input channel.
#[derive(Serialize, Deserialize, Debug)]
pub enum WireInstruction {
    /// First message a worker ever receives: hands it the sender half of the
    /// result channel it should reply on. `ipc-channel` lets a sender be
    /// transferred as the payload of another message, which is what makes
    /// this handshake possible without a second one-shot server.
    Init { result_tx: IpcSender<WireResult> },
    /// Run the worker function this process was spawned for (named by the
    /// `PROCMAP_FN_NAME` environment variable set at spawn time) with the
    /// postcard-encoded `payload` as its argument, tagged with `id`.
    Task { id: u64, payload: Vec<u8> },
    /// Reply with [`WireResult::Acknowledge`] and exit.
    Poison,
}

/// Sent from a worker to the pool's multiplexed output channel.
#[derive(Serialize, Deserialize, Debug)]
pub enum WireResult {
    /// Reply to [`WireInstruction::Poison`].
    Acknowledge,
    /// The function completed; `payload` is its postcard-encoded return
    /// value.
    Value { task_id: u64, payload: Vec<u8> },
    /// The function returned an error, or the payload failed to decode.
    Failed { task_id: u64, message: String },
    /// The task exceeded its timeout. The worker exits immediately after
    /// sending this.
    TimedOut { task_id: u64 },
}
