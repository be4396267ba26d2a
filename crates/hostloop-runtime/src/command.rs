//! Commands sent from a `WorkerHandle` to its worker thread.

use tokio::sync::oneshot;

use crate::error::RuntimeError;
use crate::types::SourceUnit;

pub(crate) enum WorkerCommand {
    /// Evaluate a source unit in the worker's guest runtime.
    Evaluate {
        source: SourceUnit,
        reply: oneshot::Sender<Result<(), RuntimeError>>,
    },

    /// Reply once the run queue is empty.
    Flush { reply: oneshot::Sender<()> },
}
