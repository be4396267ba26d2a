//! Handle to a running loop worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};

use crate::audit::{StatsSnapshot, WorkerStats};
use crate::command::WorkerCommand;
use crate::error::RuntimeError;
use crate::types::{SourceUnit, WorkerId};

/// Handle to a spawned loop worker.
///
/// The handle is `Send + Sync`; the guest runtime it controls never leaves the
/// worker thread. Dropping the handle terminates and joins the worker.
pub struct WorkerHandle {
    pub(crate) id: WorkerId,
    /// Thread that owns the guest runtime
    pub(crate) thread_id: ThreadId,
    pub(crate) cmd_tx: mpsc::Sender<WorkerCommand>,
    pub(crate) shutdown_tx: watch::Sender<bool>,
    pub(crate) terminated: Arc<AtomicBool>,
    pub(crate) stats: Arc<WorkerStats>,
    pub(crate) thread_handle: Mutex<Option<thread::JoinHandle<Result<(), RuntimeError>>>>,
}

impl WorkerHandle {
    /// Send a command and wait for its reply.
    async fn request<T>(
        &self,
        make_cmd: impl FnOnce(oneshot::Sender<T>) -> WorkerCommand,
    ) -> Result<T, RuntimeError> {
        if self.is_terminated() {
            return Err(RuntimeError::Terminated);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(make_cmd(reply_tx))
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;

        reply_rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Evaluate a source unit on the worker.
    ///
    /// A script error is returned here and leaves the worker running.
    pub async fn evaluate(&self, source: SourceUnit) -> Result<(), RuntimeError> {
        self.request(|reply| WorkerCommand::Evaluate { source, reply }).await?
    }

    /// Resolve once every task queued before this call, and every task those
    /// tasks queue, has run. Tasks parked on `host.after` are not waited for.
    pub async fn flush(&self) -> Result<(), RuntimeError> {
        self.request(|reply| WorkerCommand::Flush { reply }).await
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Signal the worker to stop. Queued tasks are discarded.
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Terminate and wait for the worker thread to finish.
    pub fn join(self) -> Result<(), RuntimeError> {
        self.terminate();
        self.join_thread()
    }

    fn join_thread(&self) -> Result<(), RuntimeError> {
        if let Some(handle) = self.thread_handle.lock().take() {
            handle.join().map_err(|_| RuntimeError::ThreadPanic)??;
        }
        Ok(())
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.terminate();
        if let Err(e) = self.join_thread() {
            tracing::warn!("[{}] worker exited with error: {}", self.id, e);
        }
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("thread_id", &self.thread_id)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}
