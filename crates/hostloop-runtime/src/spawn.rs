//! Worker spawn function.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::audit::WorkerStats;
use crate::config::EngineConfig;
use crate::error::RuntimeError;
use crate::handle::WorkerHandle;
use crate::sink::Hooks;
use crate::types::{SourceUnit, WorkerId};
use crate::worker::{WorkerSetup, run_worker};

/// Spawn one loop worker on its own thread.
///
/// Returns once the guest runtime exists and `startup` (if any) has been
/// evaluated. Tasks scheduled by `startup` may still be queued at that point.
pub fn spawn_worker(
    id: WorkerId,
    config: Arc<EngineConfig>,
    hooks: Hooks,
    startup: Option<SourceUnit>,
) -> Result<WorkerHandle, RuntimeError> {
    tracing::debug!("[spawn_worker] Starting {}", id);

    let terminated = Arc::new(AtomicBool::new(false));
    let stats = Arc::new(WorkerStats::default());

    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (init_tx, init_rx) = std::sync::mpsc::sync_channel::<Result<ThreadId, RuntimeError>>(1);

    let setup = WorkerSetup {
        id,
        config,
        hooks,
        stats: stats.clone(),
        startup,
    };

    let thread_handle = thread::Builder::new()
        .name(format!("hostloop-{}", id))
        .spawn(move || -> Result<(), RuntimeError> {
            tracing::debug!("[{}] Thread started", id);

            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(RuntimeError::SpawnFailed)?;

            let result = rt.block_on(run_worker(setup, cmd_rx, shutdown_rx, init_tx));

            rt.shutdown_background();
            tracing::debug!("[{}] Thread exiting", id);
            result
        })?;

    // The guest runtime reports the thread it is bound to.
    let thread_id = match init_rx.recv() {
        Ok(Ok(owner)) => owner,
        Ok(Err(e)) => {
            let _ = thread_handle.join();
            return Err(e);
        }
        // The thread exited before reporting; surface its own error if it has one.
        Err(_) => {
            return Err(match thread_handle.join() {
                Ok(Err(e)) => e,
                Ok(Ok(())) => RuntimeError::ChannelClosed,
                Err(_) => RuntimeError::ThreadPanic,
            });
        }
    };

    tracing::debug!("[spawn_worker] {} is ready", id);

    Ok(WorkerHandle {
        id,
        thread_id,
        cmd_tx,
        shutdown_tx,
        terminated,
        stats,
        thread_handle: Mutex::new(Some(thread_handle)),
    })
}
