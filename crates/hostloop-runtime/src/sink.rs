//! Where workers send what happened.
//!
//! Workers never return deferred-call outcomes to the code that scheduled
//! them. Completed calls go to an `InvocationObserver`, failures to an
//! `ErrorSink`. Both are shared by every worker of a pool and are called from
//! the worker threads.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::RuntimeError;
use crate::types::{InvocationRecord, WorkerId};

/// A failure a worker survived.
#[derive(Debug)]
pub struct ErrorReport {
    pub worker: WorkerId,
    /// Sequence number of the deferred call, if the failure belongs to one.
    pub seq: Option<u64>,
    pub error: RuntimeError,
}

/// Receives worker-local failures.
pub trait ErrorSink: Send + Sync + 'static {
    fn report(&self, report: ErrorReport);
}

/// Receives completed deferred invocations.
pub trait InvocationObserver: Send + Sync + 'static {
    fn observe(&self, record: InvocationRecord);
}

/// Logs everything through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl ErrorSink for TracingSink {
    fn report(&self, report: ErrorReport) {
        match report.seq {
            Some(seq) => tracing::warn!(
                "[{}] task #{} failed ({}): {}",
                report.worker,
                seq,
                report.error.class(),
                report.error
            ),
            None => tracing::warn!(
                "[{}] {}: {}",
                report.worker,
                report.error.class(),
                report.error
            ),
        }
    }
}

impl InvocationObserver for TracingSink {
    fn observe(&self, record: InvocationRecord) {
        match &record.result {
            Some(result) => tracing::debug!(
                "[{}] task #{} {} -> {}",
                record.worker,
                record.seq,
                record.args,
                result
            ),
            None => tracing::debug!(
                "[{}] task #{} {} -> <opaque>",
                record.worker,
                record.seq,
                record.args
            ),
        }
    }
}

/// Keeps every report and record in memory.
#[derive(Debug, Default)]
pub struct Recorder {
    errors: Mutex<Vec<ErrorReport>>,
    invocations: Mutex<Vec<InvocationRecord>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Records observed so far, in arrival order.
    pub fn invocations(&self) -> Vec<InvocationRecord> {
        self.invocations.lock().clone()
    }

    /// Records of one worker, in the order that worker ran them.
    pub fn invocations_of(&self, worker: WorkerId) -> Vec<InvocationRecord> {
        self.invocations
            .lock()
            .iter()
            .filter(|r| r.worker == worker)
            .cloned()
            .collect()
    }

    pub fn error_count(&self) -> usize {
        self.errors.lock().len()
    }

    /// Take all error reports collected so far.
    pub fn take_errors(&self) -> Vec<ErrorReport> {
        std::mem::take(&mut *self.errors.lock())
    }

    /// Take all invocation records collected so far.
    pub fn take_invocations(&self) -> Vec<InvocationRecord> {
        std::mem::take(&mut *self.invocations.lock())
    }
}

impl ErrorSink for Recorder {
    fn report(&self, report: ErrorReport) {
        tracing::debug!("[{}] recorded {}", report.worker, report.error.class());
        self.errors.lock().push(report);
    }
}

impl InvocationObserver for Recorder {
    fn observe(&self, record: InvocationRecord) {
        self.invocations.lock().push(record);
    }
}

/// The sinks a pool hands to each of its workers.
#[derive(Clone)]
pub struct Hooks {
    pub errors: Arc<dyn ErrorSink>,
    pub observer: Arc<dyn InvocationObserver>,
}

impl Hooks {
    /// Log-only hooks.
    pub fn tracing() -> Self {
        Self {
            errors: Arc::new(TracingSink),
            observer: Arc::new(TracingSink),
        }
    }

    /// Send both streams to one recorder.
    pub fn recording(recorder: Arc<Recorder>) -> Self {
        Self {
            errors: recorder.clone(),
            observer: recorder,
        }
    }
}

impl Default for Hooks {
    fn default() -> Self {
        Self::tracing()
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks").finish_non_exhaustive()
    }
}
