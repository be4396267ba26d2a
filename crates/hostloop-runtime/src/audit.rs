//! Per-worker counters and the owner-thread guard.
//!
//! Every entry into a guest runtime passes through `OwnerGuard::enter`. The
//! guard compares the calling thread with the thread that created the runtime
//! and refuses (and counts) any entry from elsewhere.

use std::ops::AddAssign;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use serde::Serialize;

use crate::error::RuntimeError;
use crate::types::WorkerId;

/// Live counters for one worker, shared with its handle.
#[derive(Debug, Default)]
pub struct WorkerStats {
    entries: AtomicU64,
    foreign_entries: AtomicU64,
    scheduled: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

impl WorkerStats {
    pub(crate) fn record_scheduled(&self) {
        self.scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            entries: self.entries.load(Ordering::Relaxed),
            foreign_entries: self.foreign_entries.load(Ordering::Relaxed),
            scheduled: self.scheduled.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of `WorkerStats`; pool totals are sums of these.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Successful entries into the guest runtime.
    pub entries: u64,
    /// Refused entries from a thread other than the owner.
    pub foreign_entries: u64,
    /// Deferred calls accepted by the bridge.
    pub scheduled: u64,
    /// Deferred calls that returned, or whose returned promise fulfilled.
    pub completed: u64,
    /// Deferred calls that threw, or whose returned promise rejected.
    pub failed: u64,
    /// Bridge calls refused with InvalidArgument.
    pub rejected: u64,
}

impl StatsSnapshot {
    /// Scheduled calls that have neither completed nor failed yet.
    pub fn in_flight(&self) -> u64 {
        self.scheduled
            .saturating_sub(self.completed)
            .saturating_sub(self.failed)
    }
}

impl AddAssign for StatsSnapshot {
    fn add_assign(&mut self, rhs: Self) {
        self.entries += rhs.entries;
        self.foreign_entries += rhs.foreign_entries;
        self.scheduled += rhs.scheduled;
        self.completed += rhs.completed;
        self.failed += rhs.failed;
        self.rejected += rhs.rejected;
    }
}

impl std::iter::Sum for StatsSnapshot {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(StatsSnapshot::default(), |mut acc, s| {
            acc += s;
            acc
        })
    }
}

/// Remembers which thread owns a guest runtime.
#[derive(Debug, Clone)]
pub struct OwnerGuard {
    worker: WorkerId,
    owner: ThreadId,
    stats: Arc<WorkerStats>,
}

impl OwnerGuard {
    /// Bind the guard to the calling thread.
    pub fn for_current_thread(worker: WorkerId, stats: Arc<WorkerStats>) -> Self {
        Self {
            worker,
            owner: thread::current().id(),
            stats,
        }
    }

    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    /// Admit the calling thread, or refuse it if it is not the owner.
    pub fn enter(&self) -> Result<(), RuntimeError> {
        if thread::current().id() != self.owner {
            self.stats.foreign_entries.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                "[{}] refused guest entry from foreign thread {:?}",
                self.worker,
                thread::current().id()
            );
            return Err(RuntimeError::CrossThreadAccess {
                worker: self.worker,
            });
        }
        self.stats.entries.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
