//! Hostloop runtime
//!
//! A pool of loop workers, each owning one embedded QuickJS runtime on its own
//! OS thread with a current-thread tokio runtime.
//!
//! # Architecture
//!
//! - Each worker runs in a dedicated thread and owns its guest runtime outright
//! - Guest code schedules deferred calls through a global binding
//!   (`hostInvoke` by default); arguments are copied at call time
//! - Deferred calls run later, in order, on the same worker
//! - Communication with the host is commands in, reports out (error sink and
//!   invocation observer)

mod audit;
mod bridge;
mod capabilities;
mod command;
mod config;
mod error;
mod globals;
mod guest;
mod handle;
mod pool;
mod sink;
mod snapshot;
mod spawn;
mod types;
mod worker;

pub use audit::{OwnerGuard, StatsSnapshot, WorkerStats};
pub use config::{Capabilities, EngineConfig};
pub use error::RuntimeError;
pub use guest::GuestRuntime;
pub use handle::WorkerHandle;
pub use pool::{DEFAULT_WORKERS, LoopPool, PoolBuilder};
pub use sink::{ErrorReport, ErrorSink, Hooks, InvocationObserver, Recorder, TracingSink};
pub use snapshot::{capture_args, capture_value, hydrate_args, hydrate_value};
pub use spawn::spawn_worker;
pub use types::{InvocationRecord, REPRO_RESULT, SourceUnit, WorkerId};

pub use guest_types::{ArgSnapshot, GuestValue, SnapshotError};
