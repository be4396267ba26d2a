//! Plain data shared between the pool, its workers and their observers.

use std::fmt;
use std::thread::ThreadId;

use guest_types::{ArgSnapshot, GuestValue};
use serde::{Deserialize, Serialize};

/// Index of a worker within its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// A named piece of guest source code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUnit {
    pub name: String,
    pub text: String,
}

impl SourceUnit {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
        }
    }

    /// The fixed startup script: one deferred `a + b` over two numeric literals.
    pub fn repro(binding: &str) -> Self {
        Self::new(
            "repro.js",
            format!(
                r#"
{binding}((a, b) => {{
    console.log("a + b: " + (a + b));
    return a + b;
}}, 1000, 2000);
"#
            ),
        )
    }
}

/// Result the fixed startup script is expected to produce on every worker.
pub const REPRO_RESULT: i64 = 3000;

/// One completed deferred invocation.
#[derive(Debug, Clone)]
pub struct InvocationRecord {
    /// Worker that owns the guest function.
    pub worker: WorkerId,
    /// Per-worker sequence number assigned when the call was scheduled.
    pub seq: u64,
    /// Arguments handed to the function.
    pub args: ArgSnapshot,
    /// Snapshot of the return value, `None` when it could not be copied.
    pub result: Option<GuestValue>,
    /// Thread the invocation ran on.
    pub thread: ThreadId,
}
