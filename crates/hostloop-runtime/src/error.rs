//! Error types for the loop runtime.

use crate::types::WorkerId;

/// Errors that can occur in a worker or its guest runtime.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("{worker}: failed to initialise guest runtime: {reason}")]
    Init { worker: WorkerId, reason: String },

    #[error("script error in {source_name}: {message}")]
    Script { source_name: String, message: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("guest invocation failed: {0}")]
    GuestInvocation(String),

    #[error("{worker}: guest runtime entered from a thread that does not own it")]
    CrossThreadAccess { worker: WorkerId },

    #[error("Runtime has terminated")]
    Terminated,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Runtime thread panicked")]
    ThreadPanic,

    #[error("Failed to spawn thread: {0}")]
    SpawnFailed(#[from] std::io::Error),
}

impl RuntimeError {
    /// Short, stable name of the error class, used in reports and logs.
    pub fn class(&self) -> &'static str {
        match self {
            RuntimeError::Init { .. } => "InitError",
            RuntimeError::Script { .. } => "ScriptError",
            RuntimeError::InvalidArgument(_) => "InvalidArgument",
            RuntimeError::GuestInvocation(_) => "GuestInvocationError",
            RuntimeError::CrossThreadAccess { .. } => "CrossThreadAccessViolation",
            RuntimeError::Terminated => "Terminated",
            RuntimeError::ChannelClosed => "ChannelClosed",
            RuntimeError::ThreadPanic => "ThreadPanic",
            RuntimeError::SpawnFailed(_) => "SpawnFailed",
        }
    }
}
