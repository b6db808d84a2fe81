//! Error types for paddock-core.

use thiserror::Error;

/// Result type alias for paddock-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors surfaced by VM operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed or inconsistent request. Never retried.
    #[error("spec error: {0}")]
    Spec(String),

    /// Valid request blocked by current resource state. May be retried.
    #[error("resource unavailable: {0}")]
    Busy(String),

    /// Command arrived while the VM is not accepting it
    #[error("vm not ready: expected {expected}, got {actual}")]
    NotReady {
        /// State the command needs
        expected: String,
        /// Current state
        actual: String,
    },

    /// A driver command session exhausted its retries
    #[error("driver session failed: {0}")]
    DriverSession(String),

    /// The control channel to the hypervisor or agent broke
    #[error("connection interrupted: {0}")]
    Interrupted(String),

    /// Persisted state cannot be read by this version
    #[error("incompatible persist version {found}, supported {compatible}..={current}")]
    Version {
        /// Version found in the snapshot
        found: u32,
        /// Oldest supported version
        compatible: u32,
        /// Newest supported version
        current: u32,
    },

    /// Persisted state belongs to a different VM
    #[error("persisted state belongs to {found}, expected {expected}")]
    IdMismatch {
        /// VM id asked for
        expected: String,
        /// VM id found in the snapshot
        found: String,
    },

    /// Persisted state is internally inconsistent
    #[error("persistent data corrupt: {0}")]
    Corrupt(String),

    /// The in-guest agent returned an error
    #[error("agent error: {0}")]
    Agent(String),

    /// The VM has been closed
    #[error("vm {0} is closed")]
    Closed(String),

    /// Error from paddock-vm
    #[error("VM error: {0}")]
    Vm(#[from] paddock_vm::VmError),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    pub(crate) fn spec(cause: impl Into<String>) -> Self {
        Self::Spec(cause.into())
    }

    pub(crate) fn busy(cause: impl Into<String>) -> Self {
        Self::Busy(cause.into())
    }

    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy(_))
    }
}
