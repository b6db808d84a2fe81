//! Error types for paddock-vm.

use thiserror::Error;

/// Result type alias for paddock-vm operations.
pub type Result<T> = std::result::Result<T, VmError>;

/// Errors raised by drivers, boot configuration and the session runner.
#[derive(Debug, Error)]
pub enum VmError {
    /// Boot configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// The backend driver rejected an operation
    #[error("driver error: {0}")]
    Driver(String),

    /// The control channel to the hypervisor failed
    #[error("control channel error: {0}")]
    Channel(String),

    /// The control channel handshake was refused
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// VM is not in expected state
    #[error("invalid VM state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// The session runner has stopped and accepts no more sessions
    #[error("session runner closed")]
    SessionClosed,

    /// JSON encoding/decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout waiting for operation
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),
}
