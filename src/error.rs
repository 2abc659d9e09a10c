//! Error types shared across the daemon.

/// Errors produced by the VM lifecycle engine and callback router.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration value is malformed or out of range
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An allocator has no free entries left
    #[error("{0} pool exhausted")]
    Exhausted(&'static str),

    /// Freeing a resource that was never handed out
    #[error("{0} was not allocated")]
    NotAllocated(String),

    /// A host utility exited with a non-zero status
    #[error("command `{cmd}` failed (exit {exit:?}): {stderr}")]
    Subprocess {
        cmd: String,
        exit: Option<i32>,
        stderr: String,
    },

    /// The VMM API answered outside [200, 300)
    #[error("VMM API returned status {status}: {body}")]
    VmmTransport { status: u16, body: String },

    /// A VMM API call or readiness wait ran out of time
    #[error("timed out waiting for the VMM")]
    VmmTimeout,

    /// The in-guest command server could not be reached
    #[error("guest unreachable: {0}")]
    GuestUnreachable(String),

    /// A VM with this name is already registered
    #[error("vm already exists: {0}")]
    AlreadyExists(String),

    /// No VM registered under this name
    #[error("vm not found: {0}")]
    NotFound(String),

    /// The subscriber answered with an error object
    #[error("callback error [{code}]: {message}")]
    CallbackError { code: i64, message: String },

    /// The subscriber answered with an HTTP error status
    #[error("callback returned status {status}: {body}")]
    CallbackTransport { status: u16, body: String },

    /// Callback routed to a VM that never registered a subscriber URL
    #[error("no active callback session for VM: {0}")]
    NoSession(String),
}

pub type Result<T> = std::result::Result<T, Error>;
