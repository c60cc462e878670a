//! Error types for vmshim.

use crate::power::PowerState;
use std::time::Duration;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The target VM already exists and cannot be reused.
    Conflict,
    /// A VM, controller, network, port or job does not exist.
    NotFound,
    /// The hypervisor rejected a call or a job failed.
    DriverFailure,
    /// A disk, volume or isolation type is not supported.
    Unsupported,
    /// A job did not reach a terminal state in time.
    Timeout,
    /// The command or its payload could not be understood.
    InvalidInput,
    /// Configuration or local I/O problem.
    Local,
}

/// vmshim error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("VM '{0}' is already running")]
    VmRunning(String),

    #[error("VM '{name}' already exists in state {state}")]
    VmExists { name: String, state: PowerState },

    #[error("duplicate VM name found: {0}")]
    DuplicateName(String),

    #[error("instance not found: {0}")]
    VmNotFound(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("{operation} failed: {reason}")]
    Driver { operation: String, reason: String },

    #[error("job failed: {0}")]
    JobFailed(String),

    #[error("job {job} timed out after {}", format_wait(.waited))]
    JobTimedOut { job: String, waited: Duration },

    #[error("unsupported {kind}: {value}")]
    Unsupported { kind: &'static str, value: String },

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("hypervisor unavailable: {0}")]
    HypervisorUnavailable(String),

    #[error("config error: {operation}: {reason}")]
    Config { operation: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

fn format_wait(waited: &Duration) -> humantime::FormattedDuration {
    humantime::format_duration(*waited)
}

impl Error {
    /// Create a driver failure for the named operation.
    pub fn driver(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Driver {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn unsupported(kind: &'static str, value: impl Into<String>) -> Self {
        Self::Unsupported {
            kind,
            value: value.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Wrap a lower-level failure with the operation that was being attempted.
    ///
    /// Driver and job failures get the operation prefixed; every other
    /// error is returned unchanged so its kind is preserved.
    pub fn during(self, operation: impl Into<String>) -> Self {
        match self {
            Error::Driver { reason, .. } => Error::driver(operation, reason),
            Error::JobFailed(reason) => Error::driver(operation, reason),
            other => other,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::VmRunning(_) | Error::VmExists { .. } | Error::DuplicateName(_) => {
                ErrorKind::Conflict
            }
            Error::VmNotFound(_) | Error::NotFound { .. } => ErrorKind::NotFound,
            Error::Driver { .. } | Error::JobFailed(_) | Error::HypervisorUnavailable(_) => {
                ErrorKind::DriverFailure
            }
            Error::JobTimedOut { .. } => ErrorKind::Timeout,
            Error::Unsupported { .. } => ErrorKind::Unsupported,
            Error::InvalidCommand(_) | Error::Json(_) => ErrorKind::InvalidInput,
            Error::Config { .. } | Error::Io(_) => ErrorKind::Local,
        }
    }
}

impl From<vmshim_protocol::DecodeError> for Error {
    fn from(e: vmshim_protocol::DecodeError) -> Self {
        Error::InvalidCommand(e.to_string())
    }
}

impl From<vmshim_protocol::InvalidVlan> for Error {
    fn from(e: vmshim_protocol::InvalidVlan) -> Self {
        Error::unsupported("isolation uri", e.0)
    }
}
