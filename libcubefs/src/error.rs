//! CSI error types.
//!
//! All errors in the `libcubefs` crate are represented by the [`CsiError`]
//! enum, which derives [`thiserror::Error`] for ergonomic error handling and
//! also implements [`Serialize`]/[`Deserialize`] so errors can travel across
//! the QUIC transport layer.  [`CsiError::code`] folds every variant onto the
//! coarse [`StatusCode`] taxonomy reported to the container orchestrator.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Caller-visible status class of a failed CSI call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StatusCode {
    /// Malformed or missing request fields.
    InvalidArgument,
    /// The operation presupposes state that does not exist.
    NotFound,
    /// Local I/O, serialization, mount or mount-helper failure.
    Internal,
    /// No control-plane endpoint could be reached.
    Unavailable,
    /// The control plane answered with an unexpected application error.
    Unknown,
    /// The operation was aborted by a conflicting one.
    Aborted,
    /// The method is not provided by this plugin.
    Unimplemented,
}

impl StatusCode {
    /// Whether the failure lies with the driver or its dependencies rather
    /// than with the request.
    pub fn is_server_fault(self) -> bool {
        matches!(self, Self::Internal | Self::Unavailable | Self::Unknown)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InvalidArgument => "InvalidArgument",
            Self::NotFound => "NotFound",
            Self::Internal => "Internal",
            Self::Unavailable => "Unavailable",
            Self::Unknown => "Unknown",
            Self::Aborted => "Aborted",
            Self::Unimplemented => "Unimplemented",
        };
        f.write_str(s)
    }
}

/// Unified error type for CSI operations.
#[derive(Debug, Error, Serialize, Deserialize, Clone)]
pub enum CsiError {
    /// The caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Required prior state (e.g. a staged volume) was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A mount operation failed.
    #[error("mount failed at {path}: {reason}")]
    MountFailed {
        /// Filesystem path where the mount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// An unmount operation failed.
    #[error("unmount failed at {path}: {reason}")]
    UnmountFailed {
        /// Filesystem path where the unmount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// The path is a mount point whose backing filesystem is gone
    /// (stale handle, disconnected transport endpoint).
    #[error("corrupted mount at {path}: {reason}")]
    CorruptedMount { path: String, reason: String },

    /// A reachable control-plane endpoint rejected the request.
    #[error("{operation} rejected by master {endpoint}: code={code}, msg: {msg}")]
    MasterRejected {
        operation: String,
        endpoint: String,
        code: i64,
        msg: String,
    },

    /// A control-plane endpoint could not be reached or answered garbage.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// An unclassified failure reported by the control plane.
    #[error("unknown: {0}")]
    Unknown(String),

    /// The operation was aborted.
    #[error("aborted: {0}")]
    Aborted(String),

    /// The named protocol method is not provided by this plugin.
    #[error("{0} is not implemented")]
    Unimplemented(String),

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CsiError {
    /// Create a [`CsiError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// Create a [`CsiError::Unavailable`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn unavailable<E: fmt::Display>(e: E) -> Self {
        Self::Unavailable(e.to_string())
    }

    /// Create a [`CsiError::Unimplemented`] naming the protocol method.
    pub fn unimplemented(method: &str) -> Self {
        Self::Unimplemented(method.to_owned())
    }

    /// Status class reported to the caller.
    pub fn code(&self) -> StatusCode {
        match self {
            Self::InvalidArgument(_) => StatusCode::InvalidArgument,
            Self::NotFound(_) => StatusCode::NotFound,
            Self::MountFailed { .. }
            | Self::UnmountFailed { .. }
            | Self::CorruptedMount { .. }
            | Self::Internal(_) => StatusCode::Internal,
            Self::Unavailable(_) => StatusCode::Unavailable,
            Self::MasterRejected { .. } | Self::Unknown(_) => StatusCode::Unknown,
            Self::Aborted(_) => StatusCode::Aborted,
            Self::Unimplemented(_) => StatusCode::Unimplemented,
        }
    }
}
