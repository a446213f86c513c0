//! Error types for Tether.
//!
//! This module provides a unified error type for all core operations,
//! with specific variants for transport, protocol and transfer failures.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A specialized `Result` type for Tether operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for Tether.
#[derive(Error, Debug)]
pub enum Error {
    /// USB access has not been granted by the platform (E001)
    #[error("USB permission denied")]
    PermissionDenied,

    /// No USB backend responded (E002)
    #[error("no USB backend available: {0}")]
    BackendUnavailable(String),

    /// The forwarded host port did not accept a connection (E003)
    #[error("host unreachable at {addr}: {reason}")]
    HostUnreachable {
        /// Address that was tried
        addr: SocketAddr,
        /// Underlying failure
        reason: String,
    },

    /// No response arrived in time (E004)
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The link went away while the operation was outstanding (E005)
    #[error("link lost: {0}")]
    LinkLost(String),

    /// Frame header or payload is inconsistent
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// The stream closed in the middle of a frame
    #[error("stream closed mid-frame")]
    Truncated,

    /// Payload exceeds the configured maximum
    #[error("frame payload of {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Payload size
        size: usize,
        /// Configured maximum
        max: usize,
    },

    /// Operation was cancelled
    #[error("cancelled")]
    Cancelled,

    /// No link is currently connected
    #[error("not connected")]
    NotConnected,

    /// A connect attempt is already running
    #[error("connect already in progress")]
    ConnectInProgress,

    /// A link is already connected
    #[error("already connected")]
    AlreadyConnected,

    /// The host answered with an error frame
    #[error("host error {code:?}: {message}")]
    Remote {
        /// Host error code
        code: RemoteErrorCode,
        /// Host message
        message: String,
    },

    /// Some paths of a delete request could not be removed
    #[error("failed to delete {} path(s): {}", .0.len(), format_failures(.0))]
    DeleteFailed(Vec<(String, String)>),

    /// No task with this id
    #[error("transfer task {0} not found")]
    TaskNotFound(uuid::Uuid),

    /// Command not valid for the task's current state
    #[error("transfer task {id} is {state}, operation not allowed")]
    InvalidTaskState {
        /// Task id
        id: uuid::Uuid,
        /// Current state name
        state: String,
    },

    /// Configuration file error
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid configuration value
    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidConfig {
        /// Configuration key
        key: String,
        /// Reason for invalidity
        reason: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal error (should not happen)
    #[error("internal error: {0}")]
    Internal(String),
}

fn format_failures(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(path, reason)| format!("{path} ({reason})"))
        .collect::<Vec<_>>()
        .join(", ")
}

impl Error {
    /// Returns the error code associated with this error, if any.
    ///
    /// Error codes follow the pattern EXXX where XXX is a 3-digit number.
    #[must_use]
    pub const fn code(&self) -> Option<&'static str> {
        match self {
            Self::PermissionDenied => Some("E001"),
            Self::BackendUnavailable(_) => Some("E002"),
            Self::HostUnreachable { .. } => Some("E003"),
            Self::Timeout(_) => Some("E004"),
            Self::LinkLost(_) => Some("E005"),
            _ => None,
        }
    }

    /// Returns whether this error is recoverable (can be retried).
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::BackendUnavailable(_)
                | Self::HostUnreachable { .. }
                | Self::Timeout(_)
                | Self::LinkLost(_)
        )
    }

    /// Returns whether this error means the link itself is unusable.
    #[must_use]
    pub const fn is_link_lost(&self) -> bool {
        matches!(self, Self::LinkLost(_))
    }
}

/// Error codes sent by the host in an error frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum RemoteErrorCode {
    /// Host did not recognise the opcode
    UnknownCommand = 1,
    /// Path is not valid on the host
    InvalidPath = 2,
    /// Path does not exist
    FileNotFound = 3,
    /// Host refused access
    PermissionDenied = 4,
    /// Target already exists
    AlreadyExists = 5,
    /// Directory is not empty
    NotEmpty = 6,
    /// Host disk is full
    NoSpace = 7,
    /// Generic I/O failure
    IoError = 8,
    /// Host-side timeout
    Timeout = 9,
    /// Host could not parse the request
    ProtocolError = 10,
    /// Code not known to this client
    Unknown = 0,
}

impl RemoteErrorCode {
    /// Map a wire value to a code.
    pub const fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::UnknownCommand,
            2 => Self::InvalidPath,
            3 => Self::FileNotFound,
            4 => Self::PermissionDenied,
            5 => Self::AlreadyExists,
            6 => Self::NotEmpty,
            7 => Self::NoSpace,
            8 => Self::IoError,
            9 => Self::Timeout,
            10 => Self::ProtocolError,
            _ => Self::Unknown,
        }
    }
}

/// Category of a task failure, kept alongside the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A chunk was not acknowledged in time
    Timeout,
    /// The link dropped
    LinkLost,
    /// The host reported an error
    Remote,
    /// Local file I/O failed
    Io,
    /// Process stopped while the task was active
    Interrupted,
    /// Anything else
    Other,
}

/// Cloneable summary of why a task failed.
///
/// `Error` owns non-cloneable sources such as `io::Error`; observers get this
/// instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    /// Failure category
    pub kind: FailureKind,
    /// Human readable detail
    pub message: String,
}

impl FailureReason {
    /// Create a reason from parts.
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Reason used for tasks found active after a restart.
    pub fn interrupted() -> Self {
        Self::new(FailureKind::Interrupted, "interrupted")
    }
}

impl From<&Error> for FailureReason {
    fn from(err: &Error) -> Self {
        let kind = match err {
            Error::Timeout(_) => FailureKind::Timeout,
            Error::LinkLost(_) | Error::NotConnected => FailureKind::LinkLost,
            Error::Remote { .. } => FailureKind::Remote,
            Error::Io(_) => FailureKind::Io,
            _ => FailureKind::Other,
        };
        Self::new(kind, err.to_string())
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::PermissionDenied.code(), Some("E001"));
        assert_eq!(Error::LinkLost("eof".into()).code(), Some("E005"));
        assert_eq!(Error::Truncated.code(), None);
    }

    #[test]
    fn test_recoverable() {
        assert!(Error::Timeout(Duration::from_secs(1)).is_recoverable());
        assert!(!Error::PermissionDenied.is_recoverable());
        assert!(!Error::Malformed("x".into()).is_recoverable());
    }

    #[test]
    fn test_delete_failed_message_lists_paths() {
        let err = Error::DeleteFailed(vec![
            ("/a".to_string(), "not found".to_string()),
            ("/b".to_string(), "denied".to_string()),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("2 path(s)"));
        assert!(msg.contains("/a (not found)"));
        assert!(msg.contains("/b (denied)"));
    }

    #[test]
    fn test_failure_reason_from_error() {
        let reason = FailureReason::from(&Error::Timeout(Duration::from_secs(15)));
        assert_eq!(reason.kind, FailureKind::Timeout);

        let reason = FailureReason::from(&Error::LinkLost("reset".into()));
        assert_eq!(reason.kind, FailureKind::LinkLost);
        assert!(reason.message.contains("reset"));
    }

    #[test]
    fn test_remote_code_mapping() {
        assert_eq!(RemoteErrorCode::from_u32(3), RemoteErrorCode::FileNotFound);
        assert_eq!(RemoteErrorCode::from_u32(99), RemoteErrorCode::Unknown);
    }
}
