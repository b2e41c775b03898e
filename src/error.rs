//! Error types for the connection core.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::state::VpnKind;

/// Failure categories reported to observers and callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The client binary could not be started.
    Spawn,
    /// No elevated secret is available (or it was rejected).
    NoCredentials,
    /// The VPN server rejected the profile credentials.
    AuthFailed,
    /// No completion marker within the connect budget.
    Timeout,
    /// The client reported a fatal error.
    FatalError,
    /// The client exited outside a normal lifecycle transition.
    UnexpectedExit,
    /// Reading or writing the persisted record failed.
    Io,
    /// The requested operation is not valid in the current state.
    Usage,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Spawn => "spawn error",
            Self::NoCredentials => "no credentials",
            Self::AuthFailed => "authentication failed",
            Self::Timeout => "timeout",
            Self::FatalError => "fatal error",
            Self::UnexpectedExit => "unexpected exit",
            Self::Io => "I/O error",
            Self::Usage => "usage error",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum VpnError {
    #[error("failed to start VPN client: {source}")]
    Spawn {
        #[source]
        source: io::Error,
    },

    #[error("elevated secret unavailable")]
    NoCredentials,

    #[error("VPN server rejected the credentials: {0}")]
    AuthFailed(String),

    #[error("no completion marker within {0:?}")]
    Timeout(Duration),

    #[error("VPN client reported a fatal error: {0}")]
    Fatal(String),

    /// Carries the client's last output lines, possibly empty.
    #[error("VPN client exited unexpectedly{}", quoted_output(.0))]
    UnexpectedExit(String),

    #[error("{context} ({path}): {source}")]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("connection '{0}' already has a lifecycle operation or live process")]
    AlreadyConnected(String),

    #[error("no process is tracked for connection '{0}'")]
    NotTracked(String),

    #[error("unknown profile '{0}'")]
    UnknownProfile(String),

    #[error("a profile named '{0}' already exists")]
    DuplicateProfile(String),

    #[error("profile '{name}' is not usable: {reason}")]
    InvalidProfile { name: String, reason: String },

    #[error("{0} connections are not supported yet")]
    Unsupported(VpnKind),
}

impl VpnError {
    pub(crate) fn io(context: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            context,
            path: path.into(),
            source,
        }
    }

    /// Maps the error onto the observer-facing taxonomy.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Spawn { .. } => ErrorKind::Spawn,
            Self::NoCredentials => ErrorKind::NoCredentials,
            Self::AuthFailed(_) => ErrorKind::AuthFailed,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Fatal(_) => ErrorKind::FatalError,
            Self::UnexpectedExit(_) => ErrorKind::UnexpectedExit,
            Self::Io { .. } => ErrorKind::Io,
            Self::AlreadyConnected(_)
            | Self::NotTracked(_)
            | Self::UnknownProfile(_)
            | Self::DuplicateProfile(_)
            | Self::InvalidProfile { .. }
            | Self::Unsupported(_) => ErrorKind::Usage,
        }
    }
}

fn quoted_output(output: &str) -> String {
    if output.is_empty() {
        String::new()
    } else {
        format!(":\n{output}")
    }
}

pub type Result<T> = std::result::Result<T, VpnError>;
