//! Error types for whackctl-core.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::reply::rc;

/// Status returned for failures detected on the client side (packing,
/// connecting, sending the request, translating the definition).
pub const CLIENT_FAILURE: i32 = -1;

/// Why a control socket connect failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailure {
    /// The path does not fit in a socket address.
    PathTooLong,
    /// The socket exists but we may not use it.
    PermissionDenied,
    /// Nothing is listening (missing socket or refused connection).
    NoListener,
    /// Anything else the OS reported.
    Other,
}

impl fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PathTooLong => "path too long",
            Self::PermissionDenied => "permission denied",
            Self::NoListener => "daemon not listening",
            Self::Other => "connect failed",
        };
        f.write_str(s)
    }
}

/// Which interactive value the daemon asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    Secret,
    Username,
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Secret => f.write_str("xauth password"),
            Self::Username => f.write_str("username"),
        }
    }
}

/// Main error type for all control-channel operations.
#[derive(Debug, Error)]
pub enum WhackError {
    /// The strings do not fit in the message's string pool.
    #[error(
        "can't pack strings: {field} needs {needed} bytes but only {remaining} of {capacity} remain"
    )]
    PackingOverflow {
        field: String,
        needed: usize,
        remaining: usize,
        capacity: usize,
    },

    /// The control socket could not be reached.
    #[error("connect({}) failed: {reason}: {source}", path.display())]
    Connect {
        path: PathBuf,
        reason: ConnectFailure,
        source: std::io::Error,
    },

    /// The request message could not be written in full.
    #[error("write(ctl socket) failed: {0}")]
    RequestWrite(std::io::Error),

    /// A prompted credential could not be written back.
    #[error("whack: write() of {kind} failed: {source}")]
    CredentialWrite {
        kind: CredentialKind,
        source: std::io::Error,
    },

    /// Reading the reply stream failed.
    #[error("whack: read() failed: {0}")]
    Read(std::io::Error),

    /// A reply line did not start with `NNN `.
    #[error("whack: log line missing NNN prefix: {line}")]
    ProtocolViolation { line: String },

    /// The credential source could not produce a value.
    #[error("failed to read {kind}: {source}")]
    Prompt {
        kind: CredentialKind,
        source: std::io::Error,
    },

    /// A connection end has no host.
    #[error("Failed to load connection {side}= is not set")]
    EndpointUnset { side: String },

    /// A configured value could not be interpreted.
    #[error("conn {conn}: invalid {key} value {value:?}: {reason}")]
    InvalidValue {
        conn: String,
        key: String,
        value: String,
        reason: String,
    },

    /// A pre-exchanged public key could not be decoded.
    #[error("conn {conn}: {side}{alg} malformed [{reason}]")]
    MalformedPubkey {
        conn: String,
        side: String,
        alg: &'static str,
        reason: String,
    },
}

impl WhackError {
    /// The integer status this error stands for: negative for client-side
    /// failures, the daemon's whack-problem code for reply-phase failures.
    pub fn status(&self) -> i32 {
        match self {
            Self::PackingOverflow { .. }
            | Self::Connect { .. }
            | Self::RequestWrite(_)
            | Self::EndpointUnset { .. }
            | Self::InvalidValue { .. } => CLIENT_FAILURE,
            Self::CredentialWrite { .. }
            | Self::Read(_)
            | Self::ProtocolViolation { .. }
            | Self::Prompt { .. } => rc::WHACK_PROBLEM as i32,
            Self::MalformedPubkey { .. } => 1,
        }
    }
}

/// Result type alias using WhackError.
pub type Result<T> = std::result::Result<T, WhackError>;
