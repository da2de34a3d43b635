#![deny(unsafe_code)]

//! whackctl core: a control-channel client for an IKE keying daemon.
//!
//! Builds a control message, packs its strings into the message's bounded
//! string pool, sends it over the daemon's Unix control socket and decodes
//! the prefix-coded reply stream, answering credential prompts on the same
//! connection when the daemon asks for them.

/// Transaction orchestration and the high-level operations.
pub mod client;
/// Prompted credentials: cache, clamping and the terminal source.
pub mod credentials;
/// Error taxonomy and the integer status contract.
pub mod error;
/// Control message and endpoint records.
pub mod message;
/// String-pool packing into the wire form.
pub mod pack;
/// Pre-exchanged public key decoding.
pub mod pubkey;
/// Reply line parsing and the reply state machine.
pub mod reply;
/// Connection definition → control message translation.
pub mod starter;
/// Unix control socket transport.
pub mod transport;

pub use client::{WhackClient, exit_status};
pub use credentials::{Credential, CredentialBridge, CredentialSource, TerminalPrompt};
pub use error::{CLIENT_FAILURE, ConnectFailure, CredentialKind, Result, WhackError};
pub use message::{HostSelector, WhackEnd, WhackMessage};
pub use pack::{PackedMessage, StrRef, pack};
pub use reply::{ReplyClass, ReplyCodes, ReplyLine, ReplyOutcome};
pub use transport::{Connection, Connector, UnixConnector};
