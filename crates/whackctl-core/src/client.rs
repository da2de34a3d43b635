//! Transaction orchestration.
//!
//! A [`WhackClient`] runs one request/response transaction per call:
//! pack → connect → send → read replies until the daemon closes → return
//! the status. Nothing is shared between transactions except the client's
//! settings and any pre-supplied XAUTH credentials.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};
use whackctl_config::{AutoStart, ConnConfig, WhackctlConfig};

use crate::credentials::{Credential, CredentialBridge, CredentialSource, TerminalPrompt};
use crate::error::{CredentialKind, Result, WhackError};
use crate::message::{WhackMessage, op};
use crate::pack::pack;
use crate::reply::{ReplyCodes, ReplyOutcome, ReplyReader};
use crate::starter::{add_conn_message, connection_name, pubkey_message};
use crate::transport::{Connector, UnixConnector};

/// Client for the daemon's control socket.
///
/// Generic over how the socket is reached, where prompted credentials come
/// from and where the reply transcript goes, so each can be replaced in
/// tests.
pub struct WhackClient<C = UnixConnector, P = TerminalPrompt, W = io::Stdout> {
    ctl_socket: PathBuf,
    connector: C,
    prompt: P,
    transcript: W,
    codes: ReplyCodes,
    xauth_username: Option<Credential>,
    xauth_password: Option<Credential>,
}

impl WhackClient {
    /// A client for the socket at `ctl_socket`, prompting on the terminal
    /// and writing the transcript to stdout.
    pub fn new(ctl_socket: impl Into<PathBuf>) -> Self {
        Self {
            ctl_socket: ctl_socket.into(),
            connector: UnixConnector,
            prompt: TerminalPrompt,
            transcript: io::stdout(),
            codes: ReplyCodes::default(),
            xauth_username: None,
            xauth_password: None,
        }
    }
}

impl<C, P, W> WhackClient<C, P, W> {
    pub fn with_connector<C2>(self, connector: C2) -> WhackClient<C2, P, W> {
        WhackClient {
            ctl_socket: self.ctl_socket,
            connector,
            prompt: self.prompt,
            transcript: self.transcript,
            codes: self.codes,
            xauth_username: self.xauth_username,
            xauth_password: self.xauth_password,
        }
    }

    pub fn with_prompt<P2>(self, prompt: P2) -> WhackClient<C, P2, W> {
        WhackClient {
            ctl_socket: self.ctl_socket,
            connector: self.connector,
            prompt,
            transcript: self.transcript,
            codes: self.codes,
            xauth_username: self.xauth_username,
            xauth_password: self.xauth_password,
        }
    }

    pub fn with_transcript<W2>(self, transcript: W2) -> WhackClient<C, P, W2> {
        WhackClient {
            ctl_socket: self.ctl_socket,
            connector: self.connector,
            prompt: self.prompt,
            transcript,
            codes: self.codes,
            xauth_username: self.xauth_username,
            xauth_password: self.xauth_password,
        }
    }

    /// Override the reply-code table (for daemons with a different ABI).
    pub fn with_reply_codes(mut self, codes: ReplyCodes) -> Self {
        self.codes = codes;
        self
    }

    /// Pre-supply XAUTH credentials so the daemon's prompts are answered
    /// without asking the user.
    pub fn with_xauth(mut self, username: Option<Credential>, password: Option<Credential>) -> Self {
        self.xauth_username = username;
        self.xauth_password = password;
        self
    }

    pub fn ctl_socket(&self) -> &Path {
        &self.ctl_socket
    }

    pub fn transcript(&self) -> &W {
        &self.transcript
    }
}

impl<C, P, W> WhackClient<C, P, W>
where
    C: Connector,
    P: CredentialSource,
    W: Write,
{
    /// Run one transaction and report how the reply stream ended.
    pub fn transact(&mut self, msg: &WhackMessage) -> Result<ReplyOutcome> {
        let packed = pack(msg)?;
        debug!(ops = msg.ops, len = packed.len(), header = packed.header_len(), "packed message");

        let mut conn = self.connector.connect(&self.ctl_socket)?;
        conn.send_all(packed.as_bytes())
            .map_err(WhackError::RequestWrite)?;

        let mut bridge = CredentialBridge::new(&mut self.prompt);
        if let Some(username) = &self.xauth_username {
            bridge.preset(CredentialKind::Username, username.clone());
        }
        if let Some(password) = &self.xauth_password {
            bridge.preset(CredentialKind::Secret, password.clone());
        }

        let outcome = ReplyReader::new(self.codes, &mut self.transcript, bridge).run(&mut conn)?;
        debug!(status = outcome.status, "transaction finished");
        Ok(outcome)
    }

    /// Send `msg` and return the daemon's status: 0 for success, a positive
    /// daemon code otherwise. Failures are logged and returned as errors;
    /// [`WhackError::status`] gives their integer form.
    pub fn execute(&mut self, msg: &WhackMessage) -> Result<i32> {
        match self.transact(msg) {
            Ok(outcome) => Ok(outcome.status),
            Err(e) => {
                error!(error = %e, status = e.status(), "transaction failed");
                Err(e)
            }
        }
    }

    /// Add `conn` to the daemon, then upload any pre-exchanged public keys
    /// (left first, then right).
    pub fn add_conn(&mut self, conn: &ConnConfig) -> Result<i32> {
        let name = connection_name(&conn.name, conn.id);
        info!(conn = %name, "adding connection");

        let msg = add_conn_message(conn)
            .inspect_err(|e| error!(conn = %name, error = %e, "cannot translate connection"))?;
        let status = self.execute(&msg)?;
        if status != 0 {
            return Ok(status);
        }

        for (side, end) in [("left", &conn.left), ("right", &conn.right)] {
            let Some(key_msg) =
                pubkey_message(conn, side, end).inspect_err(|e| error!(error = %e, "key not sent"))?
            else {
                continue;
            };
            // only client-side failures decide the add; a reply-phase
            // failure counts like any other daemon code
            let key_status = match self.execute(&key_msg) {
                Ok(status) => status,
                Err(e) if e.status() > 0 => e.status(),
                Err(e) => return Err(e),
            };
            if key_status != 0 {
                warn!(conn = %name, side, status = key_status, "public key upload rejected");
            }
        }
        Ok(0)
    }

    /// Install the routes/policies of an added connection.
    pub fn route_conn(&mut self, conn: &ConnConfig) -> Result<i32> {
        let mut msg = WhackMessage::with_ops(op::ROUTE);
        msg.name = Some(connection_name(&conn.name, conn.id).into_owned());
        info!(conn = msg.name.as_deref(), "routing connection");
        self.execute(&msg)
    }

    /// Start negotiating an added connection without waiting for it.
    pub fn initiate_conn(&mut self, conn: &ConnConfig) -> Result<i32> {
        let mut msg = WhackMessage::with_ops(op::INITIATE | op::ASYNC);
        msg.name = Some(connection_name(&conn.name, conn.id).into_owned());
        info!(conn = msg.name.as_deref(), "initiating connection");
        self.execute(&msg)
    }

    /// Ask the daemon to start listening for IKE.
    pub fn listen(&mut self) -> Result<i32> {
        info!("asking daemon to listen");
        self.execute(&WhackMessage::with_ops(op::LISTEN))
    }

    /// Listen, then act on every connection according to its `auto=`
    /// setting. Stops at the first non-zero status.
    pub fn autostart(&mut self, config: &WhackctlConfig) -> Result<i32> {
        let status = self.listen()?;
        if status != 0 {
            return Ok(status);
        }

        for conn in &config.conns {
            let auto = conn.autostart();
            if auto == AutoStart::Ignore {
                continue;
            }

            let status = self.add_conn(conn)?;
            if status != 0 {
                return Ok(status);
            }

            let status = match auto {
                AutoStart::Route | AutoStart::OnDemand => self.route_conn(conn)?,
                AutoStart::Start => self.initiate_conn(conn)?,
                AutoStart::Add | AutoStart::Ignore => 0,
            };
            if status != 0 {
                return Ok(status);
            }
        }
        Ok(0)
    }
}

/// Integer status of an operation result, errors included.
pub fn exit_status(result: &Result<i32>) -> i32 {
    match result {
        Ok(status) => *status,
        Err(e) => e.status(),
    }
}
