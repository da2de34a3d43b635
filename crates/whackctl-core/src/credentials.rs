//! Interactive credential bridge.
//!
//! When the daemon asks for an XAUTH password or username in the middle of a
//! reply stream, the [`CredentialBridge`] obtains it from a
//! [`CredentialSource`] (the terminal in production, a script in tests) and
//! hands back the bytes to write on the same connection.
//!
//! ## Security Properties
//!
//! - Credential bytes live in [`Zeroizing`] buffers and are cleared on drop.
//! - [`Credential`] is redacted in `Debug` output.
//! - Values are never logged; only their lengths are.

use std::fmt;
use std::io::{self, BufRead, Write};

use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use tracing::{debug, error};
use zeroize::Zeroizing;

use crate::error::{CredentialKind, Result, WhackError};

/// Longest XAUTH password the daemon accepts.
pub const MAX_SECRET_LEN: usize = 128;

/// Longest XAUTH username the daemon accepts.
pub const MAX_USERNAME_LEN: usize = 128;

impl CredentialKind {
    /// Protocol maximum for this kind.
    pub fn max_len(self) -> usize {
        match self {
            Self::Secret => MAX_SECRET_LEN,
            Self::Username => MAX_USERNAME_LEN,
        }
    }
}

/// A password or username, zeroized on drop.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credential(Zeroizing<Vec<u8>>);

impl Credential {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(Zeroizing::new(bytes.into()))
    }

    /// The raw bytes. Use only to put them on the wire.
    pub fn expose(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn truncate(&mut self, len: usize) {
        self.0.truncate(len);
    }
}

impl From<&str> for Credential {
    fn from(s: &str) -> Self {
        Self::new(s.as_bytes())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("value", &"[REDACTED]")
            .field("len", &self.0.len())
            .finish()
    }
}

/// Where prompted credentials come from.
///
/// Implementations should read up to `max_len + 1` bytes so that over-long
/// input stays detectable; the bridge does the clamping.
pub trait CredentialSource {
    fn read_secret(&mut self, prompt: &str, max_len: usize) -> io::Result<Credential>;

    fn read_username(&mut self, prompt: &str, max_len: usize) -> io::Result<Credential>;
}

impl<T: CredentialSource + ?Sized> CredentialSource for &mut T {
    fn read_secret(&mut self, prompt: &str, max_len: usize) -> io::Result<Credential> {
        (**self).read_secret(prompt, max_len)
    }

    fn read_username(&mut self, prompt: &str, max_len: usize) -> io::Result<Credential> {
        (**self).read_username(prompt, max_len)
    }
}

/// Per-transaction credential cache in front of a [`CredentialSource`].
///
/// Each kind is prompted for until a non-empty value is entered; after that
/// a repeated request reuses the cached value. Preset values are always
/// reused, empty or not.
pub struct CredentialBridge<'a, P: ?Sized> {
    source: &'a mut P,
    secret: Option<Cached>,
    username: Option<Cached>,
}

#[derive(Debug)]
struct Cached {
    value: Credential,
    preset: bool,
}

impl Cached {
    fn reusable(&self) -> bool {
        self.preset || !self.value.is_empty()
    }
}

impl<'a, P: CredentialSource + ?Sized> CredentialBridge<'a, P> {
    pub fn new(source: &'a mut P) -> Self {
        Self {
            source,
            secret: None,
            username: None,
        }
    }

    /// Seed the cache so the source is never asked for `kind`.
    pub fn preset(&mut self, kind: CredentialKind, value: Credential) {
        *self.slot(kind) = Some(Cached {
            value: clamp(kind, value),
            preset: true,
        });
    }

    /// Whether a value for `kind` will be reused without prompting.
    pub fn has(&self, kind: CredentialKind) -> bool {
        let cached = match kind {
            CredentialKind::Secret => &self.secret,
            CredentialKind::Username => &self.username,
        };
        cached.as_ref().is_some_and(Cached::reusable)
    }

    /// The bytes to send for `kind`, prompting with `prompt` if not cached.
    /// The result never exceeds the kind's maximum length.
    pub fn obtain(&mut self, kind: CredentialKind, prompt: &str) -> Result<&[u8]> {
        if !self.has(kind) {
            let max = kind.max_len();
            let read = match kind {
                CredentialKind::Secret => self.source.read_secret(prompt, max),
                CredentialKind::Username => self.source.read_username(prompt, max),
            }
            .map_err(|source| WhackError::Prompt { kind, source })?;
            debug!(%kind, len = read.len(), "credential read");
            *self.slot(kind) = Some(Cached {
                value: clamp(kind, read),
                preset: false,
            });
        }
        Ok(self
            .slot(kind)
            .as_ref()
            .map_or(&[][..], |c| c.value.expose()))
    }

    fn slot(&mut self, kind: CredentialKind) -> &mut Option<Cached> {
        match kind {
            CredentialKind::Secret => &mut self.secret,
            CredentialKind::Username => &mut self.username,
        }
    }
}

impl<P: ?Sized> fmt::Debug for CredentialBridge<'_, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialBridge")
            .field("secret", &self.secret)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Cut `value` down to the protocol maximum, reporting when it had to.
fn clamp(kind: CredentialKind, mut value: Credential) -> Credential {
    let max = kind.max_len();
    if value.len() > max {
        error!(%kind, len = value.len(), max, "{kind} cannot be >= {max} chars");
        value.truncate(max);
    }
    value
}

/// Reads credentials from the controlling terminal.
///
/// Secrets are typed with echo off (crossterm raw mode); usernames are read
/// as an ordinary line from stdin. Prompts go to stderr so stdout carries
/// only the reply transcript.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompt;

impl CredentialSource for TerminalPrompt {
    fn read_secret(&mut self, prompt: &str, max_len: usize) -> io::Result<Credential> {
        let mut stderr = io::stderr();
        write!(stderr, "{prompt}: ")?;
        stderr.flush()?;

        let bytes = {
            let _raw = RawModeGuard::enable()?;
            read_hidden_line(max_len + 1)?
        };
        writeln!(stderr)?;
        Ok(Credential(bytes))
    }

    fn read_username(&mut self, prompt: &str, max_len: usize) -> io::Result<Credential> {
        let mut stderr = io::stderr();
        write!(stderr, "{prompt}: ")?;
        stderr.flush()?;

        let mut line = Zeroizing::new(String::new());
        io::stdin().lock().read_line(&mut line)?;
        let trimmed = line.trim_end_matches(['\r', '\n']).as_bytes();
        let keep = trimmed.len().min(max_len + 1);
        Ok(Credential::new(&trimmed[..keep]))
    }
}

/// Raw mode for the lifetime of the guard.
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> io::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

/// Collect key presses until Enter, keeping at most `limit` bytes.
fn read_hidden_line(limit: usize) -> io::Result<Zeroizing<Vec<u8>>> {
    let mut buf = Zeroizing::new(Vec::with_capacity(limit));
    loop {
        let Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }
        match key.code {
            KeyCode::Enter => return Ok(buf),
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                return Err(io::Error::new(io::ErrorKind::Interrupted, "input aborted"));
            }
            KeyCode::Backspace => {
                // drop a whole UTF-8 sequence
                while let Some(b) = buf.pop() {
                    if b & 0xC0 != 0x80 {
                        break;
                    }
                }
            }
            KeyCode::Char(c) => {
                let mut utf8 = [0u8; 4];
                let encoded = c.encode_utf8(&mut utf8).as_bytes();
                if buf.len() + encoded.len() <= limit {
                    buf.extend_from_slice(encoded);
                }
            }
            _ => {}
        }
    }
}
