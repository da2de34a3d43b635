//! Scripted credential source.

use std::io;
use std::sync::{Arc, Mutex};

use whackctl_core::{Credential, CredentialKind, CredentialSource};

/// Answers prompts with fixed values and records every prompt it saw.
///
/// Clones share the record, so a test can keep one clone and hand the other
/// to the client. Like a real terminal source it returns at most
/// `max_len + 1` bytes.
#[derive(Debug, Clone, Default)]
pub struct ScriptedPrompt {
    secret: Option<Vec<u8>>,
    username: Option<Vec<u8>>,
    calls: Arc<Mutex<Vec<(CredentialKind, String)>>>,
}

impl ScriptedPrompt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, secret: impl AsRef<[u8]>) -> Self {
        self.secret = Some(secret.as_ref().to_vec());
        self
    }

    pub fn with_username(mut self, username: impl AsRef<[u8]>) -> Self {
        self.username = Some(username.as_ref().to_vec());
        self
    }

    /// Prompts received so far, in order.
    pub fn calls(&self) -> Vec<(CredentialKind, String)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn answer(&self, kind: CredentialKind, prompt: &str, max_len: usize) -> io::Result<Credential> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((kind, prompt.to_string()));
        }
        let value = match kind {
            CredentialKind::Secret => &self.secret,
            CredentialKind::Username => &self.username,
        };
        let value = value
            .as_deref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "no scripted answer"))?;
        Ok(Credential::new(&value[..value.len().min(max_len + 1)]))
    }
}

impl CredentialSource for ScriptedPrompt {
    fn read_secret(&mut self, prompt: &str, max_len: usize) -> io::Result<Credential> {
        self.answer(CredentialKind::Secret, prompt, max_len)
    }

    fn read_username(&mut self, prompt: &str, max_len: usize) -> io::Result<Credential> {
        self.answer(CredentialKind::Username, prompt, max_len)
    }
}
