#![deny(unsafe_code)]

//! Configuration loading and validation for whackctl.
//!
//! Loads the TOML file that names the daemon's control socket and holds the
//! connection definitions. [`WhackctlConfig`] is the central structure; the
//! per-connection tables live in the [`conn`] module.

/// Connection definitions (`[[conn]]` tables).
pub mod conn;

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

pub use conn::{AutoStart, ConnConfig, EndConfig};

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Top-level configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct WhackctlConfig {
    /// Daemon-facing settings.
    #[serde(default)]
    pub setup: SetupConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Connection definitions, in file order.
    #[serde(default, rename = "conn")]
    pub conns: Vec<ConnConfig>,
}

/// Daemon-facing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupConfig {
    /// Path of the daemon's control socket.
    #[serde(default = "default_ctlsocket")]
    pub ctlsocket: String,
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            ctlsocket: default_ctlsocket(),
        }
    }
}

/// Default control socket path.
pub const DEFAULT_CTLSOCKET: &str = "/run/pluto/pluto.ctl";

fn default_ctlsocket() -> String {
    DEFAULT_CTLSOCKET.to_string()
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "debug", "trace").
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

const CONN_TYPES: [&str; 2] = ["tunnel", "transport"];
const AUTO_VALUES: [&str; 5] = ["ignore", "add", "route", "ondemand", "start"];
const DPD_ACTIONS: [&str; 3] = ["clear", "hold", "restart"];
const SEND_CA_VALUES: [&str; 3] = ["none", "issuer", "all"];
const ENCAPSULATION_VALUES: [&str; 3] = ["yes", "no", "auto"];
const ENABLE_TCP_VALUES: [&str; 3] = ["no", "yes", "fallback"];
const SENDCERT_VALUES: [&str; 3] = ["always", "ifasked", "never"];
const AUTH_VALUES: [&str; 5] = ["rsasig", "ecdsa", "secret", "null", "eaponly"];
const EAP_VALUES: [&str; 2] = ["none", "tls"];

impl WhackctlConfig {
    /// Load configuration from a TOML file at the given path using async I/O.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        let config = Self::parse(&content)?;
        debug!(path = %path.display(), conns = config.conns.len(), "config loaded");
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let mut config: WhackctlConfig = toml::from_str(s)?;
        for (i, conn) in config.conns.iter_mut().enumerate() {
            if conn.id == 0 {
                conn.id = i as u64 + 1;
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Look up a connection by name.
    pub fn conn(&self, name: &str) -> Option<&ConnConfig> {
        self.conns.iter().find(|c| c.name == name)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.setup.ctlsocket.is_empty() {
            return Err(ConfigError::Validation(
                "setup.ctlsocket must not be empty".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for (i, conn) in self.conns.iter().enumerate() {
            if conn.name.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "conn[{i}].name must not be empty"
                )));
            }
            if conn.name != "%auto" && !seen.insert(conn.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "conn[{i}].name {:?} is defined more than once",
                    conn.name
                )));
            }

            check_keyword(i, "auto", Some(&conn.auto), &AUTO_VALUES)?;
            check_keyword(i, "type", conn.conn_type.as_ref(), &CONN_TYPES)?;
            check_keyword(i, "dpdaction", conn.dpdaction.as_ref(), &DPD_ACTIONS)?;
            check_keyword(i, "send_ca", conn.send_ca.as_ref(), &SEND_CA_VALUES)?;
            check_keyword(
                i,
                "encapsulation",
                conn.encapsulation.as_ref(),
                &ENCAPSULATION_VALUES,
            )?;
            check_keyword(i, "enable_tcp", conn.enable_tcp.as_ref(), &ENABLE_TCP_VALUES)?;

            if let Some(v) = conn.ike_version
                && v != 1
                && v != 2
            {
                return Err(ConfigError::Validation(format!(
                    "conn[{i}].ike_version must be 1 or 2, got {v}"
                )));
            }

            for (side, end) in [("left", &conn.left), ("right", &conn.right)] {
                validate_end(i, side, end)?;
            }
        }

        Ok(())
    }
}

fn check_keyword(
    i: usize,
    key: &str,
    value: Option<&String>,
    valid: &[&str],
) -> Result<(), ConfigError> {
    match value {
        Some(v) if !valid.contains(&v.as_str()) => Err(ConfigError::Validation(format!(
            "conn[{i}].{key} must be one of {valid:?}, got {v:?}"
        ))),
        _ => Ok(()),
    }
}

fn validate_end(i: usize, side: &str, end: &EndConfig) -> Result<(), ConfigError> {
    let key = |k: &str| format!("{side}.{k}");
    check_keyword(i, &key("sendcert"), end.sendcert.as_ref(), &SENDCERT_VALUES)?;
    check_keyword(i, &key("auth"), end.auth.as_ref(), &AUTH_VALUES)?;
    check_keyword(i, &key("eap"), end.eap.as_ref(), &EAP_VALUES)?;

    if end.pubkey_count() > 1 {
        return Err(ConfigError::Validation(format!(
            "conn[{i}].{side} sets more than one of rsasigkey, ecdsakey, pubkey"
        )));
    }
    if end.is_interface_host() && end.interface_addr.is_none() {
        return Err(ConfigError::Validation(format!(
            "conn[{i}].{side}.interface_addr is required when host is an interface ({:?})",
            end.host.as_deref().unwrap_or_default()
        )));
    }
    Ok(())
}
