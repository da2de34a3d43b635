//! Configuration builders for tests.
//!
//! Use [`TestConfigBuilder`] to create customised [`WhackctlConfig`] values
//! without repeating boilerplate across crate boundaries, and
//! [`TestConfigFile`] when the code under test loads from disk.

use std::path::PathBuf;

use tempfile::TempDir;
use whackctl_config::{ConnConfig, WhackctlConfig};

/// A connection with both ends set (`%defaultroute` ↔ `192.0.2.2`) and the
/// given `auto=` value.
pub fn test_conn(name: &str, auto: &str) -> ConnConfig {
    let mut conn = ConnConfig::named(name);
    conn.auto = auto.to_string();
    conn.left.host = Some("%defaultroute".to_string());
    conn.right.host = Some("192.0.2.2".to_string());
    conn
}

/// Fluent builder for [`WhackctlConfig`] in tests.
///
/// # Example
///
/// ```ignore
/// let config = TestConfigBuilder::new()
///     .ctlsocket(daemon.path())
///     .conn(test_conn("home", "start"))
///     .build();
/// ```
pub struct TestConfigBuilder {
    config: WhackctlConfig,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: WhackctlConfig::default(),
        }
    }

    pub fn ctlsocket(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.setup.ctlsocket = path.into().to_string_lossy().into_owned();
        self
    }

    /// Append a connection; its id is its 1-based position, as when parsed.
    pub fn conn(mut self, mut conn: ConnConfig) -> Self {
        if conn.id == 0 {
            conn.id = self.config.conns.len() as u64 + 1;
        }
        self.config.conns.push(conn);
        self
    }

    pub fn build(self) -> WhackctlConfig {
        self.config
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A config file in a temp directory, loaded through the real loader.
///
/// The temp directory is deleted automatically when this value is dropped,
/// guaranteeing cleanup even on panic.
pub struct TestConfigFile {
    pub config: WhackctlConfig,
    pub path: PathBuf,
    _temp_dir: TempDir,
}

impl TestConfigFile {
    /// Write `toml_content` to `whackctl.toml` in a fresh temp directory and
    /// load it.
    pub async fn with_toml(toml_content: &str) -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let path = temp_dir.path().join("whackctl.toml");
        tokio::fs::write(&path, toml_content)
            .await
            .expect("failed to write test config");

        let config = WhackctlConfig::load(&path)
            .await
            .expect("failed to parse test config");

        Self {
            config,
            path,
            _temp_dir: temp_dir,
        }
    }
}
