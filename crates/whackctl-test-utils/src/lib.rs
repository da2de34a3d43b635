#![deny(unsafe_code)]

//! Shared test utilities for the whackctl workspace.
//!
//! Provides a scripted mock daemon on a real Unix socket, a scripted
//! credential source, a log capture layer and config builders so that
//! individual crate tests stay concise and consistent.
//!
//! Add this crate as a `[dev-dependency]` in any workspace member:
//!
//! ```toml
//! [dev-dependencies]
//! whackctl-test-utils = { workspace = true }
//! ```

pub mod config;
pub mod daemon;
pub mod prompt;
pub mod tracing_setup;

pub use config::{TestConfigBuilder, TestConfigFile, test_conn};
pub use daemon::{Exchange, MockDaemon, Session};
pub use prompt::ScriptedPrompt;
pub use tracing_setup::{CapturedEvent, LogCapture};
