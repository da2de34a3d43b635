#![deny(unsafe_code)]

//! whackctl: drive the IKE keying daemon over its control socket.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use whackctl_config::{ConnConfig, WhackctlConfig};
use whackctl_core::{Credential, WhackClient, exit_status};
use zeroize::Zeroizing;

/// whackctl: load, route and start IKE connections through the daemon's
/// control socket.
#[derive(Debug, Parser)]
#[command(name = "whackctl", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, default_value = "whackctl.toml")]
    config: PathBuf,

    /// Control socket path (overrides `setup.ctlsocket`).
    #[arg(long)]
    ctlsocket: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Answer the daemon's XAUTH username prompt with this value.
    #[arg(long)]
    xauth_username: Option<String>,

    /// Answer the daemon's XAUTH password prompt from this file.
    #[arg(long)]
    xauth_password_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Add connections to the daemon (uploading their public keys).
    Add {
        /// Connection names as given in the config.
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Install a connection's routes and policies.
    Route { name: String },

    /// Start negotiating a connection.
    Initiate { name: String },

    /// Ask the daemon to listen for IKE.
    Listen,

    /// Listen, then add / route / initiate every connection per its `auto=`.
    Autostart,

    /// Validate and display configuration.
    Config {
        /// Show the resolved configuration.
        #[arg(long)]
        show: bool,

        /// Show it as JSON instead of TOML.
        #[arg(long, requires = "show")]
        json: bool,
    },
}

/// A command resolved against the configuration, ready to run.
#[derive(Debug)]
enum Operation {
    Add(Vec<ConnConfig>),
    Route(ConnConfig),
    Initiate(ConnConfig),
    Listen,
    Autostart(WhackctlConfig),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, found) = load_config(&cli.config).await?;
    init_tracing(cli.verbose, &config.logging.level);
    if !found {
        info!(path = %cli.config.display(), "Config file not found, using defaults");
    }

    let op = match cli.command {
        Commands::Config { show, json } => return cmd_config(&cli.config, &config, show, json),
        Commands::Add { names } => Operation::Add(
            names
                .iter()
                .map(|n| find_conn(&config, n).cloned())
                .collect::<Result<_>>()?,
        ),
        Commands::Route { name } => Operation::Route(find_conn(&config, &name)?.clone()),
        Commands::Initiate { name } => Operation::Initiate(find_conn(&config, &name)?.clone()),
        Commands::Listen => Operation::Listen,
        Commands::Autostart => Operation::Autostart(config.clone()),
    };

    let ctlsocket = cli
        .ctlsocket
        .unwrap_or_else(|| PathBuf::from(&config.setup.ctlsocket));
    let password = match &cli.xauth_password_file {
        Some(path) => Some(read_password_file(path).await?),
        None => None,
    };
    let client = WhackClient::new(ctlsocket)
        .with_xauth(cli.xauth_username.as_deref().map(Credential::from), password);

    // socket and terminal I/O block; keep them off the async workers
    let status = tokio::task::spawn_blocking(move || run(client, op))
        .await
        .context("transaction task failed")?;
    debug!(status, "exiting");
    std::process::exit(status);
}

fn init_tracing(verbose: u8, config_level: &str) {
    let filter = match verbose {
        0 => config_level,
        1 => "debug",
        _ => "trace",
    };

    // stdout carries the daemon's transcript
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();
}

fn run(mut client: WhackClient, op: Operation) -> i32 {
    let result = match &op {
        Operation::Add(conns) => conns
            .iter()
            .map(|conn| client.add_conn(conn))
            .find(|r| exit_status(r) != 0)
            .unwrap_or(Ok(0)),
        Operation::Route(conn) => client.route_conn(conn),
        Operation::Initiate(conn) => client.initiate_conn(conn),
        Operation::Listen => client.listen(),
        Operation::Autostart(config) => client.autostart(config),
    };
    exit_status(&result)
}

fn find_conn<'a>(config: &'a WhackctlConfig, name: &str) -> Result<&'a ConnConfig> {
    match config.conn(name) {
        Some(conn) => Ok(conn),
        None => bail!("no connection named '{name}' in configuration"),
    }
}

/// Read a password file, dropping one trailing line terminator.
async fn read_password_file(path: &Path) -> Result<Credential> {
    let bytes = Zeroizing::new(
        tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read password file '{}'", path.display()))?,
    );
    let trimmed = bytes
        .strip_suffix(b"\n")
        .map(|b| b.strip_suffix(b"\r").unwrap_or(b))
        .unwrap_or(&bytes[..]);
    Ok(Credential::new(trimmed))
}

fn cmd_config(path: &Path, config: &WhackctlConfig, show: bool, json: bool) -> Result<()> {
    if !show {
        println!("Configuration at '{}' is valid.", path.display());
    } else if json {
        println!("{}", serde_json::to_string_pretty(config)?);
    } else {
        let toml_str =
            toml::to_string_pretty(config).map_err(|e| anyhow::anyhow!("TOML error: {e}"))?;
        println!("{toml_str}");
    }
    Ok(())
}

async fn load_config(path: &Path) -> Result<(WhackctlConfig, bool)> {
    if path.exists() {
        let config = WhackctlConfig::load(path)
            .await
            .with_context(|| format!("failed to load '{}'", path.display()))?;
        Ok((config, true))
    } else {
        Ok((WhackctlConfig::default(), false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use whackctl_test_utils::{TestConfigBuilder, TestConfigFile, test_conn};

    #[test]
    fn test_parse_add_with_options() {
        let cli = Cli::try_parse_from([
            "whackctl",
            "-c",
            "/etc/whackctl.toml",
            "--ctlsocket",
            "/tmp/pluto.ctl",
            "-vv",
            "add",
            "home",
            "road",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("/etc/whackctl.toml"));
        assert_eq!(cli.ctlsocket, Some(PathBuf::from("/tmp/pluto.ctl")));
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Add { names } => assert_eq!(names, vec!["home", "road"]),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_add_requires_a_name() {
        assert!(Cli::try_parse_from(["whackctl", "add"]).is_err());
    }

    #[test]
    fn test_json_requires_show() {
        assert!(Cli::try_parse_from(["whackctl", "config", "--json"]).is_err());
        assert!(Cli::try_parse_from(["whackctl", "config", "--show", "--json"]).is_ok());
    }

    #[test]
    fn test_find_conn() {
        let config = TestConfigBuilder::new()
            .conn(test_conn("home", "add"))
            .build();
        assert_eq!(find_conn(&config, "home").unwrap().name, "home");
        let err = find_conn(&config, "work").unwrap_err();
        assert!(err.to_string().contains("no connection named 'work'"));
    }

    #[test]
    fn test_run_reports_client_failure_without_daemon() {
        let dir = tempfile::TempDir::new().unwrap();
        let client = WhackClient::new(dir.path().join("pluto.ctl"));
        assert_eq!(run(client, Operation::Listen), whackctl_core::CLIENT_FAILURE);
    }

    #[tokio::test]
    async fn test_password_file_trailing_newline() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("pw");
        tokio::fs::write(&path, "s3cret\r\n").await.unwrap();
        assert_eq!(read_password_file(&path).await.unwrap().expose(), b"s3cret");

        tokio::fs::write(&path, "keep\n\n").await.unwrap();
        assert_eq!(read_password_file(&path).await.unwrap().expose(), b"keep\n");
    }

    #[tokio::test]
    async fn test_missing_config_uses_defaults() {
        let (config, found) = load_config(Path::new("/nonexistent/whackctl.toml"))
            .await
            .unwrap();
        assert!(!found);
        assert_eq!(config.setup.ctlsocket, whackctl_config::DEFAULT_CTLSOCKET);
    }

    #[tokio::test]
    async fn test_config_file_round_trip() {
        let file = TestConfigFile::with_toml(
            r#"
[setup]
ctlsocket = "/tmp/test.ctl"

[[conn]]
name = "home"
auto = "start"
[conn.left]
host = "%defaultroute"
[conn.right]
host = "192.0.2.2"
"#,
        )
        .await;
        let (config, found) = load_config(&file.path).await.unwrap();
        assert!(found);
        assert_eq!(config.setup.ctlsocket, "/tmp/test.ctl");
        assert_eq!(find_conn(&config, "home").unwrap().id, 1);
    }
}
