//! CLI command definitions and handlers.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};

use tether_core::config::Config;
use tether_core::files::SortField;
use tether_core::session::Session;

pub mod browse;
pub mod manage;
pub mod transfer;

/// Load configuration with graceful fallback to defaults.
///
/// If the config file doesn't exist or can't be parsed, it falls back to
/// defaults. Command-line overrides are applied on top.
pub fn load_config(global: &GlobalArgs) -> Config {
    let mut config = match &global.config {
        Some(path) => Config::load_from(path).unwrap_or_else(|e| {
            tracing::warn!("Ignoring unreadable config {}: {}", path.display(), e);
            Config::default()
        }),
        None => Config::load().unwrap_or_default(),
    };

    if let Some(port) = global.adb_port {
        config.link.adb_port = port;
    }
    if let Some(addr) = global.simulate {
        config.link.simulation_addr = addr;
        config.link.simulation_enabled = true;
    }
    config
}

/// Build a session from the global options and connect it.
pub async fn connect(global: &GlobalArgs) -> Result<Session> {
    let session = Session::builder(load_config(global))
        .build()
        .context("Invalid configuration")?;
    let host = session
        .connect()
        .await
        .context("Could not reach the host")?;

    tracing::debug!("Connected to {} ({})", host.identity, session.state());
    if !global.json && global.verbose {
        eprintln!("  Connected to {} ({})", host.identity, session.state());
    }
    Ok(session)
}

/// Tether - browse and move files on a tethered host
#[derive(Parser)]
#[command(name = "tether")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Options shared by every command
    #[command(flatten)]
    pub global: GlobalArgs,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Options shared by every command
#[derive(Args, Clone)]
pub struct GlobalArgs {
    /// Local port the ADB tunnel forwards to the host
    #[arg(long, global = true, env = "TETHER_ADB_PORT")]
    pub adb_port: Option<u16>,

    /// Fall back to a simulation host at this address
    #[arg(long, global = true, value_name = "ADDR")]
    pub simulate: Option<SocketAddr>,

    /// Use this configuration file instead of the default
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Show connection details
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available commands
#[derive(Subcommand)]
pub enum Command {
    /// List a directory on the host
    Ls(LsArgs),

    /// Search the host by name
    Find(FindArgs),

    /// Show metadata for one path
    Stat(PathArgs),

    /// Show capacity of the volume holding a path
    Df(DfArgs),

    /// List drive roots on the host
    Drives,

    /// Create a directory
    Mkdir(PathArgs),

    /// Rename a path within its directory
    Mv(MvArgs),

    /// Delete paths
    Rm(RmArgs),

    /// Download a file from the host
    Get(GetArgs),

    /// Upload a file to the host
    Put(PutArgs),

    /// Show or clear saved transfers
    History(HistoryArgs),
}

/// Sort key for listings
#[derive(Clone, Copy, ValueEnum)]
pub enum SortKey {
    /// By name
    Name,
    /// By size
    Size,
    /// By modification time
    Modified,
    /// By extension
    Type,
}

impl From<SortKey> for SortField {
    fn from(key: SortKey) -> Self {
        match key {
            SortKey::Name => Self::Name,
            SortKey::Size => Self::Size,
            SortKey::Modified => Self::ModifiedAt,
            SortKey::Type => Self::Type,
        }
    }
}

/// Arguments for the ls command
#[derive(Args)]
pub struct LsArgs {
    /// Directory to list
    #[arg(default_value = "/")]
    pub path: String,

    /// Sort key
    #[arg(short, long, value_enum, default_value = "name")]
    pub sort: SortKey,

    /// Sort descending
    #[arg(short, long)]
    pub desc: bool,
}

/// Arguments for the find command
#[derive(Args)]
pub struct FindArgs {
    /// Text the name must contain
    pub query: String,

    /// Directory to search under
    #[arg(default_value = "/")]
    pub base: String,
}

/// A single host path
#[derive(Args)]
pub struct PathArgs {
    /// Path on the host
    pub path: String,
}

/// Arguments for the df command
#[derive(Args)]
pub struct DfArgs {
    /// Path on the volume
    #[arg(default_value = "/")]
    pub path: String,
}

/// Arguments for the mv command
#[derive(Args)]
pub struct MvArgs {
    /// Path on the host
    pub path: String,

    /// New name, without directory
    pub new_name: String,
}

/// Arguments for the rm command
#[derive(Args)]
pub struct RmArgs {
    /// Paths on the host
    #[arg(required = true)]
    pub paths: Vec<String>,
}

/// Arguments for the get command
#[derive(Args)]
pub struct GetArgs {
    /// File on the host
    pub remote: String,

    /// Local destination; defaults to the file name in the current directory
    pub local: Option<PathBuf>,

    /// Minimal output
    #[arg(short, long)]
    pub quiet: bool,
}

/// Arguments for the put command
#[derive(Args)]
pub struct PutArgs {
    /// Local file
    pub local: PathBuf,

    /// Destination path on the host
    pub remote: String,

    /// Minimal output
    #[arg(short, long)]
    pub quiet: bool,
}

/// Arguments for the history command
#[derive(Args)]
pub struct HistoryArgs {
    /// Remove finished transfers
    #[arg(long)]
    pub clear: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_options_after_subcommand() {
        let cli = Cli::try_parse_from([
            "tether",
            "ls",
            "/home",
            "--sort",
            "modified",
            "--desc",
            "--adb-port",
            "6000",
            "--simulate",
            "127.0.0.1:7000",
        ])
        .unwrap();

        let Command::Ls(args) = cli.command else {
            panic!("expected ls");
        };
        assert_eq!(args.path, "/home");
        assert!(args.desc);
        assert_eq!(SortField::from(args.sort), SortField::ModifiedAt);

        let config = load_config(&GlobalArgs {
            config: Some(PathBuf::from("/nonexistent/tether.toml")),
            ..cli.global
        });
        assert_eq!(config.link.adb_port, 6000);
        assert!(config.link.simulation_enabled);
        assert_eq!(config.link.simulation_addr.port(), 7000);
    }

    #[test]
    fn test_config_file_then_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tether.toml");
        std::fs::write(&path, "[link]\nadb_port = 7100\n\n[transfer]\nchunk_size = 32768\n")
            .unwrap();

        let global = GlobalArgs {
            adb_port: None,
            simulate: None,
            config: Some(path),
            json: false,
            verbose: false,
        };
        let config = load_config(&global);
        assert_eq!(config.link.adb_port, 7100);
        assert_eq!(config.transfer.chunk_size, 32768);

        let config = load_config(&GlobalArgs {
            adb_port: Some(7200),
            ..global
        });
        assert_eq!(config.link.adb_port, 7200);
        assert_eq!(config.transfer.chunk_size, 32768);
    }

    #[test]
    fn test_unparsable_config_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tether.toml");
        std::fs::write(&path, "[link\nadb_port = ").unwrap();

        let config = load_config(&GlobalArgs {
            adb_port: None,
            simulate: None,
            config: Some(path),
            json: false,
            verbose: false,
        });
        assert_eq!(config.link.adb_port, Config::default().link.adb_port);
    }

    #[test]
    fn test_rm_requires_a_path() {
        assert!(Cli::try_parse_from(["tether", "rm"]).is_err());
    }
}
