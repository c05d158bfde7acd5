//! # CLI Interface
//!
//! Defines the command-line argument structure for `tessera-node` using
//! `clap` derive. Supports three subcommands: `run`, `init` and `version`.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Tessera permissioned network node.
///
/// Joins the committee mesh, discovers peers through gossip, catches up to
/// the network's chain by majority vote, and exposes Prometheus metrics.
#[derive(Parser, Debug)]
#[command(
    name = "tessera-node",
    about = "Tessera permissioned network node",
    version,
    propagate_version = true
)]
pub struct TesseraNodeCli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the node.
    Run(RunArgs),
    /// Create the data directory, a node key and a starter config.
    Init(InitArgs),
    /// Print version information and exit.
    Version,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormatArg {
    Pretty,
    Json,
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to the node configuration file (TOML).
    ///
    /// When omitted, the node looks for `config.toml` in the data directory
    /// and falls back to defaults.
    #[arg(long, short = 'c', env = "TESSERA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory holding the database and the node key.
    #[arg(long, short = 'd', env = "TESSERA_DATA_DIR", default_value = ".tessera")]
    pub data_dir: PathBuf,

    /// Router (base) port. Publisher and webserver ports follow from it.
    #[arg(long, env = "TESSERA_ROUTER_PORT")]
    pub router_port: Option<u16>,

    /// Port for the Prometheus metrics endpoint. Defaults to the webserver
    /// port.
    #[arg(long, env = "TESSERA_METRICS_PORT")]
    pub metrics_port: Option<u16>,

    /// Hex-encoded Ed25519 secret key.
    ///
    /// If not provided, the node reads `node.key` from the data directory.
    #[arg(long, env = "TESSERA_NODE_KEY", hide_env_values = true)]
    pub key_hex: Option<String>,

    /// Log output format.
    #[arg(long, value_enum, env = "TESSERA_LOG_FORMAT", default_value = "pretty")]
    pub log_format: LogFormatArg,
}

#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Directory to initialize.
    #[arg(long, short = 'd', env = "TESSERA_DATA_DIR", default_value = ".tessera")]
    pub data_dir: PathBuf,

    /// Router (base) port written into the starter config.
    #[arg(long, default_value_t = tessera_protocol::config::DEFAULT_ROUTER_PORT)]
    pub router_port: u16,

    /// Overwrite an existing node key.
    #[arg(long)]
    pub force: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        TesseraNodeCli::command().debug_assert();
    }

    #[test]
    fn run_defaults() {
        let cli = TesseraNodeCli::try_parse_from(["tessera-node", "run"]).unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.log_format, LogFormatArg::Pretty);
        assert!(args.router_port.is_none());
    }

    #[test]
    fn rejects_non_numeric_port() {
        let parsed = TesseraNodeCli::try_parse_from(["tessera-node", "run", "--router-port", "abc"]);
        assert!(parsed.is_err());
    }
}
