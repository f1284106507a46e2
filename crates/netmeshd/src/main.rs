//! netmeshd — the netmesh node daemon.
//!
//! Runs the service-IP packet proxy of one node:
//! - Translation table and resolution environment
//! - Proxy tunnel between the TUN device and the UDP tunnel port
//! - Standing interests in remote jobs
//!
//! # Usage
//!
//! ```text
//! netmeshd standalone --config /etc/netmesh/node.toml
//! ```

mod node;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use netmesh_core::NetConfig;
use tracing_subscriber::EnvFilter;

/// Log filter when `RUST_LOG` is unset. Targets are crate names.
const DEFAULT_LOG_FILTER: &str = "info,netmeshd=debug,netmesh_proxy=debug,netmesh_resolve=debug";

#[derive(Parser)]
#[command(name = "netmeshd", about = "netmesh node daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a single node without an external cluster authority.
    Standalone {
        /// TOML configuration file. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override the node identifier used in bus topics.
        #[arg(long)]
        node_id: Option<String>,

        /// Override the UDP tunnel port.
        #[arg(long)]
        tunnel_port: Option<u16>,

        /// Emit logs as JSON lines.
        #[arg(long)]
        log_json: bool,
    },

    /// Print the default configuration as TOML.
    DefaultConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Standalone {
            config,
            node_id,
            tunnel_port,
            log_json,
        } => {
            init_tracing(log_json);
            let mut config = match config {
                Some(path) => NetConfig::from_file(&path)?,
                None => NetConfig::default(),
            };
            if let Some(node_id) = node_id {
                config.node.node_id = node_id;
            }
            if let Some(port) = tunnel_port {
                config.tunnel.tunnel_port = port;
            }
            node::run_standalone(config).await
        }
        Command::DefaultConfig => {
            print!("{}", NetConfig::default().to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn default_log_filter_parses() {
        let filter = EnvFilter::try_new(DEFAULT_LOG_FILTER).unwrap();
        let rendered = filter.to_string();
        assert!(rendered.contains("netmesh_proxy=debug"));
        assert!(rendered.contains("netmesh_resolve=debug"));
    }

    #[test]
    fn cli_parses_standalone_overrides() {
        Cli::command().debug_assert();
        let cli = Cli::try_parse_from([
            "netmeshd",
            "standalone",
            "--node-id",
            "worker-3",
            "--tunnel-port",
            "50200",
            "--log-json",
        ])
        .unwrap();
        match cli.command {
            Command::Standalone {
                config,
                node_id,
                tunnel_port,
                log_json,
            } => {
                assert!(config.is_none());
                assert_eq!(node_id.as_deref(), Some("worker-3"));
                assert_eq!(tunnel_port, Some(50200));
                assert!(log_json);
            }
            Command::DefaultConfig => panic!("expected standalone"),
        }
    }
}
