//! Clap CLI definitions for Netron.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  netron serve                          Run a node with the gates from config.toml
  netron serve --bind 127.0.0.1:9000    Run a node on an extra gate
  netron ping 127.0.0.1:9000            Handshake with a node and measure round trips
  netron contexts 127.0.0.1:9000        List the contexts a node advertises
  netron call 127.0.0.1:9000 node echo '\"hi\"'
  netron get 127.0.0.1:9000 node uptime";

/// Netron: peer-to-peer object sharing between nodes.
#[derive(Parser)]
#[command(name = "netron", version, about, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file (default: ~/.netron/config.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a node until interrupted.
    Serve {
        /// Extra gate addresses, bound after the configured ones.
        #[arg(long = "bind", value_name = "ADDR")]
        binds: Vec<String>,
        /// Host contexts pushed by peers.
        #[arg(long = "super")]
        is_super: bool,
    },
    /// Connect to a node and ping it.
    Ping {
        /// Node address (`host:port`, `host` or `:port`).
        addr: String,
        /// Number of pings.
        #[arg(long, short = 'n', default_value_t = 3)]
        count: u32,
    },
    /// List the contexts a node advertises.
    Contexts {
        /// Node address.
        addr: String,
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Call a method on a remote context.
    Call {
        /// Node address.
        addr: String,
        /// Context name.
        context: String,
        /// Method name.
        method: String,
        /// Arguments, each parsed as JSON (plain strings are accepted as-is).
        args: Vec<String>,
    },
    /// Read a property of a remote context.
    Get {
        /// Node address.
        addr: String,
        /// Context name.
        context: String,
        /// Property name.
        property: String,
    },
}

impl Commands {
    /// Whether this command runs a long-lived node.
    pub fn is_serve(&self) -> bool {
        matches!(self, Commands::Serve { .. })
    }
}
