//! Netron CLI: run a node or talk to one.
//!
//! `serve` runs a long-lived node with the gates listed in the config file.
//! The other subcommands dial a node with a throwaway identity, perform one
//! operation and exit.

mod cli;
mod cmd;
mod node_context;
mod ui;

use crate::cli::{Cli, Commands};
use clap::Parser;
use netron::config::{default_config_path, load_config, read_config};
use netron::NetronResult;
use netron_types::config::LogConfig;

fn init_tracing(log: &LogConfig, default_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    if log.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

async fn run(cli: Cli) -> NetronResult<()> {
    let config = load_config(cli.config.as_deref());
    match cli.command {
        Commands::Serve { binds, is_super } => cmd::serve::cmd_serve(config, binds, is_super).await,
        Commands::Ping { addr, count } => cmd::client::cmd_ping(config, &addr, count).await,
        Commands::Contexts { addr, json } => cmd::client::cmd_contexts(config, &addr, json).await,
        Commands::Call {
            addr,
            context,
            method,
            args,
        } => cmd::client::cmd_call(config, &addr, &context, &method, &args).await,
        Commands::Get {
            addr,
            context,
            property,
        } => cmd::client::cmd_get(config, &addr, &context, &property).await,
    }
}

fn main() {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let log = read_config(&config_path)
        .map(|c| c.log)
        .unwrap_or_default();
    let level = if cli.command.is_serve() {
        log.level.clone()
    } else {
        "warn".to_string()
    };
    init_tracing(&log, &level);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            ui::error(&format!("Failed to start the async runtime: {e}"));
            std::process::exit(1);
        }
    };
    if let Err(e) = runtime.block_on(run(cli)) {
        ui::error(&e.to_string());
        std::process::exit(1);
    }
}
