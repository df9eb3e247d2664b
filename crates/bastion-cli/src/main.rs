//! bastion: manage forwarded ports on a WireGuard gateway.
//!
//! Each `add`/`remove` runs one reconciliation cycle: validate the request,
//! apply it to the gateway's nftables DNAT rules, restart the tunnel when
//! something changed, then reconnect and verify the live rules.

mod commands;
mod config;
mod lockfile;
mod output;

use std::process::ExitCode;

use anyhow::Result;
use bastion_core::ReconciliationRequest;
use clap::{Parser, Subcommand};
use tracing::error;

use commands::Invocation;

/// bastion: port forwarding through a WireGuard gateway
#[derive(Parser)]
#[command(name = "bastion", version, about = "Forward gateway ports to a homelab over WireGuard")]
struct Cli {
    /// Config file path
    #[arg(long = "config", global = true)]
    config: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print results as JSON on stdout
    #[arg(long, global = true)]
    json: bool,

    /// Do not ask for confirmation
    #[arg(short = 'y', long, global = true)]
    yes: bool,

    /// Gateway host (overrides [gateway].host)
    #[arg(long, global = true)]
    host: Option<String>,

    /// Seconds to wait after a restart before verifying (overrides [timeouts].settle)
    #[arg(long, global = true)]
    settle: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Forward a port or port range to the homelab
    Add {
        /// Port (`8080`) or inclusive range (`8080-8085`)
        port: String,
        /// tcp or udp
        #[arg(default_value = "tcp")]
        protocol: String,
    },

    /// Stop forwarding a port or port range
    Remove {
        /// Port (`8080`) or inclusive range (`8080-8085`)
        port: String,
        /// tcp or udp
        #[arg(default_value = "tcp")]
        protocol: String,
    },

    /// List managed forwards live on the gateway
    List {
        /// List the local record instead of querying the gateway
        #[arg(long)]
        local: bool,
    },

    /// Compare the local record with the gateway's live rules
    Drift,

    /// Show the tunnel daemon's state
    Status,

    /// Write a default config file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.clone().unwrap_or_else(config::default_config_path);

    if let Command::InitConfig { force } = cli.command {
        return commands::init::run(&config_path, cli.host.as_deref(), force);
    }

    let mut cfg = config::Config::load(&config_path)?;
    if let Some(host) = cli.host {
        cfg.gateway.host = host;
    }
    if let Some(settle) = cli.settle {
        cfg.timeouts.settle = settle;
    }

    let inv = Invocation {
        config: cfg,
        json: cli.json,
        yes: cli.yes,
    };

    match cli.command {
        Command::Add { port, protocol } => {
            commands::forward::run(&inv, ReconciliationRequest::add(port, protocol)).await
        }
        Command::Remove { port, protocol } => {
            commands::forward::run(&inv, ReconciliationRequest::remove(port, protocol)).await
        }
        Command::List { local } => commands::list::run(&inv, local).await,
        Command::Drift => commands::drift::run(&inv).await,
        Command::Status => commands::status::run(&inv).await,
        Command::InitConfig { .. } => Ok(()),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize tracing. Logs go to stderr so stdout stays parseable.
    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("bastion=debug,bastion_cli=debug,bastion_client=debug,bastion_core=debug")
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("bastion=warn,bastion_cli=warn")
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        eprintln!("bastion: {e:#}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
