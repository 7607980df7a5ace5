//! `escrowctl`: operator CLI for the escrow orchestrator.
//!
//! Each subcommand runs one facade operation and prints the result as JSON.
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `CONFIG_FILE` selects the TOML configuration (default `escrow.toml`)
//! - `ETHEREUM_NODE_URL`, `ETHEREUM_ADMIN_ADDRESS`, `ETHEREUM_ADMIN_PRIVATE_KEY`
//! - `RUST_LOG`, `LOG_FORMAT=json` control logging

use anyhow::Context;
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

use escrow_orchestrator::sig_down::SigDown;
use escrow_orchestrator::telemetry::Telemetry;
use escrow_orchestrator::{CallContext, EscrowConfig, EscrowOrchestrator};

#[derive(Debug, Parser)]
#[command(name = "escrowctl", version, about = "Deploy and operate escrow contracts")]
struct Cli {
    /// Configuration file.
    #[arg(long, env = "CONFIG_FILE", default_value = "escrow.toml")]
    config: PathBuf,

    /// Give up on state-changing calls after this many seconds.
    #[arg(long)]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Deploy an escrow funded with `budget` (in ether).
    Deploy {
        #[arg(long)]
        contractor: String,
        #[arg(long)]
        budget: String,
    },
    /// Release escrowed funds to the contractor.
    Release {
        #[arg(long)]
        address: String,
    },
    /// Withdraw escrowed funds back to the admin account.
    Withdraw {
        #[arg(long)]
        address: String,
    },
    /// Terminate an escrow.
    Terminate {
        #[arg(long)]
        address: String,
    },
    /// Look up a transaction receipt.
    Status {
        #[arg(long)]
        hash: String,
    },
    /// Balance of any address, in ether.
    Balance {
        #[arg(long)]
        address: String,
    },
    /// Contractor, budget, status and balance of an escrow.
    Details {
        #[arg(long)]
        address: String,
    },
}

#[derive(Serialize)]
struct Deployed {
    address: String,
}

#[derive(Serialize)]
struct Balance {
    address: String,
    balance: String,
}

fn print<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    let _telemetry = Telemetry::new()
        .with_name("escrowctl")
        .with_version(env!("CARGO_PKG_VERSION"))
        .register();

    let config = EscrowConfig::load(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    let orchestrator = EscrowOrchestrator::connect(&config)
        .map_err(|e| anyhow::anyhow!(e))
        .context("connecting to ledger node")?;

    let sig_down = SigDown::try_new().context("installing signal handlers")?;
    let mut ctx = CallContext::new().with_cancellation(sig_down.cancellation_token());
    if let Some(seconds) = cli.timeout {
        ctx = ctx.with_timeout(Duration::from_secs(seconds));
    }

    match cli.command {
        Command::Deploy { contractor, budget } => {
            let address = orchestrator.deploy_contract(&contractor, &budget, &ctx).await?;
            print(&Deployed {
                address: address.to_string(),
            })
        }
        Command::Release { address } => print(&orchestrator.release_funds(&address, &ctx).await?),
        Command::Withdraw { address } => print(&orchestrator.withdraw_funds(&address, &ctx).await?),
        Command::Terminate { address } => print(&orchestrator.terminate_contract(&address, &ctx).await?),
        Command::Status { hash } => print(&orchestrator.check_transaction_status(&hash).await?),
        Command::Balance { address } => {
            let balance = orchestrator.get_balance(&address).await?;
            print(&Balance {
                address,
                balance: balance.to_ether_string(),
            })
        }
        Command::Details { address } => print(&orchestrator.contract_details(&address).await?),
    }
}
