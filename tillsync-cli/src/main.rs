//! tillsync: keeps a local catalog replica in step with the POS backend.
//!
//! Usage:
//!   tillsync --base-url https://pos.example.com sync
//!   tillsync enqueue adjust_stock '{"product_id": "p1", "delta": -1}'
//!   tillsync run
//!
//! One-shot commands open the replica, do their work and exit. `run` keeps
//! the background orchestrator going until interrupted.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tillsync_cli::{App, CliConfig};
use tillsync_sync::{create_orchestrator, SyncEvent};
use tillsync_types::{EntityType, MutationKind, MutationStatus};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tillsync")]
#[command(about = "Offline-first catalog replica and mutation outbox for POS terminals")]
struct Args {
    /// Path to a JSON config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Path to the replica database
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Backend base URL
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Records per fetched page
    #[arg(long, global = true)]
    batch_size: Option<usize>,

    /// Enable verbose debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one sync pass (full when due, incremental otherwise)
    Sync,
    /// Discard the replica's cursors and re-download everything
    FullSync,
    /// Print sync status as JSON
    Status,
    /// Print replicated records of one type as JSON
    Show {
        /// product, category, package or table
        entity_type: EntityType,
        /// Only this record
        id: Option<String>,
    },
    /// Queue a mutation for delivery
    Enqueue {
        /// e.g. create_order, adjust_stock
        kind: MutationKind,
        /// JSON payload
        payload: String,
    },
    /// List queued mutations
    Mutations {
        /// PENDING, SYNCING, FAILED or SUCCEEDED
        #[arg(long)]
        status: Option<MutationStatus>,
    },
    /// Deliver pending mutations
    Push,
    /// Requeue failed mutations and deliver them
    Retry,
    /// Keep syncing in the background until interrupted
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .compact()
        .init();

    let config = CliConfig::load(args.config.as_deref())?.with_overrides(
        args.db,
        args.base_url,
        args.batch_size,
    );

    match args.command {
        Command::Run => run(config).await,
        command => one_shot(config, command).await,
    }
}

async fn one_shot(config: CliConfig, command: Command) -> Result<()> {
    let app = App::new(config.open_store()?, config.http_remote()?, config.sync.clone())?;
    match command {
        Command::Sync => print_json(&app.sync(false).await?.report())?,
        Command::FullSync => print_json(&app.sync(true).await?.report())?,
        Command::Status => print_json(&app.status().await?)?,
        Command::Show { entity_type, id: Some(id) } => print_json(&app.record(entity_type, &id)?)?,
        Command::Show { entity_type, id: None } => print_json(&app.snapshot(entity_type)?)?,
        Command::Enqueue { kind, payload } => {
            let payload = serde_json::from_str(&payload).context("Payload is not valid JSON")?;
            println!("{}", app.enqueue(kind, payload)?);
        }
        Command::Mutations { status } => print_json(&app.mutations(status)?)?,
        Command::Push => print_json(&app.push().await?)?,
        Command::Retry => print_json(&app.retry().await?)?,
        Command::Run => return run(config).await,
    }
    Ok(())
}

async fn run(config: CliConfig) -> Result<()> {
    info!("tillsync starting against {}", config.remote.base_url);
    let (handle, orchestrator) = create_orchestrator(
        config.open_store()?,
        config.http_remote()?,
        config.sync.clone(),
        config.orchestrator.clone(),
    )?;
    let mut events = handle.events();
    let task = tokio::spawn(orchestrator.run());

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SyncEvent::Ready) => info!("Replica ready at {}", config.db_path.display()),
                Ok(SyncEvent::SyncCompleted { changed, full, failed }) => {
                    info!("Sync completed (full: {}, changed: {})", full, changed);
                    for entity_type in failed {
                        warn!("{} did not sync this pass", entity_type);
                    }
                }
                Ok(SyncEvent::OutboxProcessed(report)) => info!(
                    "Outbox run: {} sent, {} failed, {} deferred",
                    report.succeeded, report.failed, report.deferred
                ),
                Ok(SyncEvent::ConnectivityChanged { online }) => info!("Online: {}", online),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Dropped {} sync events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for ctrl-c")?;
                info!("Shutting down...");
                handle.shutdown().await?;
                break;
            }
        }
    }

    task.await.context("Orchestrator task panicked")?;
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
