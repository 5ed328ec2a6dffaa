//! slotq
//!
//! Runs the queue controller, or talks to its queue database from the shell.
//!
//! - `run`: start the controller and poll until Ctrl-C
//! - `submit`: queue a work item and make one launch attempt
//! - `list`: print work items as JSON lines
//! - `cancel`: ask the worker on a slot to stop

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use slotq_controller::agent::AgentController;
use slotq_controller::config::Config;
use slotq_controller::runtime::ScriptLauncher;
use slotq_controller::slot::{PortProbe, Slot};
use slotq_controller::state::{RequestStore, StateStore, WorkItemState};
use slotq_controller::{CancelOutcome, ControllerSettings, QueueController};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// slotq - launch queued work onto a fixed pool of port slots.
#[derive(Debug, Parser)]
#[command(name = "slotq")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the controller until interrupted.
    Run,

    /// Queue a work item and try to launch it.
    ///
    /// Use this only while no `run` process shares the database; a running
    /// controller picks up items queued by other tools on its next poll.
    Submit {
        /// Path of the data the worker operates on.
        payload_path: String,

        /// Target collection name.
        collection_name: String,
    },

    /// List work items.
    List {
        /// Only show items in this state (waiting, running, finished).
        #[arg(long)]
        state: Option<WorkItemState>,
    },

    /// Ask the worker on a slot to stop.
    Cancel {
        /// Slot (port number) of the worker.
        slot: Slot,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    match cli.command {
        Commands::Run => run(&config).await,
        Commands::Submit {
            payload_path,
            collection_name,
        } => submit(&config, payload_path, collection_name).await,
        Commands::List { state } => list(&config, state),
        Commands::Cancel { slot } => cancel(&config, slot).await,
    }
}

async fn run(config: &Config) -> Result<()> {
    let slots: Vec<u16> = config.slots.iter().map(Slot::port).collect();
    info!(
        slots = ?slots,
        poll_interval_secs = config.poll_interval_secs,
        data_dir = %config.data_dir,
        "Starting slotq controller"
    );

    let controller = QueueController::start(config)?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Received shutdown signal");

    controller.shutdown().await;
    Ok(())
}

async fn submit(config: &Config, payload_path: String, collection_name: String) -> Result<()> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create data dir {}", config.data_dir))?;
    let store = StateStore::open(config.database_path())?;

    let controller = QueueController::from_parts(
        Box::new(store),
        config.slots.clone(),
        Arc::new(PortProbe::new()),
        Arc::new(ScriptLauncher::new(
            config.worker_shell.clone(),
            config.worker_script.clone(),
        )),
        AgentController::new(config.control_url.clone(), config.control_timeout()),
        ControllerSettings {
            poller: None,
            ..config.controller_settings()
        },
    )?;

    let id = controller.submit(payload_path, collection_name).await?;
    let item = controller.item(&id).await?;
    controller.shutdown().await;

    if let Some(item) = item {
        println!("{}", serde_json::to_string(&item)?);
    }
    Ok(())
}

fn list(config: &Config, state: Option<WorkItemState>) -> Result<()> {
    let store = StateStore::open(config.database_path())?;
    let items = match state {
        Some(state) => store.find_by_state(state)?,
        None => store.list()?,
    };

    for item in items {
        println!("{}", serde_json::to_string(&item)?);
    }
    Ok(())
}

async fn cancel(config: &Config, slot: Slot) -> Result<()> {
    let agent = AgentController::new(config.control_url.clone(), config.control_timeout());
    match agent.cancel(slot).await {
        CancelOutcome::Delivered => {
            println!("stop sent to slot {slot}");
            Ok(())
        }
        CancelOutcome::Failed(e) => {
            error!(slot = %slot, error = %e, "Cancel not delivered");
            std::process::exit(1);
        }
    }
}
