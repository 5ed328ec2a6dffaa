//! The queue controller: public entry point tying the pieces together.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use slotq_id::WorkItemId;
use tracing::info;

use crate::agent::{AgentController, CancelOutcome};
use crate::config::Config;
use crate::poller::{Poller, PollerConfig, PollerError};
use crate::reconciler::SlotReconciler;
use crate::runtime::{ScriptLauncher, WorkerHandle, WorkerLauncher};
use crate::scheduler::{LaunchOutcome, LaunchScheduler, DEFAULT_STARTUP_GRACE};
use crate::slot::{PortProbe, Slot, SlotPool, SlotProbe};
use crate::state::{RequestStore, StateStore, StoreError, WorkItem, WorkItemState};

/// Scheduling knobs for a controller built from parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerSettings {
    /// Poll schedule; no background polling when `None`.
    pub poller: Option<PollerConfig>,

    /// How long a started worker owns its slot before the probe decides.
    pub startup_grace: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            poller: None,
            startup_grace: DEFAULT_STARTUP_GRACE,
        }
    }
}

/// Persists submitted work items and launches them onto free slots.
///
/// The store is opened on start and released on shutdown. Submissions and
/// the background poller share one launch lock.
pub struct QueueController {
    scheduler: Arc<LaunchScheduler>,
    agent: AgentController,
    poller: Option<Poller>,
}

impl QueueController {
    /// Open the queue database, wire the real probe and launcher, and start
    /// polling. Must be called from within a Tokio runtime.
    pub fn start(config: &Config) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("failed to create data dir {}", config.data_dir))?;

        let db_path = config.database_path();
        let store = StateStore::open(&db_path)
            .with_context(|| format!("failed to open queue database {}", db_path.display()))?;

        let controller = Self::from_parts(
            Box::new(store),
            config.slots.clone(),
            Arc::new(PortProbe::new()),
            Arc::new(ScriptLauncher::new(
                config.worker_shell.clone(),
                config.worker_script.clone(),
            )),
            AgentController::new(config.control_url.clone(), config.control_timeout()),
            config.controller_settings(),
        )?;

        info!(
            slots = config.slots.len(),
            database = %db_path.display(),
            "Queue controller started"
        );
        Ok(controller)
    }

    /// Build a controller from explicit parts. The poller only runs when
    /// `settings` carries a poll schedule, and that schedule must have a
    /// non-zero interval.
    pub fn from_parts(
        store: Box<dyn RequestStore>,
        pool: SlotPool,
        probe: Arc<dyn SlotProbe>,
        launcher: Arc<dyn WorkerLauncher>,
        agent: AgentController,
        settings: ControllerSettings,
    ) -> Result<Self, PollerError> {
        let scheduler = Arc::new(
            LaunchScheduler::new(store, SlotReconciler::new(pool, probe), launcher)
                .with_startup_grace(settings.startup_grace),
        );
        let poller = settings
            .poller
            .map(|config| Poller::start(Arc::clone(&scheduler), config))
            .transpose()?;

        Ok(Self {
            scheduler,
            agent,
            poller,
        })
    }

    /// Queue a work item and try to launch it right away.
    pub async fn submit(
        &self,
        payload_path: impl Into<String>,
        collection_name: impl Into<String>,
    ) -> Result<WorkItemId, StoreError> {
        self.scheduler.submit(payload_path, collection_name).await
    }

    /// Ask the worker on `slot` to stop. Never changes any work item.
    pub async fn cancel(&self, slot: Slot) -> CancelOutcome {
        self.agent.cancel(slot).await
    }

    /// Run one launch attempt outside the poll schedule.
    pub async fn try_launch(&self) -> Result<LaunchOutcome, StoreError> {
        self.scheduler.try_launch().await
    }

    pub async fn item(&self, id: &WorkItemId) -> Result<Option<WorkItem>, StoreError> {
        self.scheduler.item(id).await
    }

    pub async fn items(&self, state: Option<WorkItemState>) -> Result<Vec<WorkItem>, StoreError> {
        self.scheduler.items(state).await
    }

    pub async fn workers(&self) -> Vec<WorkerHandle> {
        self.scheduler.workers().await
    }

    /// Stop the poller, then release the store.
    pub async fn shutdown(mut self) {
        if let Some(poller) = self.poller.take() {
            poller.stop().await;
        }
        self.scheduler.close().await;
        info!("Queue controller shut down");
    }
}
