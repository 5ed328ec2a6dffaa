//! Periodic launch attempts.
//!
//! The poller makes progress without new submissions: when a worker exits,
//! the next tick reclaims its slot and launches the next waiting item.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::scheduler::{LaunchOutcome, LaunchScheduler};

/// Poller timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerConfig {
    /// Delay before the first tick.
    pub initial_delay: Duration,

    /// Interval between ticks.
    pub interval: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(10),
            interval: Duration::from_secs(20),
        }
    }
}

/// Errors from starting a poller.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PollerError {
    #[error("poll interval must be greater than zero")]
    ZeroInterval,
}

/// Background task calling `try_launch` on a fixed schedule.
pub struct Poller {
    shutdown_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl Poller {
    /// Spawn the poll loop on the current Tokio runtime.
    pub fn start(
        scheduler: Arc<LaunchScheduler>,
        config: PollerConfig,
    ) -> Result<Self, PollerError> {
        if config.interval.is_zero() {
            return Err(PollerError::ZeroInterval);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_poll_loop(scheduler, config, shutdown_rx));
        Ok(Self {
            shutdown_tx,
            handle: Some(handle),
        })
    }

    /// Stop polling and wait for the loop to exit.
    ///
    /// A launch attempt already in progress runs to completion first.
    pub async fn stop(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "Poller task panicked");
            }
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn run_poll_loop(
    scheduler: Arc<LaunchScheduler>,
    config: PollerConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        initial_delay = ?config.initial_delay,
        interval = ?config.interval,
        "Starting poller"
    );

    let mut ticker = tokio::time::interval_at(Instant::now() + config.initial_delay, config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Poller shutting down");
                    break;
                }
            }
            _ = ticker.tick() => {
                match scheduler.try_launch().await {
                    Ok(LaunchOutcome::Launched { item_id, slot, .. }) => {
                        info!(item_id = %item_id, slot = %slot, "Poll launched work item");
                    }
                    Ok(outcome) => debug!(?outcome, "Poll cycle complete"),
                    Err(e) => error!(error = %e, "Poll cycle failed"),
                }
            }
        }
    }
}
