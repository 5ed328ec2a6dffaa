//! Best-effort remote stop of the worker occupying a slot.
//!
//! Each worker exposes a control endpoint derived from its slot. A stop
//! request is advisory: the store is never touched here, and the slot only
//! counts as free once the reconciler's probe sees it free.

use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use crate::slot::Slot;

/// Errors from a remote stop request.
#[derive(Debug, Error)]
pub enum RemoteStopError {
    #[error("control endpoint request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("control endpoint answered HTTP {status}")]
    Status { status: u16 },
}

/// Result of a cancel request.
#[derive(Debug)]
pub enum CancelOutcome {
    /// The worker's control endpoint accepted the stop command.
    Delivered,
    /// The stop command could not be delivered.
    Failed(RemoteStopError),
}

impl CancelOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }
}

/// Sends stop commands to workers' control endpoints.
#[derive(Debug, Clone)]
pub struct AgentController {
    endpoint_template: String,
    timeout: Duration,
}

impl AgentController {
    /// `endpoint_template` may contain `{slot}`, replaced by the port number.
    pub fn new(endpoint_template: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint_template: endpoint_template.into(),
            timeout,
        }
    }

    pub fn endpoint_for(&self, slot: Slot) -> String {
        self.endpoint_template.replace("{slot}", &slot.to_string())
    }

    /// Ask the worker on `slot` to stop. Failures are logged and returned,
    /// never raised.
    pub async fn cancel(&self, slot: Slot) -> CancelOutcome {
        let endpoint = self.endpoint_for(slot);

        match self.send_stop(&endpoint).await {
            Ok(()) => {
                info!(slot = %slot, endpoint = %endpoint, "Stop command delivered");
                CancelOutcome::Delivered
            }
            Err(e) => {
                warn!(slot = %slot, endpoint = %endpoint, error = %e, "Stop command failed");
                CancelOutcome::Failed(e)
            }
        }
    }

    async fn send_stop(&self, endpoint: &str) -> Result<(), RemoteStopError> {
        // One client per call, so the connection is released with it.
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .no_proxy()
            .build()?;

        let response = client.post(endpoint).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RemoteStopError::Status {
                status: status.as_u16(),
            });
        }

        Ok(())
    }
}

impl Default for AgentController {
    fn default() -> Self {
        Self::new("http://127.0.0.1:{slot}/stop", Duration::from_secs(5))
    }
}
