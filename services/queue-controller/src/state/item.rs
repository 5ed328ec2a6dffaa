//! Work item model and lifecycle transitions.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use slotq_id::WorkItemId;
use thiserror::Error;

use crate::slot::Slot;

/// Lifecycle state of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkItemState {
    /// Queued, no slot assigned.
    Waiting,
    /// Claimed a slot and its worker was started.
    Running,
    /// The worker's slot was observed free again.
    Finished,
}

impl WorkItemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Finished => "finished",
        }
    }
}

impl fmt::Display for WorkItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown work item state '{0}'")]
pub struct UnknownState(pub String);

impl FromStr for WorkItemState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "waiting" => Ok(Self::Waiting),
            "running" => Ok(Self::Running),
            "finished" => Ok(Self::Finished),
            _ => Err(UnknownState(s.to_string())),
        }
    }
}

/// A queued unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,
    /// Path of the data the worker operates on.
    pub payload_path: String,
    /// Target collection for the worker's output.
    pub collection_name: String,
    pub state: WorkItemState,
    /// Slot claimed at launch. Never set while waiting.
    pub slot: Option<Slot>,
    pub created_at: DateTime<Utc>,
    pub last_state_change_at: DateTime<Utc>,
}

impl WorkItem {
    /// Create a fresh waiting item.
    pub fn new_waiting(payload_path: impl Into<String>, collection_name: impl Into<String>) -> Self {
        let now = now();
        Self {
            id: WorkItemId::new(),
            payload_path: payload_path.into(),
            collection_name: collection_name.into(),
            state: WorkItemState::Waiting,
            slot: None,
            created_at: now,
            last_state_change_at: now,
        }
    }

    /// Claim a slot: waiting -> running.
    pub fn mark_running(&mut self, slot: Slot) {
        self.state = WorkItemState::Running;
        self.slot = Some(slot);
        self.last_state_change_at = now();
    }

    /// The worker's slot freed up: running -> finished.
    ///
    /// The slot is kept as a record of where the item ran.
    pub fn mark_finished(&mut self) {
        self.state = WorkItemState::Finished;
        self.last_state_change_at = now();
    }

    /// Undo a claim whose worker never started: running -> waiting.
    pub fn revert_to_waiting(&mut self) {
        self.state = WorkItemState::Waiting;
        self.slot = None;
        self.last_state_change_at = now();
    }

    pub fn is_running_on(&self, slot: Slot) -> bool {
        self.state == WorkItemState::Running && self.slot == Some(slot)
    }
}

/// Current time at the precision the store keeps (milliseconds).
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}
