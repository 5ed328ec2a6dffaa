//! Worker launcher interface and implementations.
//!
//! Launching is fire-and-forget: `launch` returns once the OS has started
//! the process. Whether the worker actually takes its slot is only visible
//! later, through the slot probe. Until then the returned `WorkerHandle`
//! stands in for it: the handle tracks whether the process has exited.
//!
//! A mock implementation is provided for testing and development.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use crate::slot::Slot;

/// Errors from starting a worker.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to start `{command}`: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("launch rejected: {0}")]
    Rejected(String),
}

/// Handle to a started worker process.
///
/// Clones share the exit flag, so the task reaping the process can report
/// the exit to whoever holds the handle.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub slot: Slot,
    /// OS process ID, when the platform reports one.
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    started: Instant,
    exited: Arc<AtomicBool>,
}

impl WorkerHandle {
    pub fn new(slot: Slot, pid: Option<u32>) -> Self {
        Self {
            slot,
            pid,
            started_at: Utc::now(),
            started: Instant::now(),
            exited: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn mark_exited(&self) {
        self.exited.store(true, Ordering::SeqCst);
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Whether the worker owns its slot whatever the probe says: the process
    /// is still running, or it started less than `grace` ago and may not
    /// have bound its port yet.
    pub fn holds_slot(&self, grace: Duration) -> bool {
        !self.has_exited() || self.started.elapsed() < grace
    }
}

/// Starts the worker configured for a slot.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Start the worker bound to `slot`. Only the slot identity is passed on.
    async fn launch(&self, slot: Slot) -> Result<WorkerHandle, SpawnError>;
}

/// Runs a per-slot script through a shell, e.g. `/bin/bash crawl9995.sh`.
#[derive(Debug, Clone)]
pub struct ScriptLauncher {
    shell: String,
    script_template: String,
}

impl ScriptLauncher {
    /// `script_template` may contain `{slot}`, replaced by the port number.
    pub fn new(shell: impl Into<String>, script_template: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            script_template: script_template.into(),
        }
    }

    pub fn script_for(&self, slot: Slot) -> String {
        self.script_template.replace("{slot}", &slot.to_string())
    }
}

#[async_trait]
impl WorkerLauncher for ScriptLauncher {
    async fn launch(&self, slot: Slot) -> Result<WorkerHandle, SpawnError> {
        let script = self.script_for(slot);

        let mut child = Command::new(&self.shell)
            .arg(&script)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|source| SpawnError::Io {
                command: format!("{} {}", self.shell, script),
                source,
            })?;

        let pid = child.id();
        info!(slot = %slot, script = %script, pid = ?pid, "Worker process started");

        let handle = WorkerHandle::new(slot, pid);

        // Reap the child when it exits; the status itself is informational.
        let reaped = handle.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!(slot = %slot, pid = ?pid, %status, "Worker process exited"),
                Err(e) => debug!(slot = %slot, pid = ?pid, error = %e, "Lost track of worker process"),
            }
            reaped.mark_exited();
        });

        Ok(handle)
    }
}

/// Mock launcher for testing and development.
pub struct MockLauncher {
    /// Counter for generating fake PIDs.
    pid_counter: AtomicU32,

    /// Whether launches should fail.
    fail_launches: AtomicBool,

    /// Handles of successful launches, in order.
    launched: Mutex<Vec<WorkerHandle>>,
}

impl MockLauncher {
    pub fn new() -> Self {
        Self {
            pid_counter: AtomicU32::new(1000),
            fail_launches: AtomicBool::new(false),
            launched: Mutex::new(Vec::new()),
        }
    }

    /// Create a mock launcher that fails all launches.
    pub fn failing() -> Self {
        let launcher = Self::new();
        launcher.set_failing(true);
        launcher
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_launches.store(failing, Ordering::SeqCst);
    }

    /// Number of successful launches so far.
    pub fn launch_count(&self) -> usize {
        self.launched_slots().len()
    }

    pub fn launched_slots(&self) -> Vec<Slot> {
        self.launched
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|handle| handle.slot)
            .collect()
    }

    /// Simulate the exit of every worker started on `slot`.
    pub fn exit(&self, slot: Slot) {
        for handle in self
            .launched
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|handle| handle.slot == slot)
        {
            handle.mark_exited();
        }
    }

    /// Whether a worker started on `slot` has not exited yet.
    pub fn is_running_on(&self, slot: Slot) -> bool {
        self.launched
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|handle| handle.slot == slot && !handle.has_exited())
    }
}

impl Default for MockLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkerLauncher for MockLauncher {
    async fn launch(&self, slot: Slot) -> Result<WorkerHandle, SpawnError> {
        if self.fail_launches.load(Ordering::SeqCst) {
            return Err(SpawnError::Rejected(
                "mock launcher configured to fail".to_string(),
            ));
        }

        let pid = self.pid_counter.fetch_add(1, Ordering::SeqCst);
        info!(slot = %slot, pid, "[MOCK] Starting worker");

        let handle = WorkerHandle::new(slot, Some(pid));
        self.launched
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle.clone());

        Ok(handle)
    }
}
