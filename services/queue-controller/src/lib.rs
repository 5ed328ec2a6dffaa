//! slotq Queue Controller Library
//!
//! The queue controller persists submitted work items and launches each one
//! as a worker process on a free slot (a network port). The number of slots
//! bounds how many workers run at once.
//!
//! ## Architecture
//!
//! ```text
//! QueueController
//! ├── LaunchScheduler   (one lock: claim a slot, start a worker)
//! │   ├── SlotReconciler  (store vs. probe, reclaims exited workers)
//! │   ├── RequestStore    (SQLite work item records)
//! │   └── WorkerLauncher  (per-slot script)
//! ├── Poller            (fixed-rate launch attempts)
//! └── AgentController   (best-effort remote stop)
//! ```
//!
//! ## Modules
//!
//! - `slot`: slots, the slot pool and occupancy probes
//! - `state`: work item model and SQLite persistence
//! - `reconciler`: free-slot computation and reclamation
//! - `scheduler`: serialized launch decisions
//! - `poller`: timer-driven launch attempts
//! - `agent`: remote stop of a slot's worker

pub mod agent;
pub mod config;
pub mod controller;
pub mod poller;
pub mod reconciler;
pub mod runtime;
pub mod scheduler;
pub mod slot;
pub mod state;

// Re-export commonly used types
pub use agent::{AgentController, CancelOutcome};
pub use controller::{ControllerSettings, QueueController};
pub use runtime::MockLauncher;
pub use scheduler::{LaunchOutcome, LaunchScheduler};
pub use slot::{MockProbe, Slot, SlotPool};
pub use state::{WorkItem, WorkItemState};
