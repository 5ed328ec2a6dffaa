//! Slot reconciliation.
//!
//! Workers never report back when they exit. The reconciler compares the
//! store's running items against what the probe sees on each slot and:
//! - Marks items finished when their slot is free again
//! - Reports which slots can take a new worker this cycle
//!
//! A freshly started worker has usually not bound its port yet, so the
//! caller passes the slots its own workers still hold. Those count as busy
//! without probing.
//!
//! The slot to item mapping is rebuilt from the store on every pass, so a
//! restarted controller picks up where the previous one left off.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use slotq_id::WorkItemId;
use tracing::{debug, info};

use crate::slot::{Slot, SlotPool, SlotProbe};
use crate::state::{RequestStore, StoreError, WorkItem, WorkItemState};

/// Result of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Slots a new worker may be launched onto.
    pub free: BTreeSet<Slot>,
    /// Slots held by a running worker or some other process.
    pub busy: BTreeSet<Slot>,
    /// Items marked finished during this pass.
    pub reclaimed: Vec<WorkItemId>,
}

impl ReconcileReport {
    /// The slot the scheduler launches onto next.
    pub fn lowest_free(&self) -> Option<Slot> {
        self.free.first().copied()
    }
}

/// Reconciles stored running items against live slot occupancy.
pub struct SlotReconciler {
    pool: SlotPool,
    probe: Arc<dyn SlotProbe>,
}

impl SlotReconciler {
    pub fn new(pool: SlotPool, probe: Arc<dyn SlotProbe>) -> Self {
        Self { pool, probe }
    }

    pub fn pool(&self) -> &SlotPool {
        &self.pool
    }

    /// Probe every slot in the pool, finishing items whose worker is gone.
    ///
    /// Slots in `held` are busy regardless of the probe.
    pub fn reconcile(
        &self,
        store: &dyn RequestStore,
        held: &BTreeSet<Slot>,
    ) -> Result<ReconcileReport, StoreError> {
        let mut claims: BTreeMap<Slot, Vec<WorkItem>> = BTreeMap::new();
        for item in store.find_by_state(WorkItemState::Running)? {
            match item.slot.filter(|slot| self.pool.contains(*slot)) {
                Some(slot) => claims.entry(slot).or_default().push(item),
                None => debug!(
                    item_id = %item.id,
                    slot = ?item.slot,
                    "Running item outside the slot pool, leaving it alone"
                ),
            }
        }

        let mut report = ReconcileReport::default();

        for slot in self.pool.iter() {
            let owners = claims.remove(&slot).unwrap_or_default();

            if held.contains(&slot) {
                debug!(
                    slot = %slot,
                    owners = owners.len(),
                    "Slot held by a starting or running worker"
                );
                report.busy.insert(slot);
                continue;
            }

            if !self.probe.is_free(slot) {
                debug!(slot = %slot, owners = owners.len(), "Slot busy");
                report.busy.insert(slot);
                continue;
            }

            for mut item in owners {
                item.mark_finished();
                store.save(&item)?;
                info!(
                    item_id = %item.id,
                    slot = %slot,
                    "Worker left its slot, item finished"
                );
                report.reclaimed.push(item.id);
            }

            report.free.insert(slot);
        }

        Ok(report)
    }
}
