//! Launch scheduling.
//!
//! `LaunchScheduler` owns the one decision that must never race: which waiting
//! item goes onto which free slot. Every launch attempt, whether triggered by
//! a submission or by the poller, runs under the same lock, and that lock also
//! guards the store handle. Two attempts therefore can never see the same
//! slot as free.
//!
//! A launch attempt:
//! 1. Writes back any undo of a failed claim that could not be saved earlier
//! 2. Reconciles the pool, finishing items whose worker left its slot
//! 3. Picks the lowest free slot and the oldest waiting item
//! 4. Records the claim (running + slot) in the store
//! 5. Starts the worker, undoing the claim if that fails
//!
//! At most one item is launched per attempt. A slot whose worker process is
//! still alive, or was started within the start-up grace period, is never
//! reclaimed, even while its port still probes free.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use slotq_id::WorkItemId;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::reconciler::SlotReconciler;
use crate::runtime::{WorkerHandle, WorkerLauncher};
use crate::slot::Slot;
use crate::state::{RequestStore, StoreError, WorkItem, WorkItemState};

/// How long a started worker owns its slot before the probe decides, even
/// after its process exited. Covers launch scripts that start the real worker
/// in the background and return.
pub const DEFAULT_STARTUP_GRACE: Duration = Duration::from_secs(30);

/// What a single launch attempt did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// Every slot in the pool is occupied.
    NoFreeSlot,
    /// A slot was free but nothing is waiting.
    QueueEmpty,
    /// The item now runs on the slot.
    Launched {
        item_id: WorkItemId,
        slot: Slot,
        pid: Option<u32>,
    },
    /// The worker could not be started; the item is waiting again.
    SpawnFailed {
        item_id: WorkItemId,
        slot: Slot,
        error: String,
    },
}

impl LaunchOutcome {
    pub fn is_launched(&self) -> bool {
        matches!(self, Self::Launched { .. })
    }
}

struct Inner {
    /// `None` once the scheduler has been closed.
    store: Option<Box<dyn RequestStore>>,
    /// Last worker started on each slot, while it still holds the slot.
    workers: BTreeMap<Slot, WorkerHandle>,
    /// Items whose spawn failed but whose return to the queue was not saved.
    /// They are still recorded as running and must not be finished.
    unsaved_reverts: BTreeMap<WorkItemId, WorkItem>,
}

impl Inner {
    fn store(&self) -> Result<&dyn RequestStore, StoreError> {
        self.store.as_deref().ok_or(StoreError::Closed)
    }
}

/// Serializes submissions and launch attempts over one store.
pub struct LaunchScheduler {
    reconciler: SlotReconciler,
    launcher: Arc<dyn WorkerLauncher>,
    startup_grace: Duration,
    inner: Mutex<Inner>,
}

impl LaunchScheduler {
    pub fn new(
        store: Box<dyn RequestStore>,
        reconciler: SlotReconciler,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Self {
        Self {
            reconciler,
            launcher,
            startup_grace: DEFAULT_STARTUP_GRACE,
            inner: Mutex::new(Inner {
                store: Some(store),
                workers: BTreeMap::new(),
                unsaved_reverts: BTreeMap::new(),
            }),
        }
    }

    pub fn with_startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }

    /// Queue a new item, then immediately try to launch.
    ///
    /// Returns an error only if the item could not be stored, in which case
    /// nothing was queued. A failure in the follow-up launch attempt is
    /// logged; the item stays queued for the poller.
    pub async fn submit(
        &self,
        payload_path: impl Into<String>,
        collection_name: impl Into<String>,
    ) -> Result<WorkItemId, StoreError> {
        let mut inner = self.inner.lock().await;

        let item = WorkItem::new_waiting(payload_path, collection_name);
        inner.store()?.save(&item)?;
        info!(
            item_id = %item.id,
            collection = %item.collection_name,
            payload = %item.payload_path,
            "Work item queued"
        );

        match self.launch_next(&mut inner).await {
            Ok(outcome) => debug!(item_id = %item.id, ?outcome, "Launch attempt after submit"),
            Err(e) => error!(item_id = %item.id, error = %e, "Launch attempt after submit failed"),
        }

        Ok(item.id)
    }

    /// Run one launch attempt.
    pub async fn try_launch(&self) -> Result<LaunchOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        self.launch_next(&mut inner).await
    }

    async fn launch_next(&self, inner: &mut Inner) -> Result<LaunchOutcome, StoreError> {
        // No reconcile while a failed claim still reads as running.
        self.save_pending_reverts(inner)?;
        let held = self.held_slots(inner);

        // The store borrow must end before the launch await.
        let (mut item, slot) = {
            let store = inner.store()?;
            let report = self.reconciler.reconcile(store, &held)?;

            let Some(slot) = report.lowest_free() else {
                debug!(busy = report.busy.len(), "No free slot");
                return Ok(LaunchOutcome::NoFreeSlot);
            };

            let Some(mut item) = store.oldest_waiting()? else {
                debug!(free = report.free.len(), "Queue empty");
                return Ok(LaunchOutcome::QueueEmpty);
            };

            item.mark_running(slot);
            store.save(&item)?;
            (item, slot)
        };

        match self.launcher.launch(slot).await {
            Ok(handle) => {
                info!(
                    item_id = %item.id,
                    slot = %slot,
                    pid = ?handle.pid,
                    "Work item launched"
                );
                let pid = handle.pid;
                inner.workers.insert(slot, handle);
                Ok(LaunchOutcome::Launched {
                    item_id: item.id,
                    slot,
                    pid,
                })
            }
            Err(e) => {
                error!(
                    item_id = %item.id,
                    slot = %slot,
                    error = %e,
                    "Failed to start worker, item back in queue"
                );
                item.revert_to_waiting();
                let item_id = item.id;
                let saved = inner.store()?.save(&item);
                if let Err(save_err) = saved {
                    warn!(
                        item_id = %item_id,
                        error = %save_err,
                        "Could not save item back to waiting, retrying before next launch"
                    );
                    inner.unsaved_reverts.insert(item_id, item);
                }
                Ok(LaunchOutcome::SpawnFailed {
                    item_id,
                    slot,
                    error: e.to_string(),
                })
            }
        }
    }

    /// Write back reverts that failed to save. Stops at the first failure.
    fn save_pending_reverts(&self, inner: &mut Inner) -> Result<(), StoreError> {
        while let Some((id, item)) = inner.unsaved_reverts.pop_first() {
            let saved = inner.store().and_then(|store| store.save(&item));
            if let Err(e) = saved {
                error!(item_id = %id, error = %e, "Failed to return item to queue");
                inner.unsaved_reverts.insert(id, item);
                return Err(e);
            }
            info!(item_id = %id, "Item returned to queue after failed start");
        }
        Ok(())
    }

    /// Drop handles of workers that no longer hold their slot, and return the
    /// slots the rest still hold.
    fn held_slots(&self, inner: &mut Inner) -> BTreeSet<Slot> {
        let grace = self.startup_grace;
        inner.workers.retain(|slot, handle| {
            let holds = handle.holds_slot(grace);
            if !holds {
                debug!(slot = %slot, pid = ?handle.pid, "Worker exited, slot left to the probe");
            }
            holds
        });
        inner.workers.keys().copied().collect()
    }

    pub async fn item(&self, id: &WorkItemId) -> Result<Option<WorkItem>, StoreError> {
        self.inner.lock().await.store()?.get(id)
    }

    /// Items in a state, or all items, oldest first.
    pub async fn items(&self, state: Option<WorkItemState>) -> Result<Vec<WorkItem>, StoreError> {
        let inner = self.inner.lock().await;
        let store = inner.store()?;
        match state {
            Some(state) => store.find_by_state(state),
            None => store.list(),
        }
    }

    /// Handles of workers started by this scheduler that still held their
    /// slot at the last launch attempt.
    pub async fn workers(&self) -> Vec<WorkerHandle> {
        self.inner.lock().await.workers.values().cloned().collect()
    }

    /// Release the store. Later calls fail with `StoreError::Closed`.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        if let Err(e) = self.save_pending_reverts(&mut inner) {
            error!(
                pending = inner.unsaved_reverts.len(),
                error = %e,
                "Closing with items still recorded as running after a failed start"
            );
        }
        if inner.store.take().is_some() {
            info!("Request store closed");
        }
        inner.workers.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::runtime::MockLauncher;
    use crate::slot::{MockProbe, SlotPool};
    use crate::state::StateStore;

    fn slot(port: u16) -> Slot {
        Slot::new(port).unwrap()
    }

    struct Harness {
        scheduler: LaunchScheduler,
        probe: Arc<MockProbe>,
        launcher: Arc<MockLauncher>,
    }

    fn harness(ports: &[u16]) -> Harness {
        harness_with(
            ports,
            Box::new(StateStore::open_in_memory().unwrap()),
            Duration::ZERO,
        )
    }

    fn harness_with(ports: &[u16], store: Box<dyn RequestStore>, grace: Duration) -> Harness {
        let probe = Arc::new(MockProbe::new());
        let launcher = Arc::new(MockLauncher::new());
        let pool = SlotPool::new(ports.iter().map(|p| slot(*p))).unwrap();
        let scheduler = LaunchScheduler::new(
            store,
            SlotReconciler::new(pool, probe.clone()),
            launcher.clone(),
        )
        .with_startup_grace(grace);
        Harness {
            scheduler,
            probe,
            launcher,
        }
    }

    /// Store whose saves with the given 1-based numbers fail.
    struct FailingSave {
        inner: StateStore,
        saves: AtomicUsize,
        fail_on: Vec<usize>,
    }

    impl FailingSave {
        fn new(fail_on: &[usize]) -> Self {
            Self {
                inner: StateStore::open_in_memory().unwrap(),
                saves: AtomicUsize::new(0),
                fail_on: fail_on.to_vec(),
            }
        }
    }

    impl RequestStore for FailingSave {
        fn save(&self, item: &WorkItem) -> Result<(), StoreError> {
            let n = self.saves.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_on.contains(&n) {
                return Err(StoreError::Invalid("disk full".to_string()));
            }
            self.inner.save(item)
        }

        fn get(&self, id: &WorkItemId) -> Result<Option<WorkItem>, StoreError> {
            self.inner.get(id)
        }

        fn find_by_state(&self, state: WorkItemState) -> Result<Vec<WorkItem>, StoreError> {
            self.inner.find_by_state(state)
        }

        fn list(&self) -> Result<Vec<WorkItem>, StoreError> {
            self.inner.list()
        }
    }

    #[tokio::test]
    async fn test_empty_queue_is_noop() {
        let h = harness(&[9995]);
        assert_eq!(h.scheduler.try_launch().await.unwrap(), LaunchOutcome::QueueEmpty);
        assert_eq!(h.launcher.launch_count(), 0);
    }

    #[tokio::test]
    async fn test_submit_launches_on_free_slot() {
        let h = harness(&[9995]);
        let id = h.scheduler.submit("/data/1", "c1").await.unwrap();

        let item = h.scheduler.item(&id).await.unwrap().unwrap();
        assert!(item.is_running_on(slot(9995)));
        assert_eq!(h.launcher.launched_slots(), vec![slot(9995)]);

        let workers = h.scheduler.workers().await;
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].slot, slot(9995));
    }

    #[tokio::test]
    async fn test_busy_slot_leaves_item_waiting() {
        let h = harness(&[9995]);
        h.probe.occupy(slot(9995));

        let id = h.scheduler.submit("/data/1", "c1").await.unwrap();
        let item = h.scheduler.item(&id).await.unwrap().unwrap();
        assert_eq!(item.state, WorkItemState::Waiting);
        assert_eq!(item.slot, None);
        assert_eq!(h.scheduler.try_launch().await.unwrap(), LaunchOutcome::NoFreeSlot);
    }

    #[tokio::test]
    async fn test_picks_lowest_free_slot() {
        let h = harness(&[9997, 9995, 9996]);
        h.probe.occupy(slot(9995));

        h.scheduler.submit("/data/1", "c1").await.unwrap();
        assert_eq!(h.launcher.launched_slots(), vec![slot(9996)]);
    }

    #[tokio::test]
    async fn test_one_launch_per_attempt() {
        let h = harness(&[9995, 9996]);
        h.probe.occupy(slot(9995));
        h.probe.occupy(slot(9996));
        h.scheduler.submit("/data/1", "c1").await.unwrap();
        h.scheduler.submit("/data/2", "c2").await.unwrap();

        h.probe.release(slot(9995));
        h.probe.release(slot(9996));
        let outcome = h.scheduler.try_launch().await.unwrap();
        assert!(outcome.is_launched());
        assert_eq!(h.launcher.launch_count(), 1);
        let waiting = h.scheduler.items(Some(WorkItemState::Waiting)).await.unwrap();
        assert_eq!(waiting.len(), 1);
    }

    #[tokio::test]
    async fn test_spawn_failure_reverts_to_waiting() {
        let h = harness(&[9995]);
        h.launcher.set_failing(true);

        let id = h.scheduler.submit("/data/1", "c1").await.unwrap();
        let item = h.scheduler.item(&id).await.unwrap().unwrap();
        assert_eq!(item.state, WorkItemState::Waiting);
        assert_eq!(item.slot, None);
        assert!(h.scheduler.workers().await.is_empty());

        h.launcher.set_failing(false);
        let outcome = h.scheduler.try_launch().await.unwrap();
        assert_eq!(
            outcome,
            LaunchOutcome::Launched {
                item_id: id,
                slot: slot(9995),
                pid: Some(1000),
            }
        );
    }

    #[tokio::test]
    async fn test_spawn_failure_outcome() {
        let h = harness(&[9995]);
        h.probe.occupy(slot(9995));
        let id = h.scheduler.submit("/data/1", "c1").await.unwrap();

        h.probe.release(slot(9995));
        h.launcher.set_failing(true);
        match h.scheduler.try_launch().await.unwrap() {
            LaunchOutcome::SpawnFailed { item_id, slot: s, .. } => {
                assert_eq!(item_id, id);
                assert_eq!(s, slot(9995));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unbound_worker_keeps_its_slot() {
        // The mock worker never occupies its port, like a real one that is
        // still starting up.
        let h = harness(&[9995]);
        let a = h.scheduler.submit("/data/a", "a").await.unwrap();
        let b = h.scheduler.submit("/data/b", "b").await.unwrap();
        assert_eq!(h.scheduler.try_launch().await.unwrap(), LaunchOutcome::NoFreeSlot);
        assert_eq!(h.scheduler.try_launch().await.unwrap(), LaunchOutcome::NoFreeSlot);

        assert_eq!(h.launcher.launch_count(), 1);
        let a = h.scheduler.item(&a).await.unwrap().unwrap();
        assert!(a.is_running_on(slot(9995)));
        let b = h.scheduler.item(&b).await.unwrap().unwrap();
        assert_eq!(b.state, WorkItemState::Waiting);
    }

    #[tokio::test]
    async fn test_exited_worker_frees_slot_after_grace() {
        let h = harness(&[9995]);
        let a = h.scheduler.submit("/data/a", "a").await.unwrap();
        let b = h.scheduler.submit("/data/b", "b").await.unwrap();

        h.launcher.exit(slot(9995));
        match h.scheduler.try_launch().await.unwrap() {
            LaunchOutcome::Launched { item_id, .. } => assert_eq!(item_id, b),
            other => panic!("unexpected outcome: {other:?}"),
        }
        let a = h.scheduler.item(&a).await.unwrap().unwrap();
        assert_eq!(a.state, WorkItemState::Finished);
        assert_eq!(h.launcher.launch_count(), 2);
    }

    #[tokio::test]
    async fn test_exited_worker_holds_slot_during_grace() {
        let h = harness_with(
            &[9995],
            Box::new(StateStore::open_in_memory().unwrap()),
            Duration::from_secs(3600),
        );
        let a = h.scheduler.submit("/data/a", "a").await.unwrap();
        h.scheduler.submit("/data/b", "b").await.unwrap();

        // A launch script that backgrounds the worker exits right away.
        h.launcher.exit(slot(9995));
        assert_eq!(h.scheduler.try_launch().await.unwrap(), LaunchOutcome::NoFreeSlot);
        let a = h.scheduler.item(&a).await.unwrap().unwrap();
        assert!(a.is_running_on(slot(9995)));
        assert_eq!(h.launcher.launch_count(), 1);
    }

    #[tokio::test]
    async fn test_unsaved_revert_is_retried_before_reconcile() {
        // Saves: insert, claim, revert (fails).
        let h = harness_with(&[9995], Box::new(FailingSave::new(&[3])), Duration::ZERO);
        h.launcher.set_failing(true);
        let id = h.scheduler.submit("/data/1", "c1").await.unwrap();
        let item = h.scheduler.item(&id).await.unwrap().unwrap();
        assert_eq!(item.state, WorkItemState::Running);

        h.launcher.set_failing(false);
        match h.scheduler.try_launch().await.unwrap() {
            LaunchOutcome::Launched { item_id, slot: s, .. } => {
                assert_eq!(item_id, id);
                assert_eq!(s, slot(9995));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        let item = h.scheduler.item(&id).await.unwrap().unwrap();
        assert!(item.is_running_on(slot(9995)));
        assert_eq!(h.launcher.launch_count(), 1);
        assert!(h
            .scheduler
            .items(Some(WorkItemState::Finished))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_unsaved_revert_blocks_reconcile_until_saved() {
        // Saves: insert, claim, revert (fails), first retry (fails).
        let h = harness_with(&[9995], Box::new(FailingSave::new(&[3, 4])), Duration::ZERO);
        h.launcher.set_failing(true);
        let id = h.scheduler.submit("/data/1", "c1").await.unwrap();

        assert!(h.scheduler.try_launch().await.is_err());
        let item = h.scheduler.item(&id).await.unwrap().unwrap();
        assert_eq!(item.state, WorkItemState::Running);

        // The second retry succeeds; the launcher still fails.
        match h.scheduler.try_launch().await.unwrap() {
            LaunchOutcome::SpawnFailed { item_id, .. } => assert_eq!(item_id, id),
            other => panic!("unexpected outcome: {other:?}"),
        }
        let item = h.scheduler.item(&id).await.unwrap().unwrap();
        assert_eq!(item.state, WorkItemState::Waiting);
        assert_eq!(item.slot, None);
    }

    #[tokio::test]
    async fn test_closed_scheduler_rejects_calls() {
        let h = harness(&[9995]);
        h.scheduler.close().await;

        assert!(matches!(
            h.scheduler.submit("/data/1", "c1").await,
            Err(StoreError::Closed)
        ));
        assert!(matches!(h.scheduler.try_launch().await, Err(StoreError::Closed)));
        assert!(matches!(h.scheduler.items(None).await, Err(StoreError::Closed)));
    }
}
