//! Property tests for slot pool invariants.
//!
//! Random sequences of submissions, port binds, worker exits and launch
//! attempts must never put two running items on one slot, start a worker on
//! a slot whose previous worker is still alive, or exceed the pool size.
//!
//! The mock launcher never occupies a port itself; `Bind` does that later,
//! the way a real worker binds some time after it was started.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use slotq_controller::agent::AgentController;
use slotq_controller::state::StateStore;
use slotq_controller::{
    ControllerSettings, MockLauncher, MockProbe, QueueController, Slot, SlotPool, WorkItemState,
};

const PORTS: [u16; 3] = [9995, 9996, 9997];

#[derive(Debug, Clone)]
enum Op {
    Submit,
    /// A worker, or some other process, takes the port.
    Bind(usize),
    /// The port is released and any worker on it exits.
    Exit(usize),
    Tick,
    FailSpawns(bool),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => Just(Op::Submit),
        3 => (0..PORTS.len()).prop_map(Op::Bind),
        3 => (0..PORTS.len()).prop_map(Op::Exit),
        3 => Just(Op::Tick),
        1 => any::<bool>().prop_map(Op::FailSpawns),
    ]
}

fn slot(i: usize) -> Slot {
    Slot::new(PORTS[i]).unwrap()
}

async fn check_sequence(ops: Vec<Op>, pool_size: usize) {
    let probe = Arc::new(MockProbe::new());
    let launcher = Arc::new(MockLauncher::new());
    let ports = &PORTS[..pool_size];
    let controller = QueueController::from_parts(
        Box::new(StateStore::open_in_memory().unwrap()),
        SlotPool::new(ports.iter().map(|p| Slot::new(*p).unwrap())).unwrap(),
        probe.clone(),
        launcher.clone(),
        AgentController::default(),
        ControllerSettings {
            poller: None,
            startup_grace: Duration::ZERO,
        },
    )
    .unwrap();

    for (n, op) in ops.into_iter().enumerate() {
        let live_before: HashMap<Slot, bool> = (0..PORTS.len())
            .map(|i| (slot(i), launcher.is_running_on(slot(i))))
            .collect();
        let launches_before = launcher.launch_count();

        match op {
            Op::Submit => {
                controller.submit(format!("/data/{n}"), "c").await.unwrap();
            }
            Op::Bind(i) => probe.occupy(slot(i)),
            Op::Exit(i) => {
                probe.release(slot(i));
                launcher.exit(slot(i));
            }
            Op::Tick => {
                controller.try_launch().await.unwrap();
            }
            Op::FailSpawns(failing) => launcher.set_failing(failing),
        }

        let launched = launcher.launched_slots();
        assert!(launched.len() <= launches_before + 1, "more than one launch per attempt");
        for started in &launched[launches_before..] {
            assert!(
                !live_before[started],
                "worker started on {started} while the previous one was alive"
            );
        }

        let items = controller.items(None).await.unwrap();
        let running: Vec<_> = items
            .iter()
            .filter(|i| i.state == WorkItemState::Running)
            .collect();
        assert!(running.len() <= pool_size);

        let slots: HashSet<Slot> = running.iter().filter_map(|i| i.slot).collect();
        assert_eq!(slots.len(), running.len(), "two running items share a slot");

        for item in &items {
            if item.state == WorkItemState::Waiting {
                assert_eq!(item.slot, None);
            }
        }
    }

    controller.shutdown().await;
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn running_items_fit_the_pool(
        ops in prop::collection::vec(op(), 1..40),
        pool_size in 1..=PORTS.len(),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(check_sequence(ops, pool_size));
    }
}
