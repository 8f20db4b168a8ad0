use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;

use tessera_consensus::{LocalLog, LogConfig, ReplicatedLog};
use tessera_meta::{MetaStore, WatchConfig, WatchFilter};
use tessera_rebalance::{
    pending_key, stable_key, Assignment, Assignments, CatchUpPolicy, CoordinatorConfig,
    CoordinatorHandle, DataProbe, PartitionState, RebalanceCoordinator, TablePartitionId,
};
use tessera_storage::mem::{MemLogStorage, MemStateMachine};
use tessera_types::{
    Condition, MetaCommand, MetaEntry, MetaError, MetaResponse, Operation, Revision, ScanPage, WatchBatch,
};

type MemLog = LocalLog<MemLogStorage, MemStateMachine>;
type Store = MetaStore<HeldLog>;

const DEADLINE: Duration = Duration::from_secs(10);

/// `LocalLog` whose history reads can be held back, so watchers fall behind
/// the store on demand.
struct HeldLog {
    inner: MemLog,
    hold_history: AtomicBool,
}

impl HeldLog {
    fn set_available(&self, available: bool) {
        self.inner.set_available(available);
    }

    fn hold_history(&self, hold: bool) {
        self.hold_history.store(hold, Ordering::SeqCst);
    }
}

impl ReplicatedLog for HeldLog {
    async fn propose(&self, cmd: MetaCommand) -> Result<MetaResponse, MetaError> {
        self.inner.propose(cmd).await
    }

    async fn read(&self, key: &[u8], at_revision: Revision) -> Result<Option<MetaEntry>, MetaError> {
        self.inner.read(key, at_revision).await
    }

    async fn scan(&self, start: &[u8], end: &[u8], limit: usize) -> Result<ScanPage, MetaError> {
        self.inner.scan(start, end, limit).await
    }

    async fn batches_after(&self, after: Revision, limit: usize) -> Result<Vec<WatchBatch>, MetaError> {
        while self.hold_history.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.inner.batches_after(after, limit).await
    }

    async fn compacted_revision(&self) -> Result<Revision, MetaError> {
        self.inner.compacted_revision().await
    }

    fn applied_revision(&self) -> Revision {
        self.inner.applied_revision()
    }

    fn subscribe_applied(&self) -> watch::Receiver<Revision> {
        self.inner.subscribe_applied()
    }

    async fn purge_applied(&self, up_to: u64) -> Result<(), MetaError> {
        self.inner.purge_applied(up_to).await
    }
}

async fn open_store() -> Store {
    open_store_with(WatchConfig::default()).await
}

async fn open_store_with(config: WatchConfig) -> Store {
    let inner = LocalLog::open(MemLogStorage::new(), MemStateMachine::default(), LogConfig::default())
        .await
        .unwrap();
    MetaStore::new(Arc::new(HeldLog { inner, hold_history: AtomicBool::new(false) }), config)
}

fn fast_config(max_attempts: Option<u32>) -> CoordinatorConfig {
    CoordinatorConfig {
        catch_up: CatchUpPolicy {
            initial_backoff_ms: 5,
            max_backoff_ms: 20,
            multiplier: 2.0,
            probe_timeout_ms: 1_000,
            max_attempts,
        },
        retry_backoff_ms: 5,
    }
}

/// Every node has data unless it is marked missing or unreachable.
#[derive(Default)]
struct TestProbe {
    missing: Mutex<HashSet<String>>,
    unreachable: Mutex<HashSet<String>>,
    calls: AtomicUsize,
}

impl TestProbe {
    fn with_missing(nodes: &[&str]) -> Arc<Self> {
        let probe = TestProbe::default();
        probe.missing.lock().unwrap().extend(nodes.iter().map(|n| n.to_string()));
        Arc::new(probe)
    }

    fn release(&self, node: &str) {
        self.missing.lock().unwrap().remove(node);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl DataProbe for TestProbe {
    async fn has_data(&self, node: &str, _table_id: u32, _partition_id: u32) -> Result<bool, MetaError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.lock().unwrap().contains(node) {
            return Err(MetaError::unavailable(format!("{node} unreachable")));
        }
        Ok(!self.missing.lock().unwrap().contains(node))
    }
}

fn voters(nodes: &[&str]) -> Assignments {
    Assignments::voters(nodes.iter().copied())
}

async fn write_pending(store: &Store, tp: TablePartitionId, set: &Assignments) -> u64 {
    store.put(pending_key(tp), set.encode().unwrap()).await.unwrap()
}

async fn write_stable(store: &Store, tp: TablePartitionId, set: &Assignments) -> u64 {
    store.put(stable_key(tp), set.encode().unwrap()).await.unwrap()
}

async fn stable_of(store: &Store, tp: TablePartitionId) -> Option<Assignments> {
    let entry = store.get(stable_key(tp)).await.unwrap()?;
    Some(Assignments::decode(&entry.value).unwrap())
}

/// Wait until `stable == expected` and the pending key is gone.
async fn wait_converged(store: &Store, tp: TablePartitionId, expected: &Assignments) {
    tokio::time::timeout(DEADLINE, async {
        loop {
            let pending = store.get(pending_key(tp)).await.unwrap();
            if pending.is_none() && stable_of(store, tp).await.as_ref() == Some(expected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("partition did not converge");
}

async fn wait_state(handle: &CoordinatorHandle, tp: TablePartitionId, state: PartitionState) {
    tokio::time::timeout(DEADLINE, async {
        while handle.partition_state(tp) != Some(state) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("partition did not reach the expected state");
}

/// Record every value written to the stable key from now on.
fn record_stable(store: &Store, tp: TablePartitionId) -> Arc<Mutex<Vec<Option<Assignments>>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut sub = store.watch(WatchFilter::key(stable_key(tp)), store.revision());
    let sink = seen.clone();
    tokio::spawn(async move {
        while let Ok(batch) = sub.recv().await {
            for event in batch.events {
                let value = event.entry.map(|e| Assignments::decode(&e.value).unwrap());
                sink.lock().unwrap().push(value);
            }
        }
    });
    seen
}

#[tokio::test]
async fn converges_pending_to_stable() {
    let store = open_store().await;
    let tp = TablePartitionId::new(1, 0);
    let s0 = voters(&["a"]);
    let s1 = voters(&["a", "b"]);
    write_stable(&store, tp, &s0).await;
    let seen = record_stable(&store, tp);

    let handle = RebalanceCoordinator::start(store.clone(), Arc::new(TestProbe::default()), fast_config(None));
    write_pending(&store, tp, &s1).await;

    wait_converged(&store, tp, &s1).await;
    wait_state(&handle, tp, PartitionState::Stable).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*seen.lock().unwrap(), vec![Some(s1)]);
    handle.shutdown().await;
}

#[tokio::test]
async fn ordered_pending_updates_then_convergence() {
    let store = open_store().await;
    let tp = TablePartitionId::new(7, 0);
    let mut sub = store.watch(WatchFilter::prefix("pending-assignments-"), 0);

    let a = voters(&["A"]);
    let ab = voters(&["A", "B"]);
    write_pending(&store, tp, &a).await;
    write_pending(&store, tp, &ab).await;

    let first = sub.recv().await.unwrap();
    let second = sub.recv().await.unwrap();
    assert!(second.revision > first.revision);
    assert_eq!(Assignments::decode(&first.events[0].entry.as_ref().unwrap().value).unwrap(), a);
    assert_eq!(Assignments::decode(&second.events[0].entry.as_ref().unwrap().value).unwrap(), ab);

    let handle = RebalanceCoordinator::start(store.clone(), Arc::new(TestProbe::default()), fast_config(None));
    wait_converged(&store, tp, &ab).await;

    // The removal of the pending key is the only further pending event.
    let removal = sub.recv().await.unwrap();
    assert!(removal.events[0].is_removal());
    handle.shutdown().await;
}

#[tokio::test]
async fn newer_pending_supersedes_in_flight_catch_up() {
    let store = open_store().await;
    let tp = TablePartitionId::new(2, 0);
    let s0 = voters(&["a"]);
    let s1 = voters(&["a", "b"]);
    let s2 = voters(&["a", "c"]);
    write_stable(&store, tp, &s0).await;
    let seen = record_stable(&store, tp);

    let probe = TestProbe::with_missing(&["b"]);
    let handle = RebalanceCoordinator::start(store.clone(), probe.clone(), fast_config(None));

    write_pending(&store, tp, &s1).await;
    wait_state(&handle, tp, PartitionState::AwaitingCatchUp).await;
    write_pending(&store, tp, &s2).await;

    wait_converged(&store, tp, &s2).await;
    probe.release("b");
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(stable_of(&store, tp).await, Some(s2.clone()));
    assert_eq!(*seen.lock().unwrap(), vec![Some(s2)]);
    handle.shutdown().await;
}

#[tokio::test]
async fn stale_commit_fails_its_condition() {
    let store = open_store().await;
    let tp = TablePartitionId::new(3, 0);
    let s1 = voters(&["a", "b"]);
    let s2 = voters(&["a", "c"]);
    write_stable(&store, tp, &voters(&["a"])).await;
    write_pending(&store, tp, &s1).await;
    let observed = s1.encode().unwrap();

    // A second pending write lands before the commit of s1.
    write_pending(&store, tp, &s2).await;

    let result = store
        .invoke(
            Condition::value_eq(pending_key(tp), observed.clone()),
            vec![Operation::put(stable_key(tp), observed), Operation::remove(pending_key(tp))],
            vec![Operation::Noop],
        )
        .await
        .unwrap();
    assert!(!result.applied);
    assert_eq!(stable_of(&store, tp).await, Some(voters(&["a"])));
    let pending = store.get(pending_key(tp)).await.unwrap().unwrap();
    assert_eq!(Assignments::decode(&pending.value).unwrap(), s2);
}

#[tokio::test]
async fn own_commit_echo_is_a_no_op() {
    let store = open_store().await;
    let tp = TablePartitionId::new(4, 0);
    let target = Assignments::new([Assignment::voter("a"), Assignment::learner("b")]);
    let probe = Arc::new(TestProbe::default());
    let handle = RebalanceCoordinator::start(store.clone(), probe.clone(), fast_config(None));

    write_pending(&store, tp, &target).await;
    wait_converged(&store, tp, &target).await;
    let committed = store.revision();
    handle.wait_processed(committed).await.unwrap();
    wait_state(&handle, tp, PartitionState::Stable).await;

    let calls = probe.calls();
    let revision = store.revision();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(probe.calls(), calls);
    assert_eq!(store.revision(), revision);
    assert_eq!(handle.partition_state(tp), Some(PartitionState::Stable));
    handle.shutdown().await;
}

#[tokio::test]
async fn restart_resumes_from_store() {
    let store = open_store().await;
    let tp = TablePartitionId::new(5, 1);
    let target = voters(&["a", "b"]);
    write_stable(&store, tp, &voters(&["a"])).await;

    let probe = TestProbe::with_missing(&["b"]);
    let handle = RebalanceCoordinator::start(store.clone(), probe.clone(), fast_config(None));
    write_pending(&store, tp, &target).await;
    wait_state(&handle, tp, PartitionState::AwaitingCatchUp).await;
    handle.shutdown().await;

    // Nothing moved while the coordinator was down.
    probe.release("b");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(store.get(pending_key(tp)).await.unwrap().is_some());

    let handle = RebalanceCoordinator::start(store.clone(), probe, fast_config(None));
    wait_converged(&store, tp, &target).await;
    handle.shutdown().await;
}

#[tokio::test]
async fn unreachable_node_does_not_block_other_partitions() {
    let store = open_store().await;
    let stuck = TablePartitionId::new(6, 0);
    let healthy = TablePartitionId::new(6, 1);
    let probe = Arc::new(TestProbe::default());
    probe.unreachable.lock().unwrap().insert("dead".to_string());
    let handle = RebalanceCoordinator::start(store.clone(), probe, fast_config(None));

    write_pending(&store, stuck, &voters(&["a", "dead"])).await;
    write_pending(&store, healthy, &voters(&["a", "b"])).await;

    wait_converged(&store, healthy, &voters(&["a", "b"])).await;
    assert_eq!(handle.partition_state(stuck), Some(PartitionState::AwaitingCatchUp));
    assert!(store.get(pending_key(stuck)).await.unwrap().is_some());
    assert!(store.get(stable_key(stuck)).await.unwrap().is_none());
    handle.shutdown().await;
}

#[tokio::test]
async fn parked_partition_resumes_on_next_update() {
    let store = open_store().await;
    let tp = TablePartitionId::new(8, 0);
    let probe = TestProbe::with_missing(&["x"]);
    let handle = RebalanceCoordinator::start(store.clone(), probe.clone(), fast_config(Some(2)));

    write_pending(&store, tp, &voters(&["a", "x"])).await;
    wait_state(&handle, tp, PartitionState::AwaitingCatchUp).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Parked: no more probing, pending untouched.
    let calls = probe.calls();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(probe.calls(), calls);
    assert!(store.get(pending_key(tp)).await.unwrap().is_some());

    let next = voters(&["a", "y"]);
    write_pending(&store, tp, &next).await;
    wait_converged(&store, tp, &next).await;
    handle.shutdown().await;
}

#[tokio::test]
async fn pending_equal_to_stable_is_cleared() {
    let store = open_store().await;
    let tp = TablePartitionId::new(9, 0);
    let set = voters(&["a", "b"]);
    let stable_revision = write_stable(&store, tp, &set).await;
    write_pending(&store, tp, &set).await;

    let probe = Arc::new(TestProbe::default());
    let handle = RebalanceCoordinator::start(store.clone(), probe.clone(), fast_config(None));
    wait_converged(&store, tp, &set).await;

    let stable = store.get(stable_key(tp)).await.unwrap().unwrap();
    assert_eq!(stable.revision, stable_revision);
    assert_eq!(probe.calls(), 0);
    handle.shutdown().await;
}

#[tokio::test]
async fn unavailable_log_delays_commit() {
    let store = open_store().await;
    let tp = TablePartitionId::new(10, 0);
    let target = voters(&["a", "b"]);
    let probe = TestProbe::with_missing(&["b"]);
    let handle = RebalanceCoordinator::start(store.clone(), probe.clone(), fast_config(None));

    write_pending(&store, tp, &target).await;
    wait_state(&handle, tp, PartitionState::AwaitingCatchUp).await;

    store.log().set_available(false);
    probe.release("b");
    wait_state(&handle, tp, PartitionState::Committing).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(store.get(pending_key(tp)).await.unwrap().is_some());

    store.log().set_available(true);
    wait_converged(&store, tp, &target).await;
    handle.shutdown().await;
}

#[tokio::test]
async fn coordinator_commit_of_superseded_pending_is_rejected() {
    let store = open_store().await;
    let tp = TablePartitionId::new(3, 1);
    let s0 = voters(&["a"]);
    let s1 = voters(&["a", "b"]);
    let s2 = voters(&["a", "c"]);
    write_stable(&store, tp, &s0).await;
    let seen = record_stable(&store, tp);

    let probe = TestProbe::with_missing(&["b"]);
    let handle = RebalanceCoordinator::start(store.clone(), probe.clone(), fast_config(None));
    write_pending(&store, tp, &s1).await;
    wait_state(&handle, tp, PartitionState::AwaitingCatchUp).await;

    // The coordinator does not see s2 before it tries to commit s1.
    store.log().hold_history(true);
    write_pending(&store, tp, &s2).await;
    probe.release("b");
    wait_state(&handle, tp, PartitionState::Committing).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(stable_of(&store, tp).await, Some(s0));
    let pending = store.get(pending_key(tp)).await.unwrap().unwrap();
    assert_eq!(Assignments::decode(&pending.value).unwrap(), s2);

    store.log().hold_history(false);
    wait_converged(&store, tp, &s2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*seen.lock().unwrap(), vec![Some(s2)]);
    handle.shutdown().await;
}

#[tokio::test]
async fn converges_through_burst_on_tiny_watch_queue() {
    let config = WatchConfig { queue_capacity: 1, overflow_wait_ms: 1, ..WatchConfig::default() };
    let store = open_store_with(config).await;
    let tp = TablePartitionId::new(11, 0);
    let target = voters(&["a", "b"]);
    let handle = RebalanceCoordinator::start(store.clone(), Arc::new(TestProbe::default()), fast_config(None));
    handle.wait_processed(store.revision()).await.unwrap();

    // A backlog of assignment batches far larger than the watch queue.
    store.log().hold_history(true);
    for i in 0..64 {
        write_stable(&store, TablePartitionId::new(12, i), &voters(&["z"])).await;
    }
    write_pending(&store, tp, &target).await;
    store.log().hold_history(false);

    wait_converged(&store, tp, &target).await;
    let last = store.revision();
    handle.wait_processed(last).await.unwrap();
    for i in 0..64 {
        wait_state(&handle, TablePartitionId::new(12, i), PartitionState::Stable).await;
    }
    handle.shutdown().await;
}

#[tokio::test]
async fn converges_after_history_is_compacted_under_the_watch() {
    let store = open_store().await;
    let tp = TablePartitionId::new(13, 0);
    let probe = TestProbe::with_missing(&["x"]);
    let handle = RebalanceCoordinator::start(store.clone(), probe.clone(), fast_config(Some(2)));

    write_pending(&store, tp, &voters(&["a", "x"])).await;
    wait_state(&handle, tp, PartitionState::AwaitingCatchUp).await;
    let processed = store.revision();
    handle.wait_processed(processed).await.unwrap();

    // Everything after the coordinator's position is compacted away before
    // its watch reads it.
    store.log().hold_history(true);
    let next = voters(&["a", "y"]);
    write_pending(&store, tp, &next).await;
    store.put("unrelated", "v").await.unwrap();
    let compacted = store.compact(store.revision()).await.unwrap();
    assert!(compacted > processed);
    store.log().hold_history(false);

    wait_converged(&store, tp, &next).await;
    handle.wait_processed(compacted).await.unwrap();
    handle.shutdown().await;
}

#[tokio::test]
async fn removed_partition_retires_its_worker() {
    let store = open_store().await;
    let tp = TablePartitionId::new(14, 0);
    write_stable(&store, tp, &voters(&["a"])).await;
    let handle = RebalanceCoordinator::start(store.clone(), Arc::new(TestProbe::default()), fast_config(None));
    wait_state(&handle, tp, PartitionState::Stable).await;

    let removed = store.remove(stable_key(tp)).await.unwrap();
    handle.wait_processed(removed).await.unwrap();
    assert_eq!(handle.partition_state(tp), None);

    // A later placement starts the partition afresh.
    let target = voters(&["a", "b"]);
    write_pending(&store, tp, &target).await;
    wait_converged(&store, tp, &target).await;
    wait_state(&handle, tp, PartitionState::Stable).await;
    handle.shutdown().await;
}
