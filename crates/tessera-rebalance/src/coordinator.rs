use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tessera_consensus::ReplicatedLog;
use tessera_meta::{KeySelector, MetaStore, WatchFilter};
use tessera_types::{prefix_end, Condition, MetaError, Operation, Revision, WatchBatch};

use crate::keys::{parse_key, pending_key, stable_key, AssignmentKey, TablePartitionId, PENDING_PREFIX, STABLE_PREFIX};
use crate::partition::{decide, Decision, Observed, PartitionState, PartitionView};
use crate::probe::{wait_for_data, CatchUpPolicy, DataProbe};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub catch_up: CatchUpPolicy,
    /// First delay before retrying a commit or recovery read that failed
    /// with a retryable error. Doubles up to `catch_up.max_backoff_ms`.
    pub retry_backoff_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig { catch_up: CatchUpPolicy::default(), retry_backoff_ms: 100 }
    }
}

impl CoordinatorConfig {
    fn retry_policy(&self) -> CatchUpPolicy {
        CatchUpPolicy { initial_backoff_ms: self.retry_backoff_ms, ..self.catch_up.clone() }
    }
}

type States = Arc<Mutex<HashMap<TablePartitionId, PartitionState>>>;

fn lock_states(states: &States) -> std::sync::MutexGuard<'_, HashMap<TablePartitionId, PartitionState>> {
    states.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Context<R, P> {
    store: MetaStore<R>,
    probe: Arc<P>,
    config: CoordinatorConfig,
    states: States,
}

impl<R, P> Context<R, P> {
    fn set_state(&self, tp: TablePartitionId, state: PartitionState) {
        let previous = lock_states(&self.states).insert(tp, state);
        if previous != Some(state) {
            debug!(%tp, %state, "partition state changed");
        }
    }
}

/// Latest view of a partition plus the revision it was observed at.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PartitionUpdate {
    view: PartitionView,
    revision: Revision,
}

struct Worker {
    tx: watch::Sender<PartitionUpdate>,
    task: JoinHandle<()>,
}

/// Drives pending assignments to stable ones.
///
/// One router task follows the assignment keys and forwards the latest view
/// of every partition to that partition's own task. Nothing is persisted
/// outside the Meta Store: on start, and whenever the watch has to be
/// re-established, state is re-derived from a single range read.
pub struct RebalanceCoordinator;

impl RebalanceCoordinator {
    pub fn start<R: ReplicatedLog, P: DataProbe>(
        store: MetaStore<R>,
        probe: Arc<P>,
        config: CoordinatorConfig,
    ) -> CoordinatorHandle {
        let states: States = Arc::new(Mutex::new(HashMap::new()));
        let (processed_tx, processed_rx) = watch::channel(0);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = Arc::new(Context { store, probe, config, states: states.clone() });
        let router = tokio::spawn(run_router(ctx, processed_tx, shutdown_rx));
        info!("rebalance coordinator started");
        CoordinatorHandle { states, processed: processed_rx, shutdown: shutdown_tx, router }
    }
}

/// Handle to a running coordinator. Dropping it stops the coordinator.
pub struct CoordinatorHandle {
    states: States,
    processed: watch::Receiver<Revision>,
    shutdown: watch::Sender<bool>,
    router: JoinHandle<()>,
}

impl CoordinatorHandle {
    pub fn partition_state(&self, tp: TablePartitionId) -> Option<PartitionState> {
        lock_states(&self.states).get(&tp).copied()
    }

    /// Highest revision whose assignment changes have been routed to
    /// partition tasks.
    pub fn processed_revision(&self) -> Revision {
        *self.processed.borrow()
    }

    /// Wait until `processed_revision() >= revision`.
    pub async fn wait_processed(&self, revision: Revision) -> Result<(), MetaError> {
        let mut rx = self.processed.clone();
        rx.wait_for(|r| *r >= revision).await.map(|_| ()).map_err(|_| MetaError::Cancelled)
    }

    /// Stop the router and every partition task. In-flight invokes are
    /// atomic; whatever they did is re-derived on the next start.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.router.await;
        info!("rebalance coordinator stopped");
    }
}

async fn run_router<R: ReplicatedLog, P: DataProbe>(
    ctx: Arc<Context<R, P>>,
    processed: watch::Sender<Revision>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut workers: BTreeMap<TablePartitionId, Worker> = BTreeMap::new();
    let mut views: BTreeMap<TablePartitionId, PartitionView> = BTreeMap::new();
    let mut backoff = ctx.config.retry_policy().backoff();

    'recover: loop {
        let recovered = tokio::select! {
            r = recover(&ctx.store) => r,
            _ = shutdown.changed() => break 'recover,
        };
        let revision = match recovered {
            Ok((recovered, revision)) => {
                // Partitions whose keys disappeared while unobserved fall back to empty views.
                for view in views.values_mut() {
                    *view = PartitionView::default();
                }
                views.extend(recovered);
                for (tp, view) in &views {
                    route(&ctx, &mut workers, *tp, view.clone(), revision);
                }
                views.retain(|_, view| *view != PartitionView::default());
                info!(revision, partitions = views.len(), "recovered assignment state");
                revision
            }
            Err(e) => {
                warn!(error = %e, "failed to read assignments, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(backoff.next_delay()) => continue 'recover,
                    _ = shutdown.changed() => break 'recover,
                }
            }
        };
        backoff = ctx.config.retry_policy().backoff();
        processed.send_replace(revision);

        let filter = WatchFilter::prefix(PENDING_PREFIX).with(KeySelector::Prefix(STABLE_PREFIX.into()));
        let mut sub = ctx.store.watch(filter, revision);
        loop {
            let next = tokio::select! {
                r = sub.recv() => r,
                _ = shutdown.changed() => break 'recover,
            };
            match next {
                Ok(batch) => {
                    let revision = batch.revision;
                    for tp in apply_batch(&mut views, &batch) {
                        let view = views.remove(&tp).unwrap_or_default();
                        route(&ctx, &mut workers, tp, view.clone(), revision);
                        if view != PartitionView::default() {
                            views.insert(tp, view);
                        }
                    }
                    processed.send_replace(revision);
                }
                Err(MetaError::Cancelled) => break 'recover,
                Err(e) => {
                    // Overflow or compaction: rebuild from a fresh range read.
                    warn!(error = %e, last = sub.last_delivered(), "assignment watch lost, recovering");
                    continue 'recover;
                }
            }
        }
    }

    for (_, worker) in workers {
        worker.task.abort();
    }
}

/// Read both key families at one revision.
async fn recover<R: ReplicatedLog>(
    store: &MetaStore<R>,
) -> Result<(BTreeMap<TablePartitionId, PartitionView>, Revision), MetaError> {
    // "pending-…" sorts before "stable-…", so one scan covers both families.
    let end = prefix_end(STABLE_PREFIX.as_bytes()).unwrap_or_default();
    let page = store.scan(PENDING_PREFIX.as_bytes(), &end, 0).await?;

    let mut views: BTreeMap<TablePartitionId, PartitionView> = BTreeMap::new();
    for entry in &page.entries {
        match parse_key(&entry.key) {
            Some(AssignmentKey::Pending(tp)) => views.entry(tp).or_default().pending = Some(entry.into()),
            Some(AssignmentKey::Stable(tp)) => views.entry(tp).or_default().stable = Some(entry.into()),
            None => {}
        }
    }
    Ok((views, page.revision))
}

/// Fold a watch batch into the known views; returns the touched partitions.
fn apply_batch(
    views: &mut BTreeMap<TablePartitionId, PartitionView>,
    batch: &WatchBatch,
) -> BTreeSet<TablePartitionId> {
    let mut touched = BTreeSet::new();
    for event in &batch.events {
        let Some(key) = parse_key(&event.key) else {
            continue;
        };
        let tp = key.partition();
        let observed = event.entry.as_ref().map(Observed::from);
        let view = views.entry(tp).or_default();
        match key {
            AssignmentKey::Pending(_) => view.pending = observed,
            AssignmentKey::Stable(_) => view.stable = observed,
        }
        touched.insert(tp);
    }
    touched
}

fn route<R: ReplicatedLog, P: DataProbe>(
    ctx: &Arc<Context<R, P>>,
    workers: &mut BTreeMap<TablePartitionId, Worker>,
    tp: TablePartitionId,
    view: PartitionView,
    revision: Revision,
) {
    if view == PartitionView::default() {
        // Both keys are gone; a later write starts a fresh worker.
        if let Some(worker) = workers.remove(&tp) {
            worker.task.abort();
            debug!(%tp, "partition has no assignments, worker retired");
        }
        lock_states(&ctx.states).remove(&tp);
        return;
    }
    if let Some(worker) = workers.get(&tp) {
        // Unchanged views (e.g. after recovery) do not restart the partition.
        worker.tx.send_if_modified(|current| {
            if current.view == view {
                current.revision = current.revision.max(revision);
                false
            } else {
                *current = PartitionUpdate { view, revision };
                true
            }
        });
        return;
    }
    let (tx, rx) = watch::channel(PartitionUpdate { view, revision });
    let task = tokio::spawn(run_partition(ctx.clone(), tp, rx));
    workers.insert(tp, Worker { tx, task });
}

async fn run_partition<R: ReplicatedLog, P: DataProbe>(
    ctx: Arc<Context<R, P>>,
    tp: TablePartitionId,
    mut rx: watch::Receiver<PartitionUpdate>,
) {
    loop {
        let update = rx.borrow_and_update().clone();
        tokio::select! {
            _ = drive(&ctx, tp, &update.view) => {}
            changed = rx.changed() => {
                if changed.is_err() {
                    return;
                }
                debug!(%tp, revision = update.revision, "partition changed mid-flight, re-deriving");
                continue;
            }
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Take the partition as far as its current view allows.
async fn drive<R: ReplicatedLog, P: DataProbe>(ctx: &Context<R, P>, tp: TablePartitionId, view: &PartitionView) {
    match decide(view) {
        Decision::Idle => ctx.set_state(tp, PartitionState::Stable),
        Decision::Malformed { pending_revision } => {
            warn!(%tp, pending_revision, "pending assignments cannot be decoded, ignoring");
            ctx.set_state(tp, PartitionState::Stable);
        }
        Decision::Cleanup { observed } => {
            ctx.set_state(tp, PartitionState::Committing);
            let success = vec![Operation::remove(pending_key(tp))];
            commit(ctx, tp, observed, success).await;
        }
        Decision::CatchUp { observed, pending_revision, added } => {
            ctx.set_state(tp, PartitionState::AwaitingCatchUp);
            debug!(%tp, pending_revision, added = ?added, "awaiting catch-up");
            if !added.is_empty() && !wait_for_data(ctx.probe.as_ref(), tp, added, &ctx.config.catch_up).await {
                // Parked until the next update for this partition.
                return;
            }
            ctx.set_state(tp, PartitionState::Committing);
            let success = vec![Operation::put(stable_key(tp), observed.clone()), Operation::remove(pending_key(tp))];
            commit(ctx, tp, observed, success).await;
        }
    }
}

/// `invoke(pending == observed, success, [noop])`, retried only while the
/// log is unavailable.
async fn commit<R: ReplicatedLog, P: DataProbe>(
    ctx: &Context<R, P>,
    tp: TablePartitionId,
    observed: Vec<u8>,
    success: Vec<Operation>,
) {
    let condition = Condition::value_eq(pending_key(tp), observed);
    let mut backoff = ctx.config.retry_policy().backoff();
    loop {
        match ctx.store.invoke(condition.clone(), success.clone(), vec![Operation::Noop]).await {
            Ok(result) if result.applied => {
                info!(%tp, revision = result.revision, "assignments committed");
                ctx.set_state(tp, PartitionState::Stable);
                return;
            }
            Ok(result) => {
                // A newer pending value won; its own event re-derives the state.
                debug!(%tp, revision = result.revision, "pending assignments changed before commit");
                return;
            }
            Err(e) if e.is_retryable() => {
                let delay = backoff.next_delay();
                warn!(%tp, error = %e, delay_ms = delay.as_millis() as u64, "commit unavailable, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                warn!(%tp, error = %e, "commit failed");
                return;
            }
        }
    }
}
