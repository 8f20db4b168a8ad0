use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tracing::{debug, info, warn};

use tessera_storage::{LogEntry, LogStorage, StateMachineStore};
use tessera_types::{MetaCommand, MetaEntry, MetaError, MetaResponse, Revision, ScanPage, WatchBatch};

// ---------------------------------------------------------------------------
// ReplicatedLog trait
// Uses RPITIT (Return Position Impl Trait In Trait, stable since Rust 1.75).
// The explicit `+ Send` bound on each future ensures generic callers can
// `.await` across thread boundaries.
// ---------------------------------------------------------------------------

pub trait ReplicatedLog: Send + Sync + 'static {
    /// Append `cmd` to the log and return its result once applied.
    ///
    /// `Unavailable` means the effect is unknown: the command may or may not
    /// have committed.
    fn propose(&self, cmd: MetaCommand)
        -> impl Future<Output = Result<MetaResponse, MetaError>> + Send;

    /// `at_revision == 0` means latest.
    fn read(&self, key: &[u8], at_revision: Revision)
        -> impl Future<Output = Result<Option<MetaEntry>, MetaError>> + Send;

    /// `end` empty means unbounded. `limit == 0` means unbounded.
    /// The whole page is read at one revision.
    fn scan(&self, start: &[u8], end: &[u8], limit: usize)
        -> impl Future<Output = Result<ScanPage, MetaError>> + Send;

    /// Durable event batches with revision `> after`, oldest first.
    fn batches_after(&self, after: Revision, limit: usize)
        -> impl Future<Output = Result<Vec<WatchBatch>, MetaError>> + Send;

    fn compacted_revision(&self) -> impl Future<Output = Result<Revision, MetaError>> + Send;

    /// Revision of the last applied command.
    fn applied_revision(&self) -> Revision;

    /// Receiver that observes every new applied revision.
    fn subscribe_applied(&self) -> watch::Receiver<Revision>;

    /// Drop log entries up to `up_to` (clamped to the applied revision).
    fn purge_applied(&self, up_to: u64) -> impl Future<Output = Result<(), MetaError>> + Send;
}

// ---------------------------------------------------------------------------
// LogConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Capacity of the queue between proposers and the apply task.
    pub proposal_queue: usize,
    pub propose_timeout_ms: u64,
}

impl LogConfig {
    pub fn propose_timeout(&self) -> Duration {
        Duration::from_millis(self.propose_timeout_ms)
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig { proposal_queue: 1024, propose_timeout_ms: 5_000 }
    }
}

// ---------------------------------------------------------------------------
// LocalLog — single-replica log with one sequential apply task
// ---------------------------------------------------------------------------

struct Proposal {
    cmd: MetaCommand,
    reply: oneshot::Sender<Result<MetaResponse, MetaError>>,
}

struct Shared<L, S> {
    log: L,
    sm: S,
    /// Held for writing while a command applies; reads hold it for reading
    /// so they never observe half of a command.
    apply_lock: RwLock<()>,
    applied_tx: watch::Sender<Revision>,
    available: AtomicBool,
}

impl<L: LogStorage, S: StateMachineStore> Shared<L, S> {
    async fn commit(&self, index: u64, cmd: MetaCommand) -> Result<MetaResponse, MetaError> {
        self.log.append(vec![LogEntry { index, command: cmd.clone() }]).await?;
        let applied = {
            let _guard = self.apply_lock.write().await;
            // The entry is already in the log and a restart would replay it,
            // so the outcome is unknown to the caller.
            self.sm
                .apply(index, cmd)
                .await
                .map_err(|e| MetaError::unavailable(format!("apply of index {index} failed: {e}")))?
        };
        self.applied_tx.send_replace(index);
        if let Some(batch) = &applied.batch {
            debug!(revision = index, events = batch.events.len(), "command applied");
        }
        Ok(applied.response)
    }
}

/// `ReplicatedLog` over local storage.
///
/// Commands are totally ordered by a single apply task; each one consumes
/// the next log index, which is also its revision.
pub struct LocalLog<L, S> {
    shared: Arc<Shared<L, S>>,
    proposals: mpsc::Sender<Proposal>,
    config: LogConfig,
}

impl<L: LogStorage, S: StateMachineStore> LocalLog<L, S> {
    /// Replay entries the state machine has not applied yet, then start the
    /// apply task.
    pub async fn open(log: L, sm: S, config: LogConfig) -> Result<Self, MetaError> {
        let state = log.log_state().await?;
        let mut applied = sm.last_applied().await?.unwrap_or(0);
        let last = state.last_index.unwrap_or(0);

        if last > applied {
            let entries = log.get_entries(applied + 1, last).await?;
            let replayed = entries.len();
            for entry in entries {
                sm.apply(entry.index, entry.command).await?;
                applied = entry.index;
            }
            info!(replayed, revision = applied, "replayed log");
        }

        let next_index = applied.max(last) + 1;
        let (applied_tx, _) = watch::channel(applied);
        let shared = Arc::new(Shared {
            log,
            sm,
            apply_lock: RwLock::new(()),
            applied_tx,
            available: AtomicBool::new(true),
        });

        let (tx, rx) = mpsc::channel(config.proposal_queue.max(1));
        tokio::spawn(run_apply_loop(shared.clone(), rx, next_index));

        Ok(LocalLog { shared, proposals: tx, config })
    }

    /// Fence or unfence the log. A fenced log rejects proposals with
    /// `Unavailable`, as a replica that lost its quorum would.
    pub fn set_available(&self, available: bool) {
        if !available {
            warn!("log fenced, proposals will fail");
        }
        self.shared.available.store(available, Ordering::SeqCst);
    }
}

async fn run_apply_loop<L: LogStorage, S: StateMachineStore>(
    shared: Arc<Shared<L, S>>,
    mut rx: mpsc::Receiver<Proposal>,
    mut next_index: u64,
) {
    while let Some(Proposal { cmd, reply }) = rx.recv().await {
        if !shared.available.load(Ordering::SeqCst) {
            let _ = reply.send(Err(MetaError::unavailable("log is fenced")));
            continue;
        }
        let result = shared.commit(next_index, cmd).await;
        match &result {
            Ok(_) => next_index += 1,
            Err(e) => warn!(index = next_index, error = %e, "failed to commit command"),
        }
        let _ = reply.send(result);
    }
    debug!("apply task stopped");
}

impl<L: LogStorage, S: StateMachineStore> ReplicatedLog for LocalLog<L, S> {
    async fn propose(&self, cmd: MetaCommand) -> Result<MetaResponse, MetaError> {
        if !self.shared.available.load(Ordering::SeqCst) {
            return Err(MetaError::unavailable("log is fenced"));
        }
        let (tx, rx) = oneshot::channel();
        let submit = async {
            self.proposals
                .send(Proposal { cmd, reply: tx })
                .await
                .map_err(|_| MetaError::unavailable("apply task stopped"))?;
            rx.await.map_err(|_| MetaError::unavailable("proposal dropped"))?
        };
        match tokio::time::timeout(self.config.propose_timeout(), submit).await {
            Ok(result) => result,
            Err(_) => Err(MetaError::unavailable("proposal timed out")),
        }
    }

    async fn read(&self, key: &[u8], at_revision: Revision) -> Result<Option<MetaEntry>, MetaError> {
        let _guard = self.shared.apply_lock.read().await;
        self.shared.sm.get(key, at_revision).await
    }

    async fn scan(&self, start: &[u8], end: &[u8], limit: usize) -> Result<ScanPage, MetaError> {
        let _guard = self.shared.apply_lock.read().await;
        self.shared.sm.scan(start, end, limit).await
    }

    async fn batches_after(&self, after: Revision, limit: usize) -> Result<Vec<WatchBatch>, MetaError> {
        // A compaction must not land between the retained-history check and
        // the read.
        let _guard = self.shared.apply_lock.read().await;
        self.shared.sm.batches_after(after, limit).await
    }

    async fn compacted_revision(&self) -> Result<Revision, MetaError> {
        self.shared.sm.compacted_revision().await
    }

    fn applied_revision(&self) -> Revision {
        *self.shared.applied_tx.borrow()
    }

    fn subscribe_applied(&self) -> watch::Receiver<Revision> {
        self.shared.applied_tx.subscribe()
    }

    async fn purge_applied(&self, up_to: u64) -> Result<(), MetaError> {
        let up_to = up_to.min(self.applied_revision());
        if up_to == 0 {
            return Ok(());
        }
        self.shared.log.purge(up_to).await?;
        debug!(up_to, "purged log");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
