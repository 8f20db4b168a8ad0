use std::time::Duration;

use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tessera_consensus::ReplicatedLog;
use tessera_types::{MetaError, Revision};

use crate::MetaStore;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    pub interval_secs: u64,
    /// Revisions of history kept behind the applied revision.
    pub retain_revisions: u64,
}

impl CompactionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

impl Default for CompactionConfig {
    fn default() -> Self {
        CompactionConfig { interval_secs: 60, retain_revisions: 10_000 }
    }
}

/// Periodically compacts history older than `retain_revisions` and purges
/// the log behind it.
pub struct CompactionTask<R> {
    store: MetaStore<R>,
    config: CompactionConfig,
}

impl<R: ReplicatedLog> CompactionTask<R> {
    pub fn new(store: MetaStore<R>, config: CompactionConfig) -> Self {
        CompactionTask { store, config }
    }

    /// Compact once. Returns the new compaction point, or `None` when there
    /// is nothing old enough to drop.
    pub async fn run_once(&self) -> Result<Option<Revision>, MetaError> {
        let target = self.store.revision().saturating_sub(self.config.retain_revisions);
        if target == 0 || target <= self.store.compacted_revision().await? {
            return Ok(None);
        }
        let compacted = self.store.compact(target).await?;
        self.store.log().purge_applied(compacted).await?;
        Ok(Some(compacted))
    }

    /// Run until `shutdown` flips to `true` or its sender is dropped.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(
                interval_secs = self.config.interval_secs,
                retain = self.config.retain_revisions,
                "compaction task started"
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                match self.run_once().await {
                    Ok(Some(revision)) => info!(revision, "compacted history"),
                    Ok(None) => debug!("nothing to compact"),
                    // Unavailable is expected while the log is fenced.
                    Err(e) => warn!(error = %e, "compaction failed"),
                }
            }
            debug!("compaction task stopped");
        })
    }
}
