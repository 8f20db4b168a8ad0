//! Conditional key-value Meta Store over a replicated log.

pub mod compaction;
pub mod watch;

use std::sync::Arc;

use tracing::debug;

use tessera_consensus::ReplicatedLog;
use tessera_types::{
    prefix_end, Condition, InvokeCommand, InvokeResult, MetaCommand, MetaEntry, MetaError,
    MetaResponse, Operation, Revision, ScanPage,
};

pub use compaction::{CompactionConfig, CompactionTask};
pub use watch::{KeySelector, WatchConfig, WatchDispatcher, WatchFilter, WatchSubscription};

/// Entries under a prefix, all read at `revision`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeResult {
    pub entries: Vec<MetaEntry>,
    pub revision: Revision,
}

fn unexpected(resp: MetaResponse) -> MetaError {
    MetaError::Storage(format!("unexpected response from log: {resp:?}"))
}

/// The Meta Store. Cheap to clone; every clone shares one log and one
/// watch dispatcher.
pub struct MetaStore<R> {
    log: Arc<R>,
    watches: WatchDispatcher<R>,
}

impl<R> Clone for MetaStore<R> {
    fn clone(&self) -> Self {
        MetaStore { log: self.log.clone(), watches: self.watches.clone() }
    }
}

impl<R: ReplicatedLog> MetaStore<R> {
    pub fn new(log: Arc<R>, watch: WatchConfig) -> Self {
        let watches = WatchDispatcher::new(log.clone(), watch);
        MetaStore { log, watches }
    }

    pub fn log(&self) -> &Arc<R> {
        &self.log
    }

    pub fn dispatcher(&self) -> &WatchDispatcher<R> {
        &self.watches
    }

    /// Revision of the latest applied command.
    pub fn revision(&self) -> Revision {
        self.log.applied_revision()
    }

    pub async fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<MetaEntry>, MetaError> {
        self.log.read(key.as_ref(), 0).await
    }

    /// Value of `key` as of `revision`. Fails with `Compacted` when that
    /// revision is no longer retained.
    pub async fn get_at(
        &self,
        key: impl AsRef<[u8]>,
        revision: Revision,
    ) -> Result<Option<MetaEntry>, MetaError> {
        if revision == 0 {
            return Err(MetaError::InvalidArgument("revision must be positive".into()));
        }
        self.log.read(key.as_ref(), revision).await
    }

    /// Every entry whose key starts with `prefix`, read at one revision.
    pub async fn get_range(&self, prefix: impl AsRef<[u8]>) -> Result<RangeResult, MetaError> {
        let prefix = prefix.as_ref();
        let end = prefix_end(prefix).unwrap_or_default();
        let page = self.log.scan(prefix, &end, 0).await?;
        Ok(RangeResult { entries: page.entries, revision: page.revision })
    }

    /// Paginated range read; see [`ReplicatedLog::scan`].
    pub async fn scan(&self, start: &[u8], end: &[u8], limit: usize) -> Result<ScanPage, MetaError> {
        self.log.scan(start, end, limit).await
    }

    pub async fn put(
        &self,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Result<Revision, MetaError> {
        match self.log.propose(MetaCommand::Put { key: key.into(), value: value.into() }).await? {
            MetaResponse::Written { revision } => Ok(revision),
            other => Err(unexpected(other)),
        }
    }

    /// Removing an absent key still consumes a revision but notifies nobody.
    pub async fn remove(&self, key: impl Into<Vec<u8>>) -> Result<Revision, MetaError> {
        match self.log.propose(MetaCommand::Remove { key: key.into() }).await? {
            MetaResponse::Removed { revision, .. } => Ok(revision),
            other => Err(unexpected(other)),
        }
    }

    pub async fn put_all(&self, entries: Vec<(Vec<u8>, Vec<u8>)>) -> Result<Revision, MetaError> {
        let ops = entries.into_iter().map(|(k, v)| Operation::Put { key: k, value: v }).collect();
        Ok(self.invoke(Condition::Always, ops, Vec::new()).await?.revision)
    }

    pub async fn remove_all(&self, keys: Vec<Vec<u8>>) -> Result<Revision, MetaError> {
        let ops = keys.into_iter().map(|key| Operation::Remove { key }).collect();
        Ok(self.invoke(Condition::Always, ops, Vec::new()).await?.revision)
    }

    /// Evaluate `condition` and apply exactly one branch, atomically, as a
    /// single revision.
    pub async fn invoke(
        &self,
        condition: Condition,
        success: Vec<Operation>,
        failure: Vec<Operation>,
    ) -> Result<InvokeResult, MetaError> {
        self.invoke_command(InvokeCommand::new(condition, success, failure)).await
    }

    pub async fn invoke_command(&self, cmd: InvokeCommand) -> Result<InvokeResult, MetaError> {
        match self.log.propose(MetaCommand::Invoke(cmd)).await? {
            MetaResponse::Invoked { revision, applied } => {
                debug!(revision, applied, "invoke committed");
                Ok(InvokeResult { applied, revision })
            }
            other => Err(unexpected(other)),
        }
    }

    /// Discard history up to `revision`. Returns the effective compaction
    /// point, which never moves backwards.
    pub async fn compact(&self, revision: Revision) -> Result<Revision, MetaError> {
        match self.log.propose(MetaCommand::Compact { revision }).await? {
            MetaResponse::Compacted { compacted, .. } => Ok(compacted),
            other => Err(unexpected(other)),
        }
    }

    pub async fn compacted_revision(&self) -> Result<Revision, MetaError> {
        self.log.compacted_revision().await
    }

    /// Subscribe to mutations of keys selected by `filter` with revision
    /// `> from_exclusive`.
    pub fn watch(&self, filter: WatchFilter, from_exclusive: Revision) -> WatchSubscription {
        self.watches.subscribe(filter, from_exclusive)
    }
}
