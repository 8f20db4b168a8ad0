use std::future::Future;

use tessera_types::{MetaCommand, MetaEntry, MetaError, Revision, ScanPage, WatchBatch};

use crate::types::{Applied, LogEntry, LogState};

/// Persistent storage for the Meta Store's replicated log.
///
/// Methods use RPITIT (`-> impl Future + Send`) matching the `ReplicatedLog`
/// trait style in `tessera-consensus`.
pub trait LogStorage: Send + Sync + 'static {
    /// Return first index, last index, and last purged index.
    fn log_state(&self) -> impl Future<Output = Result<LogState, MetaError>> + Send;

    /// Return all entries in the inclusive range `[from, to_inclusive]`.
    fn get_entries(&self, from: u64, to_inclusive: u64)
        -> impl Future<Output = Result<Vec<LogEntry>, MetaError>> + Send;

    /// Append entries, overwriting any existing entry at the same index.
    fn append(&self, entries: Vec<LogEntry>)
        -> impl Future<Output = Result<(), MetaError>> + Send;

    /// Delete all entries with `index <= up_to_index`. Updates
    /// `last_purged_index`.
    fn purge(&self, up_to_index: u64) -> impl Future<Output = Result<(), MetaError>> + Send;
}

/// Persistent key-value state machine of the Meta Store.
///
/// Maintains current data, per-key version history, and the per-revision
/// watch event history used to replay subscriptions.
pub trait StateMachineStore: Send + Sync + 'static {
    /// Log index of the last applied entry, or `None` if nothing was applied.
    fn last_applied(&self) -> impl Future<Output = Result<Option<u64>, MetaError>> + Send;

    /// Apply a committed command at log `index`.
    ///
    /// `index` becomes the revision of every key the command mutates. The
    /// data, history, event batch and `last_applied` cursor are persisted
    /// atomically. Applying an index at or below `last_applied` fails.
    fn apply(&self, index: u64, cmd: MetaCommand)
        -> impl Future<Output = Result<Applied, MetaError>> + Send;

    /// Read a key.
    /// * `at_revision == 0` → current value.
    /// * `at_revision > 0`  → newest version with revision `<= at_revision`.
    fn get(&self, key: &[u8], at_revision: Revision)
        -> impl Future<Output = Result<Option<MetaEntry>, MetaError>> + Send;

    /// Range scan over current data, `start` inclusive, `end` exclusive.
    ///
    /// * `end` empty means unbounded.
    /// * `limit == 0` means unbounded.
    fn scan(&self, start: &[u8], end: &[u8], limit: usize)
        -> impl Future<Output = Result<ScanPage, MetaError>> + Send;

    /// Event batches with revision `> after`, oldest first, at most `limit`
    /// (`0` = unbounded). Fails with `Compacted` once `after` predates the
    /// retained history.
    fn batches_after(&self, after: Revision, limit: usize)
        -> impl Future<Output = Result<Vec<WatchBatch>, MetaError>> + Send;

    /// Highest revision whose history has been discarded.
    fn compacted_revision(&self) -> impl Future<Output = Result<Revision, MetaError>> + Send;
}
