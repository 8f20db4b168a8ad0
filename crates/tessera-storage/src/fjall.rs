use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use tessera_types::{
    MetaCommand, MetaEntry, MetaError, MetaResponse, Revision, ScanPage, WatchBatch, WatchEvent,
};

use crate::apply::{compaction_victims, keys_to_load, plan_mutation};
use crate::keys::{
    event_key, history_key, log_key, meta_key, parse_history_key, COMPACTED, LAST_APPLIED,
    LAST_PURGED, UPDATE_COUNTER,
};
use crate::traits::{LogStorage, StateMachineStore};
use crate::types::{Applied, LogEntry, LogState, Version};

fn encode<T: serde::Serialize>(val: &T) -> Result<Vec<u8>, MetaError> {
    bincode::serde::encode_to_vec(val, bincode::config::standard())
        .map_err(|e| MetaError::Storage(e.to_string()))
}

fn decode<T: for<'de> serde::Deserialize<'de>>(bytes: &[u8]) -> Result<T, MetaError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(v, _)| v)
        .map_err(|e| MetaError::Storage(e.to_string()))
}

fn fjall_err(e: fjall::Error) -> MetaError {
    MetaError::Storage(e.to_string())
}

fn join_err(e: tokio::task::JoinError) -> MetaError {
    MetaError::Storage(e.to_string())
}

fn read_meta_u64(store: &FjallStore, label: &str) -> Result<Option<u64>, MetaError> {
    match store.meta.get(meta_key(label)).map_err(fjall_err)? {
        Some(b) => Ok(Some(decode::<u64>(&b)?)),
        None => Ok(None),
    }
}

fn index_from_key(k: &[u8]) -> Result<u64, MetaError> {
    let bytes: [u8; 8] = k
        .get(..8)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| MetaError::Storage("short index key".into()))?;
    Ok(u64::from_be_bytes(bytes))
}

// ---------------------------------------------------------------------------
// FjallStore — shared handle wrapping all five keyspaces
// ---------------------------------------------------------------------------

/// Shared storage handle.
///
/// All five keyspaces live in a single fjall `Database` so that cross-keyspace
/// write batches are atomic.
pub struct FjallStore {
    /// The underlying fjall database.
    pub db: fjall::Database,
    /// Replicated log entries: `index(8)` → bincode(LogEntry)
    pub log: fjall::Keyspace,
    /// Current key-value data: `key` → bincode(MetaEntry)
    pub data: fjall::Keyspace,
    /// Per-key versions: `key_len(4) ++ key ++ revision(8)` → bincode(Version)
    pub history: fjall::Keyspace,
    /// Watch event batches: `revision(8)` → bincode(Vec<WatchEvent>)
    pub events: fjall::Keyspace,
    /// Cursors and counters: `label_utf8` → bincode(u64)
    pub meta: fjall::Keyspace,
}

impl FjallStore {
    /// Open (or create) a `FjallStore` at `path`.
    pub fn open(path: &Path) -> Result<Arc<Self>, MetaError> {
        let db = fjall::Database::builder(path).open().map_err(fjall_err)?;
        let log = db.keyspace("log", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        let data = db.keyspace("data", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        let history =
            db.keyspace("history", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        let events =
            db.keyspace("events", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        let meta = db.keyspace("meta", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        Ok(Arc::new(FjallStore { db, log, data, history, events, meta }))
    }
}

// ---------------------------------------------------------------------------
// FjallLogStorage
// ---------------------------------------------------------------------------

/// `LogStorage` backed by fjall.
///
/// All blocking I/O is wrapped in `tokio::task::spawn_blocking`.
pub struct FjallLogStorage(pub Arc<FjallStore>);

impl LogStorage for FjallLogStorage {
    async fn log_state(&self) -> Result<LogState, MetaError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<LogState, MetaError> {
            let first_index = match store.log.iter().next() {
                Some(guard) => Some(index_from_key(&guard.into_inner().map_err(fjall_err)?.0)?),
                None => None,
            };
            let last_entry = match store.log.iter().next_back() {
                Some(guard) => Some(index_from_key(&guard.into_inner().map_err(fjall_err)?.0)?),
                None => None,
            };
            let last_purged_index = read_meta_u64(&store, LAST_PURGED)?;

            Ok(LogState {
                first_index,
                last_index: last_entry.or(last_purged_index),
                last_purged_index,
            })
        })
        .await
        .map_err(join_err)?
    }

    async fn get_entries(&self, from: u64, to_inclusive: u64) -> Result<Vec<LogEntry>, MetaError> {
        if from > to_inclusive {
            return Ok(Vec::new());
        }
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<LogEntry>, MetaError> {
            let start = log_key(from).to_vec();
            let end = log_key(to_inclusive).to_vec();
            store
                .log
                .range(start..=end)
                .map(|g| g.into_inner().map_err(fjall_err).and_then(|(_, v)| decode::<LogEntry>(&v)))
                .collect()
        })
        .await
        .map_err(join_err)?
    }

    async fn append(&self, entries: Vec<LogEntry>) -> Result<(), MetaError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<(), MetaError> {
            let mut batch = store.db.batch();
            for entry in &entries {
                batch.insert(&store.log, log_key(entry.index).to_vec(), encode(entry)?);
            }
            batch.commit().map_err(fjall_err)
        })
        .await
        .map_err(join_err)?
    }

    async fn purge(&self, up_to_index: u64) -> Result<(), MetaError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<(), MetaError> {
            let start = log_key(0).to_vec();
            let end = log_key(up_to_index).to_vec();

            let keys: Vec<Vec<u8>> = store
                .log
                .range(start..=end)
                .map(|g| g.into_inner().map(|(k, _)| k.to_vec()).map_err(fjall_err))
                .collect::<Result<_, _>>()?;

            let purged = read_meta_u64(&store, LAST_PURGED)?.map_or(up_to_index, |p| p.max(up_to_index));
            let mut batch = store.db.batch();
            for k in keys {
                batch.remove(&store.log, k);
            }
            batch.insert(&store.meta, meta_key(LAST_PURGED), encode(&purged)?);
            batch.commit().map_err(fjall_err)
        })
        .await
        .map_err(join_err)?
    }
}

// ---------------------------------------------------------------------------
// FjallStateMachine
// ---------------------------------------------------------------------------

/// `StateMachineStore` backed by fjall.
pub struct FjallStateMachine {
    pub store: Arc<FjallStore>,
}

impl FjallStateMachine {
    pub fn new(store: Arc<FjallStore>) -> Self {
        FjallStateMachine { store }
    }
}

/// Keys to delete from `history` and `events` when compacting to `target`.
fn compaction_deletes(
    store: &FjallStore,
    target: Revision,
) -> Result<(Vec<Vec<u8>>, Vec<Vec<u8>>), MetaError> {
    let versions = store
        .history
        .iter()
        .map(|g| {
            let (k, v) = g.into_inner().map_err(fjall_err)?;
            let (key, revision) = parse_history_key(&k)
                .ok_or_else(|| MetaError::Storage("malformed history key".into()))?;
            let version = decode::<Version>(&v)?;
            Ok((key, revision, version.value.is_none()))
        })
        .collect::<Result<Vec<_>, MetaError>>()?;
    let history_keys = compaction_victims(versions, target)
        .into_iter()
        .map(|(key, revision)| history_key(&key, revision))
        .collect();

    let event_keys = store
        .events
        .range(event_key(0).to_vec()..=event_key(target).to_vec())
        .map(|g| g.into_inner().map(|(k, _)| k.to_vec()).map_err(fjall_err))
        .collect::<Result<_, _>>()?;

    Ok((history_keys, event_keys))
}

impl StateMachineStore for FjallStateMachine {
    async fn last_applied(&self) -> Result<Option<u64>, MetaError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || read_meta_u64(&store, LAST_APPLIED))
            .await
            .map_err(join_err)?
    }

    async fn apply(&self, index: u64, cmd: MetaCommand) -> Result<Applied, MetaError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || -> Result<Applied, MetaError> {
            if let Some(last) = read_meta_u64(&store, LAST_APPLIED)? {
                if index <= last {
                    return Err(MetaError::Storage(format!(
                        "index {index} already applied (last_applied = {last})"
                    )));
                }
            }

            let mut batch = store.db.batch();
            let applied = match cmd {
                MetaCommand::Compact { revision } => {
                    let mut compacted = read_meta_u64(&store, COMPACTED)?.unwrap_or(0);
                    let target = revision.min(index.saturating_sub(1));
                    if target > compacted {
                        let (history_keys, event_keys) = compaction_deletes(&store, target)?;
                        for k in history_keys {
                            batch.remove(&store.history, k);
                        }
                        for k in event_keys {
                            batch.remove(&store.events, k);
                        }
                        batch.insert(&store.meta, meta_key(COMPACTED), encode(&target)?);
                        compacted = target;
                    }
                    Applied {
                        response: MetaResponse::Compacted { revision: index, compacted },
                        batch: None,
                    }
                }
                cmd => {
                    let mut current = BTreeMap::new();
                    for key in keys_to_load(&cmd) {
                        if let Some(b) = store.data.get(&key).map_err(fjall_err)? {
                            let entry = decode::<MetaEntry>(&b)?;
                            current.insert(key, entry);
                        }
                    }
                    let counter = read_meta_u64(&store, UPDATE_COUNTER)?.unwrap_or(0);
                    let plan = plan_mutation(index, counter, cmd, current)?;

                    for (key, version) in &plan.versions {
                        match version.to_entry(key) {
                            Some(entry) => {
                                batch.insert(&store.data, key.clone(), encode(&entry)?);
                            }
                            None => {
                                batch.remove(&store.data, key.clone());
                            }
                        }
                        batch.insert(&store.history, history_key(key, index), encode(version)?);
                    }
                    if !plan.events.is_empty() {
                        batch.insert(&store.events, event_key(index).to_vec(), encode(&plan.events)?);
                    }
                    batch.insert(&store.meta, meta_key(UPDATE_COUNTER), encode(&plan.update_counter)?);
                    Applied { batch: plan.batch(index), response: plan.response }
                }
            };

            batch.insert(&store.meta, meta_key(LAST_APPLIED), encode(&index)?);
            batch.commit().map_err(fjall_err)?;
            Ok(applied)
        })
        .await
        .map_err(join_err)?
    }

    async fn get(&self, key: &[u8], at_revision: Revision) -> Result<Option<MetaEntry>, MetaError> {
        let store = self.store.clone();
        let key = key.to_vec();
        tokio::task::spawn_blocking(move || -> Result<Option<MetaEntry>, MetaError> {
            if at_revision == 0 {
                return match store.data.get(&key).map_err(fjall_err)? {
                    Some(b) => Ok(Some(decode::<MetaEntry>(&b)?)),
                    None => Ok(None),
                };
            }
            let compacted = read_meta_u64(&store, COMPACTED)?.unwrap_or(0);
            if at_revision < compacted {
                return Err(MetaError::Compacted { requested: at_revision, compacted });
            }
            let lo = history_key(&key, 0);
            let hi = history_key(&key, at_revision);
            match store.history.range(lo..=hi).next_back() {
                Some(guard) => {
                    let (_, v) = guard.into_inner().map_err(fjall_err)?;
                    Ok(decode::<Version>(&v)?.to_entry(&key))
                }
                None => Ok(None),
            }
        })
        .await
        .map_err(join_err)?
    }

    async fn scan(&self, start: &[u8], end: &[u8], limit: usize) -> Result<ScanPage, MetaError> {
        let store = self.store.clone();
        let start = start.to_vec();
        let end = end.to_vec();
        tokio::task::spawn_blocking(move || -> Result<ScanPage, MetaError> {
            let revision = read_meta_u64(&store, LAST_APPLIED)?.unwrap_or(0);
            if !end.is_empty() && start >= end {
                return Ok(ScanPage { entries: Vec::new(), continuation: None, revision });
            }
            // Fetch limit+1 to detect whether more pages exist.
            let take = if limit == 0 { usize::MAX } else { limit + 1 };
            let mut entries: Vec<MetaEntry> = if end.is_empty() {
                store
                    .data
                    .range(start..)
                    .take(take)
                    .map(|g| g.into_inner().map_err(fjall_err).and_then(|(_, v)| decode::<MetaEntry>(&v)))
                    .collect::<Result<_, _>>()?
            } else {
                store
                    .data
                    .range(start..end)
                    .take(take)
                    .map(|g| g.into_inner().map_err(fjall_err).and_then(|(_, v)| decode::<MetaEntry>(&v)))
                    .collect::<Result<_, _>>()?
            };

            let continuation = if limit != 0 && entries.len() > limit {
                entries.pop().map(|e| e.key)
            } else {
                None
            };
            Ok(ScanPage { entries, continuation, revision })
        })
        .await
        .map_err(join_err)?
    }

    async fn batches_after(&self, after: Revision, limit: usize) -> Result<Vec<WatchBatch>, MetaError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<WatchBatch>, MetaError> {
            let compacted = read_meta_u64(&store, COMPACTED)?.unwrap_or(0);
            if after < compacted {
                return Err(MetaError::Compacted { requested: after, compacted });
            }
            let take = if limit == 0 { usize::MAX } else { limit };
            let batches = store
                .events
                .range(event_key(after.saturating_add(1)).to_vec()..)
                .take(take)
                .map(|g| {
                    let (k, v) = g.into_inner().map_err(fjall_err)?;
                    Ok(WatchBatch {
                        revision: index_from_key(&k)?,
                        events: decode::<Vec<WatchEvent>>(&v)?,
                    })
                })
                .collect::<Result<Vec<_>, MetaError>>()?;
            // A compaction committed during the range may have removed batches
            // the range would otherwise have returned.
            let compacted = read_meta_u64(&store, COMPACTED)?.unwrap_or(0);
            if after < compacted {
                return Err(MetaError::Compacted { requested: after, compacted });
            }
            Ok(batches)
        })
        .await
        .map_err(join_err)?
    }

    async fn compacted_revision(&self) -> Result<Revision, MetaError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || Ok(read_meta_u64(&store, COMPACTED)?.unwrap_or(0)))
            .await
            .map_err(join_err)?
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
