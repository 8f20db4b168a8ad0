use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use tokio::sync::RwLock;

use tessera_types::{MetaCommand, MetaEntry, MetaError, MetaResponse, Revision, ScanPage, WatchBatch, WatchEvent};

use crate::apply::{compaction_victims, keys_to_load, plan_mutation};
use crate::traits::{LogStorage, StateMachineStore};
use crate::types::{Applied, LogEntry, LogState, Version};

// ---------------------------------------------------------------------------
// MemLogStorage
// ---------------------------------------------------------------------------

struct MemLogInner {
    entries: BTreeMap<u64, LogEntry>,
    last_purged: Option<u64>,
}

/// In-memory `LogStorage` backed by a `BTreeMap`.
///
/// Not persisted across restarts; clones share the same log, which lets
/// tests reopen a `LocalLog` over the "surviving" storage.
#[derive(Clone)]
pub struct MemLogStorage {
    inner: Arc<RwLock<MemLogInner>>,
}

impl MemLogStorage {
    pub fn new() -> Self {
        MemLogStorage {
            inner: Arc::new(RwLock::new(MemLogInner { entries: BTreeMap::new(), last_purged: None })),
        }
    }
}

impl Default for MemLogStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl LogStorage for MemLogStorage {
    async fn log_state(&self) -> Result<LogState, MetaError> {
        let g = self.inner.read().await;
        Ok(LogState {
            first_index: g.entries.keys().next().copied(),
            last_index: g.entries.keys().next_back().copied().or(g.last_purged),
            last_purged_index: g.last_purged,
        })
    }

    async fn get_entries(&self, from: u64, to_inclusive: u64) -> Result<Vec<LogEntry>, MetaError> {
        if from > to_inclusive {
            return Ok(Vec::new());
        }
        let g = self.inner.read().await;
        Ok(g.entries.range(from..=to_inclusive).map(|(_, e)| e.clone()).collect())
    }

    async fn append(&self, entries: Vec<LogEntry>) -> Result<(), MetaError> {
        let mut g = self.inner.write().await;
        for entry in entries {
            g.entries.insert(entry.index, entry);
        }
        Ok(())
    }

    async fn purge(&self, up_to_index: u64) -> Result<(), MetaError> {
        let mut g = self.inner.write().await;
        g.entries.retain(|&idx, _| idx > up_to_index);
        g.last_purged = Some(g.last_purged.map_or(up_to_index, |p| p.max(up_to_index)));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemStateMachine
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemSmInner {
    data: BTreeMap<Vec<u8>, MetaEntry>,
    /// (key, revision) → version, for historical reads.
    history: BTreeMap<(Vec<u8>, Revision), Version>,
    /// revision → events, for watch replay.
    events: BTreeMap<Revision, Vec<WatchEvent>>,
    last_applied: Option<u64>,
    update_counter: u64,
    compacted: Revision,
}

/// In-memory `StateMachineStore` with version and event history.
///
/// Not persisted across restarts; clones share state.
#[derive(Clone, Default)]
pub struct MemStateMachine {
    inner: Arc<RwLock<MemSmInner>>,
}

impl MemStateMachine {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MemSmInner {
    fn compact(&mut self, target: Revision) {
        self.events = self.events.split_off(&(target + 1));
        let victims = compaction_victims(
            self.history.iter().map(|((k, r), v)| (k.clone(), *r, v.value.is_none())),
            target,
        );
        for (key, revision) in victims {
            self.history.remove(&(key, revision));
        }
        self.compacted = target;
    }
}

impl StateMachineStore for MemStateMachine {
    async fn last_applied(&self) -> Result<Option<u64>, MetaError> {
        Ok(self.inner.read().await.last_applied)
    }

    async fn apply(&self, index: u64, cmd: MetaCommand) -> Result<Applied, MetaError> {
        let mut g = self.inner.write().await;
        if let Some(last) = g.last_applied {
            if index <= last {
                return Err(MetaError::Storage(format!(
                    "index {index} already applied (last_applied = {last})"
                )));
            }
        }

        let applied = match cmd {
            MetaCommand::Compact { revision } => {
                let target = revision.min(index.saturating_sub(1));
                if target > g.compacted {
                    g.compact(target);
                }
                Applied {
                    response: MetaResponse::Compacted { revision: index, compacted: g.compacted },
                    batch: None,
                }
            }
            cmd => {
                let current = keys_to_load(&cmd)
                    .into_iter()
                    .filter_map(|k| g.data.get(&k).cloned().map(|e| (k, e)))
                    .collect();
                let plan = plan_mutation(index, g.update_counter, cmd, current)?;
                for (key, version) in &plan.versions {
                    match version.to_entry(key) {
                        Some(entry) => {
                            g.data.insert(key.clone(), entry);
                        }
                        None => {
                            g.data.remove(key);
                        }
                    }
                    g.history.insert((key.clone(), index), version.clone());
                }
                let batch = plan.batch(index);
                if !plan.events.is_empty() {
                    g.events.insert(index, plan.events);
                }
                g.update_counter = plan.update_counter;
                Applied { response: plan.response, batch }
            }
        };

        g.last_applied = Some(index);
        Ok(applied)
    }

    async fn get(&self, key: &[u8], at_revision: Revision) -> Result<Option<MetaEntry>, MetaError> {
        let g = self.inner.read().await;
        if at_revision == 0 {
            return Ok(g.data.get(key).cloned());
        }
        if at_revision < g.compacted {
            return Err(MetaError::Compacted { requested: at_revision, compacted: g.compacted });
        }
        let lo = (key.to_vec(), 0);
        let hi = (key.to_vec(), at_revision);
        Ok(g.history
            .range(lo..=hi)
            .next_back()
            .and_then(|(_, v)| v.to_entry(key)))
    }

    async fn scan(&self, start: &[u8], end: &[u8], limit: usize) -> Result<ScanPage, MetaError> {
        let g = self.inner.read().await;
        let revision = g.last_applied.unwrap_or(0);
        if !end.is_empty() && start >= end {
            return Ok(ScanPage { entries: Vec::new(), continuation: None, revision });
        }
        let upper = if end.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Excluded(end.to_vec())
        };
        let range = g.data.range::<Vec<u8>, _>((Bound::Included(start.to_vec()), upper));

        let mut entries: Vec<MetaEntry> = if limit == 0 {
            range.map(|(_, v)| v.clone()).collect()
        } else {
            // Fetch limit+1 to detect whether more pages exist.
            range.take(limit + 1).map(|(_, v)| v.clone()).collect()
        };
        let continuation = if limit != 0 && entries.len() > limit {
            entries.pop().map(|e| e.key)
        } else {
            None
        };
        Ok(ScanPage { entries, continuation, revision })
    }

    async fn batches_after(&self, after: Revision, limit: usize) -> Result<Vec<WatchBatch>, MetaError> {
        let g = self.inner.read().await;
        if after < g.compacted {
            return Err(MetaError::Compacted { requested: after, compacted: g.compacted });
        }
        let limit = if limit == 0 { usize::MAX } else { limit };
        Ok(g.events
            .range((Bound::Excluded(after), Bound::Unbounded))
            .take(limit)
            .map(|(revision, events)| WatchBatch { revision: *revision, events: events.clone() })
            .collect())
    }

    async fn compacted_revision(&self) -> Result<Revision, MetaError> {
        Ok(self.inner.read().await.compacted)
    }
}

#[cfg(test)]
mod tests {
    use tessera_types::{Condition, InvokeCommand, Operation};

    use super::*;

    fn put(key: &str, value: &str) -> MetaCommand {
        MetaCommand::Put { key: key.as_bytes().to_vec(), value: value.as_bytes().to_vec() }
    }

    fn remove(key: &str) -> MetaCommand {
        MetaCommand::Remove { key: key.as_bytes().to_vec() }
    }

    // -----------------------------------------------------------------------
    // MemLogStorage tests
    // -----------------------------------------------------------------------

    fn make_entry(index: u64) -> LogEntry {
        LogEntry { index, command: put("k", &index.to_string()) }
    }

    #[tokio::test]
    async fn log_storage_basic() {
        let store = MemLogStorage::new();

        let state = store.log_state().await.unwrap();
        assert!(state.first_index.is_none());
        assert!(state.last_index.is_none());
        assert!(state.last_purged_index.is_none());

        store.append(vec![make_entry(1), make_entry(2), make_entry(3)]).await.unwrap();

        let state = store.log_state().await.unwrap();
        assert_eq!(state.first_index, Some(1));
        assert_eq!(state.last_index, Some(3));

        let entries = store.get_entries(1, 2).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].index, 2);

        store.purge(1).await.unwrap();
        let state = store.log_state().await.unwrap();
        assert_eq!(state.first_index, Some(2));
        assert_eq!(state.last_purged_index, Some(1));
    }

    #[tokio::test]
    async fn purged_log_remembers_last_index() {
        let store = MemLogStorage::new();
        store.append(vec![make_entry(1), make_entry(2)]).await.unwrap();
        store.purge(2).await.unwrap();

        let state = store.log_state().await.unwrap();
        assert!(state.first_index.is_none());
        assert_eq!(state.last_index, Some(2));
    }

    // -----------------------------------------------------------------------
    // MemStateMachine tests
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn sm_put_and_get_latest() {
        let sm = MemStateMachine::new();

        let applied = sm.apply(1, put("k", "v1")).await.unwrap();
        assert_eq!(applied.response, MetaResponse::Written { revision: 1 });
        let batch = applied.batch.unwrap();
        assert_eq!(batch.revision, 1);
        assert!(batch.events[0].prev.is_none());

        let entry = sm.get(b"k", 0).await.unwrap().unwrap();
        assert_eq!(entry.value, b"v1");
        assert_eq!(entry.revision, 1);
        assert_eq!(entry.update_counter, 1);
    }

    #[tokio::test]
    async fn sm_rejects_reapplied_index() {
        let sm = MemStateMachine::new();
        sm.apply(1, put("k", "v1")).await.unwrap();
        let err = sm.apply(1, put("k", "v2")).await.unwrap_err();
        assert!(matches!(err, MetaError::Storage(_)));
        assert_eq!(sm.get(b"k", 0).await.unwrap().unwrap().value, b"v1");
    }

    #[tokio::test]
    async fn sm_historical_reads() {
        let sm = MemStateMachine::new();

        for i in 1u64..=3 {
            sm.apply(i, put("k", &format!("v{i}"))).await.unwrap();
        }
        sm.apply(4, put("other", "x")).await.unwrap();
        sm.apply(5, remove("k")).await.unwrap();

        assert!(sm.get(b"k", 0).await.unwrap().is_none());
        for i in 1u64..=3 {
            let e = sm.get(b"k", i).await.unwrap().unwrap();
            assert_eq!(e.value, format!("v{i}").into_bytes());
        }
        // Revision 4 did not touch "k": the newest version at or below it wins.
        assert_eq!(sm.get(b"k", 4).await.unwrap().unwrap().value, b"v3");
        assert!(sm.get(b"k", 5).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sm_invoke_success_and_failure() {
        let sm = MemStateMachine::new();
        let cmd = || {
            MetaCommand::Invoke(InvokeCommand::new(
                Condition::not_exists("x"),
                vec![Operation::put("x", "1")],
                vec![],
            ))
        };

        let first = sm.apply(1, cmd()).await.unwrap();
        assert_eq!(first.response, MetaResponse::Invoked { revision: 1, applied: true });

        let second = sm.apply(2, cmd()).await.unwrap();
        assert_eq!(second.response, MetaResponse::Invoked { revision: 2, applied: false });
        assert!(second.batch.is_none());

        let x = sm.get(b"x", 0).await.unwrap().unwrap();
        assert_eq!(x.value, b"1");
        assert_eq!(x.revision, 1);
        assert_eq!(sm.last_applied().await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn sm_scan_pagination() {
        let sm = MemStateMachine::new();

        for i in 0u64..10 {
            sm.apply(i + 1, put(&format!("key{i:02}"), "v")).await.unwrap();
        }

        let page1 = sm.scan(b"", b"", 5).await.unwrap();
        assert_eq!(page1.entries.len(), 5);
        assert_eq!(page1.revision, 10);
        let start = page1.continuation.unwrap();

        let page2 = sm.scan(&start, b"", 5).await.unwrap();
        assert_eq!(page2.entries.len(), 5);
        assert!(page2.continuation.is_none());

        let bounded = sm.scan(b"key02", b"key05", 0).await.unwrap();
        assert_eq!(bounded.entries.len(), 3);
    }

    #[tokio::test]
    async fn sm_batches_replay_in_order() {
        let sm = MemStateMachine::new();
        sm.apply(1, put("a", "1")).await.unwrap();
        sm.apply(2, remove("missing")).await.unwrap();
        sm.apply(3, put("b", "1")).await.unwrap();
        sm.apply(4, remove("a")).await.unwrap();

        let all = sm.batches_after(0, 0).await.unwrap();
        let revisions: Vec<u64> = all.iter().map(|b| b.revision).collect();
        assert_eq!(revisions, vec![1, 3, 4]);
        assert!(all[2].events[0].is_removal());

        let tail = sm.batches_after(1, 1).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].revision, 3);
    }

    #[tokio::test]
    async fn sm_compaction() {
        let sm = MemStateMachine::new();
        sm.apply(1, put("a", "1")).await.unwrap();
        sm.apply(2, put("a", "2")).await.unwrap();
        sm.apply(3, put("b", "1")).await.unwrap();
        sm.apply(4, remove("b")).await.unwrap();
        sm.apply(5, put("a", "3")).await.unwrap();

        let resp = sm.apply(6, MetaCommand::Compact { revision: 4 }).await.unwrap();
        assert_eq!(resp.response, MetaResponse::Compacted { revision: 6, compacted: 4 });
        assert_eq!(sm.compacted_revision().await.unwrap(), 4);

        // Reads at or above the compaction point still resolve.
        assert_eq!(sm.get(b"a", 4).await.unwrap().unwrap().value, b"2");
        assert!(sm.get(b"b", 4).await.unwrap().is_none());
        assert!(matches!(sm.get(b"a", 1).await, Err(MetaError::Compacted { .. })));

        assert!(matches!(sm.batches_after(2, 0).await, Err(MetaError::Compacted { .. })));
        let tail = sm.batches_after(4, 0).await.unwrap();
        assert_eq!(tail.iter().map(|b| b.revision).collect::<Vec<_>>(), vec![5]);

        // Compaction never moves backwards.
        sm.apply(7, MetaCommand::Compact { revision: 2 }).await.unwrap();
        assert_eq!(sm.compacted_revision().await.unwrap(), 4);
    }
}
