//! Backend-independent command evaluation.
//!
//! Both state machines load the entries a command touches, hand them to
//! [`plan_mutation`], and persist the resulting versions and events in one
//! atomic write.

use std::collections::BTreeMap;

use tessera_types::{
    MetaCommand, MetaEntry, MetaError, MetaResponse, Operation, Revision, WatchBatch, WatchEvent,
};

use crate::types::Version;

pub(crate) struct MutationPlan {
    pub response: MetaResponse,
    /// Final state of every mutated key at this revision.
    pub versions: BTreeMap<Vec<u8>, Version>,
    /// One event per effective operation, in branch order.
    pub events: Vec<WatchEvent>,
    pub update_counter: u64,
}

impl MutationPlan {
    pub fn batch(&self, revision: Revision) -> Option<WatchBatch> {
        if self.events.is_empty() {
            None
        } else {
            Some(WatchBatch { revision, events: self.events.clone() })
        }
    }
}

/// Keys whose current entries must be loaded before planning `cmd`.
pub(crate) fn keys_to_load(cmd: &MetaCommand) -> Vec<Vec<u8>> {
    let mut keys: Vec<Vec<u8>> = match cmd {
        MetaCommand::Put { key, .. } | MetaCommand::Remove { key } => vec![key.clone()],
        MetaCommand::Invoke(inv) => inv.touched_keys().into_iter().map(<[u8]>::to_vec).collect(),
        MetaCommand::Compact { .. } => Vec::new(),
    };
    keys.sort();
    keys.dedup();
    keys
}

/// Evaluate a mutating command at log `index` against `current` (the
/// existing entries for [`keys_to_load`]).
pub(crate) fn plan_mutation(
    index: u64,
    update_counter: u64,
    cmd: MetaCommand,
    mut current: BTreeMap<Vec<u8>, MetaEntry>,
) -> Result<MutationPlan, MetaError> {
    enum Kind {
        Put,
        Remove,
        Invoke { applied: bool },
    }

    let (kind, ops) = match cmd {
        MetaCommand::Put { key, value } => (Kind::Put, vec![Operation::Put { key, value }]),
        MetaCommand::Remove { key } => (Kind::Remove, vec![Operation::Remove { key }]),
        MetaCommand::Invoke(inv) => {
            let applied = inv.condition.evaluate(&|k: &[u8]| current.get(k));
            let ops = if applied { inv.success } else { inv.failure };
            (Kind::Invoke { applied }, ops)
        }
        MetaCommand::Compact { .. } => {
            return Err(MetaError::InvalidArgument("compaction is not a mutation".into()));
        }
    };

    let mut counter = update_counter;
    let mut versions = BTreeMap::new();
    let mut events = Vec::new();

    for op in ops {
        match op {
            Operation::Put { key, value } => {
                counter += 1;
                let entry = MetaEntry {
                    key: key.clone(),
                    value,
                    revision: index,
                    update_counter: counter,
                };
                let prev = current.insert(key.clone(), entry.clone());
                versions.insert(
                    key.clone(),
                    Version { revision: index, update_counter: counter, value: Some(entry.value.clone()) },
                );
                events.push(WatchEvent { key, prev, entry: Some(entry), revision: index });
            }
            Operation::Remove { key } => {
                // Removing an absent key mutates nothing.
                if let Some(prev) = current.remove(&key) {
                    counter += 1;
                    versions.insert(
                        key.clone(),
                        Version { revision: index, update_counter: counter, value: None },
                    );
                    events.push(WatchEvent { key, prev: Some(prev), entry: None, revision: index });
                }
            }
            Operation::Noop => {}
        }
    }

    let response = match kind {
        Kind::Put => MetaResponse::Written { revision: index },
        Kind::Remove => MetaResponse::Removed { revision: index, found: !events.is_empty() },
        Kind::Invoke { applied } => MetaResponse::Invoked { revision: index, applied },
    };

    Ok(MutationPlan { response, versions, events, update_counter: counter })
}

/// History versions to delete when compacting up to `target`.
///
/// `versions` yields `(key, revision, is_removal)` grouped by key with
/// ascending revisions. For each key every version `<= target` is dropped
/// except the newest one, which survives unless it records a removal.
pub(crate) fn compaction_victims<I>(versions: I, target: Revision) -> Vec<(Vec<u8>, Revision)>
where
    I: IntoIterator<Item = (Vec<u8>, Revision, bool)>,
{
    let mut victims = Vec::new();
    let mut newest: Option<(Vec<u8>, Revision, bool)> = None;
    for (key, revision, removed) in versions {
        if revision > target {
            continue;
        }
        if let Some((k, r, rm)) = newest.take() {
            if k == key || rm {
                victims.push((k, r));
            }
        }
        newest = Some((key, revision, removed));
    }
    if let Some((k, r, true)) = newest {
        victims.push((k, r));
    }
    victims
}
