use tessera_types::{MetaCommand, MetaEntry, MetaResponse, Revision, WatchBatch};

/// A single entry in the replicated log.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub command: MetaCommand,
}

/// Summary of the current log extent.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct LogState {
    /// Smallest index currently in the log (`None` if log is empty).
    pub first_index: Option<u64>,
    /// Largest index currently in the log (`None` if log is empty).
    pub last_index: Option<u64>,
    /// Largest index that has been purged.
    pub last_purged_index: Option<u64>,
}

/// One retained version of a key in the history partition. `value == None`
/// records a removal.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Version {
    pub revision: Revision,
    pub update_counter: u64,
    pub value: Option<Vec<u8>>,
}

impl Version {
    pub fn to_entry(&self, key: &[u8]) -> Option<MetaEntry> {
        self.value.as_ref().map(|value| MetaEntry {
            key: key.to_vec(),
            value: value.clone(),
            revision: self.revision,
            update_counter: self.update_counter,
        })
    }
}

/// Result of applying one command: the client response plus the watch batch
/// it produced (`None` when nothing was mutated).
#[derive(Debug, Clone)]
pub struct Applied {
    pub response: MetaResponse,
    pub batch: Option<WatchBatch>,
}
