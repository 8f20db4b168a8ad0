mod condition;

pub use condition::{CompareOp, Condition, KeyTest};

/// Position in the Meta Store's mutation history. Equal to the log index of
/// the command that produced it; `0` means nothing has been applied yet.
pub type Revision = u64;

/// Current value of a key (also used for history versions).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MetaEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// Revision of the most recent mutation of this key.
    pub revision: Revision,
    /// Global per-mutation sequence number, dense across all keys.
    pub update_counter: u64,
}

/// A single mutation inside an invoke branch.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Operation {
    Put { key: Vec<u8>, value: Vec<u8> },
    Remove { key: Vec<u8> },
    Noop,
}

impl Operation {
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Operation::Put { key: key.into(), value: value.into() }
    }

    pub fn remove(key: impl Into<Vec<u8>>) -> Self {
        Operation::Remove { key: key.into() }
    }

    pub fn key(&self) -> Option<&[u8]> {
        match self {
            Operation::Put { key, .. } | Operation::Remove { key } => Some(key.as_slice()),
            Operation::Noop => None,
        }
    }
}

/// Atomic compare-branch-execute. Exactly one of `success` / `failure` is
/// applied, in the same revision as the condition evaluation.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct InvokeCommand {
    pub condition: Condition,
    pub success: Vec<Operation>,
    pub failure: Vec<Operation>,
}

impl InvokeCommand {
    pub fn new(condition: Condition, success: Vec<Operation>, failure: Vec<Operation>) -> Self {
        InvokeCommand { condition, success, failure }
    }

    /// Every key the command may read or write.
    pub fn touched_keys(&self) -> Vec<&[u8]> {
        let mut keys = self.condition.keys();
        keys.extend(self.success.iter().chain(&self.failure).filter_map(Operation::key));
        keys
    }
}

/// Commands replicated through the log.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum MetaCommand {
    Put { key: Vec<u8>, value: Vec<u8> },
    Remove { key: Vec<u8> },
    Invoke(InvokeCommand),
    /// Drop watch history and superseded versions at or below `revision`.
    Compact { revision: Revision },
}

/// Responses returned from state machine apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaResponse {
    Written { revision: Revision },
    Removed { revision: Revision, found: bool },
    Invoked { revision: Revision, applied: bool },
    /// `compacted` is the effective compaction point after the command.
    Compacted { revision: Revision, compacted: Revision },
}

impl MetaResponse {
    pub fn revision(&self) -> Revision {
        match self {
            MetaResponse::Written { revision }
            | MetaResponse::Removed { revision, .. }
            | MetaResponse::Invoked { revision, .. }
            | MetaResponse::Compacted { revision, .. } => *revision,
        }
    }
}

/// Outcome of an invoke. `applied == false` means the condition did not hold
/// and the failure branch ran; it is a normal outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvokeResult {
    pub applied: bool,
    pub revision: Revision,
}

/// One key mutation as seen by watchers. `entry == None` is a removal.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct WatchEvent {
    pub key: Vec<u8>,
    pub prev: Option<MetaEntry>,
    pub entry: Option<MetaEntry>,
    pub revision: Revision,
}

impl WatchEvent {
    pub fn is_removal(&self) -> bool {
        self.entry.is_none()
    }
}

/// All events produced by a single command. Delivered as a unit.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct WatchBatch {
    pub revision: Revision,
    pub events: Vec<WatchEvent>,
}

/// One page of a range scan, read at a single revision.
#[derive(Debug, Clone, Default)]
pub struct ScanPage {
    pub entries: Vec<MetaEntry>,
    /// First key of the next page when more entries exist.
    pub continuation: Option<Vec<u8>>,
    /// Revision the page was read at.
    pub revision: Revision,
}

/// Exclusive upper bound for all keys starting with `prefix`, or `None` when
/// the prefix is empty or all `0xff` (unbounded).
pub fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MetaError {
    /// The log could not accept the command. The effect is unknown: the
    /// command may or may not have committed.
    #[error("meta store unavailable: {reason}")]
    Unavailable { reason: String },
    #[error("watch subscriber fell behind its buffer capacity")]
    Overflow,
    #[error("cancelled")]
    Cancelled,
    #[error("revision {requested} has been compacted (compacted up to {compacted})")]
    Compacted { requested: Revision, compacted: Revision },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl MetaError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        MetaError::Unavailable { reason: reason.into() }
    }

    /// `true` for errors a caller may retry after re-reading state.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MetaError::Unavailable { .. })
    }
}
