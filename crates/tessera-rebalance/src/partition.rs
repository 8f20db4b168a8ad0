//! Per-partition decision logic.
//!
//! The coordinator is level-triggered: every decision is re-derived from the
//! last-known pending and stable values, so re-delivery of an already handled
//! transition compares equal and changes nothing.

use std::fmt;

use tessera_types::{MetaEntry, Revision};

use crate::assignment::Assignments;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    Stable,
    AwaitingCatchUp,
    Committing,
}

impl fmt::Display for PartitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionState::Stable => write!(f, "stable"),
            PartitionState::AwaitingCatchUp => write!(f, "awaiting-catch-up"),
            PartitionState::Committing => write!(f, "committing"),
        }
    }
}

/// Raw value of an assignment key and the revision that wrote it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observed {
    pub value: Vec<u8>,
    pub revision: Revision,
}

impl From<&MetaEntry> for Observed {
    fn from(entry: &MetaEntry) -> Self {
        Observed { value: entry.value.clone(), revision: entry.revision }
    }
}

/// Last-known values of one partition's assignment keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionView {
    pub pending: Option<Observed>,
    pub stable: Option<Observed>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// No pending placement.
    Idle,
    /// Pending equals stable; only the pending key has to go.
    Cleanup { observed: Vec<u8> },
    /// New nodes must report data before `pending` becomes stable.
    CatchUp { observed: Vec<u8>, pending_revision: Revision, added: Vec<String> },
    /// Pending value cannot be decoded; nothing can be done until it changes.
    Malformed { pending_revision: Revision },
}

pub fn decide(view: &PartitionView) -> Decision {
    let Some(pending) = &view.pending else {
        return Decision::Idle;
    };
    let Ok(target) = Assignments::decode(&pending.value) else {
        return Decision::Malformed { pending_revision: pending.revision };
    };
    // An unreadable stable value is treated as absent.
    let stable = view.stable.as_ref().and_then(|s| Assignments::decode(&s.value).ok());

    if stable.as_ref() == Some(&target) {
        return Decision::Cleanup { observed: pending.value.clone() };
    }
    Decision::CatchUp {
        observed: pending.value.clone(),
        pending_revision: pending.revision,
        added: target.added_since(stable.as_ref()),
    }
}
