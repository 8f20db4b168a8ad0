//! Well-known assignment keys.
//!
//! `pending-assignments-<table_id>-<partition_id>` and
//! `stable-assignments-<table_id>-<partition_id>`. The layout is part of the
//! metadata wire format and must stay bit-stable.

use std::fmt;

pub const PENDING_PREFIX: &str = "pending-assignments-";
pub const STABLE_PREFIX: &str = "stable-assignments-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TablePartitionId {
    pub table_id: u32,
    pub partition_id: u32,
}

impl TablePartitionId {
    pub fn new(table_id: u32, partition_id: u32) -> Self {
        TablePartitionId { table_id, partition_id }
    }
}

impl fmt::Display for TablePartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.table_id, self.partition_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentKey {
    Pending(TablePartitionId),
    Stable(TablePartitionId),
}

impl AssignmentKey {
    pub fn partition(&self) -> TablePartitionId {
        match self {
            AssignmentKey::Pending(tp) | AssignmentKey::Stable(tp) => *tp,
        }
    }

    pub fn key(&self) -> Vec<u8> {
        match self {
            AssignmentKey::Pending(tp) => pending_key(*tp),
            AssignmentKey::Stable(tp) => stable_key(*tp),
        }
    }
}

pub fn pending_key(tp: TablePartitionId) -> Vec<u8> {
    format!("{PENDING_PREFIX}{tp}").into_bytes()
}

pub fn stable_key(tp: TablePartitionId) -> Vec<u8> {
    format!("{STABLE_PREFIX}{tp}").into_bytes()
}

/// Recognize an assignment key. Anything else, including malformed ids,
/// yields `None`.
///
/// Only the canonical spelling is accepted: `pending-assignments-07-0` is
/// not partition `7-0`, so no two keys ever map to one partition.
pub fn parse_key(key: &[u8]) -> Option<AssignmentKey> {
    let text = std::str::from_utf8(key).ok()?;
    let parsed = if let Some(rest) = text.strip_prefix(PENDING_PREFIX) {
        AssignmentKey::Pending(parse_partition(rest)?)
    } else if let Some(rest) = text.strip_prefix(STABLE_PREFIX) {
        AssignmentKey::Stable(parse_partition(rest)?)
    } else {
        return None;
    };
    (parsed.key() == key).then_some(parsed)
}

fn parse_partition(s: &str) -> Option<TablePartitionId> {
    let (table, partition) = s.split_once('-')?;
    Some(TablePartitionId { table_id: table.parse().ok()?, partition_id: partition.parse().ok()? })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        let tp = TablePartitionId::new(7, 0);
        assert_eq!(pending_key(tp), b"pending-assignments-7-0");
        assert_eq!(stable_key(tp), b"stable-assignments-7-0");
    }

    #[test]
    fn parse_recognizes_both_families() {
        let tp = TablePartitionId::new(12, 3);
        assert_eq!(parse_key(&pending_key(tp)), Some(AssignmentKey::Pending(tp)));
        assert_eq!(parse_key(&stable_key(tp)), Some(AssignmentKey::Stable(tp)));
        assert_eq!(parse_key(b"stable-assignments-12"), None);
        assert_eq!(parse_key(b"stable-assignments-a-1"), None);
        assert_eq!(parse_key(b"pending-assignments-1-2-3"), None);
        assert_eq!(parse_key(b"other-1-2"), None);
        assert_eq!(parse_key(&[0xff, 0xfe]), None);
    }

    #[test]
    fn parse_rejects_non_canonical_ids() {
        assert_eq!(parse_key(b"pending-assignments-07-0"), None);
        assert_eq!(parse_key(b"pending-assignments-7-00"), None);
        assert_eq!(parse_key(b"stable-assignments-+7-0"), None);
        assert_eq!(
            parse_key(b"pending-assignments-7-0"),
            Some(AssignmentKey::Pending(TablePartitionId::new(7, 0)))
        );
        assert_eq!(parse_key(b"stable-assignments-0-0"), Some(AssignmentKey::Stable(TablePartitionId::new(0, 0))));
    }
}
