use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use tessera_types::MetaError;

/// One replica of a partition.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Assignment {
    pub node: String,
    pub voter: bool,
}

impl Assignment {
    pub fn voter(node: impl Into<String>) -> Self {
        Assignment { node: node.into(), voter: true }
    }

    pub fn learner(node: impl Into<String>) -> Self {
        Assignment { node: node.into(), voter: false }
    }
}

/// Replica placement of a partition.
///
/// Stored as the bincode (standard config) encoding of the sorted sequence
/// of `(node, voter)` pairs, so equal sets always encode to equal bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assignments(BTreeSet<Assignment>);

impl Assignments {
    pub fn new(assignments: impl IntoIterator<Item = Assignment>) -> Self {
        Assignments(assignments.into_iter().collect())
    }

    /// All nodes as voting replicas.
    pub fn voters<S: Into<String>>(nodes: impl IntoIterator<Item = S>) -> Self {
        Self::new(nodes.into_iter().map(Assignment::voter))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Assignment> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn nodes(&self) -> BTreeSet<&str> {
        self.0.iter().map(|a| a.node.as_str()).collect()
    }

    /// Nodes in `self` that are not replicas in `stable`. Every node when
    /// there is no stable placement. A voter flag change alone does not add
    /// a node.
    pub fn added_since(&self, stable: Option<&Assignments>) -> Vec<String> {
        let existing = stable.map(Assignments::nodes).unwrap_or_default();
        self.nodes()
            .into_iter()
            .filter(|node| !existing.contains(node))
            .map(str::to_owned)
            .collect()
    }

    pub fn encode(&self) -> Result<Vec<u8>, MetaError> {
        let pairs: Vec<(&str, bool)> = self.0.iter().map(|a| (a.node.as_str(), a.voter)).collect();
        bincode::serde::encode_to_vec(&pairs, bincode::config::standard())
            .map_err(|e| MetaError::InvalidArgument(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MetaError> {
        let (pairs, read): (Vec<(String, bool)>, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| MetaError::InvalidArgument(format!("malformed assignments: {e}")))?;
        if read != bytes.len() {
            return Err(MetaError::InvalidArgument("trailing bytes after assignments".into()));
        }
        Ok(Self::new(pairs.into_iter().map(|(node, voter)| Assignment { node, voter })))
    }
}

impl FromIterator<Assignment> for Assignments {
    fn from_iter<I: IntoIterator<Item = Assignment>>(iter: I) -> Self {
        Self::new(iter)
    }
}
