use std::cmp::Ordering;

use crate::{MetaEntry, Revision};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn holds(self, ord: Ordering) -> bool {
        match self {
            CompareOp::Eq => ord == Ordering::Equal,
            CompareOp::Ne => ord != Ordering::Equal,
            CompareOp::Lt => ord == Ordering::Less,
            CompareOp::Le => ord != Ordering::Greater,
            CompareOp::Gt => ord == Ordering::Greater,
            CompareOp::Ge => ord != Ordering::Less,
        }
    }
}

/// Predicate on a single key.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum KeyTest {
    Exists,
    NotExists,
    /// Byte-lexicographic comparison of the current value against the operand.
    /// On an absent key only `Ne` holds.
    Value(CompareOp, Vec<u8>),
    /// Compares the key's revision; an absent key has revision 0.
    Revision(CompareOp, Revision),
}

/// Predicate over zero or more keys, evaluated atomically by the state
/// machine when an invoke is applied.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Condition {
    Always,
    Key { key: Vec<u8>, test: KeyTest },
    /// Empty `And` holds.
    And(Vec<Condition>),
    /// Empty `Or` does not hold.
    Or(Vec<Condition>),
}

impl Condition {
    pub fn exists(key: impl Into<Vec<u8>>) -> Self {
        Condition::Key { key: key.into(), test: KeyTest::Exists }
    }

    pub fn not_exists(key: impl Into<Vec<u8>>) -> Self {
        Condition::Key { key: key.into(), test: KeyTest::NotExists }
    }

    pub fn value_eq(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Condition::Key { key: key.into(), test: KeyTest::Value(CompareOp::Eq, value.into()) }
    }

    pub fn value_ne(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Condition::Key { key: key.into(), test: KeyTest::Value(CompareOp::Ne, value.into()) }
    }

    pub fn revision(key: impl Into<Vec<u8>>, op: CompareOp, revision: Revision) -> Self {
        Condition::Key { key: key.into(), test: KeyTest::Revision(op, revision) }
    }

    pub fn and(self, other: Condition) -> Self {
        match self {
            Condition::And(mut all) => {
                all.push(other);
                Condition::And(all)
            }
            first => Condition::And(vec![first, other]),
        }
    }

    pub fn or(self, other: Condition) -> Self {
        match self {
            Condition::Or(mut any) => {
                any.push(other);
                Condition::Or(any)
            }
            first => Condition::Or(vec![first, other]),
        }
    }

    /// Keys the condition reads, in declaration order (may contain duplicates).
    pub fn keys(&self) -> Vec<&[u8]> {
        let mut out = Vec::new();
        self.collect_keys(&mut out);
        out
    }

    fn collect_keys<'a>(&'a self, out: &mut Vec<&'a [u8]>) {
        match self {
            Condition::Always => {}
            Condition::Key { key, .. } => out.push(key.as_slice()),
            Condition::And(all) | Condition::Or(all) => {
                for c in all {
                    c.collect_keys(out);
                }
            }
        }
    }

    /// Evaluate against the state exposed by `lookup` (current entry per key).
    pub fn evaluate<'e, F>(&self, lookup: &F) -> bool
    where
        F: Fn(&[u8]) -> Option<&'e MetaEntry>,
    {
        match self {
            Condition::Always => true,
            Condition::Key { key, test } => test.evaluate(lookup(key.as_slice())),
            Condition::And(all) => all.iter().all(|c| c.evaluate(lookup)),
            Condition::Or(any) => any.iter().any(|c| c.evaluate(lookup)),
        }
    }
}

impl KeyTest {
    fn evaluate(&self, entry: Option<&MetaEntry>) -> bool {
        match (self, entry) {
            (KeyTest::Exists, e) => e.is_some(),
            (KeyTest::NotExists, e) => e.is_none(),
            (KeyTest::Value(op, operand), Some(e)) => op.holds(e.value.as_slice().cmp(operand.as_slice())),
            (KeyTest::Value(op, _), None) => *op == CompareOp::Ne,
            (KeyTest::Revision(op, operand), e) => {
                let current = e.map(|e| e.revision).unwrap_or(0);
                op.holds(current.cmp(operand))
            }
        }
    }
}
