use tessera_types::Revision;

/// `log` partition: `index(8)`, big-endian so lexicographic order = numeric order.
pub fn log_key(index: u64) -> [u8; 8] {
    index.to_be_bytes()
}

/// `events` partition: `revision(8)`, big-endian.
pub fn event_key(revision: Revision) -> [u8; 8] {
    revision.to_be_bytes()
}

/// `history` partition: `key_len(4) ++ key ++ revision(8)`
///
/// User keys are arbitrary bytes, so the length prefix (rather than a
/// delimiter) keeps a prefix scan for "foo" from bleeding into "foobar".
pub fn history_key(key: &[u8], revision: Revision) -> Vec<u8> {
    let mut buf = history_prefix(key);
    buf.extend_from_slice(&revision.to_be_bytes());
    buf
}

/// Prefix for scanning all history versions of a single key.
/// `key_len(4) ++ key`
pub fn history_prefix(key: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + key.len() + 8);
    buf.extend_from_slice(&(key.len() as u32).to_be_bytes());
    buf.extend_from_slice(key);
    buf
}

/// Split a `history` key back into `(user_key, revision)`.
pub fn parse_history_key(raw: &[u8]) -> Option<(Vec<u8>, Revision)> {
    let len = u32::from_be_bytes(raw.get(..4)?.try_into().ok()?) as usize;
    let key = raw.get(4..4 + len)?;
    let revision = u64::from_be_bytes(raw.get(4 + len..4 + len + 8)?.try_into().ok()?);
    Some((key.to_vec(), revision))
}

/// `meta` partition: `label_utf8`
pub fn meta_key(label: &str) -> Vec<u8> {
    label.as_bytes().to_vec()
}

pub const LAST_APPLIED: &str = "last_applied";
pub const UPDATE_COUNTER: &str = "update_counter";
pub const COMPACTED: &str = "compacted";
pub const LAST_PURGED: &str = "last_purged";
