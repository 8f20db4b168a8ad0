use tessera_meta::{KeySelector, WatchFilter};
use tessera_proto::v1;
use tessera_types::{CompareOp, Condition, KeyTest, MetaEntry, MetaError, Operation, Revision, WatchBatch};
use tonic::Status;

pub fn entry_to_proto(entry: MetaEntry) -> v1::MetaEntry {
    v1::MetaEntry {
        key: entry.key,
        value: entry.value,
        revision: entry.revision,
        update_counter: entry.update_counter,
    }
}

pub fn header(node_id: u64, revision: Revision) -> v1::ResponseHeader {
    v1::ResponseHeader { node_id, revision }
}

fn compare_op_from_proto(raw: i32) -> Result<CompareOp, Status> {
    let op = v1::CompareOp::try_from(raw)
        .map_err(|_| Status::invalid_argument(format!("unknown compare op {raw}")))?;
    Ok(match op {
        v1::CompareOp::Eq => CompareOp::Eq,
        v1::CompareOp::Ne => CompareOp::Ne,
        v1::CompareOp::Lt => CompareOp::Lt,
        v1::CompareOp::Le => CompareOp::Le,
        v1::CompareOp::Gt => CompareOp::Gt,
        v1::CompareOp::Ge => CompareOp::Ge,
    })
}

/// A missing condition is `Always`.
pub fn condition_from_proto(raw: Option<v1::Condition>) -> Result<Condition, Status> {
    use v1::condition::Kind;
    use v1::key_condition::Test;

    let Some(kind) = raw.and_then(|c| c.kind) else {
        return Ok(Condition::Always);
    };
    match kind {
        Kind::Always(_) => Ok(Condition::Always),
        Kind::Key(kc) => {
            if kc.key.is_empty() {
                return Err(Status::invalid_argument("condition key must not be empty"));
            }
            let test = match kc.test {
                Some(Test::Exists(true)) => KeyTest::Exists,
                Some(Test::Exists(false)) => KeyTest::NotExists,
                Some(Test::Value(t)) => KeyTest::Value(compare_op_from_proto(t.op)?, t.value),
                Some(Test::Revision(t)) => KeyTest::Revision(compare_op_from_proto(t.op)?, t.revision),
                None => return Err(Status::invalid_argument("key condition without a test")),
            };
            Ok(Condition::Key { key: kc.key, test })
        }
        Kind::All(list) => list
            .conditions
            .into_iter()
            .map(|c| condition_from_proto(Some(c)))
            .collect::<Result<Vec<_>, _>>()
            .map(Condition::And),
        Kind::Any(list) => list
            .conditions
            .into_iter()
            .map(|c| condition_from_proto(Some(c)))
            .collect::<Result<Vec<_>, _>>()
            .map(Condition::Or),
    }
}

pub fn operation_from_proto(raw: v1::Operation) -> Result<Operation, Status> {
    use v1::operation::Kind;

    match raw.kind {
        Some(Kind::Put(op)) if !op.key.is_empty() => Ok(Operation::Put { key: op.key, value: op.value }),
        Some(Kind::Remove(op)) if !op.key.is_empty() => Ok(Operation::Remove { key: op.key }),
        Some(Kind::Put(_)) | Some(Kind::Remove(_)) => {
            Err(Status::invalid_argument("operation key must not be empty"))
        }
        Some(Kind::Noop(_)) | None => Ok(Operation::Noop),
    }
}

pub fn operations_from_proto(raw: Vec<v1::Operation>) -> Result<Vec<Operation>, Status> {
    raw.into_iter().map(operation_from_proto).collect()
}

/// No selectors watches every key.
pub fn filter_from_proto(selectors: Vec<v1::KeySelector>) -> Result<WatchFilter, Status> {
    use v1::key_selector::Kind;

    let mut filter: Option<WatchFilter> = None;
    for selector in selectors {
        let selector = match selector.kind {
            Some(Kind::Exact(key)) => KeySelector::Exact(key),
            Some(Kind::Prefix(prefix)) => KeySelector::Prefix(prefix),
            Some(Kind::Range(r)) => KeySelector::Range { start: r.start, end: r.end },
            None => return Err(Status::invalid_argument("empty key selector")),
        };
        filter = Some(match filter {
            Some(f) => f.with(selector),
            None => WatchFilter::default().with(selector),
        });
    }
    Ok(filter.unwrap_or_else(WatchFilter::all))
}

pub fn batch_to_proto(batch: WatchBatch) -> v1::WatchResponse {
    v1::WatchResponse {
        revision: batch.revision,
        events: batch
            .events
            .into_iter()
            .map(|e| v1::WatchEvent {
                key: e.key,
                prev: e.prev.map(entry_to_proto),
                entry: e.entry.map(entry_to_proto),
            })
            .collect(),
    }
}

pub fn meta_to_status(err: MetaError) -> Status {
    match &err {
        MetaError::Unavailable { .. } => Status::unavailable(err.to_string()),
        MetaError::Overflow => Status::resource_exhausted(err.to_string()),
        MetaError::Compacted { .. } => Status::out_of_range(err.to_string()),
        MetaError::Cancelled => Status::cancelled(err.to_string()),
        MetaError::InvalidArgument(_) => Status::invalid_argument(err.to_string()),
        MetaError::Storage(_) => Status::internal(err.to_string()),
    }
}
