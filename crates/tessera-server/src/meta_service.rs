use tessera_consensus::ReplicatedLog;
use tessera_meta::MetaStore;
use tessera_proto::v1::{
    meta_service_server::MetaService, CompactRequest, CompactResponse, GetRequest, GetResponse,
    InvokeRequest, InvokeResponse, PutRequest, PutResponse, RangeRequest, RangeResponse,
    RemoveRequest, RemoveResponse, WatchRequest, WatchResponse,
};
use tessera_types::{prefix_end, InvokeCommand};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::debug;

use crate::convert::{
    batch_to_proto, condition_from_proto, entry_to_proto, filter_from_proto, header,
    meta_to_status, operations_from_proto,
};

/// Streamed watch responses buffered per client before the subscription's
/// own backpressure applies.
const WATCH_STREAM_BUFFER: usize = 16;

pub struct MetaServiceImpl<R> {
    store: MetaStore<R>,
    node_id: u64,
}

impl<R: ReplicatedLog> MetaServiceImpl<R> {
    pub fn new(store: MetaStore<R>, node_id: u64) -> Self {
        MetaServiceImpl { store, node_id }
    }
}

#[tonic::async_trait]
impl<R: ReplicatedLog> MetaService for MetaServiceImpl<R> {
    async fn get(&self, request: Request<GetRequest>) -> Result<Response<GetResponse>, Status> {
        let req = request.into_inner();
        if req.key.is_empty() {
            return Err(Status::invalid_argument("key must not be empty"));
        }
        // Sampled before the read so the header never claims a newer revision.
        let revision = if req.revision == 0 { self.store.revision() } else { req.revision };
        let entry = if req.revision == 0 {
            self.store.get(&req.key).await
        } else {
            self.store.get_at(&req.key, req.revision).await
        }
        .map_err(meta_to_status)?;

        match entry {
            None => Err(Status::not_found(format!("key '{}' not found", String::from_utf8_lossy(&req.key)))),
            Some(e) => Ok(Response::new(GetResponse {
                header: Some(header(self.node_id, revision)),
                entry: Some(entry_to_proto(e)),
            })),
        }
    }

    async fn range(&self, request: Request<RangeRequest>) -> Result<Response<RangeResponse>, Status> {
        let req = request.into_inner();
        // page_token bytes are the first key of the next page.
        let start = if req.page_token.is_empty() { req.prefix.clone() } else { req.page_token };
        if !start.starts_with(&req.prefix) {
            return Err(Status::invalid_argument("page_token is outside the requested prefix"));
        }
        let end = prefix_end(&req.prefix).unwrap_or_default();
        let page = self.store.scan(&start, &end, req.limit as usize).await.map_err(meta_to_status)?;

        Ok(Response::new(RangeResponse {
            header: Some(header(self.node_id, page.revision)),
            entries: page.entries.into_iter().map(entry_to_proto).collect(),
            next_page_token: page.continuation.unwrap_or_default(),
        }))
    }

    async fn put(&self, request: Request<PutRequest>) -> Result<Response<PutResponse>, Status> {
        let req = request.into_inner();
        if req.key.is_empty() {
            return Err(Status::invalid_argument("key must not be empty"));
        }
        let revision = self.store.put(req.key, req.value).await.map_err(meta_to_status)?;
        Ok(Response::new(PutResponse { header: Some(header(self.node_id, revision)) }))
    }

    async fn remove(&self, request: Request<RemoveRequest>) -> Result<Response<RemoveResponse>, Status> {
        let req = request.into_inner();
        if req.key.is_empty() {
            return Err(Status::invalid_argument("key must not be empty"));
        }
        let revision = self.store.remove(req.key).await.map_err(meta_to_status)?;
        Ok(Response::new(RemoveResponse { header: Some(header(self.node_id, revision)) }))
    }

    async fn invoke(&self, request: Request<InvokeRequest>) -> Result<Response<InvokeResponse>, Status> {
        let req = request.into_inner();
        let cmd = InvokeCommand::new(
            condition_from_proto(req.condition)?,
            operations_from_proto(req.success)?,
            operations_from_proto(req.failure)?,
        );
        let result = self.store.invoke_command(cmd).await.map_err(meta_to_status)?;
        Ok(Response::new(InvokeResponse {
            header: Some(header(self.node_id, result.revision)),
            applied: result.applied,
        }))
    }

    async fn compact(&self, request: Request<CompactRequest>) -> Result<Response<CompactResponse>, Status> {
        let req = request.into_inner();
        let compacted = self.store.compact(req.revision).await.map_err(meta_to_status)?;
        Ok(Response::new(CompactResponse {
            header: Some(header(self.node_id, self.store.revision())),
            compacted,
        }))
    }

    type WatchStream = ReceiverStream<Result<WatchResponse, Status>>;

    async fn watch(&self, request: Request<WatchRequest>) -> Result<Response<Self::WatchStream>, Status> {
        let req = request.into_inner();
        let filter = filter_from_proto(req.selectors)?;
        let mut sub = self.store.watch(filter, req.from_revision);
        let (tx, rx) = mpsc::channel(WATCH_STREAM_BUFFER);
        let watch_id = sub.id();
        debug!(watch_id, from = req.from_revision, "client watch opened");

        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    r = sub.recv() => r,
                    _ = tx.closed() => break,
                };
                match next {
                    Ok(batch) => {
                        if tx.send(Ok(batch_to_proto(batch))).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(meta_to_status(e))).await;
                        break;
                    }
                }
            }
            debug!(watch_id, "client watch closed");
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}
