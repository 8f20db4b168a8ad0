mod convert;
mod meta_service;

use std::net::SocketAddr;

use anyhow::Context;
use tessera_consensus::ReplicatedLog;
use tessera_meta::MetaStore;
use tessera_proto::v1::meta_service_server::MetaServiceServer;
use tonic_reflection::server::Builder as ReflectionBuilder;

pub use meta_service::MetaServiceImpl;

/// Serve the Meta Store over gRPC until `shutdown` resolves.
pub async fn serve<R: ReplicatedLog>(
    addr: SocketAddr,
    store: MetaStore<R>,
    node_id: u64,
    shutdown: impl std::future::Future<Output = ()> + Send,
) -> anyhow::Result<()> {
    let reflection = ReflectionBuilder::configure()
        .register_encoded_file_descriptor_set(tessera_proto::FILE_DESCRIPTOR_SET)
        .build_v1()
        .context("failed to build reflection service")?;
    tracing::info!(%addr, node_id, "meta gRPC server starting");
    tonic::transport::Server::builder()
        .add_service(MetaServiceServer::new(MetaServiceImpl::new(store, node_id)))
        .add_service(reflection)
        .serve_with_shutdown(addr, shutdown)
        .await
        .map_err(Into::into)
}
