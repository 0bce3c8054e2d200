//! Relay service: the server side of the tunnel
//!
//! Bridges one inbound RPC call into one pool work item and maps the
//! outcome back to an RPC success or failure. All the concurrency lives in
//! the pool; the handler itself is a straight enqueue-and-wait.

use crate::config::RelayConfig;
use crate::noise::NoiseConfig;
use crate::pool::SerializerPool;
use crate::rpc::{RpcHandler, RpcServer};
use async_trait::async_trait;
use log::info;
use std::sync::Arc;

/// RPC handler backed by a serializer pool.
pub struct RelayService {
    pool: SerializerPool,
}

impl RelayService {
    pub fn new(pool: SerializerPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RpcHandler for RelayService {
    async fn call(&self, input: Vec<u8>) -> Result<Vec<u8>, String> {
        // A fresh reply slot per call is allocated inside lookup(); the
        // slot is never shared across calls
        self.pool
            .lookup(input)
            .await
            .map_err(|_| "lookup did not succeed".to_string())
    }
}

/// Run the relay until the process is stopped: pool, RPC server, handler
/// registration.
pub async fn run_relay(config: RelayConfig, transport: Option<NoiseConfig>) -> anyhow::Result<()> {
    let pool = SerializerPool::spawn(config.pool_size, config.upstream_addr, config.query_timeout);

    let mut server = RpcServer::bind(config.listen_addr, transport).await?;
    server.register(
        &config.rpc_service,
        &config.rpc_method,
        Arc::new(RelayService::new(pool)),
    );

    info!(
        "relay ready: {} -> {} ({}.{})",
        config.listen_addr, config.upstream_addr, config.rpc_service, config.rpc_method
    );
    server.serve().await
}
