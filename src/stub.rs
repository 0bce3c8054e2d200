//! Stub listener: the client side of the tunnel
//!
//! Presents a local DNS-over-UDP surface and forwards every datagram as one
//! RPC call to the relay. Stateless per query: read, translate, call, write
//! back to the originating address. Several listener loops share one UDP
//! socket; each loop owns a private RPC connection so calls from different
//! loops proceed in parallel.

use crate::config::StubConfig;
use crate::dns;
use crate::noise::NoiseConfig;
use crate::rpc::RpcClient;
use anyhow::Context;
use futures::future::join_all;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::net::UdpSocket;

/// One listener loop: a shared socket plus a private RPC client.
struct StubListener {
    id: usize,
    socket: Arc<UdpSocket>,
    client: RpcClient,
    service: String,
    method: String,
    buffer_size: usize,
}

impl StubListener {
    async fn run(mut self) {
        info!("resolver {} ready", self.id);
        let mut buf = vec![0u8; self.buffer_size];

        loop {
            let (len, from) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!("resolver {}: recv error: {}", self.id, e);
                    continue;
                }
            };
            let query = &buf[..len];

            // Name extraction is observability only; a malformed packet is
            // still forwarded as-is
            match dns::query_names(query) {
                Ok(names) => debug!("resolver {} resolving {}", self.id, names),
                Err(e) => warn!("resolver {}: unparseable query from {}: {}", self.id, from, e),
            }

            let response = match self.client.request(&self.service, &self.method, query).await {
                Ok(response) => response,
                Err(e) => {
                    // Drop the query; the local client will time out and
                    // retry per normal DNS-over-UDP behavior
                    warn!("resolver {}: rpc call failed: {}", self.id, e);
                    continue;
                }
            };

            match self.socket.send_to(&response, from).await {
                Ok(sent) if sent < response.len() => {
                    warn!(
                        "resolver {}: truncated send to {}: {} < {}",
                        self.id,
                        from,
                        sent,
                        response.len()
                    );
                }
                Ok(_) => {}
                Err(e) => warn!("resolver {}: send to {} failed: {}", self.id, from, e),
            }
        }
    }
}

/// Bind the stub socket and run `config.listeners` loops over it until the
/// process is stopped.
pub async fn run_stub(config: StubConfig, transport: Option<NoiseConfig>) -> anyhow::Result<()> {
    let socket = UdpSocket::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind stub listener on {}", config.listen_addr))?;
    let socket = Arc::new(socket);
    info!(
        "stub listening on {} -> relay {} ({} resolvers)",
        config.listen_addr, config.relay_addr, config.listeners
    );

    let mut loops = Vec::with_capacity(config.listeners);
    for id in 0..config.listeners {
        let listener = StubListener {
            id,
            socket: Arc::clone(&socket),
            client: RpcClient::new(config.relay_addr, transport.clone()),
            service: config.rpc_service.clone(),
            method: config.rpc_method.clone(),
            buffer_size: config.buffer_size,
        };
        loops.push(tokio::spawn(listener.run()));
    }

    join_all(loops).await;
    Ok(())
}
