//! RPC boundary between stub and relay
//!
//! One TCP connection carries a sequence of request/response exchanges,
//! framed with a u16 big-endian length prefix (the same framing the Noise
//! channel uses, so encryption slots in without changing the wire shape):
//!
//! ```text
//! request  = [service_len u8][service][method_len u8][method][payload...]
//! response = [status u8][payload]          status 0: success
//!          | [status u8][utf8 reason]      status 1: failure
//! ```
//!
//! Payloads are opaque: the layer moves bytes and a success/failure verdict,
//! nothing else. A client connection is private to one caller and carries
//! one request at a time; parallelism comes from opening more connections.

use crate::noise::{self, NoiseConfig, SecureChannel, MAX_NOISE_MESSAGE, TAG_LEN};
use anyhow::Context;
use async_trait::async_trait;
use bytes::{Buf, BufMut};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};

/// Room left in one frame after the request header worst case
pub const MAX_RPC_PAYLOAD: usize = MAX_NOISE_MESSAGE - TAG_LEN - 2 - 2 * 256;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("rpc i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("rpc transport error: {0}")]
    Transport(String),

    #[error("malformed rpc frame: {0}")]
    Frame(String),

    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("remote failure: {0}")]
    Remote(String),
}

/// Inbound-call dispatch: input bytes in, output bytes or a failure reason
/// out. Implementations must be safe to share across connections.
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    async fn call(&self, input: Vec<u8>) -> Result<Vec<u8>, String>;
}

// --- wire codec ---

pub(crate) fn encode_request(
    service: &str,
    method: &str,
    payload: &[u8],
) -> Result<Vec<u8>, RpcError> {
    if service.len() > u8::MAX as usize || method.len() > u8::MAX as usize {
        return Err(RpcError::Frame("service/method name too long".into()));
    }
    if payload.len() > MAX_RPC_PAYLOAD {
        return Err(RpcError::PayloadTooLarge(payload.len()));
    }

    let mut frame = Vec::with_capacity(2 + service.len() + method.len() + payload.len());
    frame.put_u8(service.len() as u8);
    frame.put_slice(service.as_bytes());
    frame.put_u8(method.len() as u8);
    frame.put_slice(method.as_bytes());
    frame.put_slice(payload);
    Ok(frame)
}

pub(crate) fn decode_request(frame: &[u8]) -> Result<(String, String, Vec<u8>), RpcError> {
    let mut buf = frame;

    let mut read_name = |what: &str| -> Result<String, RpcError> {
        if buf.remaining() < 1 {
            return Err(RpcError::Frame(format!("missing {} length", what)));
        }
        let len = buf.get_u8() as usize;
        if buf.remaining() < len {
            return Err(RpcError::Frame(format!("truncated {}", what)));
        }
        let name = String::from_utf8(buf[..len].to_vec())
            .map_err(|_| RpcError::Frame(format!("{} is not utf-8", what)))?;
        buf.advance(len);
        Ok(name)
    };

    let service = read_name("service")?;
    let method = read_name("method")?;
    Ok((service, method, buf.to_vec()))
}

pub(crate) fn encode_response(outcome: Result<&[u8], &str>) -> Vec<u8> {
    match outcome {
        Ok(payload) => {
            let mut frame = Vec::with_capacity(1 + payload.len());
            frame.put_u8(0);
            frame.put_slice(payload);
            frame
        }
        Err(reason) => {
            let mut frame = Vec::with_capacity(1 + reason.len());
            frame.put_u8(1);
            frame.put_slice(reason.as_bytes());
            frame
        }
    }
}

pub(crate) fn decode_response(frame: &[u8]) -> Result<Vec<u8>, RpcError> {
    let mut buf = frame;
    if buf.remaining() < 1 {
        return Err(RpcError::Frame("empty response frame".into()));
    }
    match buf.get_u8() {
        0 => Ok(buf.to_vec()),
        1 => Err(RpcError::Remote(
            String::from_utf8_lossy(buf).into_owned(),
        )),
        status => Err(RpcError::Frame(format!("unknown status {}", status))),
    }
}

// --- connection ---

/// One framed connection, plain or Noise-wrapped.
struct Connection {
    stream: TcpStream,
    channel: Option<SecureChannel>,
}

impl Connection {
    async fn send(&mut self, frame: &[u8]) -> Result<(), RpcError> {
        match &mut self.channel {
            Some(channel) => channel
                .write(&mut self.stream, frame)
                .await
                .map_err(|e| RpcError::Transport(e.to_string())),
            None => noise::write_frame(&mut self.stream, frame)
                .await
                .map_err(|e| RpcError::Transport(e.to_string())),
        }
    }

    async fn recv(&mut self) -> Result<Vec<u8>, RpcError> {
        match &mut self.channel {
            Some(channel) => channel
                .read(&mut self.stream)
                .await
                .map_err(|e| RpcError::Transport(e.to_string())),
            None => {
                let mut buf = vec![0u8; MAX_NOISE_MESSAGE];
                let frame = noise::read_frame_into(&mut self.stream, &mut buf)
                    .await
                    .map_err(|e| RpcError::Transport(e.to_string()))?;
                Ok(frame.to_vec())
            }
        }
    }
}

// --- client ---

/// Client end of the RPC boundary.
///
/// Holds at most one connection; a transport error drops it and the next
/// `request` re-dials (a remote *failure* is an answered call and keeps the
/// connection).
pub struct RpcClient {
    server: SocketAddr,
    transport: Option<NoiseConfig>,
    conn: Option<Connection>,
}

impl RpcClient {
    pub fn new(server: SocketAddr, transport: Option<NoiseConfig>) -> Self {
        Self {
            server,
            transport,
            conn: None,
        }
    }

    async fn dial(
        server: SocketAddr,
        transport: Option<&NoiseConfig>,
    ) -> Result<Connection, RpcError> {
        let mut stream = TcpStream::connect(server).await?;
        let channel = match transport {
            Some(config) => Some(
                SecureChannel::connect(&mut stream, config)
                    .await
                    .map_err(|e| RpcError::Transport(e.to_string()))?,
            ),
            None => None,
        };
        debug!(
            "rpc connection to {} established ({})",
            server,
            if channel.is_some() { "noise" } else { "plain" }
        );
        Ok(Connection { stream, channel })
    }

    /// Issue one call and wait for its answer.
    pub async fn request(
        &mut self,
        service: &str,
        method: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, RpcError> {
        let frame = encode_request(service, method, payload)?;

        let mut conn = match self.conn.take() {
            Some(conn) => conn,
            None => Self::dial(self.server, self.transport.as_ref()).await?,
        };

        let outcome = async {
            conn.send(&frame).await?;
            let response = conn.recv().await?;
            decode_response(&response)
        }
        .await;

        match outcome {
            Ok(bytes) => {
                self.conn = Some(conn);
                Ok(bytes)
            }
            Err(e @ RpcError::Remote(_)) => {
                // The call completed; the remote just said no
                self.conn = Some(conn);
                Err(e)
            }
            Err(e) => Err(e), // connection dropped, next request re-dials
        }
    }
}

// --- server ---

/// Server end of the RPC boundary: accepts connections, performs the
/// optional Noise handshake, and dispatches frames to registered handlers
/// keyed by `service/method`.
pub struct RpcServer {
    listener: TcpListener,
    transport: Option<NoiseConfig>,
    handlers: HashMap<String, Arc<dyn RpcHandler>>,
}

impl RpcServer {
    pub async fn bind(
        listen: SocketAddr,
        transport: Option<NoiseConfig>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(listen)
            .await
            .with_context(|| format!("failed to bind RPC listener on {}", listen))?;
        Ok(Self {
            listener,
            transport,
            handlers: HashMap::new(),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn register(&mut self, service: &str, method: &str, handler: Arc<dyn RpcHandler>) {
        self.handlers.insert(format!("{}/{}", service, method), handler);
    }

    pub async fn serve(self) -> anyhow::Result<()> {
        let local = self.listener.local_addr()?;
        info!(
            "rpc server listening on {} ({} policy)",
            local,
            if self.transport.is_some() { "noise" } else { "null" }
        );

        let handlers = Arc::new(self.handlers);
        loop {
            let (stream, peer) = self.listener.accept().await?;
            let handlers = Arc::clone(&handlers);
            let transport = self.transport.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_connection(stream, peer, handlers, transport).await {
                    warn!("rpc connection from {}: {}", peer, e);
                }
            });
        }
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    handlers: Arc<HashMap<String, Arc<dyn RpcHandler>>>,
    transport: Option<NoiseConfig>,
) -> Result<(), RpcError> {
    let channel = match &transport {
        Some(config) => Some(
            SecureChannel::accept(&mut stream, config)
                .await
                .map_err(|e| RpcError::Transport(e.to_string()))?,
        ),
        None => None,
    };
    let mut conn = Connection { stream, channel };
    debug!("rpc connection from {} established", peer);

    loop {
        let frame = match conn.recv().await {
            Ok(frame) => frame,
            Err(_) => {
                debug!("rpc connection from {} closed", peer);
                return Ok(());
            }
        };

        let response = match decode_request(&frame) {
            Ok((service, method, payload)) => {
                let key = format!("{}/{}", service, method);
                match handlers.get(&key) {
                    Some(handler) => match handler.call(payload).await {
                        Ok(output) if output.len() > MAX_RPC_PAYLOAD => {
                            warn!("response to {} exceeds frame size: {} bytes", peer, output.len());
                            encode_response(Err("response too large"))
                        }
                        Ok(output) => encode_response(Ok(&output)),
                        Err(reason) => encode_response(Err(&reason)),
                    },
                    None => {
                        warn!("rpc call from {} for unknown {}", peer, key);
                        encode_response(Err(&format!("no such method: {}", key)))
                    }
                }
            }
            Err(e) => {
                warn!("malformed rpc frame from {}: {}", peer, e);
                encode_response(Err("malformed request"))
            }
        };

        conn.send(&response).await?;
    }
}
