//! Qanat configuration

use crate::noise::NoiseConfig;
use crate::rpc::MAX_RPC_PAYLOAD;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Main Qanat configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QanatConfig {
    /// Mode of operation
    pub mode: QanatMode,

    /// Stub configuration (stub mode)
    #[serde(default)]
    pub stub: StubConfig,

    /// Relay configuration (relay mode)
    #[serde(default)]
    pub relay: RelayConfig,

    /// Transport encryption (Noise Protocol); absent means plaintext RPC
    #[serde(default)]
    pub transport: Option<NoiseConfig>,
}

impl Default for QanatConfig {
    fn default() -> Self {
        Self {
            mode: QanatMode::Stub,
            stub: StubConfig::default(),
            relay: RelayConfig::default(),
            transport: None,
        }
    }
}

/// Operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QanatMode {
    Stub,
    Relay,
}

/// Stub (client-side) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StubConfig {
    /// Local DNS-over-UDP listen address
    pub listen_addr: SocketAddr,

    /// Relay RPC server address
    pub relay_addr: SocketAddr,

    /// How many listener loops share the stub socket
    #[serde(default = "default_listeners")]
    pub listeners: usize,

    /// Receive buffer per datagram; queries larger than this are truncated
    /// by the socket layer
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// RPC service name
    #[serde(default = "default_service")]
    pub rpc_service: String,

    /// RPC method name
    #[serde(default = "default_method")]
    pub rpc_method: String,
}

impl Default for StubConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:5353".parse().unwrap(),
            relay_addr: "127.0.0.1:5555".parse().unwrap(),
            listeners: default_listeners(),
            buffer_size: default_buffer_size(),
            rpc_service: default_service(),
            rpc_method: default_method(),
        }
    }
}

/// Relay (server-side) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// RPC listen address
    pub listen_addr: SocketAddr,

    /// Upstream resolver address
    pub upstream_addr: SocketAddr,

    /// Serializer pool size: the hard bound on concurrent upstream queries
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Per-query upstream receive timeout ("1s", "500ms", ...). Omitting it
    /// blocks indefinitely; keep one set in production or a silent upstream
    /// pins a worker forever.
    #[serde(default = "default_query_timeout", with = "humantime_serde")]
    pub query_timeout: Option<Duration>,

    /// RPC service name
    #[serde(default = "default_service")]
    pub rpc_service: String,

    /// RPC method name
    #[serde(default = "default_method")]
    pub rpc_method: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:5555".parse().unwrap(),
            upstream_addr: "127.0.0.1:53".parse().unwrap(),
            pool_size: default_pool_size(),
            query_timeout: default_query_timeout(),
            rpc_service: default_service(),
            rpc_method: default_method(),
        }
    }
}

fn default_listeners() -> usize {
    20
}

fn default_buffer_size() -> usize {
    4096
}

fn default_pool_size() -> usize {
    10
}

fn default_query_timeout() -> Option<Duration> {
    Some(Duration::from_secs(1))
}

fn default_service() -> String {
    "DnsOverRpc".to_string()
}

fn default_method() -> String {
    "Resolve".to_string()
}

impl QanatConfig {
    /// Load configuration from TOML file
    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.stub.listeners == 0 {
            return Err("stub.listeners must be at least 1".to_string());
        }
        if self.stub.buffer_size == 0 || self.stub.buffer_size > MAX_RPC_PAYLOAD {
            return Err(format!(
                "stub.buffer_size must be between 1 and {}",
                MAX_RPC_PAYLOAD
            ));
        }
        if self.relay.pool_size == 0 {
            return Err("relay.pool_size must be at least 1".to_string());
        }
        if self.relay.query_timeout == Some(Duration::ZERO) {
            return Err("relay.query_timeout must be non-zero; omit it to disable".to_string());
        }
        if self.stub.rpc_service.is_empty() || self.stub.rpc_method.is_empty() {
            return Err("stub rpc_service/rpc_method must be set".to_string());
        }
        if self.relay.rpc_service.is_empty() || self.relay.rpc_method.is_empty() {
            return Err("relay rpc_service/rpc_method must be set".to_string());
        }
        Ok(())
    }
}
