//! Qanat: DNS-over-RPC tunnel
//!
//! Qanat routes DNS queries from a local stub resolver to a remote resolver
//! over an RPC channel (optionally Noise-encrypted) instead of directly over
//! UDP, so DNS traffic can cross networks that block, poison, or surveil
//! port 53.
//!
//! ## Features
//!
//! - **Stub mode**: a local DNS-over-UDP listener that forwards every query
//!   as one RPC call and writes the raw answer back to the asker
//! - **Relay mode**: an RPC server backed by a fixed pool of workers, each
//!   owning one UDP socket to the upstream resolver
//! - **Bounded fan-out**: at most `pool_size` queries are ever in flight
//!   upstream, no matter how many clients are asking
//! - **Optional encryption**: Noise NK on the RPC link - the relay proves
//!   its identity, the stub stays anonymous
//! - **Byte-exact forwarding**: no caching, no recursion, no rewriting;
//!   wire-format bytes pass through one-to-one
//!
//! ## Quick Start
//!
//! ```bash
//! # Generate relay keys
//! qanat genkey --private-key-file relay.key --public-key-file relay.pub
//!
//! # On the relay host
//! qanat relay --listen 0.0.0.0:5555 --upstream 9.9.9.9:53 --privkey-file relay.key
//!
//! # On the local host
//! qanat stub --listen 127.0.0.1:5353 --relay relay.example.net:5555 --pubkey-file relay.pub
//!
//! # Point the system resolver at 127.0.0.1:5353
//! ```
//!
//! ## Architecture
//!
//! ```text
//! DNS client --UDP--> Stub --RPC--> Relay --> Serializer Pool --UDP--> upstream
//!            <--UDP-- Stub <--RPC-- Relay <-- (per-call reply slot) <--+
//! ```
//!
//! The hard part lives in [`pool`]: N workers pull from one FIFO queue and
//! correlate each query with exactly one response through a single-use reply
//! slot, so concurrent lookups can never receive each other's answers.

pub mod config;
pub mod dns;
pub mod noise;
pub mod pool;
pub mod relay;
pub mod rpc;
pub mod stub;
pub mod upstream;

// Re-export core types
pub use config::{QanatConfig, QanatMode, RelayConfig, StubConfig};
pub use noise::{Keypair, NoiseConfig, SecureChannel};
pub use pool::{LookupError, SerializerPool};
pub use relay::{run_relay, RelayService};
pub use rpc::{RpcClient, RpcError, RpcHandler, RpcServer};
pub use stub::run_stub;
pub use upstream::{UpstreamError, UpstreamLink, MAX_DNS_PACKET_SIZE};
