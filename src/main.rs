//! Qanat - DNS-over-RPC tunnel
//!
//! Routes DNS queries from a local stub resolver to a remote resolver over
//! an optionally encrypted RPC channel instead of plain port-53 UDP.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use std::net::SocketAddr;
use std::path::PathBuf;

use qanat::{noise, run_relay, run_stub, Keypair, QanatConfig, QanatMode};

#[derive(Parser)]
#[command(name = "qanat")]
#[command(author = "Sina Rabbani")]
#[command(version)]
#[command(about = "DNS-over-RPC tunnel", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the stub: a local DNS-over-UDP listener backed by the relay
    Stub {
        /// Listen address for local DNS queries
        #[arg(short, long)]
        listen: Option<SocketAddr>,

        /// Relay RPC server address
        #[arg(short, long)]
        relay: Option<SocketAddr>,

        /// How many parallel requests can be served
        #[arg(short, long)]
        threads: Option<usize>,

        /// Relay public key file for RPC encryption
        #[arg(long)]
        pubkey_file: Option<PathBuf>,
    },

    /// Run the relay: an RPC server forwarding queries to an upstream resolver
    Relay {
        /// Listen address for the RPC server
        #[arg(short, long)]
        listen: Option<SocketAddr>,

        /// Upstream resolver address
        #[arg(short, long)]
        upstream: Option<SocketAddr>,

        /// Worker pool size (bound on concurrent upstream queries)
        #[arg(short, long)]
        pool_size: Option<usize>,

        /// Per-query upstream timeout (e.g. "1s", "500ms")
        #[arg(short, long, value_parser = humantime::parse_duration)]
        timeout: Option<std::time::Duration>,

        /// Private key file for RPC encryption
        #[arg(long)]
        privkey_file: Option<PathBuf>,
    },

    /// Generate an X25519 keypair for the encrypted transport
    Genkey {
        /// Write the private key here (printed to stdout otherwise)
        #[arg(long)]
        private_key_file: Option<PathBuf>,

        /// Write the public key here (printed to stdout otherwise)
        #[arg(long)]
        public_key_file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logger
    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    let mut config = if let Some(ref path) = cli.config {
        QanatConfig::from_file(path)
            .with_context(|| format!("failed to load config from {:?}", path))?
    } else {
        QanatConfig::default()
    };

    match cli.command {
        Commands::Stub {
            listen,
            relay,
            threads,
            pubkey_file,
        } => {
            config.mode = QanatMode::Stub;
            if let Some(listen) = listen {
                config.stub.listen_addr = listen;
            }
            if let Some(relay) = relay {
                config.stub.relay_addr = relay;
            }
            if let Some(threads) = threads {
                config.stub.listeners = threads;
            }
            if let Some(path) = pubkey_file {
                config
                    .transport
                    .get_or_insert_with(Default::default)
                    .public_key_file = Some(path);
            }
            run(config).await
        }
        Commands::Relay {
            listen,
            upstream,
            pool_size,
            timeout,
            privkey_file,
        } => {
            config.mode = QanatMode::Relay;
            if let Some(listen) = listen {
                config.relay.listen_addr = listen;
            }
            if let Some(upstream) = upstream {
                config.relay.upstream_addr = upstream;
            }
            if let Some(pool_size) = pool_size {
                config.relay.pool_size = pool_size;
            }
            if let Some(timeout) = timeout {
                config.relay.query_timeout = Some(timeout);
            }
            if let Some(path) = privkey_file {
                config
                    .transport
                    .get_or_insert_with(Default::default)
                    .private_key_file = Some(path);
            }
            run(config).await
        }
        Commands::Genkey {
            private_key_file,
            public_key_file,
        } => genkey(private_key_file, public_key_file),
    }
}

async fn run(mut config: QanatConfig) -> Result<()> {
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {}", e))?;

    // Resolve key files before any socket work so a bad path is fatal at
    // startup, not at first use
    let transport = match config.transport.take() {
        Some(mut transport) => {
            transport.load_keys().context("failed to load key material")?;
            info!("transport: noise policy");
            Some(transport)
        }
        None => {
            info!("transport: null policy");
            None
        }
    };

    match config.mode {
        QanatMode::Stub => run_stub(config.stub, transport).await,
        QanatMode::Relay => run_relay(config.relay, transport).await,
    }
}

fn genkey(private_key_file: Option<PathBuf>, public_key_file: Option<PathBuf>) -> Result<()> {
    let keypair = Keypair::generate().context("failed to generate keypair")?;

    match private_key_file {
        Some(path) => {
            write_key(&path, &keypair.private)?;
            println!("private key written to {:?} (keep it on the relay host only)", path);
        }
        None => {
            println!("# private key ({}) - relay side, keep secret", noise::NOISE_PATTERN);
            println!("{}", keypair.private);
        }
    }

    match public_key_file {
        Some(path) => {
            write_key(&path, &keypair.public)?;
            println!("public key written to {:?} (distribute to stub hosts)", path);
        }
        None => {
            println!("# public key - stub side, safe to share");
            println!("{}", keypair.public);
        }
    }

    Ok(())
}

fn write_key(path: &PathBuf, key: &str) -> Result<()> {
    std::fs::write(path, format!("{}\n", key))
        .with_context(|| format!("failed to write key to {:?}", path))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(path)?.permissions();
        perms.set_mode(0o600);
        std::fs::set_permissions(path, perms)?;
    }

    Ok(())
}
