//! Optional Noise encryption for the RPC link
//!
//! The tunnel's trust model is one-sided: the relay proves its identity with
//! a static X25519 key and the stub stays anonymous, so the channel uses
//! exactly one pattern, **Noise_NK_25519_ChaChaPoly_BLAKE2s**. Without a
//! `[transport]` section the RPC link runs in the clear (the null policy).
//!
//! Keys travel as base64, either inline in the config or in small key files
//! holding a single base64 line.

use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use snow::{Builder, HandshakeState, TransportState};
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// The one Noise pattern the tunnel speaks
pub const NOISE_PATTERN: &str = "Noise_NK_25519_ChaChaPoly_BLAKE2s";

/// Maximum Noise message size, which also caps one RPC frame
pub const MAX_NOISE_MESSAGE: usize = 65535;

/// AEAD tag overhead per message
pub const TAG_LEN: usize = 16;

/// Transport encryption configuration.
///
/// The relay needs `local_private_key`; the stub needs `remote_public_key`
/// (the relay's public key). The `*_file` variants load the same base64
/// material from disk and win over the inline fields when both are set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NoiseConfig {
    /// Our static private key, base64
    pub local_private_key: Option<String>,

    /// The relay's static public key, base64 (stub side)
    pub remote_public_key: Option<String>,

    /// File holding the private key as one base64 line
    #[serde(default)]
    pub private_key_file: Option<std::path::PathBuf>,

    /// File holding the relay's public key as one base64 line
    #[serde(default)]
    pub public_key_file: Option<std::path::PathBuf>,
}

impl NoiseConfig {
    /// Resolve key files into inline key material.
    pub fn load_keys(&mut self) -> Result<()> {
        if let Some(path) = self.private_key_file.take() {
            self.local_private_key = Some(read_key_file(&path)?);
        }
        if let Some(path) = self.public_key_file.take() {
            self.remote_public_key = Some(read_key_file(&path)?);
        }
        Ok(())
    }

    fn private_key(&self) -> Result<Vec<u8>> {
        let key = self
            .local_private_key
            .as_deref()
            .ok_or_else(|| anyhow!("transport requires local_private_key on the relay side"))?;
        decode_key(key)
    }

    fn remote_key(&self) -> Result<Vec<u8>> {
        let key = self
            .remote_public_key
            .as_deref()
            .ok_or_else(|| anyhow!("transport requires remote_public_key on the stub side"))?;
        decode_key(key)
    }
}

fn read_key_file(path: &Path) -> Result<String> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read key file {:?}", path))?;
    let key = contents.trim().to_string();
    if key.is_empty() {
        bail!("key file {:?} is empty", path);
    }
    Ok(key)
}

fn decode_key(key: &str) -> Result<Vec<u8>> {
    let raw = BASE64
        .decode(key)
        .map_err(|e| anyhow!("invalid base64 key: {}", e))?;
    if raw.len() != 32 {
        bail!("key must be 32 bytes, got {}", raw.len());
    }
    Ok(raw)
}

/// A static X25519 keypair, base64 on the outside
#[derive(Debug)]
pub struct Keypair {
    pub private: String,
    pub public: String,
}

impl Keypair {
    pub fn generate() -> Result<Self> {
        let keypair = Builder::new(NOISE_PATTERN.parse()?).generate_keypair()?;
        Ok(Self {
            private: BASE64.encode(&keypair.private),
            public: BASE64.encode(&keypair.public),
        })
    }
}

/// An established NK session: encrypts and decrypts u16-length-prefixed
/// frames on a byte stream it does not own.
pub struct SecureChannel {
    transport: TransportState,
    buf: Vec<u8>,
}

impl SecureChannel {
    /// Initiator side (the stub). Pins the relay's static public key.
    pub async fn connect<S>(stream: &mut S, config: &NoiseConfig) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let handshake = Builder::new(NOISE_PATTERN.parse()?)
            .remote_public_key(&config.remote_key()?)
            .build_initiator()?;
        Self::handshake(stream, handshake, true).await
    }

    /// Responder side (the relay). Proves ownership of the static key.
    pub async fn accept<S>(stream: &mut S, config: &NoiseConfig) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let handshake = Builder::new(NOISE_PATTERN.parse()?)
            .local_private_key(&config.private_key()?)
            .build_responder()?;
        Self::handshake(stream, handshake, false).await
    }

    /// NK is a two-message handshake: initiator -> responder -> done.
    async fn handshake<S>(
        stream: &mut S,
        mut state: HandshakeState,
        initiator: bool,
    ) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; MAX_NOISE_MESSAGE];

        if initiator {
            let len = state.write_message(&[], &mut buf)?;
            write_frame(stream, &buf[..len]).await?;

            let msg = read_frame_into(stream, &mut buf).await?;
            state.read_message(msg, &mut [])?;
        } else {
            let msg = read_frame_into(stream, &mut buf).await?;
            state.read_message(msg, &mut [])?;

            let len = state.write_message(&[], &mut buf)?;
            write_frame(stream, &buf[..len]).await?;
        }

        if !state.is_handshake_finished() {
            bail!("noise handshake did not complete");
        }

        Ok(Self {
            transport: state.into_transport_mode()?,
            buf,
        })
    }

    /// Encrypt `data` and send it as one frame.
    pub async fn write<S>(&mut self, stream: &mut S, data: &[u8]) -> Result<()>
    where
        S: AsyncWrite + Unpin,
    {
        if data.len() + TAG_LEN > MAX_NOISE_MESSAGE {
            bail!("message too large for one noise frame: {} bytes", data.len());
        }
        let len = self.transport.write_message(data, &mut self.buf)?;
        write_frame(stream, &self.buf[..len]).await
    }

    /// Receive one frame and decrypt it.
    pub async fn read<S>(&mut self, stream: &mut S) -> Result<Vec<u8>>
    where
        S: AsyncRead + Unpin,
    {
        let mut ciphertext = vec![0u8; MAX_NOISE_MESSAGE];
        let msg = read_frame_into(stream, &mut ciphertext).await?;
        let len = self.transport.read_message(msg, &mut self.buf)?;
        Ok(self.buf[..len].to_vec())
    }
}

/// Write one u16-big-endian length-prefixed frame.
pub async fn write_frame<S>(stream: &mut S, data: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    if data.len() > MAX_NOISE_MESSAGE {
        bail!("frame too large: {} bytes", data.len());
    }
    stream.write_all(&(data.len() as u16).to_be_bytes()).await?;
    stream.write_all(data).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one u16-length-prefixed frame into `buf`.
pub async fn read_frame_into<'a, S>(stream: &mut S, buf: &'a mut [u8]) -> Result<&'a [u8]>
where
    S: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 2];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => anyhow!("peer closed the connection"),
            _ => anyhow!("failed to read frame length: {}", e),
        })?;

    let len = u16::from_be_bytes(len_buf) as usize;
    if len > buf.len() {
        bail!("frame larger than buffer: {} > {}", len, buf.len());
    }
    stream
        .read_exact(&mut buf[..len])
        .await
        .context("failed to read frame payload")?;
    Ok(&buf[..len])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn test_configs() -> (NoiseConfig, NoiseConfig) {
        let keypair = Keypair::generate().unwrap();
        let relay = NoiseConfig {
            local_private_key: Some(keypair.private.clone()),
            ..Default::default()
        };
        let stub = NoiseConfig {
            remote_public_key: Some(keypair.public),
            ..Default::default()
        };
        (relay, stub)
    }

    #[test]
    fn test_keypair_roundtrip() {
        let keypair = Keypair::generate().unwrap();
        assert_eq!(decode_key(&keypair.private).unwrap().len(), 32);
        assert_eq!(decode_key(&keypair.public).unwrap().len(), 32);
    }

    #[test]
    fn test_missing_keys_rejected() {
        let empty = NoiseConfig::default();
        assert!(empty.private_key().is_err());
        assert!(empty.remote_key().is_err());
    }

    #[test]
    fn test_key_file_loading() {
        let dir = std::env::temp_dir().join("qanat-noise-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("server.pub");
        let keypair = Keypair::generate().unwrap();
        std::fs::write(&path, format!("{}\n", keypair.public)).unwrap();

        let mut config = NoiseConfig {
            public_key_file: Some(path),
            ..Default::default()
        };
        config.load_keys().unwrap();
        assert_eq!(config.remote_public_key.as_deref(), Some(keypair.public.as_str()));
    }

    #[tokio::test]
    async fn test_nk_handshake_and_exchange() {
        let (relay_config, stub_config) = test_configs();
        let (mut stub_stream, mut relay_stream) = duplex(8192);

        let stub = tokio::spawn(async move {
            let mut channel = SecureChannel::connect(&mut stub_stream, &stub_config)
                .await
                .unwrap();
            channel
                .write(&mut stub_stream, b"query bytes")
                .await
                .unwrap();
            channel.read(&mut stub_stream).await.unwrap()
        });

        let relay = tokio::spawn(async move {
            let mut channel = SecureChannel::accept(&mut relay_stream, &relay_config)
                .await
                .unwrap();
            let received = channel.read(&mut relay_stream).await.unwrap();
            assert_eq!(received, b"query bytes");
            channel
                .write(&mut relay_stream, b"response bytes")
                .await
                .unwrap();
        });

        let response = stub.await.unwrap();
        relay.await.unwrap();
        assert_eq!(response, b"response bytes");
    }

    #[tokio::test]
    async fn test_wrong_server_key_fails_handshake() {
        let (relay_config, _) = test_configs();
        let other = Keypair::generate().unwrap();
        let stub_config = NoiseConfig {
            remote_public_key: Some(other.public),
            ..Default::default()
        };

        let (mut stub_stream, mut relay_stream) = duplex(8192);
        let stub =
            tokio::spawn(
                async move { SecureChannel::connect(&mut stub_stream, &stub_config).await },
            );
        let relay =
            tokio::spawn(
                async move { SecureChannel::accept(&mut relay_stream, &relay_config).await },
            );

        // The responder cannot decrypt a message encrypted to a different
        // static key, so at least its side must fail
        let relay_result = relay.await.unwrap();
        assert!(relay_result.is_err());
        let _ = stub.await;
    }
}
