//! Upstream resolver link
//!
//! Each pool worker owns exactly one `UpstreamLink`: a UDP socket dialed to
//! the upstream resolver, carrying at most one outstanding query at a time.
//! The link is dialed lazily on first use and re-dialed on the use after a
//! socket error.

use log::warn;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;

/// Largest DNS message we will accept from upstream (EDNS0 ceiling)
pub const MAX_DNS_PACKET_SIZE: usize = 65535;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream socket error: {0}")]
    Io(#[from] io::Error),

    #[error("upstream did not answer within {0:?}")]
    TimedOut(Duration),
}

/// One UDP socket dialed to the upstream resolver.
///
/// Not shared: a link belongs to a single worker, which queries it strictly
/// sequentially, so there is never more than one unanswered datagram in
/// flight on it.
pub struct UpstreamLink {
    upstream: SocketAddr,
    timeout: Option<Duration>,
    socket: Option<UdpSocket>,
}

impl UpstreamLink {
    /// `timeout` bounds each receive; `None` blocks indefinitely. Production
    /// configs should always set one, or a silent upstream parks the owning
    /// worker forever.
    pub fn new(upstream: SocketAddr, timeout: Option<Duration>) -> Self {
        Self {
            upstream,
            timeout,
            socket: None,
        }
    }

    /// Send one query and wait for exactly one reply datagram.
    ///
    /// The payload goes out verbatim; whatever comes back is returned
    /// unmodified, even if zero-length. Any send/receive error or a timeout
    /// drops the socket so the next call re-dials.
    pub async fn query(&mut self, payload: &[u8]) -> Result<Vec<u8>, UpstreamError> {
        let socket = match self.socket.take() {
            Some(socket) => socket,
            None => Self::dial(self.upstream).await?,
        };

        match Self::exchange(&socket, payload, self.timeout).await {
            Ok(response) => {
                self.socket = Some(socket);
                Ok(response)
            }
            // socket stays dropped; next query() re-dials
            Err(e) => Err(e),
        }
    }

    async fn dial(upstream: SocketAddr) -> Result<UdpSocket, UpstreamError> {
        let bind = if upstream.is_ipv4() {
            SocketAddr::from((std::net::Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((std::net::Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(upstream).await?;
        Ok(socket)
    }

    async fn exchange(
        socket: &UdpSocket,
        payload: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, UpstreamError> {
        let sent = socket.send(payload).await?;
        if sent < payload.len() {
            // Best effort, consistent with UDP's delivery model
            warn!("short write to upstream: {} of {} bytes", sent, payload.len());
        }

        let mut buf = vec![0u8; MAX_DNS_PACKET_SIZE];
        let len = match timeout {
            Some(duration) => tokio::time::timeout(duration, socket.recv(&mut buf))
                .await
                .map_err(|_| UpstreamError::TimedOut(duration))??,
            None => socket.recv(&mut buf).await?,
        };

        buf.truncate(len);
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    /// Upstream that answers every datagram with a fixed payload
    async fn fake_upstream(response: Vec<u8>) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DNS_PACKET_SIZE];
            loop {
                let (_, from) = socket.recv_from(&mut buf).await.unwrap();
                socket.send_to(&response, from).await.unwrap();
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_query_round_trip() {
        let upstream = fake_upstream(vec![0x42; 45]).await;
        let mut link = UpstreamLink::new(upstream, Some(Duration::from_secs(1)));

        let response = link.query(&[0x01; 29]).await.unwrap();
        assert_eq!(response, vec![0x42; 45]);

        // Link survives across queries without re-dialing
        assert!(link.socket.is_some());
        let response = link.query(&[0x02; 29]).await.unwrap();
        assert_eq!(response, vec![0x42; 45]);
    }

    #[tokio::test]
    async fn test_zero_length_response_passed_through() {
        let upstream = fake_upstream(Vec::new()).await;
        let mut link = UpstreamLink::new(upstream, Some(Duration::from_secs(1)));

        let response = link.query(b"query").await.unwrap();
        assert!(response.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_is_bounded() {
        // Bound socket that never answers
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream = silent.local_addr().unwrap();

        let timeout = Duration::from_millis(200);
        let mut link = UpstreamLink::new(upstream, Some(timeout));

        let start = Instant::now();
        let result = link.query(b"query").await;
        let elapsed = start.elapsed();

        assert!(matches!(result, Err(UpstreamError::TimedOut(_))));
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout * 4, "timeout took {:?}", elapsed);

        // Timed-out socket was discarded; next use re-dials
        assert!(link.socket.is_none());
    }

    #[tokio::test]
    async fn test_timeout_does_not_leak_into_next_query() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let silent_addr = silent.local_addr().unwrap();

        let mut link = UpstreamLink::new(silent_addr, Some(Duration::from_millis(100)));
        assert!(link.query(b"first").await.is_err());

        // Redirect the link at a live upstream and confirm a clean exchange
        let live = fake_upstream(b"answer".to_vec()).await;
        link.upstream = live;
        assert_eq!(link.query(b"second").await.unwrap(), b"answer");
    }
}
