//! Full-path tests: DNS client -> stub -> RPC -> relay pool -> upstream

use qanat::noise::Keypair;
use qanat::{run_relay, run_stub, NoiseConfig, RelayConfig, StubConfig};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};

/// A minimal single-question query for example.com, A/IN (29 bytes)
fn minimal_query() -> Vec<u8> {
    let mut packet = vec![0x00, 0x42, 0x01, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
    for label in ["example", "com"] {
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);
    packet.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
    packet
}

/// Upstream that answers any query with a fixed 45-byte payload
async fn fake_upstream() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            let (len, from) = socket.recv_from(&mut buf).await.unwrap();
            assert_eq!(len, 29, "relay must forward the query byte-for-byte");
            socket.send_to(&[0xab; 45], from).await.unwrap();
        }
    });
    addr
}

async fn free_port(host: &str) -> SocketAddr {
    // Grab an ephemeral port, then release it for the component under test
    let listener = TcpListener::bind(format!("{}:0", host)).await.unwrap();
    listener.local_addr().unwrap()
}

async fn start_tunnel(transport_keys: Option<Keypair>) -> SocketAddr {
    let upstream_addr = fake_upstream().await;
    let relay_addr = free_port("127.0.0.1").await;
    let stub_addr = {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.local_addr().unwrap()
    };

    let (relay_transport, stub_transport) = match transport_keys {
        Some(keypair) => (
            Some(NoiseConfig {
                local_private_key: Some(keypair.private.clone()),
                ..Default::default()
            }),
            Some(NoiseConfig {
                remote_public_key: Some(keypair.public),
                ..Default::default()
            }),
        ),
        None => (None, None),
    };

    let relay_config = RelayConfig {
        listen_addr: relay_addr,
        upstream_addr,
        pool_size: 3,
        query_timeout: Some(Duration::from_secs(1)),
        ..Default::default()
    };
    tokio::spawn(run_relay(relay_config, relay_transport));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stub_config = StubConfig {
        listen_addr: stub_addr,
        relay_addr,
        listeners: 4,
        ..Default::default()
    };
    tokio::spawn(run_stub(stub_config, stub_transport));
    tokio::time::sleep(Duration::from_millis(50)).await;

    stub_addr
}

#[tokio::test]
async fn test_query_round_trip_plain() {
    let stub_addr = start_tunnel(None).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect(stub_addr).await.unwrap();
    client.send(&minimal_query()).await.unwrap();

    let mut buf = vec![0u8; 4096];
    let len = tokio::time::timeout(Duration::from_secs(2), client.recv(&mut buf))
        .await
        .expect("stub did not answer in time")
        .unwrap();

    assert_eq!(len, 45);
    assert_eq!(&buf[..len], &[0xab; 45][..]);
}

#[tokio::test]
async fn test_query_round_trip_encrypted() {
    let keypair = Keypair::generate().unwrap();
    let stub_addr = start_tunnel(Some(keypair)).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect(stub_addr).await.unwrap();
    client.send(&minimal_query()).await.unwrap();

    let mut buf = vec![0u8; 4096];
    let len = tokio::time::timeout(Duration::from_secs(2), client.recv(&mut buf))
        .await
        .expect("stub did not answer in time")
        .unwrap();

    assert_eq!(len, 45);
}

#[tokio::test]
async fn test_concurrent_clients_get_their_own_answers() {
    // Upstream echoes the query back so responses are distinguishable
    let upstream_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream_socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            let (len, from) = upstream_socket.recv_from(&mut buf).await.unwrap();
            upstream_socket.send_to(&buf[..len], from).await.unwrap();
        }
    });

    let relay_addr = free_port("127.0.0.1").await;
    let stub_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let stub_addr = stub_socket.local_addr().unwrap();
    drop(stub_socket);

    let relay_config = RelayConfig {
        listen_addr: relay_addr,
        upstream_addr,
        pool_size: 2,
        query_timeout: Some(Duration::from_secs(1)),
        ..Default::default()
    };
    tokio::spawn(run_relay(relay_config, None));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stub_config = StubConfig {
        listen_addr: stub_addr,
        relay_addr,
        listeners: 4,
        ..Default::default()
    };
    tokio::spawn(run_stub(stub_config, None));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut tasks = Vec::new();
    for i in 0..8u16 {
        tasks.push(tokio::spawn(async move {
            // Distinct transaction ID per client
            let mut query = minimal_query();
            query[..2].copy_from_slice(&i.to_be_bytes());

            let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            client.connect(stub_addr).await.unwrap();
            client.send(&query).await.unwrap();

            let mut buf = vec![0u8; 4096];
            let len = tokio::time::timeout(Duration::from_secs(2), client.recv(&mut buf))
                .await
                .expect("no answer")
                .unwrap();
            assert_eq!(&buf[..len], &query[..], "client {} got a foreign answer", i);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
}

#[tokio::test]
async fn test_unresponsive_upstream_drops_query_at_stub() {
    // Upstream exists but never answers; the stub must stay silent so the
    // DNS client's own retry logic takes over
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = silent.local_addr().unwrap();

    let relay_addr = free_port("127.0.0.1").await;
    let stub_probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let stub_addr = stub_probe.local_addr().unwrap();
    drop(stub_probe);

    let relay_config = RelayConfig {
        listen_addr: relay_addr,
        upstream_addr,
        pool_size: 1,
        query_timeout: Some(Duration::from_millis(200)),
        ..Default::default()
    };
    tokio::spawn(run_relay(relay_config, None));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stub_config = StubConfig {
        listen_addr: stub_addr,
        relay_addr,
        listeners: 1,
        ..Default::default()
    };
    tokio::spawn(run_stub(stub_config, None));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect(stub_addr).await.unwrap();
    client.send(&minimal_query()).await.unwrap();

    let mut buf = vec![0u8; 512];
    let answer = tokio::time::timeout(Duration::from_millis(800), client.recv(&mut buf)).await;
    assert!(answer.is_err(), "stub must drop the query on relay failure");
}
