//! Integration tests for the TURN listener dispatch loop and allocation lifecycle.
//!
//! A minimal line protocol stands in for STUN/TURN:
//! - `ALLOC` creates an allocation and replies with the relay address
//! - `DELETE` removes the caller's allocation and replies `OK`
//! - anything else is rejected with an error

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use zrc_turn::config::{ListenerConfig, TurnConfig};
use zrc_turn::{
    PacketConnConfig, RelayAddressGeneratorStatic, Request, RequestHandler, ServerConfig, TurnServer,
};

const ALLOCATION_LIFETIME: Duration = Duration::from_secs(30);

struct LineProtocol;

#[async_trait]
impl RequestHandler for LineProtocol {
    async fn handle_request(&self, request: Request<'_>) -> anyhow::Result<()> {
        let five_tuple = request.five_tuple()?;
        match request.buf {
            b"ALLOC" => {
                let allocation = request
                    .allocation_manager
                    .create_allocation(&five_tuple, request.conn.clone(), 0, ALLOCATION_LIFETIME)
                    .map_err(|e| anyhow!("allocate failed: {e}"))?;
                let reply = allocation.relay_addr().to_string();
                request.conn.send_to(reply.as_bytes(), request.src_addr).await?;
            }
            b"DELETE" => {
                request.allocation_manager.delete_allocation(&five_tuple).await;
                request.conn.send_to(b"OK", request.src_addr).await?;
            }
            other => bail!("unknown request of {} bytes", other.len()),
        }
        Ok(())
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn start_server(listeners: usize) -> TurnServer {
    init_tracing();
    let mut packet_conn_configs = Vec::new();
    for _ in 0..listeners {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let generator = RelayAddressGeneratorStatic::new("127.0.0.1".parse().unwrap(), "udp4", "127.0.0.1");
        packet_conn_configs.push(PacketConnConfig::new(socket, Arc::new(generator)));
    }

    let config = ServerConfig {
        packet_conn_configs,
        realm: "zrc".to_string(),
        ..Default::default()
    };
    TurnServer::start(config, Arc::new(LineProtocol)).unwrap()
}

async fn recv(socket: &UdpSocket) -> (Vec<u8>, SocketAddr) {
    let mut buf = [0u8; 1500];
    let (n, from) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for datagram")
        .unwrap();
    (buf[..n].to_vec(), from)
}

async fn allocate(client: &UdpSocket, server: SocketAddr) -> SocketAddr {
    client.send_to(b"ALLOC", server).await.unwrap();
    let (reply, _) = recv(client).await;
    String::from_utf8(reply).unwrap().parse().unwrap()
}

/// Test: Relay traffic reaches the client unaltered through the listener socket
#[tokio::test]
async fn integration_relay_round_trip() {
    let server = start_server(1).await;
    let server_addr = server.local_addrs()[0];
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let relay_addr = allocate(&client, server_addr).await;
    peer.send_to(&[0xDE, 0xAD], relay_addr).await.unwrap();

    let (payload, from) = recv(&client).await;
    assert_eq!(payload, vec![0xDE, 0xAD]);
    assert_eq!(from, server_addr);

    let manager = server.allocation_manager(server_addr).unwrap();
    assert_eq!(manager.count(), 1);

    // Counters are bumped after the send completes
    let metrics = server.metrics().clone();
    timeout(Duration::from_secs(2), async move {
        while metrics.bytes_relayed() < 2.0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("relay counters never updated");

    server.close().await.unwrap();
}

/// Test: A rejected datagram is logged and the loop keeps serving
#[tokio::test]
async fn integration_handler_error_keeps_loop_running() {
    let server = start_server(1).await;
    let server_addr = server.local_addrs()[0];
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    client.send_to(b"GARBAGE", server_addr).await.unwrap();
    allocate(&client, server_addr).await;

    assert_eq!(server.running_listeners(), 1);
    assert_eq!(server.metrics().handler_errors(), 1.0);
    assert_eq!(server.metrics().datagrams_received(), 2.0);

    server.close().await.unwrap();
}

/// Test: A second allocate from the same client is rejected and leaves one allocation
#[tokio::test]
async fn integration_duplicate_allocation_rejected() {
    let server = start_server(1).await;
    let server_addr = server.local_addrs()[0];
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let relay_addr = allocate(&client, server_addr).await;
    client.send_to(b"ALLOC", server_addr).await.unwrap();
    // The duplicate gets no reply; a delete round trip proves it was processed
    client.send_to(b"DELETE", server_addr).await.unwrap();
    let (reply, _) = recv(&client).await;
    assert_eq!(reply, b"OK");

    assert_eq!(server.metrics().handler_errors(), 1.0);
    let manager = server.allocation_manager(server_addr).unwrap();
    assert_eq!(manager.count(), 0);

    // Deleted allocation released its relay port
    std::net::UdpSocket::bind(relay_addr).unwrap();

    // Same client may allocate again afterwards
    allocate(&client, server_addr).await;
    assert_eq!(manager.count(), 1);

    server.close().await.unwrap();
}

/// Test: Each listener has its own allocation table
#[tokio::test]
async fn integration_listeners_are_independent() {
    let server = start_server(2).await;
    let addrs = server.local_addrs();
    assert_eq!(addrs.len(), 2);
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let relay_a = allocate(&client, addrs[0]).await;
    let relay_b = allocate(&client, addrs[1]).await;
    assert_ne!(relay_a, relay_b);

    for addr in &addrs {
        assert_eq!(server.allocation_manager(*addr).unwrap().count(), 1);
    }

    server.close().await.unwrap();
}

/// Test: Shutdown stops every loop and releases listener and relay sockets
#[tokio::test]
async fn integration_close_releases_sockets() {
    let server = start_server(1).await;
    let server_addr = server.local_addrs()[0];
    let manager = server.allocation_manager(server_addr).unwrap().clone();
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let relay_addr = allocate(&client, server_addr).await;
    let allocation = manager.list().pop().unwrap();
    assert_eq!(allocation.relay_addr, relay_addr);

    server.close().await.unwrap();

    assert_eq!(manager.count(), 0);
    std::net::UdpSocket::bind(relay_addr).unwrap();
    std::net::UdpSocket::bind(server_addr).unwrap();
}

/// Test: A server assembled from file configuration serves allocations
#[tokio::test]
async fn integration_server_from_turn_config() {
    init_tracing();
    let config = TurnConfig {
        listeners: vec![ListenerConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            relay_address: "127.0.0.1".parse().unwrap(),
            network: "udp4".to_string(),
            address: "127.0.0.1".to_string(),
        }],
        ..Default::default()
    };

    let server = TurnServer::start(config.build().await.unwrap(), Arc::new(LineProtocol)).unwrap();
    let server_addr = server.local_addrs()[0];
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let relay_addr = allocate(&client, server_addr).await;
    assert_eq!(relay_addr.ip(), "127.0.0.1".parse::<std::net::IpAddr>().unwrap());

    server.close().await.unwrap();
}

/// Test: A failed read stops the listener for good and closes its allocations
#[tokio::test]
async fn integration_read_failure_stops_listener() {
    init_tracing();
    let listener = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let server_addr = listener.local_addr().unwrap();
    let generator = RelayAddressGeneratorStatic::new("127.0.0.1".parse().unwrap(), "udp4", "127.0.0.1");
    let config = ServerConfig {
        packet_conn_configs: vec![PacketConnConfig::new(listener.clone(), Arc::new(generator))],
        realm: "zrc".to_string(),
        ..Default::default()
    };
    let server = TurnServer::start(config, Arc::new(LineProtocol)).unwrap();
    let manager = server.allocation_manager(server_addr).unwrap().clone();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let relay_addr = allocate(&client, server_addr).await;
    assert_eq!(manager.count(), 1);

    // Sending from the connected listener to a closed port queues ECONNREFUSED
    let closed_port = std::net::UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
    listener.connect(closed_port).await.unwrap();
    listener.send(b"x").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Make the listener readable so the pending error is reported by recv_from
    let waker = UdpSocket::bind(closed_port).await.unwrap();
    waker.send_to(b"wake", server_addr).await.unwrap();

    timeout(Duration::from_secs(2), async {
        while server.running_listeners() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("dispatch loop kept running after a read error");

    // Stopped without a handler error and with its allocations closed
    assert_eq!(server.metrics().handler_errors(), 0.0);
    assert_eq!(manager.count(), 0);
    std::net::UdpSocket::bind(relay_addr).unwrap();

    server.close().await.unwrap();
}
