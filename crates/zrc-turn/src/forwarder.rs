//! Relay socket to client forwarding

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::metrics::TurnMetrics;

/// Largest datagram read from a relay socket
pub const RELAY_MTU: usize = 1500;

/// Per-allocation traffic counters, updated by the forwarding task
#[derive(Debug, Default)]
pub struct RelayCounters {
    bytes: AtomicU64,
    packets: AtomicU64,
}

impl RelayCounters {
    pub fn record(&self, bytes: usize) {
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }
}

/// Moves datagrams arriving on one relay socket back to the owning client
/// through the shared listener socket.
///
/// Payloads are written unaltered; permission and channel framing are the
/// request handler's concern.
pub(crate) struct Forwarder {
    relay_socket: Arc<UdpSocket>,
    turn_socket: Arc<UdpSocket>,
    client_addr: SocketAddr,
    counters: Arc<RelayCounters>,
    metrics: Option<Arc<TurnMetrics>>,
    closed: watch::Receiver<bool>,
}

impl Forwarder {
    pub(crate) fn new(
        relay_socket: Arc<UdpSocket>,
        turn_socket: Arc<UdpSocket>,
        client_addr: SocketAddr,
        counters: Arc<RelayCounters>,
        metrics: Option<Arc<TurnMetrics>>,
        closed: watch::Receiver<bool>,
    ) -> Self {
        Self {
            relay_socket,
            turn_socket,
            client_addr,
            counters,
            metrics,
            closed,
        }
    }

    /// Run until the allocation is closed or the relay socket fails.
    /// The relay socket handle is dropped on return.
    pub(crate) async fn run(mut self) {
        let mut buf = vec![0u8; RELAY_MTU];

        loop {
            if *self.closed.borrow() {
                break;
            }

            tokio::select! {
                biased;
                changed = self.closed.changed() => {
                    // A dropped sender means the allocation itself is gone
                    if changed.is_err() || *self.closed.borrow() {
                        break;
                    }
                }
                received = self.relay_socket.recv_from(&mut buf) => {
                    let (n, peer) = match received {
                        Ok(received) => received,
                        Err(e) => {
                            debug!(client = %self.client_addr, "relay read failed: {}", e);
                            break;
                        }
                    };

                    trace!(client = %self.client_addr, peer = %peer, "relaying {} bytes", n);

                    if let Err(e) = self.turn_socket.send_to(&buf[..n], self.client_addr).await {
                        warn!(client = %self.client_addr, "failed to relay datagram to client: {}", e);
                        continue;
                    }

                    self.counters.record(n);
                    if let Some(metrics) = &self.metrics {
                        metrics.record_relay(n);
                    }
                }
            }
        }

        debug!(client = %self.client_addr, "relay forwarding stopped");
    }
}
