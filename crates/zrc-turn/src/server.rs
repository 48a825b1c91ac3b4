//! TURN server: one dispatch loop per listening socket

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::allocation::{AllocationError, AllocationManager, ManagerConfig};
use crate::config::ConfigError;
use crate::handler::{AuthHandler, Request, RequestHandler};
use crate::metrics::TurnMetrics;
use crate::relay::RelayAddressGenerator;

/// Receive buffer size of a dispatch loop
pub const INBOUND_MTU: usize = 1500;

/// Channel binding lifetime used when none is configured
pub const DEFAULT_CHANNEL_BIND_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("listener task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("failed to close allocations: {0}")]
    Allocation(#[from] AllocationError),
}

/// A UDP listener and the policy for relay sockets of its allocations.
///
/// The socket is read by the dispatch loop and written by every allocation's
/// forwarding task at the same time; Tokio's `UdpSocket` supports concurrent
/// `send_to` through a shared reference, so no extra locking is done.
#[derive(Clone, Default)]
pub struct PacketConnConfig {
    pub packet_conn: Option<Arc<UdpSocket>>,
    pub relay_address_generator: Option<Arc<dyn RelayAddressGenerator>>,
}

impl PacketConnConfig {
    pub fn new(packet_conn: Arc<UdpSocket>, relay_address_generator: Arc<dyn RelayAddressGenerator>) -> Self {
        Self {
            packet_conn: Some(packet_conn),
            relay_address_generator: Some(relay_address_generator),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.packet_conn.is_none() {
            return Err(ConfigError::ConnUnset);
        }
        match &self.relay_address_generator {
            None => Err(ConfigError::RelayAddressGeneratorUnset),
            Some(generator) => Ok(generator.validate()?),
        }
    }
}

/// Runtime server configuration
#[derive(Clone, Default)]
pub struct ServerConfig {
    pub packet_conn_configs: Vec<PacketConnConfig>,
    pub realm: String,
    pub auth_handler: Option<AuthHandler>,
    /// Zero selects [`DEFAULT_CHANNEL_BIND_TIMEOUT`]
    pub channel_bind_timeout: Duration,
    /// Per listener, `0` for unlimited
    pub max_allocations: usize,
}

impl ServerConfig {
    /// Fail fast on an unusable listener set
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.packet_conn_configs.is_empty() {
            return Err(ConfigError::NoAvailableConns);
        }
        for conn in &self.packet_conn_configs {
            conn.validate()?;
        }
        Ok(())
    }
}

struct Listener {
    local_addr: SocketAddr,
    allocation_manager: Arc<AllocationManager>,
    task: JoinHandle<()>,
}

/// Running TURN server
pub struct TurnServer {
    listeners: Vec<Listener>,
    shutdown_tx: watch::Sender<bool>,
    metrics: Arc<TurnMetrics>,
}

impl TurnServer {
    /// Validate the configuration and spawn one dispatch loop per listener
    pub fn start(config: ServerConfig, handler: Arc<dyn RequestHandler>) -> Result<Self, ConfigError> {
        config.validate()?;

        let metrics = Arc::new(TurnMetrics::new()?);
        let (shutdown_tx, _) = watch::channel(false);
        let realm: Arc<str> = Arc::from(config.realm.as_str());
        let channel_bind_timeout = if config.channel_bind_timeout.is_zero() {
            DEFAULT_CHANNEL_BIND_TIMEOUT
        } else {
            config.channel_bind_timeout
        };

        let mut listeners = Vec::with_capacity(config.packet_conn_configs.len());
        for conn in config.packet_conn_configs {
            let (Some(socket), Some(generator)) = (conn.packet_conn, conn.relay_address_generator) else {
                continue;
            };
            let local_addr = socket.local_addr()?;

            let allocation_manager = Arc::new(AllocationManager::new(ManagerConfig {
                relay_address_generator: generator,
                max_allocations: config.max_allocations,
                metrics: Some(metrics.clone()),
            }));

            let dispatch = DispatchLoop {
                socket,
                local_addr,
                allocation_manager: allocation_manager.clone(),
                handler: handler.clone(),
                realm: realm.clone(),
                channel_bind_timeout,
                auth_handler: config.auth_handler.clone(),
                metrics: metrics.clone(),
                shutdown: shutdown_tx.subscribe(),
            };

            info!("Starting TURN listener on {}", local_addr);
            listeners.push(Listener {
                local_addr,
                allocation_manager,
                task: tokio::spawn(dispatch.run()),
            });
        }

        Ok(Self {
            listeners,
            shutdown_tx,
            metrics,
        })
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().map(|l| l.local_addr).collect()
    }

    /// Allocation manager of the listener bound to `local_addr`
    pub fn allocation_manager(&self, local_addr: SocketAddr) -> Option<&Arc<AllocationManager>> {
        self.listeners
            .iter()
            .find(|l| l.local_addr == local_addr)
            .map(|l| &l.allocation_manager)
    }

    pub fn metrics(&self) -> &Arc<TurnMetrics> {
        &self.metrics
    }

    /// Number of dispatch loops still reading
    pub fn running_listeners(&self) -> usize {
        self.listeners.iter().filter(|l| !l.task.is_finished()).count()
    }

    /// Stop every dispatch loop, wait for it to exit and close all
    /// allocations. Listening sockets are released on return.
    pub async fn close(self) -> Result<(), ServerError> {
        info!("Shutting down TURN server");
        self.shutdown_tx.send_replace(true);

        let mut result = Ok(());
        for listener in self.listeners {
            if let Err(e) = listener.task.await {
                error!(listener = %listener.local_addr, "dispatch loop failed: {}", e);
                if result.is_ok() {
                    result = Err(e.into());
                }
            }
            // The loop closes its manager on exit; repeat in case it panicked
            if let Err(e) = listener.allocation_manager.close().await {
                if result.is_ok() {
                    result = Err(e.into());
                }
            }
        }
        result
    }
}

/// Reads datagrams from one listening socket and hands each to the request handler
struct DispatchLoop {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    allocation_manager: Arc<AllocationManager>,
    handler: Arc<dyn RequestHandler>,
    realm: Arc<str>,
    channel_bind_timeout: Duration,
    auth_handler: Option<AuthHandler>,
    metrics: Arc<TurnMetrics>,
    shutdown: watch::Receiver<bool>,
}

impl DispatchLoop {
    async fn run(mut self) {
        let mut buf = vec![0u8; INBOUND_MTU];

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.changed() => {
                    debug!(listener = %self.local_addr, "dispatch loop stopping");
                    break;
                }
                received = self.socket.recv_from(&mut buf) => {
                    let (n, src_addr) = match received {
                        Ok(received) => received,
                        Err(e) => {
                            error!(listener = %self.local_addr, "exit read loop on error: {}", e);
                            break;
                        }
                    };
                    self.metrics.record_datagram();

                    let request = Request {
                        conn: &self.socket,
                        src_addr,
                        buf: &buf[..n],
                        allocation_manager: &self.allocation_manager,
                        realm: &self.realm,
                        channel_bind_timeout: self.channel_bind_timeout,
                        auth_handler: self.auth_handler.as_ref(),
                    };
                    if let Err(e) = self.handler.handle_request(request).await {
                        warn!(listener = %self.local_addr, client = %src_addr, "error when handling datagram: {:#}", e);
                        self.metrics.record_handler_error();
                    }
                }
            }
        }

        if let Err(e) = self.allocation_manager.close().await {
            error!(listener = %self.local_addr, "failed to close allocations: {}", e);
        }
    }
}
