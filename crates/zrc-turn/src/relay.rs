//! Relay address generation
//!
//! A [`RelayAddressGenerator`] decides how the relay socket of a new
//! allocation is bound and which address is advertised to the client for it.
//! Generators are validated once at server startup and then called from the
//! allocation manager for every successful allocation request.

use std::fmt;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::OnceLock;

use rand::Rng;
use thiserror::Error;
use tokio::net::UdpSocket;

/// Default number of random ports tried by [`RelayAddressGeneratorRange`]
pub const DEFAULT_MAX_RETRIES: u16 = 10;

#[derive(Debug, Error)]
pub enum RelayAddressError {
    #[error("relay address must be a valid IP")]
    RelayAddressInvalid,
    #[error("relay generator has an invalid listening address")]
    ListeningAddressInvalid,
    #[error("unsupported relay network: {0:?}")]
    UnsupportedNetwork(String),
    #[error("invalid relay port range {min}-{max}")]
    PortRangeInvalid { min: u16, max: u16 },
    #[error("no free relay port after {0} attempts")]
    MaxRetriesExceeded(u16),
    #[error("relay bind failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Policy for obtaining relay sockets.
///
/// `allocate` runs while the allocation table entry for the requesting
/// client is locked, so implementations must bind synchronously and must not
/// call back into the allocation manager. Sockets are registered with the
/// current Tokio runtime, so allocation must happen inside one.
pub trait RelayAddressGenerator: Send + Sync + fmt::Debug {
    /// Check the static configuration. Called once before any traffic is served.
    fn validate(&self) -> Result<(), RelayAddressError>;

    /// Bind a fresh relay socket, returning it with the address clients should use.
    fn allocate(&self) -> Result<(UdpSocket, SocketAddr), RelayAddressError>;

    /// Like [`allocate`](Self::allocate) with a client-requested port hint.
    /// Generators without port control ignore the hint.
    fn allocate_with_port(
        &self,
        requested_port: u16,
    ) -> Result<(UdpSocket, SocketAddr), RelayAddressError> {
        let _ = requested_port;
        self.allocate()
    }
}

/// Address family restriction of a relay network name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Any,
    V4,
    V6,
}

impl Family {
    fn parse(network: &str) -> Result<Self, RelayAddressError> {
        match network {
            "udp" => Ok(Family::Any),
            "udp4" => Ok(Family::V4),
            "udp6" => Ok(Family::V6),
            other => Err(RelayAddressError::UnsupportedNetwork(other.to_string())),
        }
    }

    fn accepts(self, addr: &SocketAddr) -> bool {
        match self {
            Family::Any => true,
            Family::V4 => addr.is_ipv4(),
            Family::V6 => addr.is_ipv6(),
        }
    }
}

/// Resolve `address` to the first IP matching `network`. IP literals are
/// taken as is; anything else goes through a host lookup.
fn resolve(network: &str, address: &str) -> Result<IpAddr, RelayAddressError> {
    if network.is_empty() || address.is_empty() {
        return Err(RelayAddressError::ListeningAddressInvalid);
    }
    let family = Family::parse(network)?;

    let resolved = match address.parse::<IpAddr>() {
        Ok(ip) => Some(SocketAddr::new(ip, 0)).filter(|addr| family.accepts(addr)),
        Err(_) => (address, 0)
            .to_socket_addrs()
            .map_err(|_| RelayAddressError::ListeningAddressInvalid)?
            .find(|addr| family.accepts(addr)),
    };
    resolved
        .map(|addr| addr.ip())
        .ok_or(RelayAddressError::ListeningAddressInvalid)
}

/// Listening IP of a generator, resolved on first use and reused after
fn cached_bind_ip(
    cache: &OnceLock<IpAddr>,
    network: &str,
    address: &str,
) -> Result<IpAddr, RelayAddressError> {
    if let Some(ip) = cache.get() {
        return Ok(*ip);
    }
    let ip = resolve(network, address)?;
    Ok(*cache.get_or_init(|| ip))
}

/// Bind a relay socket and substitute the advertised IP, keeping the bound port
fn bind_relay(
    bind_addr: SocketAddr,
    relay_address: IpAddr,
) -> Result<(UdpSocket, SocketAddr), std::io::Error> {
    let socket = std::net::UdpSocket::bind(bind_addr)?;
    socket.set_nonblocking(true)?;
    let socket = UdpSocket::from_std(socket)?;

    let mut relay_addr = socket.local_addr()?;
    relay_addr.set_ip(relay_address);
    Ok((socket, relay_addr))
}

/// Returns the same relay IP for every allocation, binding an ephemeral port
/// chosen by the OS on `network`/`address`.
///
/// `network` and `address` are resolved once, by `validate` or the first
/// `allocate`, and not re-read afterwards.
#[derive(Debug, Clone)]
pub struct RelayAddressGeneratorStatic {
    /// IP returned to the client when the relay is created
    pub relay_address: Option<IpAddr>,
    /// `udp`, `udp4` or `udp6`
    pub network: String,
    /// Local address relay sockets are bound on
    pub address: String,
    bind_ip: OnceLock<IpAddr>,
}

impl RelayAddressGeneratorStatic {
    pub fn new(relay_address: IpAddr, network: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            relay_address: Some(relay_address),
            network: network.into(),
            address: address.into(),
            bind_ip: OnceLock::new(),
        }
    }
}

impl RelayAddressGenerator for RelayAddressGeneratorStatic {
    fn validate(&self) -> Result<(), RelayAddressError> {
        if self.relay_address.is_none() {
            return Err(RelayAddressError::RelayAddressInvalid);
        }
        cached_bind_ip(&self.bind_ip, &self.network, &self.address).map(|_| ())
    }

    fn allocate(&self) -> Result<(UdpSocket, SocketAddr), RelayAddressError> {
        let relay_address = self.relay_address.ok_or(RelayAddressError::RelayAddressInvalid)?;
        let bind_ip = cached_bind_ip(&self.bind_ip, &self.network, &self.address)?;
        Ok(bind_relay(SocketAddr::new(bind_ip, 0), relay_address)?)
    }
}

/// Binds relay sockets on random ports within `[min_port, max_port]`.
///
/// A non-zero requested port inside the range is bound exactly; anything
/// else falls back to random selection.
#[derive(Debug, Clone)]
pub struct RelayAddressGeneratorRange {
    pub relay_address: Option<IpAddr>,
    pub min_port: u16,
    /// Inclusive
    pub max_port: u16,
    /// Random ports tried before giving up, `0` means [`DEFAULT_MAX_RETRIES`]
    pub max_retries: u16,
    pub network: String,
    pub address: String,
    bind_ip: OnceLock<IpAddr>,
}

impl RelayAddressGeneratorRange {
    pub fn new(
        relay_address: IpAddr,
        min_port: u16,
        max_port: u16,
        network: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            relay_address: Some(relay_address),
            min_port,
            max_port,
            max_retries: DEFAULT_MAX_RETRIES,
            network: network.into(),
            address: address.into(),
            bind_ip: OnceLock::new(),
        }
    }

    fn in_range(&self, port: u16) -> bool {
        (self.min_port..=self.max_port).contains(&port)
    }
}

impl RelayAddressGenerator for RelayAddressGeneratorRange {
    fn validate(&self) -> Result<(), RelayAddressError> {
        if self.relay_address.is_none() {
            return Err(RelayAddressError::RelayAddressInvalid);
        }
        if self.min_port == 0 || self.min_port > self.max_port {
            return Err(RelayAddressError::PortRangeInvalid {
                min: self.min_port,
                max: self.max_port,
            });
        }
        cached_bind_ip(&self.bind_ip, &self.network, &self.address).map(|_| ())
    }

    fn allocate(&self) -> Result<(UdpSocket, SocketAddr), RelayAddressError> {
        self.allocate_with_port(0)
    }

    fn allocate_with_port(
        &self,
        requested_port: u16,
    ) -> Result<(UdpSocket, SocketAddr), RelayAddressError> {
        let relay_address = self.relay_address.ok_or(RelayAddressError::RelayAddressInvalid)?;
        let bind_ip = cached_bind_ip(&self.bind_ip, &self.network, &self.address)?;

        if requested_port != 0 && self.in_range(requested_port) {
            return Ok(bind_relay(SocketAddr::new(bind_ip, requested_port), relay_address)?);
        }

        let max_retries = if self.max_retries == 0 {
            DEFAULT_MAX_RETRIES
        } else {
            self.max_retries
        };

        let mut rng = rand::thread_rng();
        for _ in 0..max_retries {
            let port = rng.gen_range(self.min_port..=self.max_port);
            if let Ok(bound) = bind_relay(SocketAddr::new(bind_ip, port), relay_address) {
                return Ok(bound);
            }
        }

        Err(RelayAddressError::MaxRetriesExceeded(max_retries))
    }
}
