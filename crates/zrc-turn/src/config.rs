//! Configuration management

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::UdpSocket;

use crate::handler::auth_from_users;
use crate::relay::{RelayAddressError, RelayAddressGenerator, RelayAddressGeneratorStatic};
use crate::server::{PacketConnConfig, ServerConfig};

/// Default TURN listening port
pub const DEFAULT_UDP_PORT: u16 = 3478;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no listeners configured, unable to proceed")]
    NoAvailableConns,
    #[error("listener config must have a socket")]
    ConnUnset,
    #[error("relay address generator of listener config is unset")]
    RelayAddressGeneratorUnset,
    #[error("invalid relay address generator: {0}")]
    RelayAddress(#[from] RelayAddressError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// One UDP listener and how relay sockets for its clients are bound
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub listen_addr: SocketAddr,
    /// IP advertised to clients for relay sockets
    pub relay_address: IpAddr,
    #[serde(default = "default_network")]
    pub network: String,
    /// Local address relay sockets are bound on
    #[serde(default = "default_relay_bind")]
    pub address: String,
}

fn default_network() -> String {
    "udp4".to_string()
}

fn default_relay_bind() -> String {
    "0.0.0.0".to_string()
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), DEFAULT_UDP_PORT),
            relay_address: Ipv4Addr::LOCALHOST.into(),
            network: default_network(),
            address: "127.0.0.1".to_string(),
        }
    }
}

impl ListenerConfig {
    pub fn relay_address_generator(&self) -> RelayAddressGeneratorStatic {
        RelayAddressGeneratorStatic::new(self.relay_address, self.network.clone(), self.address.clone())
    }
}

/// TURN server configuration as loaded from TOML and the environment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    pub realm: String,
    pub channel_bind_timeout_secs: u64,
    /// Per listener, `0` for unlimited
    pub max_allocations: usize,
    pub users: HashMap<String, String>,
    pub listeners: Vec<ListenerConfig>,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            realm: "zrc".to_string(),
            channel_bind_timeout_secs: 600, // 10 minutes
            max_allocations: 0,
            users: HashMap::new(),
            listeners: vec![ListenerConfig::default()],
        }
    }
}

impl TurnConfig {
    /// Load from the TOML file named by `ZRC_TURN_CONFIG` (if any), apply
    /// environment overrides and validate
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("ZRC_TURN_CONFIG") {
            Ok(path) => Self::from_toml(path)?,
            Err(_) => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Apply `ZRC_TURN_*` overrides read through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(realm) = lookup("ZRC_TURN_REALM") {
            self.realm = realm;
        }

        if let Some(users) = lookup("ZRC_TURN_USERS") {
            self.users = parse_users(&users)?;
        }

        if let Some(timeout) = lookup("ZRC_TURN_CHANNEL_BIND_TIMEOUT") {
            self.channel_bind_timeout_secs = timeout
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("Invalid channel bind timeout: {}", e)))?;
        }

        if let Some(max) = lookup("ZRC_TURN_MAX_ALLOCATIONS") {
            self.max_allocations = max
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("Invalid max_allocations: {}", e)))?;
        }

        if let Some(port) = lookup("ZRC_TURN_UDP_PORT") {
            let port: u16 = port
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("Invalid UDP port: {}", e)))?;
            if self.listeners.is_empty() {
                self.listeners.push(ListenerConfig::default());
            }
            self.listeners[0].listen_addr.set_port(port);
        }

        if let Some(ip) = lookup("ZRC_TURN_PUBLIC_IP") {
            let ip: IpAddr = ip
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("Invalid public IP: {}", e)))?;
            for listener in &mut self.listeners {
                listener.relay_address = ip;
            }
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.realm.is_empty() {
            return Err(ConfigError::Invalid("realm must be set".to_string()));
        }

        if self.listeners.is_empty() {
            return Err(ConfigError::NoAvailableConns);
        }

        for listener in &self.listeners {
            listener.relay_address_generator().validate()?;
        }

        Ok(())
    }

    pub fn channel_bind_timeout(&self) -> Duration {
        Duration::from_secs(self.channel_bind_timeout_secs)
    }

    /// Bind every listener and assemble the runtime server configuration
    pub async fn build(&self) -> Result<ServerConfig, ConfigError> {
        self.validate()?;

        let mut packet_conn_configs = Vec::with_capacity(self.listeners.len());
        for listener in &self.listeners {
            let socket = UdpSocket::bind(listener.listen_addr).await?;
            let generator: Arc<dyn RelayAddressGenerator> = Arc::new(listener.relay_address_generator());
            packet_conn_configs.push(PacketConnConfig::new(Arc::new(socket), generator));
        }

        Ok(ServerConfig {
            packet_conn_configs,
            realm: self.realm.clone(),
            auth_handler: Some(auth_from_users(self.users.clone())),
            channel_bind_timeout: self.channel_bind_timeout(),
            max_allocations: self.max_allocations,
        })
    }
}

/// Parse `user=pass` pairs separated by commas or whitespace
fn parse_users(value: &str) -> Result<HashMap<String, String>, ConfigError> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((user, pass)) if !user.is_empty() => Ok((user.to_string(), pass.to_string())),
            _ => Err(ConfigError::Invalid(format!("Invalid user entry: {:?}", pair))),
        })
        .collect()
}
