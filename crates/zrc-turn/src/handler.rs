//! Boundary between the dispatch loop and the TURN protocol layer
//!
//! The relay core does not parse STUN/TURN messages. Every datagram read by a
//! listener is handed to a [`RequestHandler`], which decides whether to
//! create, refresh, look up or delete allocations.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;

use crate::allocation::AllocationManager;
use crate::five_tuple::FiveTuple;

/// Looks up the password for `username` connecting from `src_addr`.
/// Returns `None` for unknown users.
pub type AuthHandler = Arc<dyn Fn(&str, SocketAddr) -> Option<String> + Send + Sync>;

/// Build an [`AuthHandler`] over a static user table
pub fn auth_from_users(users: HashMap<String, String>) -> AuthHandler {
    Arc::new(move |username: &str, _src_addr: SocketAddr| users.get(username).cloned())
}

/// One inbound datagram and the listener context it arrived in
pub struct Request<'a> {
    /// Listening socket the datagram was read from. Shared with every
    /// allocation's forwarding task, which write to it concurrently.
    pub conn: &'a Arc<UdpSocket>,
    pub src_addr: SocketAddr,
    pub buf: &'a [u8],
    pub allocation_manager: &'a Arc<AllocationManager>,
    pub realm: &'a str,
    pub channel_bind_timeout: Duration,
    pub auth_handler: Option<&'a AuthHandler>,
}

impl Request<'_> {
    /// Five-tuple of this datagram's conversation
    pub fn five_tuple(&self) -> std::io::Result<FiveTuple> {
        Ok(FiveTuple::udp(self.src_addr, self.conn.local_addr()?))
    }

    /// Resolve credentials through the configured auth callback
    pub fn authenticate(&self, username: &str) -> Option<String> {
        self.auth_handler
            .and_then(|auth| auth(username, self.src_addr))
    }
}

/// Protocol-processing collaborator invoked once per inbound datagram.
///
/// Errors are logged by the dispatch loop and never stop it.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle_request(&self, request: Request<'_>) -> anyhow::Result<()>;
}
