//! Allocation management for relay sessions
//!
//! The [`AllocationManager`] owns the table of live allocations for one
//! listening socket. Each [`Allocation`] owns a relay socket, a forwarding
//! task that sends relay traffic back to its client and an expiry timer.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::error;

use crate::five_tuple::{FiveTuple, Fingerprint};
use crate::forwarder::{Forwarder, RelayCounters};
use crate::metrics::TurnMetrics;
use crate::relay::{RelayAddressError, RelayAddressGenerator};

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("invalid allocation argument: {0}")]
    InvalidArgument(&'static str),
    #[error("allocation already exists for {0}")]
    Duplicate(FiveTuple),
    #[error("maximum allocations exceeded")]
    MaxAllocations,
    #[error("allocation not found")]
    NotFound,
    #[error("allocation is closed")]
    Closed,
    #[error("relay allocation failed: {0}")]
    Relay(#[from] RelayAddressError),
    #[error("relay I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("relay task failed: {0}")]
    Teardown(#[from] tokio::task::JoinError),
}

/// Allocation information for external use
#[derive(Debug, Clone, Serialize)]
pub struct AllocationInfo {
    pub five_tuple: FiveTuple,
    pub relay_addr: SocketAddr,
    pub age_secs: u64,
    pub lifetime_remaining_secs: u64,
    pub bytes_relayed: u64,
    pub packets_relayed: u64,
}

/// One relay binding for one client
pub struct Allocation {
    id: u64,
    five_tuple: FiveTuple,
    turn_socket: Arc<UdpSocket>,
    relay_addr: SocketAddr,
    relay_socket: Mutex<Option<Arc<UdpSocket>>>,
    created_at: Instant,
    expires_at: Mutex<Instant>,
    counters: Arc<RelayCounters>,
    closed: watch::Sender<bool>,
    lifetime_timer: Mutex<Option<JoinHandle<()>>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl Allocation {
    fn new(
        id: u64,
        five_tuple: FiveTuple,
        turn_socket: Arc<UdpSocket>,
        relay_socket: UdpSocket,
        relay_addr: SocketAddr,
        expires_at: Instant,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            id,
            five_tuple,
            turn_socket,
            relay_addr,
            relay_socket: Mutex::new(Some(Arc::new(relay_socket))),
            created_at: Instant::now(),
            expires_at: Mutex::new(expires_at),
            counters: Arc::new(RelayCounters::default()),
            closed,
            lifetime_timer: Mutex::new(None),
            forwarder: Mutex::new(None),
        }
    }

    pub fn five_tuple(&self) -> &FiveTuple {
        &self.five_tuple
    }

    /// Address advertised to the client for this relay
    pub fn relay_addr(&self) -> SocketAddr {
        self.relay_addr
    }

    /// Listener socket the client's datagrams arrive on
    pub fn turn_socket(&self) -> &Arc<UdpSocket> {
        &self.turn_socket
    }

    pub fn expires_at(&self) -> Instant {
        *self.expires_at.lock()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub fn bytes_relayed(&self) -> u64 {
        self.counters.bytes()
    }

    pub fn packets_relayed(&self) -> u64 {
        self.counters.packets()
    }

    pub fn info(&self) -> AllocationInfo {
        let now = Instant::now();
        AllocationInfo {
            five_tuple: self.five_tuple,
            relay_addr: self.relay_addr,
            age_secs: now.duration_since(self.created_at).as_secs(),
            lifetime_remaining_secs: self.expires_at().saturating_duration_since(now).as_secs(),
            bytes_relayed: self.counters.bytes(),
            packets_relayed: self.counters.packets(),
        }
    }

    /// Send a client payload from the relay socket to a peer
    pub async fn relay_send_to(&self, data: &[u8], peer: SocketAddr) -> Result<usize, AllocationError> {
        let relay_socket = self
            .relay_socket
            .lock()
            .clone()
            .ok_or(AllocationError::Closed)?;
        Ok(relay_socket.send_to(data, peer).await?)
    }

    /// Close the allocation: cancel the expiry timer, release the relay
    /// socket and wait for the forwarding task to exit. Closing twice is a
    /// no-op.
    pub async fn close(&self) -> Result<(), AllocationError> {
        if !self.shutdown() {
            return Ok(());
        }

        let forwarder = self.forwarder.lock().take();
        if let Some(forwarder) = forwarder {
            forwarder.await?;
        }
        Ok(())
    }

    /// Synchronous part of closing. Returns false if already closed.
    fn shutdown(&self) -> bool {
        if self.closed.send_replace(true) {
            return false;
        }
        if let Some(timer) = self.lifetime_timer.lock().take() {
            timer.abort();
        }
        self.relay_socket.lock().take();
        true
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at()
    }

    /// Install a new expiry timer, cancelling the previous one
    fn replace_timer(&self, timer: JoinHandle<()>) {
        let mut slot = self.lifetime_timer.lock();
        if self.is_closed() {
            timer.abort();
            return;
        }
        if let Some(previous) = slot.replace(timer) {
            previous.abort();
        }
    }

    /// Spawn the forwarding task. The handle slot stays locked until the task
    /// is stored, so a concurrent `close` either prevents the spawn or waits
    /// for the task.
    fn start_forwarding(&self, metrics: Option<Arc<TurnMetrics>>) {
        let mut slot = self.forwarder.lock();
        if self.is_closed() || slot.is_some() {
            return;
        }
        let Some(relay_socket) = self.relay_socket.lock().clone() else {
            return;
        };

        let forwarder = Forwarder::new(
            relay_socket,
            self.turn_socket.clone(),
            self.five_tuple.src_addr,
            self.counters.clone(),
            metrics,
            self.closed.subscribe(),
        );
        *slot = Some(tokio::spawn(forwarder.run()));
    }
}

impl std::fmt::Debug for Allocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocation")
            .field("five_tuple", &self.five_tuple)
            .field("relay_addr", &self.relay_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Allocation manager configuration
#[derive(Clone)]
pub struct ManagerConfig {
    pub relay_address_generator: Arc<dyn RelayAddressGenerator>,
    /// `0` disables the limit
    pub max_allocations: usize,
    pub metrics: Option<Arc<TurnMetrics>>,
}

impl ManagerConfig {
    pub fn new(relay_address_generator: Arc<dyn RelayAddressGenerator>) -> Self {
        Self {
            relay_address_generator,
            max_allocations: 0,
            metrics: None,
        }
    }
}

/// Table of live allocations for one listening socket.
///
/// Every operation on a fingerprint is serialised by the map's shard lock;
/// the existence check and the insert of [`create_allocation`] happen under
/// a single acquisition. Relay sockets are bound and allocations are closed
/// outside the lock, so lookups never wait on either.
///
/// [`create_allocation`]: AllocationManager::create_allocation
pub struct AllocationManager {
    allocations: DashMap<Fingerprint, Arc<Allocation>>,
    relay_address_generator: Arc<dyn RelayAddressGenerator>,
    max_allocations: usize,
    live: AtomicUsize,
    next_id: AtomicU64,
    metrics: Option<Arc<TurnMetrics>>,
}

impl AllocationManager {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            allocations: DashMap::with_capacity(64),
            relay_address_generator: config.relay_address_generator,
            max_allocations: config.max_allocations,
            live: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            metrics: config.metrics,
        }
    }

    /// Fetch the allocation matching the five-tuple
    pub fn get_allocation(&self, five_tuple: &FiveTuple) -> Option<Arc<Allocation>> {
        self.allocations
            .get(&five_tuple.fingerprint())
            .map(|entry| entry.value().clone())
    }

    /// Create a new allocation and start relaying.
    ///
    /// `requested_port` is passed to the relay address generator as a hint.
    /// Must be called from within a Tokio runtime.
    pub fn create_allocation(
        self: &Arc<Self>,
        five_tuple: &FiveTuple,
        turn_socket: Arc<UdpSocket>,
        requested_port: u16,
        lifetime: Duration,
    ) -> Result<Arc<Allocation>, AllocationError> {
        if !five_tuple.src_is_set() {
            return Err(AllocationError::InvalidArgument("five-tuple source address is unset"));
        }
        if !five_tuple.dst_is_set() {
            return Err(AllocationError::InvalidArgument("five-tuple destination address is unset"));
        }
        if lifetime.is_zero() {
            return Err(AllocationError::InvalidArgument("lifetime must be positive"));
        }

        let fingerprint = five_tuple.fingerprint();
        // Capacity is read first so a slot taken by a concurrent create for
        // this same tuple is reported as a duplicate
        let at_capacity = self.at_capacity();
        if self.allocations.contains_key(&fingerprint) {
            return Err(AllocationError::Duplicate(*five_tuple));
        }
        if at_capacity {
            return Err(AllocationError::MaxAllocations);
        }

        // Bound without holding the table lock. A socket that loses the race
        // for the entry below is dropped, releasing its port.
        let (relay_socket, relay_addr) = self
            .relay_address_generator
            .allocate_with_port(requested_port)?;

        let allocation = match self.allocations.entry(fingerprint.clone()) {
            Entry::Occupied(_) => return Err(AllocationError::Duplicate(*five_tuple)),
            Entry::Vacant(entry) => {
                self.reserve_slot()?;

                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let deadline = Instant::now() + lifetime;
                let allocation = Arc::new(Allocation::new(
                    id,
                    *five_tuple,
                    turn_socket,
                    relay_socket,
                    relay_addr,
                    deadline,
                ));
                allocation.replace_timer(self.spawn_expiry_timer(fingerprint, id, deadline));

                entry.insert(allocation.clone());
                allocation
            }
        };

        allocation.start_forwarding(self.metrics.clone());
        if let Some(metrics) = &self.metrics {
            metrics.record_allocation_created();
        }
        Ok(allocation)
    }

    /// Re-arm the expiry timer of an allocation. A zero lifetime deletes it.
    pub async fn refresh_allocation(
        self: &Arc<Self>,
        five_tuple: &FiveTuple,
        lifetime: Duration,
    ) -> Result<(), AllocationError> {
        if lifetime.is_zero() {
            self.delete_allocation(five_tuple).await;
            return Ok(());
        }

        let allocation = self
            .get_allocation(five_tuple)
            .ok_or(AllocationError::NotFound)?;

        let deadline = Instant::now() + lifetime;
        *allocation.expires_at.lock() = deadline;
        allocation.replace_timer(self.spawn_expiry_timer(
            five_tuple.fingerprint(),
            allocation.id,
            deadline,
        ));
        Ok(())
    }

    /// Remove an allocation and close it. Unknown tuples are ignored.
    pub async fn delete_allocation(&self, five_tuple: &FiveTuple) {
        let removed = self.allocations.remove(&five_tuple.fingerprint());
        if let Some((_, allocation)) = removed {
            if let Err(e) = self.release(allocation).await {
                error!(client = %five_tuple.src_addr, "failed to close allocation: {}", e);
            }
        }
    }

    /// Close every allocation. The manager stays usable.
    ///
    /// All allocations are closed even if some fail; the first failure is
    /// returned.
    pub async fn close(&self) -> Result<(), AllocationError> {
        let mut drained = Vec::new();
        self.allocations.retain(|_, allocation| {
            drained.push(allocation.clone());
            false
        });

        let mut result = Ok(());
        for allocation in drained {
            let client = allocation.five_tuple.src_addr;
            if let Err(e) = self.release(allocation).await {
                error!(client = %client, "failed to close allocation: {}", e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Get current allocation count
    pub fn count(&self) -> usize {
        self.allocations.len()
    }

    /// Get all allocations
    pub fn list(&self) -> Vec<AllocationInfo> {
        self.allocations
            .iter()
            .map(|entry| entry.value().info())
            .collect()
    }

    fn at_capacity(&self) -> bool {
        self.max_allocations > 0 && self.live.load(Ordering::Acquire) >= self.max_allocations
    }

    fn reserve_slot(&self) -> Result<(), AllocationError> {
        let previous = self.live.fetch_add(1, Ordering::AcqRel);
        if self.max_allocations > 0 && previous >= self.max_allocations {
            self.live.fetch_sub(1, Ordering::AcqRel);
            return Err(AllocationError::MaxAllocations);
        }
        Ok(())
    }

    /// Close an allocation already removed from the table
    async fn release(&self, allocation: Arc<Allocation>) -> Result<(), AllocationError> {
        self.live.fetch_sub(1, Ordering::AcqRel);
        if let Some(metrics) = &self.metrics {
            metrics.record_allocation_terminated(allocation.created_at.elapsed());
        }
        allocation.close().await
    }

    fn spawn_expiry_timer(
        self: &Arc<Self>,
        fingerprint: Fingerprint,
        id: u64,
        deadline: Instant,
    ) -> JoinHandle<()> {
        let manager: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let Some(manager) = manager.upgrade() else {
                return;
            };
            // Detached so that closing the allocation cannot abort the deletion midway
            tokio::spawn(async move {
                manager.expire_allocation(&fingerprint, id).await;
            });
        })
    }

    /// Remove the allocation only if it is the one the timer was armed for
    /// and its deadline has not been pushed back by a refresh.
    async fn expire_allocation(&self, fingerprint: &Fingerprint, id: u64) {
        let removed = self
            .allocations
            .remove_if(fingerprint, |_, allocation| allocation.id == id && allocation.is_expired());

        if let Some((_, allocation)) = removed {
            if let Some(metrics) = &self.metrics {
                metrics.record_allocation_expired();
            }
            let client = allocation.five_tuple.src_addr;
            if let Err(e) = self.release(allocation).await {
                error!(client = %client, "failed to close expired allocation: {}", e);
            }
        }
    }
}

impl Drop for AllocationManager {
    fn drop(&mut self) {
        // Forwarding tasks outlive the manager unless told to stop
        for entry in self.allocations.iter() {
            entry.value().shutdown();
        }
    }
}
