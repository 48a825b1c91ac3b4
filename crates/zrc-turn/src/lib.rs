//! zrc-turn: TURN relay allocation core for ZRC
//!
//! Listeners read client datagrams and pass them to a protocol
//! [`RequestHandler`], which creates and removes relay allocations through
//! the per-listener [`AllocationManager`]. Each allocation owns a relay
//! socket and forwards traffic arriving on it back to its client.

pub mod allocation;
pub mod config;
pub mod five_tuple;
pub mod forwarder;
pub mod handler;
pub mod metrics;
pub mod relay;
pub mod server;

pub use allocation::{Allocation, AllocationError, AllocationManager, ManagerConfig};
pub use config::{ConfigError, TurnConfig};
pub use five_tuple::{FiveTuple, Fingerprint, Protocol};
pub use handler::{AuthHandler, Request, RequestHandler};
pub use relay::{RelayAddressGenerator, RelayAddressGeneratorRange, RelayAddressGeneratorStatic};
pub use server::{PacketConnConfig, ServerConfig, TurnServer};
