//! Connection endpoints and read-side buffering.
//!
//! An `Agent` fronts one client socket on a frontend server; an `Acceptor`
//! fronts one inbound rpc link on a backend server and multiplexes the
//! sessions bridged over it. The watchdog closes whichever of them goes
//! silent past the heartbeat deadline.

use std::sync::Arc;

use dashmap::DashMap;

pub use acceptor::Acceptor;
pub use agent::{Agent, AgentStatus};
pub use connection::{PacketConnection, RpcConnection};
pub use watchdog::start_watchdog;

/// Live agents keyed by session id.
pub type AgentDirectory = DashMap<u64, Arc<Agent>>;
/// Live acceptors keyed by acceptor id.
pub type AcceptorDirectory = DashMap<u64, Arc<Acceptor>>;

mod acceptor;
mod agent;
mod connection;
mod watchdog;
