//! Cluster directory and rpc connection management.
//!
//! The registry owns the authoritative server directory, the per-type index
//! used for routing-policy resolution, and the lazily populated rpc client
//! pool. Clients demultiplex asynchronous responses back to the sessions
//! that originated the calls.

pub use registry::{ClusterRegistry, RouterFn, RpcClientOptions, ServerInfo};
pub use rpc_client::{ClientState, RpcClient};

mod registry;
mod rpc_client;
