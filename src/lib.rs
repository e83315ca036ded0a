mod cluster;
mod dispatch;
mod network;
mod protocol;
mod serializer;
mod service;
mod session;

pub use cluster::{ClientState, ClusterRegistry, RouterFn, RpcClientOptions, ServerInfo};
pub use dispatch::{HandlerRegistry, HandlerService, RemoteRegistry, RemoteService};
pub use network::{Acceptor, Agent, AgentStatus, PacketConnection, RpcConnection};
pub use protocol::{
    Message, MessageKind, Packet, PacketType, Route, RouteDictionary, RpcFrame, RpcKind,
    RpcRequest, RpcResponse, RpcResponseKind, HEARTBEAT_PACKET, SESSION_CLOSED_ROUTE,
};
pub use serializer::{JsonSerializer, Serializer};
pub use service::{
    global_config, setup_local_tracing, setup_tracing, App, AppError, AppResult, MeshConfig,
    NetworkConfig, NodeConfig, Shutdown, GLOBAL_CONFIG,
};
pub use session::{NetworkEntity, Session, SessionDirectory, SessionValue};
