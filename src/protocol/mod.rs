//! Wire formats of the mesh.
//!
//! Three layers share this module: the client packet framer
//! (`[type:1][len:3 BE][payload]`), the application message codec
//! multiplexed inside data packets, and the tagged binary rpc records
//! exchanged between servers. All decoding is incremental and never
//! consumes a partial frame.

pub use message::{Message, MessageKind, RouteDictionary, MSG_HEAD_LEN};
pub use packet::{Packet, PacketType, HEARTBEAT_PACKET, MAX_PACKET_BODY, PACKET_HEAD_LEN};
pub use route::Route;
pub use rpc::{
    RpcFrame, RpcKind, RpcRequest, RpcResponse, RpcResponseKind, CONNECTION_PING_ROUTE,
    SESSION_CLOSED_ROUTE,
};

mod message;
mod packet;
mod route;
mod rpc;
