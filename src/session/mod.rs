use std::sync::Arc;

use dashmap::DashMap;

pub use entity::NetworkEntity;
pub use session::{Session, SessionValue};

/// Live frontend sessions keyed by session id, owned by the application
/// context and shared with the rpc demultiplexers.
pub type SessionDirectory = DashMap<u64, Arc<Session>>;

mod entity;
mod session;
