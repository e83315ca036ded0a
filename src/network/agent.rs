use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use bytes::Bytes;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use super::AgentDirectory;
use crate::cluster::ClusterRegistry;
use crate::protocol::{Message, Packet, PacketType, Route, HEARTBEAT_PACKET};
use crate::session::{NetworkEntity, Session, SessionDirectory};
use crate::{AppError, AppResult};

/// Lifecycle of a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AgentStatus {
    Start = 0,
    Handshake = 1,
    Working = 2,
    Closed = 3,
}

impl AgentStatus {
    fn from_u8(value: u8) -> AgentStatus {
        match value {
            1 => AgentStatus::Handshake,
            2 => AgentStatus::Working,
            3 => AgentStatus::Closed,
            _ => AgentStatus::Start,
        }
    }
}

/// Frontend endpoint owning one live client socket and exactly one session.
pub struct Agent {
    session: Arc<Session>,
    writer: Mutex<BufWriter<OwnedWriteHalf>>,
    status: AtomicU8,
    last_contact: parking_lot::Mutex<Instant>,
    close_notify: Notify,
    cluster: Arc<ClusterRegistry>,
    sessions: Arc<SessionDirectory>,
    agents: Arc<AgentDirectory>,
}

impl Agent {
    pub fn new(
        writer: OwnedWriteHalf,
        cluster: Arc<ClusterRegistry>,
        sessions: Arc<SessionDirectory>,
        agents: Arc<AgentDirectory>,
    ) -> Arc<Agent> {
        Arc::new_cyclic(|weak: &Weak<Agent>| {
            let entity: Weak<dyn NetworkEntity> = weak.clone();
            Agent {
                session: Arc::new(Session::new(entity)),
                writer: Mutex::new(BufWriter::new(writer)),
                status: AtomicU8::new(AgentStatus::Start as u8),
                last_contact: parking_lot::Mutex::new(Instant::now()),
                close_notify: Notify::new(),
                cluster,
                sessions,
                agents,
            }
        })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn status(&self) -> AgentStatus {
        AgentStatus::from_u8(self.status.load(Ordering::Relaxed))
    }

    pub fn set_status(&self, status: AgentStatus) {
        self.status.store(status as u8, Ordering::Relaxed);
    }

    /// Stamps last-contact time; called for every inbound packet.
    pub fn heartbeat(&self) {
        *self.last_contact.lock() = Instant::now();
    }

    pub fn last_contact(&self) -> Instant {
        *self.last_contact.lock()
    }

    /// Resolves when `close` has run; the read loop selects on this.
    pub async fn closed(&self) {
        self.close_notify.notified().await;
    }

    /// One heartbeat probe toward the client, reusing the precomputed
    /// packet.
    pub async fn send_heartbeat(&self) -> AppResult<()> {
        self.send_raw(HEARTBEAT_PACKET).await
    }

    async fn send_raw(&self, data: Bytes) -> AppResult<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(&data).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl NetworkEntity for Agent {
    fn id(&self) -> u64 {
        self.session.id()
    }

    async fn send(&self, data: Bytes) -> AppResult<()> {
        if self.status() == AgentStatus::Closed {
            return Err(AppError::IllegalState(format!(
                "agent for session {} is closed",
                self.session.id()
            )));
        }
        self.send_raw(data).await
    }

    async fn push(&self, _session: &Session, route: &str, payload: Bytes) -> AppResult<()> {
        let message = Message::push(route, payload).encode()?;
        self.send(Packet::pack(PacketType::Data, &message)?).await
    }

    async fn response(&self, session: &Session, payload: Bytes) -> AppResult<()> {
        let message = Message::response(session.last_request_id(), payload).encode()?;
        self.send(Packet::pack(PacketType::Data, &message)?).await
    }

    async fn call(&self, session: &Session, route: Route, payload: Bytes) -> AppResult<Bytes> {
        self.cluster.call_sys(session, &route, payload).await
    }

    /// Idempotent teardown: kick the client, deregister the session, and
    /// notify every backend type that the session closed. Notification is
    /// best-effort; the session is already gone.
    async fn close(&self) {
        let previous = self
            .status
            .swap(AgentStatus::Closed as u8, Ordering::Relaxed);
        if previous == AgentStatus::Closed as u8 {
            return;
        }
        debug!("closing agent for session {}", self.session.id());

        if let Ok(kick) = Packet::pack(PacketType::Kick, b"") {
            if let Err(e) = self.send_raw(kick).await {
                debug!("kick for session {} not delivered: {}", self.session.id(), e);
            }
        }

        self.agents.remove(&self.session.id());
        self.sessions.remove(&self.session.id());
        self.cluster.notify_session_closed(&self.session).await;

        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.shutdown().await {
                warn!("socket shutdown for session {}: {}", self.session.id(), e);
            }
        }
        self.close_notify.notify_one();
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("session", &self.session.id())
            .field("status", &self.status())
            .finish()
    }
}
