use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use bytes::Bytes;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use super::AcceptorDirectory;
use crate::protocol::{Route, RpcFrame, RpcResponse, RpcResponseKind};
use crate::session::{NetworkEntity, Session};
use crate::{AppError, AppResult};

static NEXT_ACCEPTOR_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Default)]
struct Bridge {
    /// local session id → bridged session
    sessions: HashMap<u64, Arc<Session>>,
    frontend_to_local: HashMap<u64, u64>,
    local_to_frontend: HashMap<u64, u64>,
}

/// Backend endpoint owning one inbound rpc link from a frontend server and
/// multiplexing every session bridged over it.
///
/// Both bridging maps are injective and always mutated together under one
/// lock: a local session has exactly one frontend-id mapping and vice versa.
pub struct Acceptor {
    id: u64,
    writer: Mutex<BufWriter<OwnedWriteHalf>>,
    bridge: parking_lot::Mutex<Bridge>,
    last_contact: parking_lot::Mutex<Instant>,
    close_notify: Notify,
    closed: AtomicBool,
    acceptors: Arc<AcceptorDirectory>,
}

impl Acceptor {
    pub fn new(writer: OwnedWriteHalf, acceptors: Arc<AcceptorDirectory>) -> Arc<Acceptor> {
        Arc::new(Acceptor {
            id: NEXT_ACCEPTOR_ID.fetch_add(1, Ordering::Relaxed),
            writer: Mutex::new(BufWriter::new(writer)),
            bridge: parking_lot::Mutex::new(Bridge::default()),
            last_contact: parking_lot::Mutex::new(Instant::now()),
            close_notify: Notify::new(),
            closed: AtomicBool::new(false),
            acceptors,
        })
    }

    /// Returns the bridged session for a frontend session id, creating it
    /// (with a fresh local id and both map directions) on first reference.
    pub fn session_for(self: &Arc<Self>, frontend_id: u64) -> Arc<Session> {
        let mut bridge = self.bridge.lock();
        if let Some(local_id) = bridge.frontend_to_local.get(&frontend_id) {
            return bridge.sessions[local_id].clone();
        }
        let this: Arc<dyn NetworkEntity> = self.clone();
        let entity: Weak<dyn NetworkEntity> = Arc::downgrade(&this);
        let session = Arc::new(Session::new(entity));
        let local_id = session.id();
        bridge.frontend_to_local.insert(frontend_id, local_id);
        bridge.local_to_frontend.insert(local_id, frontend_id);
        bridge.sessions.insert(local_id, session.clone());
        session
    }

    /// Frontend id of a bridged session, if the mapping exists.
    pub fn frontend_id_of(&self, local_id: u64) -> Option<u64> {
        self.bridge.lock().local_to_frontend.get(&local_id).copied()
    }

    /// Removes the bridged session and both map directions atomically.
    pub fn close_session(&self, frontend_id: u64) -> Option<Arc<Session>> {
        let mut bridge = self.bridge.lock();
        let local_id = bridge.frontend_to_local.remove(&frontend_id)?;
        bridge.local_to_frontend.remove(&local_id);
        bridge.sessions.remove(&local_id)
    }

    pub fn session_count(&self) -> usize {
        self.bridge.lock().sessions.len()
    }

    pub fn heartbeat(&self) {
        *self.last_contact.lock() = Instant::now();
    }

    pub fn last_contact(&self) -> Instant {
        *self.last_contact.lock()
    }

    pub async fn closed(&self) {
        self.close_notify.notified().await;
    }

    fn response_for(&self, session: &Session, kind: RpcResponseKind) -> AppResult<RpcResponse> {
        let frontend_id = self
            .frontend_id_of(session.id())
            .ok_or(AppError::SessionGone(session.id()))?;
        Ok(RpcResponse {
            kind,
            seq: 0,
            session_id: frontend_id,
            route: String::new(),
            error: String::new(),
            payload: Bytes::new(),
        })
    }
}

#[async_trait::async_trait]
impl NetworkEntity for Acceptor {
    fn id(&self) -> u64 {
        self.id
    }

    async fn send(&self, data: Bytes) -> AppResult<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(AppError::IllegalState(format!(
                "acceptor {} is closed",
                self.id
            )));
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(&data).await?;
        writer.flush().await?;
        Ok(())
    }

    /// A backend push travels to the frontend as a push-kind response
    /// addressed by the session's frontend id.
    async fn push(&self, session: &Session, route: &str, payload: Bytes) -> AppResult<()> {
        let mut response = self.response_for(session, RpcResponseKind::Push)?;
        response.route = route.to_string();
        response.payload = payload;
        self.send(RpcFrame::frame(response.encode())).await
    }

    async fn response(&self, session: &Session, payload: Bytes) -> AppResult<()> {
        let mut response = self.response_for(session, RpcResponseKind::Response)?;
        response.payload = payload;
        self.send(RpcFrame::frame(response.encode())).await
    }

    async fn call(&self, session: &Session, _route: Route, _payload: Bytes) -> AppResult<Bytes> {
        Err(AppError::IllegalState(format!(
            "session {} is backend-bridged and cannot originate calls",
            session.id()
        )))
    }

    /// Closes every bridged session, then deregisters from the connection
    /// directory.
    async fn close(&self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        let dropped = {
            let mut bridge = self.bridge.lock();
            bridge.frontend_to_local.clear();
            bridge.local_to_frontend.clear();
            std::mem::take(&mut bridge.sessions)
        };
        debug!(
            "acceptor {} closing with {} bridged sessions",
            self.id,
            dropped.len()
        );
        self.acceptors.remove(&self.id);
        {
            let mut writer = self.writer.lock().await;
            let _ = writer.shutdown().await;
        }
        self.close_notify.notify_one();
    }
}

impl std::fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acceptor")
            .field("id", &self.id)
            .field("sessions", &self.session_count())
            .finish()
    }
}
