use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use super::NetworkEntity;
use crate::protocol::Route;
use crate::{AppError, AppResult};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Typed value stored in a session's key/value store.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionValue {
    Int(i64),
    Uint(u64),
    Float(f64),
    Bool(bool),
    Str(String),
    Bytes(Bytes),
}

/// A logical client session, referenced consistently across a frontend
/// connection and any number of backend bridges.
///
/// The key/value store and `last_request_id` are written only by the single
/// dispatch task that owns the session's connection; the locks exist for
/// memory safety, not for cross-task write contention.
pub struct Session {
    id: u64,
    uid: AtomicI64,
    /// id of the last request-kind message received; 0 means the
    /// triggering message was a notify and the next reply must be a push
    last_request_id: AtomicU64,
    data: RwLock<HashMap<String, SessionValue>>,
    /// server-type → sticky server-id, consulted by cluster resolution
    sticky: Mutex<HashMap<String, String>>,
    /// weak back-reference: the entity owns the session, never the reverse
    entity: Weak<dyn NetworkEntity>,
}

impl Session {
    pub fn new(entity: Weak<dyn NetworkEntity>) -> Session {
        Session {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            uid: AtomicI64::new(0),
            last_request_id: AtomicU64::new(0),
            data: RwLock::new(HashMap::new()),
            sticky: Mutex::new(HashMap::new()),
            entity,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Application-bound identity, 0 while unbound.
    pub fn uid(&self) -> i64 {
        self.uid.load(Ordering::Relaxed)
    }

    /// Binds an application identity to the session. Rebinding overwrites;
    /// a uid below 1 is rejected, so a bound session never returns to 0.
    pub fn bind(&self, uid: i64) -> AppResult<()> {
        if uid < 1 {
            return Err(AppError::IllegalUid(uid));
        }
        self.uid.store(uid, Ordering::Relaxed);
        Ok(())
    }

    pub fn last_request_id(&self) -> u64 {
        self.last_request_id.load(Ordering::Relaxed)
    }

    pub fn set_last_request_id(&self, id: u64) {
        self.last_request_id.store(id, Ordering::Relaxed);
    }

    fn entity(&self) -> AppResult<Arc<dyn NetworkEntity>> {
        self.entity.upgrade().ok_or(AppError::SessionGone(self.id))
    }

    // ---- key/value store ----

    pub fn set(&self, key: impl Into<String>, value: SessionValue) {
        self.data.write().insert(key.into(), value);
    }

    pub fn remove(&self, key: &str) -> Option<SessionValue> {
        self.data.write().remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.read().contains_key(key)
    }

    fn lookup(&self, key: &str) -> AppResult<SessionValue> {
        self.data
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| AppError::KeyNotFound(key.to_string()))
    }

    pub fn int(&self, key: &str) -> AppResult<i64> {
        match self.lookup(key)? {
            SessionValue::Int(v) => Ok(v),
            _ => Err(AppError::WrongType(key.to_string())),
        }
    }

    pub fn uint(&self, key: &str) -> AppResult<u64> {
        match self.lookup(key)? {
            SessionValue::Uint(v) => Ok(v),
            _ => Err(AppError::WrongType(key.to_string())),
        }
    }

    pub fn float(&self, key: &str) -> AppResult<f64> {
        match self.lookup(key)? {
            SessionValue::Float(v) => Ok(v),
            _ => Err(AppError::WrongType(key.to_string())),
        }
    }

    pub fn boolean(&self, key: &str) -> AppResult<bool> {
        match self.lookup(key)? {
            SessionValue::Bool(v) => Ok(v),
            _ => Err(AppError::WrongType(key.to_string())),
        }
    }

    pub fn string(&self, key: &str) -> AppResult<String> {
        match self.lookup(key)? {
            SessionValue::Str(v) => Ok(v),
            _ => Err(AppError::WrongType(key.to_string())),
        }
    }

    pub fn bytes(&self, key: &str) -> AppResult<Bytes> {
        match self.lookup(key)? {
            SessionValue::Bytes(v) => Ok(v),
            _ => Err(AppError::WrongType(key.to_string())),
        }
    }

    // ---- sticky routing ----

    pub fn sticky_server(&self, server_type: &str) -> Option<String> {
        self.sticky.lock().get(server_type).cloned()
    }

    pub fn set_sticky_server(&self, server_type: impl Into<String>, server_id: impl Into<String>) {
        self.sticky
            .lock()
            .insert(server_type.into(), server_id.into());
    }

    pub fn clear_sticky_server(&self, server_type: &str) {
        self.sticky.lock().remove(server_type);
    }

    // ---- entity forwarding ----

    pub async fn push(&self, route: &str, payload: Bytes) -> AppResult<()> {
        self.entity()?.push(self, route, payload).await
    }

    /// Replies to the pending request. Enforced before any encode or send:
    /// when the triggering message was a notify there is no reply channel.
    pub async fn response(&self, payload: Bytes) -> AppResult<()> {
        if self.last_request_id() == 0 {
            return Err(AppError::NotifyMode(self.id));
        }
        self.entity()?.response(self, payload).await
    }

    pub async fn call(&self, route: Route, payload: Bytes) -> AppResult<Bytes> {
        self.entity()?.call(self, route, payload).await
    }

    pub async fn close(&self) {
        if let Ok(entity) = self.entity() {
            entity.close().await;
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("uid", &self.uid())
            .field("last_request_id", &self.last_request_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detached_session() -> Session {
        // a session whose entity is already gone
        Session::new(Weak::<crate::network::Acceptor>::new())
    }

    #[test]
    fn test_ids_are_unique_and_monotonic() {
        let a = detached_session();
        let b = detached_session();
        assert!(b.id() > a.id());
    }

    #[test]
    fn test_bind_rejects_illegal_uid() {
        let session = detached_session();
        assert!(matches!(session.bind(0), Err(AppError::IllegalUid(0))));
        assert!(matches!(session.bind(-3), Err(AppError::IllegalUid(-3))));
        session.bind(7).unwrap();
        assert_eq!(session.uid(), 7);
        // rebind overwrites
        session.bind(9).unwrap();
        assert_eq!(session.uid(), 9);
    }

    #[test]
    fn test_typed_accessors() {
        let session = detached_session();
        session.set("hp", SessionValue::Int(42));
        session.set("name", SessionValue::Str("kael".to_string()));
        assert_eq!(session.int("hp").unwrap(), 42);
        assert_eq!(session.string("name").unwrap(), "kael");
        assert!(matches!(
            session.int("name"),
            Err(AppError::WrongType(_))
        ));
        assert!(matches!(
            session.uint("missing"),
            Err(AppError::KeyNotFound(_))
        ));
        session.remove("hp");
        assert!(!session.contains("hp"));
    }

    #[tokio::test]
    async fn test_response_in_notify_mode_fails() {
        let session = detached_session();
        session.set_last_request_id(0);
        assert!(matches!(
            session.response(Bytes::new()).await,
            Err(AppError::NotifyMode(_))
        ));
    }

    #[tokio::test]
    async fn test_gone_entity_reported() {
        let session = detached_session();
        session.set_last_request_id(5);
        assert!(matches!(
            session.response(Bytes::new()).await,
            Err(AppError::SessionGone(_))
        ));
        assert!(matches!(
            session.push("chat.said", Bytes::new()).await,
            Err(AppError::SessionGone(_))
        ));
    }

    #[test]
    fn test_sticky_routing_store() {
        let session = detached_session();
        assert!(session.sticky_server("game").is_none());
        session.set_sticky_server("game", "game-1");
        assert_eq!(session.sticky_server("game").unwrap(), "game-1");
        session.clear_sticky_server("game");
        assert!(session.sticky_server("game").is_none());
    }
}
