use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use super::rpc_client::RpcClient;
use crate::protocol::{Route, RpcKind, RpcRequest, SESSION_CLOSED_ROUTE};
use crate::session::{Session, SessionDirectory};
use crate::{AppError, AppResult};

/// Directory record of one server in the mesh. Immutable once registered
/// except through [`ClusterRegistry::update_server`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub server_type: String,
    pub server_id: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub frontend: bool,
    #[serde(default)]
    pub master: bool,
}

impl ServerInfo {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// User-supplied routing policy for one server type: picks a server id among
/// the live candidates, optionally using session context.
pub type RouterFn =
    Arc<dyn Fn(&[ServerInfo], Option<&Session>) -> Option<String> + Send + Sync>;

/// Tuning knobs the registry passes to every client it dials.
#[derive(Debug, Clone)]
pub struct RpcClientOptions {
    pub buffer_size: usize,
    pub max_record: usize,
    pub ping_interval: Duration,
}

impl Default for RpcClientOptions {
    fn default() -> Self {
        RpcClientOptions {
            buffer_size: 4 * 1024,
            max_record: 1 << 20,
            ping_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Default)]
struct ClusterState {
    servers: HashMap<String, ServerInfo>,
    by_type: HashMap<String, Vec<String>>,
    clients: HashMap<String, Arc<RpcClient>>,
}

/// Authoritative server directory plus the rpc client-connection pool.
///
/// All membership mutation and client open/close is serialized under one
/// read-write lock; lookups proceed concurrently. Removing a server and
/// closing its client is a single atomic sequence, so a lookup never
/// observes a directory entry whose client is already torn down.
pub struct ClusterRegistry {
    local: ServerInfo,
    state: RwLock<ClusterState>,
    routers: parking_lot::RwLock<HashMap<String, RouterFn>>,
    sessions: Arc<SessionDirectory>,
    options: RpcClientOptions,
}

impl ClusterRegistry {
    pub fn new(
        local: ServerInfo,
        sessions: Arc<SessionDirectory>,
        options: RpcClientOptions,
    ) -> Arc<ClusterRegistry> {
        Arc::new(ClusterRegistry {
            local,
            state: RwLock::new(ClusterState::default()),
            routers: parking_lot::RwLock::new(HashMap::new()),
            sessions,
            options,
        })
    }

    pub fn local(&self) -> &ServerInfo {
        &self.local
    }

    /// Registers a routing policy consulted for the given server type before
    /// falling back to uniform random selection.
    pub fn set_router(&self, server_type: impl Into<String>, router: RouterFn) {
        self.routers.write().insert(server_type.into(), router);
    }

    pub async fn register_server(&self, info: ServerInfo) {
        let mut state = self.state.write().await;
        info!("registering server {} ({})", info.server_id, info.server_type);
        let ids = state.by_type.entry(info.server_type.clone()).or_default();
        ids.retain(|id| id != &info.server_id);
        ids.push(info.server_id.clone());
        state.servers.insert(info.server_id.clone(), info);
    }

    /// Replaces a directory record; any pooled client is closed so the next
    /// lookup redials the updated address.
    pub async fn update_server(&self, info: ServerInfo) {
        let mut state = self.state.write().await;
        if let Some(client) = state.clients.remove(&info.server_id) {
            client.close().await;
        }
        if let Some(previous) = state.servers.remove(&info.server_id) {
            if let Some(ids) = state.by_type.get_mut(&previous.server_type) {
                ids.retain(|id| id != &info.server_id);
            }
        }
        state
            .by_type
            .entry(info.server_type.clone())
            .or_default()
            .push(info.server_id.clone());
        state.servers.insert(info.server_id.clone(), info);
    }

    pub async fn remove_server(&self, server_id: &str) {
        let mut state = self.state.write().await;
        Self::remove_locked(&mut state, server_id).await;
    }

    async fn remove_locked(state: &mut ClusterState, server_id: &str) {
        if let Some(info) = state.servers.remove(server_id) {
            info!("removing server {} ({})", server_id, info.server_type);
            if let Some(ids) = state.by_type.get_mut(&info.server_type) {
                ids.retain(|id| id != server_id);
                if ids.is_empty() {
                    state.by_type.remove(&info.server_type);
                }
            }
        }
        if let Some(client) = state.clients.remove(server_id) {
            client.close().await;
        }
    }

    /// Shutdown callback installed on every dialed client: transport death
    /// is treated as server death, no automatic redial.
    pub(crate) async fn handle_client_shutdown(&self, server_id: &str) {
        warn!("rpc client for {} shut down, deregistering", server_id);
        self.remove_server(server_id).await;
    }

    pub async fn server(&self, server_id: &str) -> Option<ServerInfo> {
        self.state.read().await.servers.get(server_id).cloned()
    }

    pub async fn servers_of_type(&self, server_type: &str) -> Vec<ServerInfo> {
        let state = self.state.read().await;
        state
            .by_type
            .get(server_type)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.servers.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Backend server types currently present in the directory.
    pub async fn backend_types(&self) -> Vec<String> {
        let state = self.state.read().await;
        state
            .by_type
            .iter()
            .filter(|(server_type, ids)| {
                *server_type != &self.local.server_type
                    && ids
                        .iter()
                        .any(|id| state.servers.get(id).is_some_and(|s| !s.frontend))
            })
            .map(|(server_type, _)| server_type.clone())
            .collect()
    }

    /// Picks the target instance of `server_type` for this session.
    ///
    /// Order: sticky id cached on the session (re-resolved freshly when the
    /// cached id has left the directory), then the registered router for the
    /// type, then uniform random. The chosen id is persisted sticky on the
    /// session. Resolving the local type or a frontend-flagged server is
    /// always an error.
    pub async fn resolve_server(
        &self,
        server_type: &str,
        session: Option<&Session>,
    ) -> AppResult<String> {
        if server_type == self.local.server_type {
            return Err(AppError::SelfRpc(server_type.to_string()));
        }

        let state = self.state.read().await;

        if let Some(session) = session {
            if let Some(sticky) = session.sticky_server(server_type) {
                if state.servers.contains_key(&sticky) {
                    return Ok(sticky);
                }
                // stale sticky route, the instance has been deregistered
                debug!(
                    "sticky server {} for session {} is gone, re-resolving",
                    sticky,
                    session.id()
                );
                session.clear_sticky_server(server_type);
            }
        }

        let candidates: Vec<ServerInfo> = state
            .by_type
            .get(server_type)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.servers.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default();
        if candidates.is_empty() {
            return Err(AppError::ServerNotFound(server_type.to_string()));
        }
        if let Some(frontend) = candidates.iter().find(|info| info.frontend) {
            return Err(AppError::FrontendTarget(frontend.server_id.clone()));
        }

        let router = self.routers.read().get(server_type).cloned();
        let chosen = match router {
            Some(router) => router(&candidates, session).ok_or_else(|| {
                AppError::ServerNotFound(server_type.to_string())
            })?,
            None => candidates
                .choose(&mut rand::thread_rng())
                .map(|info| info.server_id.clone())
                .ok_or_else(|| AppError::ServerNotFound(server_type.to_string()))?,
        };
        if !state.servers.contains_key(&chosen) {
            return Err(AppError::ServerIdNotFound(chosen));
        }

        if let Some(session) = session {
            session.set_sticky_server(server_type, chosen.clone());
        }
        Ok(chosen)
    }

    /// Returns the pooled client for `server_id`, dialing it first if
    /// needed. Creation and removal are serialized under the registry's
    /// write lock.
    pub async fn get_client(self: &Arc<Self>, server_id: &str) -> AppResult<Arc<RpcClient>> {
        {
            let state = self.state.read().await;
            if let Some(client) = state.clients.get(server_id) {
                return Ok(client.clone());
            }
        }

        let mut state = self.state.write().await;
        if let Some(client) = state.clients.get(server_id) {
            return Ok(client.clone());
        }
        let info = state
            .servers
            .get(server_id)
            .cloned()
            .ok_or_else(|| AppError::ServerIdNotFound(server_id.to_string()))?;
        let client = RpcClient::dial(
            &info,
            self.sessions.clone(),
            Arc::downgrade(self),
            self.options.buffer_size,
            self.options.max_record,
            self.options.ping_interval,
        )
        .await?;
        state.clients.insert(server_id.to_string(), client.clone());
        Ok(client)
    }

    pub async fn resolve_client(
        self: &Arc<Self>,
        server_type: &str,
        session: Option<&Session>,
    ) -> AppResult<Arc<RpcClient>> {
        let server_id = self.resolve_server(server_type, session).await?;
        self.get_client(&server_id).await
    }

    /// Forwards a client request/notify to its backend as a sys-namespace
    /// rpc. Fire-and-forget: any reply comes back through the demultiplexer
    /// keyed by session id.
    pub async fn forward_sys(
        self: &Arc<Self>,
        session: &Session,
        route: &Route,
        msg_id: u64,
        payload: Bytes,
    ) -> AppResult<()> {
        let server_type = route.server_type.as_deref().ok_or_else(|| {
            AppError::InvalidRoute(format!("'{}' has no server type to forward to", route))
        })?;
        let client = self.resolve_client(server_type, Some(session)).await?;
        // sequence 0: no reply slot, any reply is keyed by session id
        let request = RpcRequest {
            kind: RpcKind::Sys,
            seq: 0,
            session_id: session.id(),
            msg_id,
            service_method: route.to_string(),
            payload,
        };
        client.send(request).await
    }

    /// Session-scoped call awaiting the remote result.
    pub async fn call_sys(
        self: &Arc<Self>,
        session: &Session,
        route: &Route,
        payload: Bytes,
    ) -> AppResult<Bytes> {
        let server_type = route.server_type.as_deref().ok_or_else(|| {
            AppError::InvalidRoute(format!("'{}' has no server type to call", route))
        })?;
        let client = self.resolve_client(server_type, Some(session)).await?;
        let request = RpcRequest {
            kind: RpcKind::Sys,
            seq: 0,
            session_id: session.id(),
            msg_id: 0,
            service_method: route.to_string(),
            payload,
        };
        client.call(request).await
    }

    /// Plain rpc without session semantics: arguments are a JSON array
    /// matched positionally by the remote.
    pub async fn call_user(
        self: &Arc<Self>,
        route: &Route,
        args: &[serde_json::Value],
        session: Option<&Session>,
    ) -> AppResult<Bytes> {
        let server_type = route.server_type.as_deref().ok_or_else(|| {
            AppError::InvalidRoute(format!("'{}' has no server type to call", route))
        })?;
        let client = self.resolve_client(server_type, session).await?;
        let request = RpcRequest {
            kind: RpcKind::User,
            seq: 0,
            session_id: session.map(|s| s.id()).unwrap_or(0),
            msg_id: 0,
            service_method: route.to_string(),
            payload: Bytes::from(serde_json::to_vec(args)?),
        };
        client.call(request).await
    }

    /// Best-effort broadcast that a frontend session has closed, sent to one
    /// instance of every backend type. Failures are logged, never retried:
    /// the session is already gone.
    pub async fn notify_session_closed(self: &Arc<Self>, session: &Session) {
        for server_type in self.backend_types().await {
            let client = match self.resolve_client(&server_type, Some(session)).await {
                Ok(client) => client,
                Err(e) => {
                    warn!(
                        "session-closed notify skipped for type {}: {}",
                        server_type, e
                    );
                    continue;
                }
            };
            let request = RpcRequest {
                kind: RpcKind::Sys,
                seq: 0,
                session_id: session.id(),
                msg_id: 0,
                service_method: SESSION_CLOSED_ROUTE.to_string(),
                payload: Bytes::new(),
            };
            if let Err(e) = client.send(request).await {
                warn!(
                    "session-closed notify to type {} failed: {}",
                    server_type, e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Weak;

    use dashmap::DashMap;

    use super::*;
    use crate::session::NetworkEntity;

    fn registry() -> Arc<ClusterRegistry> {
        let local = ServerInfo {
            server_type: "gate".to_string(),
            server_id: "gate-1".to_string(),
            host: "127.0.0.1".to_string(),
            port: 3250,
            frontend: true,
            master: false,
        };
        ClusterRegistry::new(
            local,
            Arc::new(DashMap::new()),
            RpcClientOptions::default(),
        )
    }

    fn backend(server_type: &str, server_id: &str) -> ServerInfo {
        ServerInfo {
            server_type: server_type.to_string(),
            server_id: server_id.to_string(),
            host: "127.0.0.1".to_string(),
            port: 4250,
            frontend: false,
            master: false,
        }
    }

    fn session() -> Session {
        let entity: Weak<dyn NetworkEntity> = Weak::<crate::network::Acceptor>::new();
        Session::new(entity)
    }

    #[tokio::test]
    async fn test_resolution_basics() {
        let registry = registry();
        registry.register_server(backend("game", "game-1")).await;
        let session = session();

        let id = registry
            .resolve_server("game", Some(&session))
            .await
            .unwrap();
        assert_eq!(id, "game-1");
        assert!(matches!(
            registry.resolve_server("chat", Some(&session)).await,
            Err(AppError::ServerNotFound(_))
        ));
        assert!(matches!(
            registry.resolve_server("gate", Some(&session)).await,
            Err(AppError::SelfRpc(_))
        ));
    }

    #[tokio::test]
    async fn test_sticky_survives_new_registrations() {
        let registry = registry();
        registry.register_server(backend("game", "game-1")).await;
        let session = session();

        let first = registry
            .resolve_server("game", Some(&session))
            .await
            .unwrap();
        registry.register_server(backend("game", "game-2")).await;
        registry.register_server(backend("game", "game-3")).await;
        for _ in 0..8 {
            let again = registry
                .resolve_server("game", Some(&session))
                .await
                .unwrap();
            assert_eq!(again, first);
        }
    }

    #[tokio::test]
    async fn test_stale_sticky_re_resolves() {
        let registry = registry();
        registry.register_server(backend("game", "game-1")).await;
        let session = session();

        let first = registry
            .resolve_server("game", Some(&session))
            .await
            .unwrap();
        assert_eq!(first, "game-1");

        registry.remove_server("game-1").await;
        registry.register_server(backend("game", "game-2")).await;

        let second = registry
            .resolve_server("game", Some(&session))
            .await
            .unwrap();
        assert_eq!(second, "game-2");
        assert_eq!(session.sticky_server("game").unwrap(), "game-2");
    }

    #[tokio::test]
    async fn test_frontend_target_rejected() {
        let registry = registry();
        let mut info = backend("gate2", "gate2-1");
        info.frontend = true;
        registry.register_server(info).await;
        assert!(matches!(
            registry.resolve_server("gate2", Some(&session())).await,
            Err(AppError::FrontendTarget(_))
        ));
    }

    #[tokio::test]
    async fn test_router_overrides_random() {
        let registry = registry();
        registry.register_server(backend("game", "game-1")).await;
        registry.register_server(backend("game", "game-2")).await;
        registry.set_router(
            "game",
            Arc::new(|candidates, _session| {
                candidates
                    .iter()
                    .map(|info| info.server_id.clone())
                    .max()
            }),
        );
        let session = session();
        let id = registry
            .resolve_server("game", Some(&session))
            .await
            .unwrap();
        assert_eq!(id, "game-2");
    }

    #[tokio::test]
    async fn test_backend_types_excludes_local_and_frontends() {
        let registry = registry();
        registry.register_server(backend("game", "game-1")).await;
        let mut other_gate = backend("gate", "gate-9");
        other_gate.frontend = true;
        registry.register_server(other_gate).await;

        let types = registry.backend_types().await;
        assert_eq!(types, vec!["game".to_string()]);
    }

    #[tokio::test]
    async fn test_get_client_for_unknown_server_fails() {
        let registry = registry();
        assert!(matches!(
            registry.get_client("nope").await,
            Err(AppError::ServerIdNotFound(_))
        ));
    }
}
