use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, error, warn};

use super::{panic_message, RemoteRegistry};
use crate::network::Acceptor;
use crate::protocol::{
    Route, RpcFrame, RpcKind, RpcRequest, RpcResponse, CONNECTION_PING_ROUTE,
    SESSION_CLOSED_ROUTE,
};
use crate::session::NetworkEntity;
use crate::{AppError, AppResult};

/// Backend dispatch: decodes routed requests off an acceptor's link, runs
/// the registered sys or user method, and writes the reply back on the same
/// connection with the original sequence number and session id.
pub struct RemoteService {
    registry: RemoteRegistry,
}

impl RemoteService {
    pub fn new(registry: RemoteRegistry) -> RemoteService {
        RemoteService { registry }
    }

    /// Per-connection dispatch task, mirroring the frontend one: requests
    /// for one link execute strictly in arrival order and a misbehaving
    /// handler never takes the loop down.
    pub async fn run(&self, acceptor: Arc<Acceptor>, queue: async_channel::Receiver<RpcRequest>) {
        while let Ok(request) = queue.recv().await {
            if let Err(e) = self.handle_request(&acceptor, request).await {
                warn!("acceptor {}: {}", acceptor.id(), e);
            }
        }
        debug!("dispatch task for acceptor {} drained and exited", acceptor.id());
    }

    pub async fn handle_request(
        &self,
        acceptor: &Arc<Acceptor>,
        request: RpcRequest,
    ) -> AppResult<()> {
        if request.service_method == CONNECTION_PING_ROUTE {
            return Ok(());
        }
        // reserved route: bridged-session teardown, bypasses dispatch
        if request.service_method == SESSION_CLOSED_ROUTE {
            if let Some(session) = acceptor.close_session(request.session_id) {
                debug!(
                    "frontend session {} closed, dropped bridged session {}",
                    request.session_id,
                    session.id()
                );
            }
            return Ok(());
        }

        let route = match Route::parse(&request.service_method) {
            Ok(route) => route,
            Err(e) => {
                warn!("dropping rpc with unparsable route: {}", e);
                if request.seq != 0 {
                    self.reply(acceptor, &request, Err(e)).await?;
                }
                return Ok(());
            }
        };

        let result = match request.kind {
            RpcKind::Sys => self.invoke_sys(acceptor, &route, &request).await,
            RpcKind::User => self.invoke_user(&route, &request).await,
        };

        // a zero sequence number means no reply slot was allocated
        if request.seq != 0 {
            self.reply(acceptor, &request, result).await?;
        } else if let Err(e) = result {
            warn!("rpc '{}' failed: {}", route, e);
            // a forwarded client request still deserves an error reply
            if request.kind == RpcKind::Sys && request.msg_id != 0 {
                let session = acceptor.session_for(request.session_id);
                let body = serde_json::json!({ "error": e.to_string() });
                let payload = Bytes::from(serde_json::to_vec(&body)?);
                if let Err(e) = session.response(payload).await {
                    warn!(
                        "error reply for frontend session {} failed: {}",
                        request.session_id, e
                    );
                }
            }
        }
        Ok(())
    }

    async fn invoke_sys(
        &self,
        acceptor: &Arc<Acceptor>,
        route: &Route,
        request: &RpcRequest,
    ) -> AppResult<Bytes> {
        let handler = self
            .registry
            .lookup_sys(&route.service, &route.method)
            .ok_or_else(|| AppError::UnknownHandler(route.to_string()))?;
        let session = acceptor.session_for(request.session_id);
        // recorded before invocation: the handler may respond immediately
        session.set_last_request_id(request.msg_id);

        match tokio::spawn(handler(session, request.payload.clone())).await {
            Ok(result) => result.map(|payload| payload.unwrap_or_default()),
            Err(join_error) => Err(self.contain(route, join_error)),
        }
    }

    async fn invoke_user(&self, route: &Route, request: &RpcRequest) -> AppResult<Bytes> {
        let handler = self
            .registry
            .lookup_user(&route.service, &route.method)
            .ok_or_else(|| AppError::UnknownHandler(route.to_string()))?;
        let args: Vec<serde_json::Value> = if request.payload.is_empty() {
            Vec::new()
        } else {
            serde_json::from_slice(&request.payload)?
        };

        match tokio::spawn(handler(args)).await {
            Ok(result) => result,
            Err(join_error) => Err(self.contain(route, join_error)),
        }
    }

    /// The fault boundary: a panic inside a registered method is recovered
    /// at the call join, logged, and converted into an rpc error so the
    /// connection's loop and its other sessions keep running.
    fn contain(&self, route: &Route, join_error: tokio::task::JoinError) -> AppError {
        if join_error.is_panic() {
            let message = panic_message(join_error.into_panic());
            error!("handler '{}' panicked: {}", route, message);
            AppError::Remote(format!("handler '{}' panicked: {}", route, message))
        } else {
            error!("handler '{}' was cancelled", route);
            AppError::Remote(format!("handler '{}' was cancelled", route))
        }
    }

    async fn reply(
        &self,
        acceptor: &Arc<Acceptor>,
        request: &RpcRequest,
        result: AppResult<Bytes>,
    ) -> AppResult<()> {
        let response = RpcResponse::remote(request.seq, request.session_id, result);
        acceptor.send(RpcFrame::frame(response.encode())).await
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    use super::*;
    use crate::network::AcceptorDirectory;
    use crate::protocol::RpcResponseKind;

    async fn acceptor_with_service(registry: RemoteRegistry) -> (Arc<Acceptor>, TcpStream, RemoteService) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = TcpStream::connect(addr).await.unwrap();
        let (socket, _) = listener.accept().await.unwrap();
        let (_reader, writer) = socket.into_split();
        let acceptors = Arc::new(AcceptorDirectory::new());
        let acceptor = Acceptor::new(writer, acceptors.clone());
        acceptors.insert(acceptor.id(), acceptor.clone());
        (acceptor, peer, RemoteService::new(registry))
    }

    async fn read_response(peer: &mut TcpStream) -> RpcResponse {
        let mut buffer = BytesMut::with_capacity(1024);
        loop {
            if let Some(record) = RpcFrame::parse(&mut buffer, 1 << 20).unwrap() {
                return RpcResponse::decode(record).unwrap();
            }
            peer.read_buf(&mut buffer).await.unwrap();
        }
    }

    fn sys_request(seq: u64, session_id: u64, msg_id: u64, route: &str, payload: &'static [u8]) -> RpcRequest {
        RpcRequest {
            kind: RpcKind::Sys,
            seq,
            session_id,
            msg_id,
            service_method: route.to_string(),
            payload: Bytes::from_static(payload),
        }
    }

    #[tokio::test]
    async fn test_sys_call_replies_with_original_seq_and_session() {
        let mut registry = RemoteRegistry::new();
        registry.register_sys_raw("room", "count", |_session, _payload| async {
            Ok(Some(Bytes::from_static(b"4")))
        });
        let (acceptor, mut peer, service) = acceptor_with_service(registry).await;

        let request = sys_request(9, 77, 0, "game.room.count", b"");
        service.handle_request(&acceptor, request).await.unwrap();

        let response = read_response(&mut peer).await;
        assert_eq!(response.kind, RpcResponseKind::RemoteResponse);
        assert_eq!(response.seq, 9);
        assert_eq!(response.session_id, 77);
        assert_eq!(&response.payload[..], b"4");
        assert!(response.error.is_empty());
    }

    #[tokio::test]
    async fn test_panicking_remote_becomes_error_response() {
        let mut registry = RemoteRegistry::new();
        registry.register_sys_raw("room", "explode", |_session, _payload| async {
            panic!("kaboom");
        });
        registry.register_sys_raw("room", "count", |_session, _payload| async {
            Ok(Some(Bytes::from_static(b"alive")))
        });
        let (acceptor, mut peer, service) = acceptor_with_service(registry).await;

        let request = sys_request(1, 5, 0, "game.room.explode", b"");
        service.handle_request(&acceptor, request).await.unwrap();
        let response = read_response(&mut peer).await;
        assert_eq!(response.seq, 1);
        assert!(response.error.contains("kaboom"));

        // the dispatch loop keeps serving the connection
        let request = sys_request(2, 5, 0, "game.room.count", b"");
        service.handle_request(&acceptor, request).await.unwrap();
        let response = read_response(&mut peer).await;
        assert_eq!(&response.payload[..], b"alive");
    }

    #[tokio::test]
    async fn test_unknown_remote_method_reports_error() {
        let (acceptor, mut peer, service) = acceptor_with_service(RemoteRegistry::new()).await;
        let request = sys_request(3, 5, 0, "game.room.missing", b"");
        service.handle_request(&acceptor, request).await.unwrap();
        let response = read_response(&mut peer).await;
        assert!(!response.error.is_empty());
    }

    #[tokio::test]
    async fn test_user_rpc_positional_args() {
        let mut registry = RemoteRegistry::new();
        registry.register_user("stats", "add", |args| async move {
            let a = args[0].as_i64().unwrap_or(0);
            let b = args[1].as_i64().unwrap_or(0);
            Ok(Bytes::from((a + b).to_string()))
        });
        let (acceptor, mut peer, service) = acceptor_with_service(registry).await;

        let request = RpcRequest {
            kind: RpcKind::User,
            seq: 12,
            session_id: 0,
            msg_id: 0,
            service_method: "game.stats.add".to_string(),
            payload: Bytes::from_static(b"[2,3]"),
        };
        service.handle_request(&acceptor, request).await.unwrap();
        let response = read_response(&mut peer).await;
        assert_eq!(&response.payload[..], b"5");
    }

    #[tokio::test]
    async fn test_session_closed_route_drops_bridge() {
        let mut registry = RemoteRegistry::new();
        registry.register_sys_raw("room", "touch", |_session, _payload| async { Ok(None) });
        let (acceptor, _peer, service) = acceptor_with_service(registry).await;

        // bridge a session via a normal sys notify
        let request = sys_request(0, 42, 0, "game.room.touch", b"");
        service.handle_request(&acceptor, request).await.unwrap();
        assert_eq!(acceptor.session_count(), 1);

        let request = sys_request(0, 42, 0, SESSION_CLOSED_ROUTE, b"");
        service.handle_request(&acceptor, request).await.unwrap();
        assert_eq!(acceptor.session_count(), 0);
    }

    #[tokio::test]
    async fn test_notify_mode_enforced_on_bridge() {
        // msg_id 0 marks a forwarded notify: the handler cannot respond
        let mut registry = RemoteRegistry::new();
        registry.register_sys_raw("room", "shout", |session, _payload| async move {
            match session.response(Bytes::from_static(b"nope")).await {
                Err(AppError::NotifyMode(_)) => Ok(Some(Bytes::from_static(b"guarded"))),
                other => Err(AppError::IllegalState(format!(
                    "notify-mode response was {:?}",
                    other.map(|_| ())
                ))),
            }
        });
        let (acceptor, mut peer, service) = acceptor_with_service(registry).await;
        let request = sys_request(5, 8, 0, "game.room.shout", b"");
        service.handle_request(&acceptor, request).await.unwrap();
        let response = read_response(&mut peer).await;
        assert!(response.error.is_empty());
        assert_eq!(&response.payload[..], b"guarded");
    }
}
