use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, error, warn};

use super::{panic_message, HandlerRegistry};
use crate::cluster::ClusterRegistry;
use crate::network::{Agent, AgentStatus};
use crate::protocol::{Message, MessageKind, Packet, PacketType, Route, RouteDictionary};
use crate::session::NetworkEntity;
use crate::{AppError, AppResult};

#[derive(Debug, Serialize)]
struct HandshakeSys {
    heartbeat: u64,
    dict: HashMap<String, u16>,
}

#[derive(Debug, Serialize)]
struct HandshakeAck {
    code: u16,
    sys: HandshakeSys,
}

/// Frontend dispatch: decodes client packets and either runs local logic or
/// forwards the message to its backend.
pub struct HandlerService {
    registry: HandlerRegistry,
    cluster: Arc<ClusterRegistry>,
    local_type: String,
    heartbeat_interval: u64,
}

impl HandlerService {
    pub fn new(
        registry: HandlerRegistry,
        cluster: Arc<ClusterRegistry>,
        heartbeat_interval: u64,
    ) -> HandlerService {
        let local_type = cluster.local().server_type.clone();
        HandlerService {
            registry,
            cluster,
            local_type,
            heartbeat_interval,
        }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Per-connection dispatch task. Drains the bounded queue fed by the
    /// read task, so all logic for one connection runs strictly in arrival
    /// order; the closed queue is the end signal.
    pub async fn run(&self, agent: Arc<Agent>, queue: async_channel::Receiver<Packet>) {
        while let Ok(packet) = queue.recv().await {
            if agent.status() == AgentStatus::Closed {
                break;
            }
            if let Err(e) = self.handle_packet(&agent, packet).await {
                match e {
                    AppError::MalformedProtocol(_) => {
                        error!(
                            "protocol error on session {}, closing: {}",
                            agent.session().id(),
                            e
                        );
                        agent.session().close().await;
                        break;
                    }
                    other => warn!("session {}: {}", agent.session().id(), other),
                }
            }
        }
        debug!(
            "dispatch task for session {} drained and exited",
            agent.session().id()
        );
    }

    pub async fn handle_packet(&self, agent: &Arc<Agent>, packet: Packet) -> AppResult<()> {
        agent.heartbeat();
        match packet.packet_type {
            PacketType::Handshake => {
                let ack = HandshakeAck {
                    code: 200,
                    sys: HandshakeSys {
                        heartbeat: self.heartbeat_interval,
                        dict: RouteDictionary::get()
                            .map(|dict| dict.entries().clone())
                            .unwrap_or_default(),
                    },
                };
                let payload = serde_json::to_vec(&ack)?;
                let wire = Packet::pack(PacketType::Handshake, &payload)?;
                agent.send(wire).await?;
                agent.set_status(AgentStatus::Handshake);
            }
            PacketType::HandshakeAck => {
                // heartbeats begin only once the client confirms
                agent.set_status(AgentStatus::Working);
            }
            PacketType::Heartbeat => {
                agent.send_heartbeat().await?;
            }
            PacketType::Data => {
                self.handle_data(agent, packet.payload).await?;
            }
            PacketType::Kick => {
                debug!(
                    "ignoring kick packet from client session {}",
                    agent.session().id()
                );
            }
        }
        Ok(())
    }

    async fn handle_data(&self, agent: &Arc<Agent>, payload: Bytes) -> AppResult<()> {
        let message = Message::decode(payload)?;
        let session = agent.session().clone();

        // the asymmetry is recorded before the handler runs: it may itself
        // attempt a response
        match message.kind {
            MessageKind::Request => session.set_last_request_id(message.id),
            MessageKind::Notify => session.set_last_request_id(0),
            other => {
                warn!(
                    "dropping {:?} message from client session {}",
                    other,
                    session.id()
                );
                return Ok(());
            }
        }

        let raw_route = match &message.route {
            Some(route) => route.as_str(),
            None => {
                warn!("dropping routeless message from session {}", session.id());
                return Ok(());
            }
        };
        let route = match Route::parse(raw_route) {
            Ok(route) => route,
            Err(e) => {
                warn!("dropping message from session {}: {}", session.id(), e);
                return Ok(());
            }
        };

        let local = route
            .server_type
            .as_deref()
            .map_or(true, |server_type| server_type == self.local_type);
        if local {
            self.dispatch_local(&route, session, message.payload).await;
        } else if let Err(e) = self
            .cluster
            .forward_sys(&session, &route, message.id, message.payload)
            .await
        {
            warn!(
                "forward of '{}' for session {} failed: {}",
                route,
                session.id(),
                e
            );
            if message.kind == MessageKind::Request {
                let body = serde_json::json!({ "error": e.to_string() });
                let payload = Bytes::from(serde_json::to_vec(&body)?);
                if let Err(e) = session.response(payload).await {
                    warn!("error reply to session {} failed: {}", session.id(), e);
                }
            }
        }
        Ok(())
    }

    /// Unknown service or method is logged and the message dropped, by
    /// design lenient toward malformed input. A panicking handler is caught
    /// at the invocation boundary and the loop continues.
    async fn dispatch_local(
        &self,
        route: &Route,
        session: Arc<crate::session::Session>,
        payload: Bytes,
    ) {
        let session_id = session.id();
        let handler = match self.registry.lookup(&route.service, &route.method) {
            Some(handler) => handler,
            None => {
                warn!("no local handler for '{}', message dropped", route);
                return;
            }
        };
        match tokio::spawn(handler(session, payload)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("handler '{}' for session {} failed: {}", route, session_id, e),
            Err(join_error) => {
                if join_error.is_panic() {
                    error!(
                        "handler '{}' for session {} panicked: {}",
                        route,
                        session_id,
                        panic_message(join_error.into_panic())
                    );
                } else {
                    error!("handler '{}' for session {} was cancelled", route, session_id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::{TcpListener, TcpStream};

    use super::*;
    use crate::cluster::{ClusterRegistry, RpcClientOptions, ServerInfo};
    use crate::network::AgentDirectory;
    use crate::session::{SessionDirectory, SessionValue};

    fn cluster(sessions: Arc<SessionDirectory>) -> Arc<ClusterRegistry> {
        let local = ServerInfo {
            server_type: "gate".to_string(),
            server_id: "gate-1".to_string(),
            host: "127.0.0.1".to_string(),
            port: 3250,
            frontend: true,
            master: false,
        };
        ClusterRegistry::new(local, sessions, RpcClientOptions::default())
    }

    async fn agent_with_service(registry: HandlerRegistry) -> (Arc<Agent>, TcpStream, HandlerService) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = TcpStream::connect(addr).await.unwrap();
        let (socket, _) = listener.accept().await.unwrap();
        let (_reader, writer) = socket.into_split();

        let sessions = Arc::new(SessionDirectory::new());
        let agents = Arc::new(AgentDirectory::new());
        let cluster = cluster(sessions.clone());
        let agent = Agent::new(writer, cluster.clone(), sessions, agents);
        let service = HandlerService::new(registry, cluster, 30);
        (agent, peer, service)
    }

    fn data_packet(message: Message) -> Packet {
        Packet::new(PacketType::Data, message.encode().unwrap())
    }

    #[tokio::test]
    async fn test_notify_then_response_is_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.register_raw("room", "leave", |_session, _payload| async { Ok(()) });
        let (agent, _peer, service) = agent_with_service(registry).await;

        let notify = Message::notify("room.leave", Bytes::new());
        service.handle_packet(&agent, data_packet(notify)).await.unwrap();

        assert_eq!(agent.session().last_request_id(), 0);
        assert!(matches!(
            agent.session().response(Bytes::from_static(b"late")).await,
            Err(AppError::NotifyMode(_))
        ));
    }

    #[tokio::test]
    async fn test_request_enables_response() {
        let mut registry = HandlerRegistry::new();
        registry.register_raw("room", "enter", |session, payload| async move {
            session.response(payload).await
        });
        let (agent, _peer, service) = agent_with_service(registry).await;

        let request = Message::request(11, "room.enter", Bytes::from_static(b"ok"));
        service.handle_packet(&agent, data_packet(request)).await.unwrap();

        assert_eq!(agent.session().last_request_id(), 11);
        // the reply channel stays usable after the handler returned
        agent
            .session()
            .response(Bytes::from_static(b"again"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unknown_service_is_dropped_not_fatal() {
        let (agent, _peer, service) = agent_with_service(HandlerRegistry::new()).await;
        let notify = Message::notify("ghost.walk", Bytes::new());
        service.handle_packet(&agent, data_packet(notify)).await.unwrap();
        assert_ne!(agent.status(), AgentStatus::Closed);
    }

    #[tokio::test]
    async fn test_unparsable_route_is_dropped_not_fatal() {
        let (agent, _peer, service) = agent_with_service(HandlerRegistry::new()).await;
        let notify = Message::notify("onesegment", Bytes::new());
        service.handle_packet(&agent, data_packet(notify)).await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_message_is_a_protocol_error() {
        let (agent, _peer, service) = agent_with_service(HandlerRegistry::new()).await;
        let packet = Packet::new(PacketType::Data, Bytes::new());
        assert!(matches!(
            service.handle_packet(&agent, packet).await,
            Err(AppError::MalformedProtocol(_))
        ));
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_stop_dispatch() {
        let mut registry = HandlerRegistry::new();
        registry.register_raw("bomb", "arm", |_session, _payload| async {
            panic!("boom");
        });
        registry.register_raw("room", "mark", |session, _payload| async move {
            session.set("after", SessionValue::Bool(true));
            Ok(())
        });
        let (agent, _peer, service) = agent_with_service(registry).await;

        let exploding = Message::notify("bomb.arm", Bytes::new());
        service.handle_packet(&agent, data_packet(exploding)).await.unwrap();

        // subsequent queued messages still run
        let follow_up = Message::notify("room.mark", Bytes::new());
        service.handle_packet(&agent, data_packet(follow_up)).await.unwrap();
        assert!(agent.session().boolean("after").unwrap());
    }

    #[tokio::test]
    async fn test_handshake_ack_reports_heartbeat() {
        let (agent, mut peer, service) = agent_with_service(HandlerRegistry::new()).await;
        let handshake = Packet::new(PacketType::Handshake, Bytes::from_static(b"{}"));
        service.handle_packet(&agent, handshake).await.unwrap();
        assert_eq!(agent.status(), AgentStatus::Handshake);

        use tokio::io::AsyncReadExt;
        let mut buffer = bytes::BytesMut::with_capacity(1024);
        let reply = loop {
            if let Some(packet) = Packet::parse(&mut buffer).unwrap() {
                break packet;
            }
            peer.read_buf(&mut buffer).await.unwrap();
        };
        assert_eq!(reply.packet_type, PacketType::Handshake);
        let body: serde_json::Value = serde_json::from_slice(&reply.payload).unwrap();
        assert_eq!(body["code"], 200);
        assert_eq!(body["sys"]["heartbeat"], 30);

        let ack = Packet::new(PacketType::HandshakeAck, Bytes::new());
        service.handle_packet(&agent, ack).await.unwrap();
        assert_eq!(agent.status(), AgentStatus::Working);
    }
}
