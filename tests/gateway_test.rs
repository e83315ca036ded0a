use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Duration};

use crossgate::{
    App, AppResult, MeshConfig, Message, MessageKind, NodeConfig, Packet, PacketType, ServerInfo,
    SessionValue,
};

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn node_config(server_type: &str, server_id: &str, frontend: bool, port: u16) -> MeshConfig {
    let mut config = MeshConfig::default();
    config.node = NodeConfig {
        server_type: server_type.to_string(),
        server_id: server_id.to_string(),
        host: "127.0.0.1".to_string(),
        client_port: if frontend { port } else { 0 },
        rpc_port: if frontend { 0 } else { port },
        frontend,
        master: false,
    };
    config
}

async fn connect(port: u16) -> TcpStream {
    for _ in 0..200 {
        if let Ok(socket) = TcpStream::connect(("127.0.0.1", port)).await {
            return socket;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("server on port {} never came up", port);
}

async fn read_packet(socket: &mut TcpStream, buffer: &mut BytesMut) -> Packet {
    let deadline = Duration::from_secs(10);
    timeout(deadline, async {
        loop {
            if let Some(packet) = Packet::parse(buffer).unwrap() {
                return packet;
            }
            if socket.read_buf(buffer).await.unwrap() == 0 {
                panic!("server closed the connection mid-read");
            }
        }
    })
    .await
    .expect("timed out waiting for a packet")
}

async fn write_packet(socket: &mut TcpStream, packet_type: PacketType, payload: &[u8]) {
    let wire = Packet::pack(packet_type, payload).unwrap();
    socket.write_all(&wire).await.unwrap();
}

async fn handshake(socket: &mut TcpStream, buffer: &mut BytesMut) -> serde_json::Value {
    write_packet(socket, PacketType::Handshake, b"{}").await;
    let ack = read_packet(socket, buffer).await;
    assert_eq!(ack.packet_type, PacketType::Handshake);
    let body: serde_json::Value = serde_json::from_slice(&ack.payload).unwrap();
    write_packet(socket, PacketType::HandshakeAck, b"").await;
    body
}

#[tokio::test]
async fn test_handshake_heartbeat_and_local_notify() -> AppResult<()> {
    let port = free_port();
    let mut app = App::new(node_config("gate", "gate-e2e-1", true, port));
    app.handlers()
        .register_raw("echo", "say", |session, payload| async move {
            session.set("said", SessionValue::Uint(payload.len() as u64));
            Ok(())
        });
    app.handlers()
        .register_raw("echo", "ask", |session, payload| async move {
            session.response(payload).await
        });
    let server = tokio::spawn(app.run());

    let mut socket = connect(port).await;
    let mut buffer = BytesMut::with_capacity(4 * 1024);

    // handshake advertises the active heartbeat interval
    let body = handshake(&mut socket, &mut buffer).await;
    assert_eq!(body["code"], 200);
    assert!(body["sys"]["heartbeat"].as_u64().unwrap() > 0);

    // heartbeats echo back
    write_packet(&mut socket, PacketType::Heartbeat, b"").await;
    let beat = read_packet(&mut socket, &mut buffer).await;
    assert_eq!(beat.packet_type, PacketType::Heartbeat);
    assert!(beat.payload.is_empty());

    // a notify runs the local method, produces no reply and no error
    let notify = Message::notify("echo.say", Bytes::from_static(b"hello")).encode()?;
    write_packet(&mut socket, PacketType::Data, &notify).await;

    // a request on the same connection is processed after it, in order
    let request = Message::request(21, "echo.ask", Bytes::from_static(b"marco")).encode()?;
    write_packet(&mut socket, PacketType::Data, &request).await;

    let reply = read_packet(&mut socket, &mut buffer).await;
    assert_eq!(reply.packet_type, PacketType::Data);
    let message = Message::decode(reply.payload)?;
    assert_eq!(message.kind, MessageKind::Response);
    assert_eq!(message.id, 21);
    assert_eq!(&message.payload[..], b"marco");

    server.abort();
    Ok(())
}

#[tokio::test]
async fn test_request_routed_through_backend() -> AppResult<()> {
    let rpc_port = free_port();
    let mut backend = App::new(node_config("game", "game-e2e-1", false, rpc_port));
    backend
        .remotes()
        .register_sys_raw("room", "join", |session, payload| async move {
            session.push("room.welcome", Bytes::from_static(b"welcome")).await?;
            session.response(payload).await?;
            Ok(None)
        });
    let backend_task = tokio::spawn(backend.run());

    // wait for the backend to listen before wiring the frontend to it
    drop(connect(rpc_port).await);

    let client_port = free_port();
    let mut config = node_config("gate", "gate-e2e-2", true, client_port);
    config.cluster.members.push(ServerInfo {
        server_type: "game".to_string(),
        server_id: "game-e2e-1".to_string(),
        host: "127.0.0.1".to_string(),
        port: rpc_port,
        frontend: false,
        master: false,
    });
    let frontend_task = tokio::spawn(App::new(config).run());

    let mut socket = connect(client_port).await;
    let mut buffer = BytesMut::with_capacity(4 * 1024);
    handshake(&mut socket, &mut buffer).await;

    let request = Message::request(5, "game.room.join", Bytes::from_static(b"{\"seat\":1}"))
        .encode()?;
    write_packet(&mut socket, PacketType::Data, &request).await;

    // the backend pushes first, then answers the pending request
    let first = Message::decode(read_packet(&mut socket, &mut buffer).await.payload)?;
    assert_eq!(first.kind, MessageKind::Push);
    assert_eq!(first.route.as_deref(), Some("room.welcome"));
    assert_eq!(&first.payload[..], b"welcome");

    let second = Message::decode(read_packet(&mut socket, &mut buffer).await.payload)?;
    assert_eq!(second.kind, MessageKind::Response);
    assert_eq!(second.id, 5);
    assert_eq!(&second.payload[..], b"{\"seat\":1}");

    backend_task.abort();
    frontend_task.abort();
    Ok(())
}

#[tokio::test]
async fn test_request_to_missing_backend_gets_error_payload() -> AppResult<()> {
    let client_port = free_port();
    let frontend_task = tokio::spawn(App::new(node_config("gate", "gate-e2e-3", true, client_port)).run());

    let mut socket = connect(client_port).await;
    let mut buffer = BytesMut::with_capacity(4 * 1024);
    handshake(&mut socket, &mut buffer).await;

    let request = Message::request(3, "chat.room.say", Bytes::new()).encode()?;
    write_packet(&mut socket, PacketType::Data, &request).await;

    let reply = Message::decode(read_packet(&mut socket, &mut buffer).await.payload)?;
    assert_eq!(reply.kind, MessageKind::Response);
    assert_eq!(reply.id, 3);
    let body: serde_json::Value = serde_json::from_slice(&reply.payload).unwrap();
    assert!(body["error"].as_str().unwrap().contains("chat"));

    frontend_task.abort();
    Ok(())
}
