use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::time::{self, Duration};
use tracing::{debug, error, warn};

use super::registry::ClusterRegistry;
use super::ServerInfo;
use crate::network::RpcConnection;
use crate::protocol::{
    RpcFrame, RpcKind, RpcRequest, RpcResponse, RpcResponseKind, CONNECTION_PING_ROUTE,
};
use crate::session::SessionDirectory;
use crate::{AppError, AppResult};

/// Connection state of one remote target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientState {
    Unresolved = 0,
    Connecting = 1,
    Established = 2,
    Closed = 3,
    Failed = 4,
}

impl ClientState {
    fn from_u8(value: u8) -> ClientState {
        match value {
            1 => ClientState::Connecting,
            2 => ClientState::Established,
            3 => ClientState::Closed,
            4 => ClientState::Failed,
            _ => ClientState::Unresolved,
        }
    }
}

/// One pooled connection to a backend server, shared by every session that
/// routes there.
///
/// Sequence numbers are scoped to this connection and monotonically
/// increasing; a number is never reused while its call is in flight. One
/// dedicated reader task demultiplexes inbound responses: `RemoteResponse`
/// by sequence number to the pending call, `Push` and `Response` by session
/// id to the originating session's entity.
pub struct RpcClient {
    server_id: String,
    state: AtomicU8,
    seq: AtomicU64,
    writer: Mutex<BufWriter<OwnedWriteHalf>>,
    pending: DashMap<u64, oneshot::Sender<RpcResponse>>,
}

impl RpcClient {
    /// Dials the target and spawns the response reader and the link ping
    /// task. On transport death the client deregisters its server from the
    /// registry; there is no automatic redial.
    pub async fn dial(
        info: &ServerInfo,
        sessions: Arc<SessionDirectory>,
        registry: Weak<ClusterRegistry>,
        buffer_size: usize,
        max_record: usize,
        ping_interval: Duration,
    ) -> AppResult<Arc<RpcClient>> {
        let addr = info.addr();
        debug!("dialing rpc target {} at {}", info.server_id, addr);
        let socket = match TcpStream::connect(&addr).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!("dial {} failed: {}", addr, e);
                return Err(AppError::DetailedIoError(format!(
                    "dial {} failed: {}",
                    addr, e
                )));
            }
        };
        let (reader, writer) = socket.into_split();

        let client = Arc::new(RpcClient {
            server_id: info.server_id.clone(),
            state: AtomicU8::new(ClientState::Established as u8),
            seq: AtomicU64::new(0),
            writer: Mutex::new(BufWriter::new(writer)),
            pending: DashMap::new(),
        });

        let mut connection = RpcConnection::new(reader, buffer_size, max_record);
        let reader_client = client.clone();
        tokio::spawn(async move {
            loop {
                match connection.read_record().await {
                    Ok(Some(record)) => reader_client.demux(record, &sessions).await,
                    Ok(None) => {
                        debug!("rpc connection to {} closed by peer", reader_client.server_id);
                        break;
                    }
                    Err(e) => {
                        warn!(
                            "rpc connection to {} died: {}",
                            reader_client.server_id, e
                        );
                        break;
                    }
                }
            }
            reader_client.pending.clear();
            let deliberate = reader_client.state() == ClientState::Closed;
            if !deliberate {
                reader_client
                    .state
                    .store(ClientState::Failed as u8, Ordering::Relaxed);
                // transport death is server death: deregister
                if let Some(registry) = registry.upgrade() {
                    registry.handle_client_shutdown(&reader_client.server_id).await;
                }
            }
        });

        let ping_client = client.clone();
        tokio::spawn(async move {
            let mut interval = time::interval(ping_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                if ping_client.state() != ClientState::Established {
                    break;
                }
                let ping = RpcRequest {
                    kind: RpcKind::User,
                    seq: 0,
                    session_id: 0,
                    msg_id: 0,
                    service_method: CONNECTION_PING_ROUTE.to_string(),
                    payload: Bytes::new(),
                };
                if ping_client.send(ping).await.is_err() {
                    break;
                }
            }
        });

        Ok(client)
    }

    async fn demux(&self, record: Bytes, sessions: &SessionDirectory) {
        let response = match RpcResponse::decode(record) {
            Ok(response) => response,
            Err(AppError::UnknownResponseKind(kind)) => {
                warn!("dropping response of unrecognized kind {}", kind);
                return;
            }
            Err(e) => {
                error!("undecodable rpc response from {}: {}", self.server_id, e);
                return;
            }
        };
        match response.kind {
            RpcResponseKind::RemoteResponse => {
                match self.pending.remove(&response.seq) {
                    Some((_, tx)) => {
                        let _ = tx.send(response);
                    }
                    None => warn!(
                        "stale remote response seq {} from {}",
                        response.seq, self.server_id
                    ),
                }
            }
            RpcResponseKind::Push => {
                let session = sessions.get(&response.session_id).map(|s| s.value().clone());
                match session {
                    Some(session) => {
                        if let Err(e) = session.push(&response.route, response.payload).await {
                            warn!("push to session {} failed: {}", response.session_id, e);
                        }
                    }
                    None => warn!("push for unknown session {}", response.session_id),
                }
            }
            RpcResponseKind::Response => {
                let session = sessions.get(&response.session_id).map(|s| s.value().clone());
                match session {
                    Some(session) => {
                        let delivery = if response.error.is_empty() {
                            session.response(response.payload).await
                        } else {
                            session.response(Bytes::from(response.error)).await
                        };
                        if let Err(e) = delivery {
                            warn!(
                                "response to session {} failed: {}",
                                response.session_id, e
                            );
                        }
                    }
                    None => warn!("response for unknown session {}", response.session_id),
                }
            }
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn state(&self) -> ClientState {
        ClientState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Fire-and-forget write of one framed request.
    pub async fn send(&self, request: RpcRequest) -> AppResult<()> {
        if self.state() != ClientState::Established {
            return Err(AppError::IllegalState(format!(
                "rpc client {} is {:?}",
                self.server_id,
                self.state()
            )));
        }
        let frame = RpcFrame::frame(request.encode());
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Sends a request and awaits its `RemoteResponse`. There is no default
    /// deadline: a hung remote stalls the caller until the transport errors.
    pub async fn call(&self, mut request: RpcRequest) -> AppResult<Bytes> {
        let seq = self.next_seq();
        request.seq = seq;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(seq, tx);
        if let Err(e) = self.send(request).await {
            self.pending.remove(&seq);
            return Err(e);
        }
        let response = rx.await.map_err(|_| {
            AppError::Remote(format!("rpc connection to {} closed", self.server_id))
        })?;
        if response.error.is_empty() {
            Ok(response.payload)
        } else {
            Err(AppError::Remote(response.error))
        }
    }

    /// Deliberate close: shuts the write half down so the reader task drains
    /// and exits without treating it as a transport death.
    pub async fn close(&self) {
        self.state.store(ClientState::Closed as u8, Ordering::Relaxed);
        self.pending.clear();
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("server_id", &self.server_id)
            .field("state", &self.state())
            .finish()
    }
}
