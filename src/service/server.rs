use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::time::{self, Duration};
use tracing::{debug, warn};

use crate::cluster::ClusterRegistry;
use crate::dispatch::{HandlerService, RemoteService};
use crate::network::{
    Acceptor, AcceptorDirectory, Agent, AgentDirectory, PacketConnection, RpcConnection,
};
use crate::protocol::RpcRequest;
use crate::session::{NetworkEntity, SessionDirectory};
use crate::{AppError, AppResult};

use super::{global_config, Shutdown};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

async fn accept(listener: &TcpListener) -> AppResult<TcpStream> {
    let mut backoff = 1;
    loop {
        match listener.accept().await {
            Ok((socket, _)) => return Ok(socket),
            Err(err) => {
                if backoff > 64 {
                    return Err(AppError::DetailedIoError(format!(
                        "accept error: {}",
                        err
                    )));
                }
            }
        }
        time::sleep(Duration::from_secs(backoff)).await;
        backoff *= 2;
    }
}

/// Client-facing accept loop of a frontend server.
///
/// Each accepted connection gets an agent, a bounded packet queue, and two
/// tasks: the read task parses packets off the socket, the dispatch task
/// drains the queue in arrival order. Closing the queue is the end signal;
/// already queued packets are still processed before the agent closes.
pub struct FrontendServer {
    listener: TcpListener,
    limit_connections: Arc<Semaphore>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
    handler_service: Arc<HandlerService>,
    cluster: Arc<ClusterRegistry>,
    sessions: Arc<SessionDirectory>,
    agents: Arc<AgentDirectory>,
}

impl FrontendServer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        listener: TcpListener,
        limit_connections: Arc<Semaphore>,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
        handler_service: Arc<HandlerService>,
        cluster: Arc<ClusterRegistry>,
        sessions: Arc<SessionDirectory>,
        agents: Arc<AgentDirectory>,
    ) -> FrontendServer {
        FrontendServer {
            listener,
            limit_connections,
            notify_shutdown,
            shutdown_complete_tx,
            handler_service,
            cluster,
            sessions,
            agents,
        }
    }

    pub async fn run(&self) -> AppResult<()> {
        let network = &global_config().network;
        loop {
            let permit = self
                .limit_connections
                .clone()
                .acquire_owned()
                .await
                .unwrap();

            let socket = accept(&self.listener).await?;
            let connection_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
            debug!("accepted client connection {}", connection_id);

            let (reader, writer) = socket.into_split();
            let agent = Agent::new(
                writer,
                self.cluster.clone(),
                self.sessions.clone(),
                self.agents.clone(),
            );
            self.sessions
                .insert(agent.session().id(), agent.session().clone());
            self.agents.insert(agent.session().id(), agent.clone());

            let (packet_tx, packet_rx) = async_channel::bounded(network.dispatch_queue_size);

            let handler_service = self.handler_service.clone();
            let dispatch_agent = agent.clone();
            let dispatch_complete = self.shutdown_complete_tx.clone();
            let dispatch = tokio::spawn(async move {
                let _shutdown_complete_tx = dispatch_complete;
                handler_service.run(dispatch_agent, packet_rx).await;
            });

            let mut connection = PacketConnection::new(reader, network.conn_read_buffer_size);
            let notify_shutdown = self.notify_shutdown.clone();
            let read_complete = self.shutdown_complete_tx.clone();
            tokio::spawn(async move {
                let _shutdown_complete_tx = read_complete;
                let mut shutdown = Shutdown::subscribe(&notify_shutdown);
                loop {
                    let read = tokio::select! {
                        read = connection.read_packet() => read,
                        _ = agent.closed() => {
                            debug!("connection {} force-closed", connection_id);
                            break;
                        }
                        _ = shutdown.recv() => {
                            debug!("connection {} stops reading on shutdown", connection_id);
                            break;
                        }
                    };
                    match read {
                        Ok(Some(packet)) => {
                            if packet_tx.send(packet).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => {
                            debug!("connection {} closed by client", connection_id);
                            break;
                        }
                        Err(e) => {
                            warn!("connection {} read error: {}", connection_id, e);
                            break;
                        }
                    }
                }
                drop(packet_tx);
                let _ = dispatch.await;
                agent.close().await;
                drop(permit);
            });
        }
    }
}

/// Rpc accept loop of a backend server; one acceptor per inbound frontend
/// link, same two-task shape as the frontend side.
pub struct BackendServer {
    listener: TcpListener,
    limit_connections: Arc<Semaphore>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
    remote_service: Arc<RemoteService>,
    acceptors: Arc<AcceptorDirectory>,
}

impl BackendServer {
    pub fn new(
        listener: TcpListener,
        limit_connections: Arc<Semaphore>,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
        remote_service: Arc<RemoteService>,
        acceptors: Arc<AcceptorDirectory>,
    ) -> BackendServer {
        BackendServer {
            listener,
            limit_connections,
            notify_shutdown,
            shutdown_complete_tx,
            remote_service,
            acceptors,
        }
    }

    pub async fn run(&self) -> AppResult<()> {
        let network = &global_config().network;
        loop {
            let permit = self
                .limit_connections
                .clone()
                .acquire_owned()
                .await
                .unwrap();

            let socket = accept(&self.listener).await?;
            let connection_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
            debug!("accepted rpc connection {}", connection_id);

            let (reader, writer) = socket.into_split();
            let acceptor = Acceptor::new(writer, self.acceptors.clone());
            self.acceptors.insert(acceptor.id(), acceptor.clone());

            let (request_tx, request_rx) = async_channel::bounded(network.dispatch_queue_size);

            let remote_service = self.remote_service.clone();
            let dispatch_acceptor = acceptor.clone();
            let dispatch_complete = self.shutdown_complete_tx.clone();
            let dispatch = tokio::spawn(async move {
                let _shutdown_complete_tx = dispatch_complete;
                remote_service.run(dispatch_acceptor, request_rx).await;
            });

            let mut connection = RpcConnection::new(
                reader,
                network.conn_read_buffer_size,
                network.max_rpc_record_size,
            );
            let notify_shutdown = self.notify_shutdown.clone();
            let read_complete = self.shutdown_complete_tx.clone();
            tokio::spawn(async move {
                let _shutdown_complete_tx = read_complete;
                let mut shutdown = Shutdown::subscribe(&notify_shutdown);
                loop {
                    let read = tokio::select! {
                        read = connection.read_record() => read,
                        _ = acceptor.closed() => {
                            debug!("rpc connection {} force-closed", connection_id);
                            break;
                        }
                        _ = shutdown.recv() => {
                            debug!("rpc connection {} stops reading on shutdown", connection_id);
                            break;
                        }
                    };
                    match read {
                        Ok(Some(record)) => {
                            acceptor.heartbeat();
                            match RpcRequest::decode(record) {
                                Ok(request) => {
                                    if request_tx.send(request).await.is_err() {
                                        break;
                                    }
                                }
                                Err(e) => {
                                    warn!(
                                        "rpc connection {} protocol error: {}",
                                        connection_id, e
                                    );
                                    break;
                                }
                            }
                        }
                        Ok(None) => {
                            debug!("rpc connection {} closed by peer", connection_id);
                            break;
                        }
                        Err(e) => {
                            warn!("rpc connection {} read error: {}", connection_id, e);
                            break;
                        }
                    }
                }
                drop(request_tx);
                let _ = dispatch.await;
                acceptor.close().await;
                drop(permit);
            });
        }
    }
}
