use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::time::Duration;
use tokio::{runtime, signal};
use tracing::{error, info};

use crate::cluster::{ClusterRegistry, RouterFn, RpcClientOptions, ServerInfo};
use crate::dispatch::{HandlerRegistry, HandlerService, RemoteRegistry, RemoteService};
use crate::network::{start_watchdog, AcceptorDirectory, AgentDirectory};
use crate::protocol::RouteDictionary;
use crate::session::SessionDirectory;
use crate::AppResult;

use super::config::{MeshConfig, GLOBAL_CONFIG};
use super::server::{BackendServer, FrontendServer};

/// Top-level application context of one mesh node.
///
/// Owns the connection/session directories and the cluster registry, and
/// injects them into every component that needs them; nothing below this
/// layer reaches for hidden process-wide state.
pub struct App {
    config: MeshConfig,
    sessions: Arc<SessionDirectory>,
    agents: Arc<AgentDirectory>,
    acceptors: Arc<AcceptorDirectory>,
    cluster: Arc<ClusterRegistry>,
    handlers: HandlerRegistry,
    remotes: RemoteRegistry,
    extra_routes: Vec<String>,
}

impl App {
    pub fn new(config: MeshConfig) -> App {
        GLOBAL_CONFIG.get_or_init(|| config.clone());
        let node = &config.node;
        let local = ServerInfo {
            server_type: node.server_type.clone(),
            server_id: node.server_id.clone(),
            host: node.host.clone(),
            port: if node.frontend {
                node.client_port
            } else {
                node.rpc_port
            },
            frontend: node.frontend,
            master: node.master,
        };
        let sessions = Arc::new(SessionDirectory::new());
        let options = RpcClientOptions {
            buffer_size: config.network.conn_read_buffer_size,
            max_record: config.network.max_rpc_record_size,
            ping_interval: Duration::from_secs(config.network.heartbeat_interval),
        };
        let cluster = ClusterRegistry::new(local, sessions.clone(), options);
        App {
            config,
            sessions,
            agents: Arc::new(AgentDirectory::new()),
            acceptors: Arc::new(AcceptorDirectory::new()),
            cluster,
            handlers: HandlerRegistry::new(),
            remotes: RemoteRegistry::new(),
            extra_routes: Vec::new(),
        }
    }

    /// Frontend service table; register methods before starting.
    pub fn handlers(&mut self) -> &mut HandlerRegistry {
        &mut self.handlers
    }

    /// Backend sys/user method tables; register before starting.
    pub fn remotes(&mut self) -> &mut RemoteRegistry {
        &mut self.remotes
    }

    pub fn cluster(&self) -> &Arc<ClusterRegistry> {
        &self.cluster
    }

    pub fn set_router(&self, server_type: impl Into<String>, router: RouterFn) {
        self.cluster.set_router(server_type, router);
    }

    /// Extra routes (typically backend ones that clients address directly)
    /// to include in the compression dictionary advertised at handshake.
    pub fn add_dictionary_routes<I, S>(&mut self, routes: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_routes.extend(routes.into_iter().map(Into::into));
    }

    /// Builds the runtime and serves until interrupted.
    pub fn start(self) -> AppResult<()> {
        let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
        rt.block_on(async move {
            tokio::select! {
                res = self.run() => {
                    if let Err(err) = res {
                        error!(cause = %err, "node exited with error");
                    }
                }
                _ = signal::ctrl_c() => {
                    info!("interrupt received, shutting down");
                }
            }
            Ok(())
        })
    }

    /// Serves forever; callers wanting signal handling use [`App::start`].
    pub async fn run(self) -> AppResult<()> {
        let App {
            config,
            sessions,
            agents,
            acceptors,
            cluster,
            handlers,
            remotes,
            extra_routes,
        } = self;

        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel::<()>(1);

        for member in &config.cluster.members {
            cluster.register_server(member.clone()).await;
        }

        // dictionary: local routes in both 2- and 3-part forms, plus any
        // explicitly advertised backend routes, sorted for stable codes
        let mut routes = handlers.route_names();
        let qualified: Vec<String> = routes
            .iter()
            .map(|route| format!("{}.{}", config.node.server_type, route))
            .collect();
        routes.extend(qualified);
        routes.extend(extra_routes);
        routes.sort();
        routes.dedup();
        RouteDictionary::install(routes);

        let heartbeat = Duration::from_secs(config.network.heartbeat_interval);
        let watchdog = start_watchdog(
            heartbeat,
            agents.clone(),
            acceptors.clone(),
            notify_shutdown.clone(),
        );

        let limit_connections = Arc::new(Semaphore::new(config.network.max_connection));
        let node = &config.node;
        let result = if node.frontend {
            let listen_address = format!("{}:{}", node.host, node.client_port);
            let listener = TcpListener::bind(&listen_address).await?;
            info!(
                "frontend {} listening for clients on {}",
                node.server_id, listen_address
            );
            let handler_service = Arc::new(HandlerService::new(
                handlers,
                cluster.clone(),
                config.network.heartbeat_interval,
            ));
            let server = FrontendServer::new(
                listener,
                limit_connections,
                notify_shutdown.clone(),
                shutdown_complete_tx.clone(),
                handler_service,
                cluster.clone(),
                sessions.clone(),
                agents.clone(),
            );
            server.run().await
        } else {
            let listen_address = format!("{}:{}", node.host, node.rpc_port);
            let listener = TcpListener::bind(&listen_address).await?;
            info!(
                "backend {} listening for rpc on {}",
                node.server_id, listen_address
            );
            let remote_service = Arc::new(RemoteService::new(remotes));
            let server = BackendServer::new(
                listener,
                limit_connections,
                notify_shutdown.clone(),
                shutdown_complete_tx.clone(),
                remote_service,
                acceptors.clone(),
            );
            server.run().await
        };

        let _ = notify_shutdown.send(());
        drop(shutdown_complete_tx);
        let _ = watchdog.await;
        let _ = shutdown_complete_rx.recv().await;
        info!("node {} shutdown complete", config.node.server_id);
        result
    }
}
