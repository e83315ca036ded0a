use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tracing::{debug, warn};

use super::{AcceptorDirectory, AgentDirectory, AgentStatus};
use crate::service::Shutdown;
use crate::session::NetworkEntity;

/// Periodic liveness scan over the connection directories.
///
/// Working agents get one heartbeat probe per tick; a failed probe closes
/// the connection immediately rather than waiting out the deadline. Any
/// endpoint whose last contact predates twice the heartbeat interval is
/// forcibly closed.
pub fn start_watchdog(
    heartbeat_interval: Duration,
    agents: Arc<AgentDirectory>,
    acceptors: Arc<AcceptorDirectory>,
    notify_shutdown: broadcast::Sender<()>,
) -> JoinHandle<()> {
    let deadline = heartbeat_interval * 2;
    tokio::spawn(async move {
        let mut shutdown = Shutdown::subscribe(&notify_shutdown);
        let mut interval = time::interval(heartbeat_interval);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("watchdog received shutdown signal");
                    break;
                }
                _ = interval.tick() => {}
            }

            // snapshot first: close() mutates the directories being scanned
            let scanned: Vec<_> = agents.iter().map(|entry| entry.value().clone()).collect();
            for agent in scanned {
                if agent.status() != AgentStatus::Working {
                    continue;
                }
                let idle = agent.last_contact().elapsed();
                if idle >= deadline {
                    warn!(
                        "session {} idle for {:?}, closing",
                        agent.session().id(),
                        idle
                    );
                    agent.close().await;
                } else if let Err(e) = agent.send_heartbeat().await {
                    warn!(
                        "heartbeat to session {} failed ({}), closing",
                        agent.session().id(),
                        e
                    );
                    agent.close().await;
                }
            }

            let scanned: Vec<_> = acceptors.iter().map(|entry| entry.value().clone()).collect();
            for acceptor in scanned {
                let idle = acceptor.last_contact().elapsed();
                if idle >= deadline {
                    warn!("acceptor {} idle for {:?}, closing", acceptor.id(), idle);
                    acceptor.close().await;
                }
            }
        }
    })
}
