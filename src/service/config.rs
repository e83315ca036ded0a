use std::path::Path;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::cluster::ServerInfo;

use super::{AppError, AppResult};

pub static GLOBAL_CONFIG: OnceCell<MeshConfig> = OnceCell::new();
pub fn global_config() -> &'static MeshConfig {
    GLOBAL_CONFIG.get().unwrap()
}

/// Identity of this server process in the mesh.
#[derive(Debug, Default, Serialize, Deserialize, Clone)]
pub struct NodeConfig {
    pub server_type: String,
    pub server_id: String,
    pub host: String,
    /// client-facing listen port on frontend servers
    pub client_port: u16,
    /// rpc listen port on backend servers
    pub rpc_port: u16,
    pub frontend: bool,
    #[serde(default)]
    pub master: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NetworkConfig {
    /// seconds between heartbeats; the watchdog deadline is twice this
    pub heartbeat_interval: u64,
    pub max_connection: usize,
    pub conn_read_buffer_size: usize,
    pub max_rpc_record_size: usize,
    /// capacity of each per-connection dispatch queue
    pub dispatch_queue_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            heartbeat_interval: 30,
            max_connection: 4096,
            conn_read_buffer_size: 4 * 1024,
            max_rpc_record_size: 1 << 20,
            dispatch_queue_size: 128,
        }
    }
}

/// Static cluster membership, registered at startup. Servers may still be
/// registered and removed dynamically at runtime.
#[derive(Debug, Default, Serialize, Deserialize, Clone)]
pub struct ClusterConfig {
    #[serde(default)]
    pub members: Vec<ServerInfo>,
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
pub struct MeshConfig {
    pub node: NodeConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
}

impl MeshConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<MeshConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .build()?;
        let mesh_config: MeshConfig = config.try_deserialize()?;
        Ok(mesh_config)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_load_from_toml() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("gate.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"
[node]
server_type = "gate"
server_id = "gate-1"
host = "127.0.0.1"
client_port = 3250
rpc_port = 0
frontend = true

[network]
heartbeat_interval = 10
max_connection = 64
conn_read_buffer_size = 4096
max_rpc_record_size = 1048576
dispatch_queue_size = 32

[[cluster.members]]
server_type = "game"
server_id = "game-1"
host = "127.0.0.1"
port = 4250
frontend = false
"#
        )
        .unwrap();

        let config = MeshConfig::set_up_config(&path).unwrap();
        assert_eq!(config.node.server_id, "gate-1");
        assert!(config.node.frontend);
        assert_eq!(config.network.heartbeat_interval, 10);
        assert_eq!(config.cluster.members.len(), 1);
        assert_eq!(config.cluster.members[0].server_type, "game");
    }

    #[test]
    fn test_missing_file_reported() {
        assert!(MeshConfig::set_up_config("/definitely/not/here.toml").is_err());
    }
}
