pub use app::App;
pub use app_error::{AppError, AppResult};
pub use config::{global_config, MeshConfig, NetworkConfig, NodeConfig, GLOBAL_CONFIG};
pub use server::{BackendServer, FrontendServer};
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing};

mod app;
mod app_error;
mod config;
mod server;
mod shutdown;
mod tracing_config;
