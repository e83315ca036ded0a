use clap::Parser;
use tracing::info;

use crossgate::{setup_local_tracing, setup_tracing, App, AppResult, MeshConfig};

/// A mesh node: a frontend gateway or a backend logic server, per its
/// config file. Library users embed [`crossgate::App`] directly to register
/// handlers; this binary starts a bare node, which on the frontend side is
/// a pure forwarding gateway.
#[derive(Parser, Debug)]
#[command(name = "crossgate", version, about = "distributed game server mesh node")]
struct Args {
    /// path to the node's TOML config file
    #[arg(short, long, default_value = "conf/crossgate.toml")]
    config: String,

    /// write logs into this directory instead of the console only
    #[arg(long)]
    log_dir: Option<String>,
}

fn main() -> AppResult<()> {
    let args = Args::parse();
    let config = MeshConfig::set_up_config(&args.config)?;

    let _guard = match &args.log_dir {
        Some(dir) => Some(setup_tracing(dir, &config.node.server_id)),
        None => {
            setup_local_tracing();
            None
        }
    };

    info!(
        "starting {} node {} ({})",
        if config.node.frontend {
            "frontend"
        } else {
            "backend"
        },
        config.node.server_id,
        config.node.server_type
    );

    App::new(config).start()
}
