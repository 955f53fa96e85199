//! Control-plane daemon entry point.

use clap::Parser;
use flowmesh_governor::{Controller, ControlPlaneConfig};

#[derive(Parser)]
#[command(name = "flowmesh-governor")]
#[command(about = "Adaptive execution control plane for a serverless workflow mesh")]
struct Cli {
    /// Path to a TOML configuration file, overriding defaults
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = ControlPlaneConfig::load(cli.config.as_deref())?;
    let controller = Controller::new(config);

    let shutdown = tokio::signal::ctrl_c();
    tokio::select! {
        result = controller.start() => result?,
        _ = shutdown => {
            controller.stop().await;
        }
    }

    Ok(())
}
