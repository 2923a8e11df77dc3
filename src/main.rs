use anyhow::Context;
use sim_circuits::networking::scheduler::EmptyScene;
use sim_circuits::networking::{CircuitManager, LoggingMessageService};
use sim_circuits::utils::logging::init_logging;
use sim_circuits::{load_settings, APP_NAME, VERSION};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let path = std::env::args_os().nth(1).map(PathBuf::from);
    let settings = load_settings(path.as_deref())?;
    info!("{} {} starting", APP_NAME, VERSION);

    let manager = CircuitManager::bind(
        settings,
        Arc::new(EmptyScene::default()),
        Arc::new(LoggingMessageService),
    )
    .await
    .context("binding UDP socket")?;
    manager.start();

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("Shutting down");
    manager.shutdown().await;
    Ok(())
}
