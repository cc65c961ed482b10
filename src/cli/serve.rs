use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::core::config::EngineConfig;
use crate::core::engine::{Engine, RegistryComponent};
use crate::core::lifecycle::LifecycleManager;
use crate::core::terminal;
use crate::interfaces::web::{ApiServer, ApiServerConfig};

pub async fn run_server(data_dir: PathBuf, config: EngineConfig) -> Result<()> {
    let log_tx = crate::logging::init_logging(false);
    info!("Starting subroutines engine...");

    let engine = Engine::boot(&data_dir, config).await?;
    let host = engine.config.server.host.clone();
    let port = engine.config.server.port;

    let mut lifecycle = LifecycleManager::new();
    lifecycle.attach(Arc::new(Mutex::new(RegistryComponent::new(
        engine.store.clone(),
        engine.registry.clone(),
        engine.config.engine.resume_active,
    ))));
    lifecycle.attach(Arc::new(Mutex::new(ApiServer::new(ApiServerConfig {
        store: engine.store.clone(),
        registry: engine.registry.clone(),
        user_name: engine.config.engine.user_name.clone(),
        log_tx,
        api_host: host.clone(),
        api_port: port,
    }))));

    if let Err(e) = lifecycle.start().await {
        lifecycle.shutdown().await;
        return Err(e);
    }

    terminal::print_success("Engine is running.");
    terminal::print_link("API", &format!("http://{}:{}/api", host, port));
    terminal::print_status("Data", &engine.data_dir.display().to_string());
    terminal::print_info("Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received, shutting down");
    lifecycle.shutdown().await;
    Ok(())
}
