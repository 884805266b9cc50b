use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use hearth_core::auth::{AuthRegistry, SystemBrowser};
use hearth_core::config::GlobalConfig;
use hearth_core::instance::InstanceStore;
use hearth_core::ipc::IPCServer;
use hearth_core::supervisor::{Supervisor, SupervisorOptions};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    tracing::info!("Hearth core daemon starting");

    let cfg = GlobalConfig::load().context("Failed to load configuration")?;

    let store = Arc::new(
        InstanceStore::open(&cfg.instances_file)
            .with_context(|| format!("Failed to open {}", cfg.instances_file.display()))?,
    );
    let supervisor = Arc::new(Supervisor::new(store, SupervisorOptions::from(&cfg)));
    if let Err(e) = supervisor.initialize().await {
        tracing::warn!("Failed to initialize supervisor: {}", e);
    }

    let auth = Arc::new(AuthRegistry::new(supervisor.clone(), Arc::new(SystemBrowser)));
    let ipc_server = IPCServer::new(supervisor, auth, &cfg.ipc_listen);

    // Ctrl+C 시 IPC만 닫음. 실행 중인 서버는 PID로 다음 실행 때 재연결
    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Shutdown signal received; servers keep running and will be reattached by PID");
    };

    if let Err(e) = ipc_server.start(shutdown).await {
        tracing::error!("IPC server error: {}", e);
        return Err(e);
    }

    tracing::info!("Hearth core daemon shutting down");
    Ok(())
}
