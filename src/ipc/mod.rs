pub mod handlers;

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::auth::AuthRegistry;
use crate::instance::{AuthMode, ServerDescriptor};
use crate::supervisor::state_machine::Phase;
use crate::supervisor::Supervisor;

/// IPC 요청/응답 타입
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateInstanceRequest {
    pub name: String,
    pub server_root: PathBuf,
    #[serde(default)]
    pub assets_path: Option<PathBuf>,
    #[serde(default)]
    pub runtime_path: Option<PathBuf>,
    #[serde(default)]
    pub bind_address: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub min_memory_mb: Option<u32>,
    #[serde(default)]
    pub max_memory_mb: Option<u32>,
    #[serde(default)]
    pub auth_mode: Option<AuthMode>,
}

impl CreateInstanceRequest {
    pub fn into_descriptor(self) -> ServerDescriptor {
        let mut d = ServerDescriptor::new(&self.name, self.server_root);
        d.assets_path = self.assets_path;
        d.runtime_path = self.runtime_path;
        if let Some(addr) = self.bind_address {
            d.bind_address = addr;
        }
        if let Some(port) = self.port {
            d.port = port;
        }
        if let Some(min) = self.min_memory_mb {
            d.min_memory_mb = min;
        }
        if let Some(max) = self.max_memory_mb {
            d.max_memory_mb = max;
        }
        if let Some(mode) = self.auth_mode {
            d.auth_mode = mode;
        }
        d
    }
}

/// 인스턴스 + 현재 전이 상태
#[derive(Debug, Clone, Serialize)]
pub struct InstanceInfo {
    #[serde(flatten)]
    pub descriptor: ServerDescriptor,
    pub phase: Phase,
}

/// IPC Server State
#[derive(Clone)]
pub struct IPCServer {
    pub supervisor: Arc<Supervisor>,
    pub auth: Arc<AuthRegistry>,
    pub listen_addr: String,
}

impl IPCServer {
    pub fn new(supervisor: Arc<Supervisor>, auth: Arc<AuthRegistry>, listen_addr: &str) -> Self {
        Self {
            supervisor,
            auth,
            listen_addr: listen_addr.to_string(),
        }
    }

    pub fn router(&self) -> Router {
        use handlers::{auth, console, instance, server};

        Router::new()
            .route("/api/instances", get(instance::list_instances).post(instance::create_instance))
            .route("/api/instance/:id", get(instance::get_instance).delete(instance::delete_instance))
            .route("/api/instance/:id/start", post(server::start_server_handler))
            .route("/api/instance/:id/stop", post(server::stop_server_handler))
            .route("/api/instance/:id/restart", post(server::restart_server_handler))
            .route("/api/instance/:id/command", post(server::execute_command))
            .route("/api/instance/:id/probe", get(server::probe_server_handler))
            .route("/api/instance/:id/console", get(console::get_console_handler).delete(console::clear_console_handler))
            .route("/api/instance/:id/auth/login", post(auth::begin_login_handler))
            .route("/api/instance/:id/auth", get(auth::get_auth_handler))
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
            .with_state(self.clone())
    }

    pub async fn start<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tracing::info!("IPC HTTP server starting on {}", self.listen_addr);
        let router = self.router();

        // TCP 리스너
        let listener = tokio::net::TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("IPC listening on http://{}", self.listen_addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}
