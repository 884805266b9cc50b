use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// 서버 실행 시 인증 방식
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    #[default]
    Authenticated,
    Offline,
}

/// 저장되는 실행 상태 (전이 중 상태는 메모리에만 존재)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    #[default]
    Stopped,
    Running,
}

/// 서버 디스크립터 - 관리 대상 서버 하나의 설정 + 실행 상태
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerDescriptor {
    pub id: String,                    // 고유 ID (uuid), 생성 후 불변
    pub name: String,                  // 사용자 지정 이름
    pub server_root: PathBuf,          // 서버 설치 루트 (Server/, Assets.zip 포함)
    #[serde(default)]
    pub assets_path: Option<PathBuf>,  // 비어 있으면 <root>/Assets.zip
    #[serde(default)]
    pub runtime_path: Option<PathBuf>, // 비어 있으면 PATH의 java
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_min_memory")]
    pub min_memory_mb: u32,
    #[serde(default = "default_max_memory")]
    pub max_memory_mb: u32,
    #[serde(default = "default_true")]
    pub use_aot_cache: bool,
    #[serde(default)]
    pub disable_sentry: bool,          // 텔레메트리 비활성화
    #[serde(default)]
    pub enable_backups: bool,
    #[serde(default = "default_backup_frequency")]
    pub backup_frequency_minutes: u32,
    #[serde(default)]
    pub backup_directory: Option<PathBuf>,
    #[serde(default)]
    pub auth_mode: AuthMode,
    #[serde(default)]
    pub run_state: RunState,
    #[serde(default)]
    pub process_id: Option<u32>,       // 재연결 키 (약한 참조)
    #[serde(default)]
    pub last_started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub console_cleared: bool,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5520
}

fn default_min_memory() -> u32 {
    2048
}

fn default_max_memory() -> u32 {
    4096
}

fn default_backup_frequency() -> u32 {
    30
}

fn default_true() -> bool {
    true
}

impl ServerDescriptor {
    pub fn new(name: &str, server_root: impl Into<PathBuf>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            server_root: server_root.into(),
            assets_path: None,
            runtime_path: None,
            bind_address: default_bind_address(),
            port: default_port(),
            min_memory_mb: default_min_memory(),
            max_memory_mb: default_max_memory(),
            use_aot_cache: true,
            disable_sentry: false,
            enable_backups: false,
            backup_frequency_minutes: default_backup_frequency(),
            backup_directory: None,
            auth_mode: AuthMode::Authenticated,
            run_state: RunState::Stopped,
            process_id: None,
            last_started: None,
            console_cleared: false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.run_state == RunState::Running
    }

    /// Directory holding the server jar; also the launch working directory.
    pub fn server_dir(&self) -> PathBuf {
        self.server_root.join("Server")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.server_dir().join("logs")
    }

    pub fn resolved_assets_path(&self) -> PathBuf {
        match &self.assets_path {
            Some(p) if !p.as_os_str().is_empty() => p.clone(),
            _ => self.server_root.join("Assets.zip"),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("descriptor id must not be empty".into());
        }
        if self.min_memory_mb > self.max_memory_mb {
            return Err(format!(
                "minimum memory ({} MB) exceeds maximum memory ({} MB)",
                self.min_memory_mb, self.max_memory_mb
            ));
        }
        if self.port == 0 {
            return Err("port must be between 1 and 65535".into());
        }
        if self.is_running() && self.process_id.is_none() {
            return Err("a running descriptor must carry a process id".into());
        }
        Ok(())
    }

    /// 실행 상태를 stopped로 되돌리고 PID를 비운다.
    pub(crate) fn mark_stopped(&mut self) {
        self.run_state = RunState::Stopped;
        self.process_id = None;
    }
}

/// External descriptor persistence boundary.
///
/// The supervisor only needs these four calls and never depends on the
/// underlying serialization format.
pub trait DescriptorStore: Send + Sync {
    fn load(&self, id: &str) -> Result<Option<ServerDescriptor>>;
    fn save(&self, descriptor: &ServerDescriptor) -> Result<()>;
    fn delete(&self, id: &str) -> Result<()>;
    fn list(&self) -> Result<Vec<ServerDescriptor>>;
}

/// 인스턴스 저장소 - instances.json 관리
pub struct InstanceStore {
    file_path: PathBuf,
    instances: Mutex<Vec<ServerDescriptor>>,
}

impl InstanceStore {
    pub fn new(file_path: impl AsRef<Path>) -> Self {
        Self {
            file_path: file_path.as_ref().to_path_buf(),
            instances: Mutex::new(Vec::new()),
        }
    }

    /// Open a store and load whatever is on disk.
    pub fn open(file_path: impl AsRef<Path>) -> Result<Self> {
        let store = Self::new(file_path);
        store.reload()?;
        Ok(store)
    }

    /// 파일에서 인스턴스 로드
    pub fn reload(&self) -> Result<()> {
        let loaded = if !self.file_path.exists() {
            tracing::info!("Instance store file does not exist, starting empty");
            Vec::new()
        } else {
            let content = fs::read_to_string(&self.file_path)
                .with_context(|| format!("reading {}", self.file_path.display()))?;
            serde_json::from_str::<Vec<ServerDescriptor>>(&content)
                .with_context(|| format!("parsing {}", self.file_path.display()))?
        };
        tracing::info!("Loaded {} instances", loaded.len());
        *self.lock() = loaded;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ServerDescriptor>> {
        self.instances.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 파일에 인스턴스 저장
    fn persist(&self, instances: &[ServerDescriptor]) -> Result<()> {
        if let Some(parent) = self.file_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let content = serde_json::to_string_pretty(instances)?;
        fs::write(&self.file_path, content)
            .with_context(|| format!("writing {}", self.file_path.display()))?;
        tracing::debug!("Saved {} instances", instances.len());
        Ok(())
    }
}

impl DescriptorStore for InstanceStore {
    fn load(&self, id: &str) -> Result<Option<ServerDescriptor>> {
        Ok(self.lock().iter().find(|d| d.id == id).cloned())
    }

    fn save(&self, descriptor: &ServerDescriptor) -> Result<()> {
        descriptor
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid descriptor '{}': {}", descriptor.id, e))?;
        let mut instances = self.lock();
        match instances.iter().position(|d| d.id == descriptor.id) {
            Some(pos) => instances[pos] = descriptor.clone(),
            None => instances.push(descriptor.clone()),
        }
        self.persist(&instances)
    }

    /// 인스턴스 제거 (디스크의 서버 파일은 건드리지 않음)
    fn delete(&self, id: &str) -> Result<()> {
        let mut instances = self.lock();
        instances.retain(|d| d.id != id);
        self.persist(&instances)
    }

    fn list(&self) -> Result<Vec<ServerDescriptor>> {
        Ok(self.lock().clone())
    }
}
