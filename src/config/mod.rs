use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

pub const DEFAULT_CONFIG_PATH: &str = "config/global.toml";
pub const CONFIG_PATH_ENV: &str = "HEARTH_CONFIG";

/// 데몬 전역 설정 (`config/global.toml`)
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct GlobalConfig {
    /// IPC HTTP 서버 바인드 주소
    pub ipc_listen: String,
    /// 인스턴스 저장 파일
    pub instances_file: PathBuf,
    /// 인스턴스당 콘솔 링 버퍼 줄 수
    pub console_buffer_size: usize,
    /// 명령줄을 읽을 수 없는 프로세스를 서버로 간주할지 여부
    pub trust_unverifiable_process: bool,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            ipc_listen: "127.0.0.1:57480".to_string(),
            instances_file: PathBuf::from("./instances.json"),
            console_buffer_size: crate::console::DEFAULT_BUFFER_LINES,
            trust_unverifiable_process: true,
        }
    }
}

impl GlobalConfig {
    /// `HEARTH_CONFIG` 또는 기본 경로에서 로드
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load_from(&path)
    }

    /// 파일이 없으면 기본값, 형식이 잘못되었으면 에러
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let cfg: Self = toml::from_str(&s)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.console_buffer_size == 0 {
            anyhow::bail!("console_buffer_size must be greater than zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_config_default() {
        let cfg = GlobalConfig::default();
        assert_eq!(cfg.ipc_listen, "127.0.0.1:57480");
        assert_eq!(cfg.console_buffer_size, 2000);
        assert!(cfg.trust_unverifiable_process);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = GlobalConfig::load_from(&tmp.path().join("global.toml")).unwrap();
        assert_eq!(cfg, GlobalConfig::default());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("global.toml");
        std::fs::write(
            &path,
            "ipc_listen = \"0.0.0.0:9000\"\ntrust_unverifiable_process = false\n",
        )
        .unwrap();

        let cfg = GlobalConfig::load_from(&path).unwrap();
        assert_eq!(cfg.ipc_listen, "0.0.0.0:9000");
        assert!(!cfg.trust_unverifiable_process);
        assert_eq!(cfg.instances_file, PathBuf::from("./instances.json"));
    }

    #[test]
    fn test_malformed_file_is_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("global.toml");
        std::fs::write(&path, "ipc_listen = [").unwrap();
        assert!(GlobalConfig::load_from(&path).is_err());

        std::fs::write(&path, "console_buffer_size = 0").unwrap();
        assert!(GlobalConfig::load_from(&path).is_err());
    }
}
