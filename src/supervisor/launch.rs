//! Launch plan - turns a descriptor into the exact program, arguments and
//! working directory handed to the OS.
//!
//! Flag spellings are dictated by the server binary and must not drift.

use std::path::{Path, PathBuf};

use crate::instance::{AuthMode, ServerDescriptor};
use super::error::SupervisorError;

pub const SERVER_JAR: &str = "HytaleServer.jar";
pub const AOT_CACHE: &str = "HytaleServer.aot";
const DEFAULT_RUNTIME: &str = "java";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

impl LaunchPlan {
    /// Build the launch plan, failing with `MissingArtifact` when the server
    /// jar or assets archive is absent.
    pub fn build(descriptor: &ServerDescriptor) -> Result<Self, SupervisorError> {
        let server_dir = descriptor.server_dir();
        let jar = server_dir.join(SERVER_JAR);
        if !jar.is_file() {
            return Err(SupervisorError::MissingArtifact(jar));
        }
        let assets = descriptor.resolved_assets_path();
        if !assets.is_file() {
            return Err(SupervisorError::MissingArtifact(assets));
        }

        let aot_cache = Some(server_dir.join(AOT_CACHE))
            .filter(|p| descriptor.use_aot_cache && p.is_file());

        Ok(Self {
            program: runtime_program(descriptor),
            args: build_args(descriptor, &jar, &assets, aot_cache.as_deref()),
            working_dir: server_dir,
        })
    }
}

fn runtime_program(descriptor: &ServerDescriptor) -> PathBuf {
    match &descriptor.runtime_path {
        Some(p) if !p.as_os_str().is_empty() => p.clone(),
        _ => PathBuf::from(DEFAULT_RUNTIME),
    }
}

/// Pure argument assembly; every enabled option appears exactly once.
pub fn build_args(
    descriptor: &ServerDescriptor,
    jar: &Path,
    assets: &Path,
    aot_cache: Option<&Path>,
) -> Vec<String> {
    let mut args = vec![
        format!("-Xms{}M", descriptor.min_memory_mb),
        format!("-Xmx{}M", descriptor.max_memory_mb),
    ];

    if let Some(cache) = aot_cache {
        args.push(format!("-XX:AOTCache={}", cache.display()));
    }

    args.push("-jar".into());
    args.push(jar.display().to_string());
    args.push("--assets".into());
    args.push(assets.display().to_string());
    args.push("--bind".into());
    args.push(bind_endpoint(descriptor));

    if descriptor.disable_sentry {
        args.push("--disable-sentry".into());
    }

    if descriptor.enable_backups {
        args.push("--backup".into());
        if let Some(dir) = descriptor
            .backup_directory
            .as_ref()
            .filter(|d| !d.as_os_str().is_empty())
        {
            args.push("--backup-dir".into());
            args.push(dir.display().to_string());
        }
        args.push("--backup-frequency".into());
        args.push(descriptor.backup_frequency_minutes.to_string());
    }

    if descriptor.auth_mode == AuthMode::Offline {
        args.push("--auth-mode".into());
        args.push("offline".into());
    }

    args
}

/// `<address>:<port>` as passed to `--bind`; also the liveness-probe key.
pub fn bind_endpoint(descriptor: &ServerDescriptor) -> String {
    format!("{}:{}", descriptor.bind_address, descriptor.port)
}
