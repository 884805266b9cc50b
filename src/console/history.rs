//! Log-file replay for reattached servers.
//!
//! A reattached process's stdout is gone for good, so the newest `*.log` file
//! in the server's logs directory stands in as console history.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Lines replayed on reattachment.
pub const REPLAY_LINES: usize = 500;

/// Most recently modified `*.log` in `logs_dir`, if any.
pub fn latest_log_file(logs_dir: &Path) -> Option<PathBuf> {
    // 디렉터리 경로의 [ ] * ? 는 패턴으로 해석되지 않게 이스케이프
    let dir = glob::Pattern::escape(logs_dir.to_str()?);
    let pattern = Path::new(&dir).join("*.log");

    glob::glob(pattern.to_str()?)
        .ok()?
        .filter_map(Result::ok)
        .filter_map(|path| {
            let modified = fs::metadata(&path).and_then(|m| m.modified()).ok()?;
            Some((modified, path))
        })
        .max_by_key(|(modified, _): &(SystemTime, PathBuf)| *modified)
        .map(|(_, path)| path)
}

/// Final `limit` lines of the newest log file. Missing directories and
/// unreadable files yield an empty history.
pub fn tail_latest_log(logs_dir: &Path, limit: usize) -> Vec<String> {
    let Some(path) = latest_log_file(logs_dir) else {
        return Vec::new();
    };
    match fs::read(&path) {
        Ok(bytes) => {
            let text = String::from_utf8_lossy(&bytes);
            let lines: Vec<&str> = text.lines().collect();
            let start = lines.len().saturating_sub(limit);
            lines[start..].iter().map(|l| l.to_string()).collect()
        }
        Err(e) => {
            tracing::warn!("Failed to read log history {}: {}", path.display(), e);
            Vec::new()
        }
    }
}
