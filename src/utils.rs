//! Shared utility functions for the hearth core daemon.

use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use regex::Regex;
use tokio::process::Command;

/// Windows `CREATE_NO_WINDOW` process creation flag.
#[cfg(target_os = "windows")]
pub const CREATE_NO_WINDOW: u32 = 0x08000000;

/// Apply platform-specific spawn flags for a supervised server.
///
/// Windows: hide the console window. Unix: put the child in its own process
/// group so the whole tree can be signalled on forced stop.
#[cfg(target_os = "windows")]
pub fn apply_creation_flags(cmd: &mut Command) -> &mut Command {
    cmd.creation_flags(CREATE_NO_WINDOW)
}

#[cfg(not(target_os = "windows"))]
pub fn apply_creation_flags(cmd: &mut Command) -> &mut Command {
    cmd.process_group(0)
}

/// Remove ANSI/VT escape sequences from a console line.
///
/// Also strips the bare `[..m` remnants some consoles leave behind once the
/// ESC byte has been eaten by an intermediate pipe.
pub fn strip_ansi(text: &str) -> String {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    let re = ANSI.get_or_init(|| {
        Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b[@-Z\\-_]|\[[0-9;]*m")
            .expect("static ANSI pattern")
    });
    re.replace_all(text, "").into_owned()
}

/// Current unix timestamp in seconds.
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_ansi_color_codes() {
        let line = "\x1b[32mOr visit:\x1b[0m https://example/device";
        assert_eq!(strip_ansi(line), "Or visit: https://example/device");
    }

    #[test]
    fn test_strip_ansi_orphaned_sequences() {
        // ESC 바이트가 유실된 채 남은 컬러 코드
        assert_eq!(strip_ansi("[1;33mEnter code:[0m AB12"), "Enter code: AB12");
    }

    #[test]
    fn test_strip_ansi_keeps_profile_brackets() {
        assert_eq!(strip_ansi("[1] alice"), "[1] alice");
    }

    #[test]
    fn test_current_timestamp_nonzero() {
        assert!(current_timestamp() > 0);
    }
}
