//! OS-level termination of a server process tree.
//!
//! Works from a bare PID so it applies equally to processes this daemon
//! spawned and to processes rediscovered after a restart.

use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::process_monitor;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("failed to terminate process {pid}: {reason}")]
    TerminationFailed { pid: u32, reason: String },
}

/// Force-kill `pid` and every descendant. Cross-platform.
///
/// Errors are reported but the caller decides success by re-checking
/// liveness; a kill racing a natural exit is not a failure.
pub async fn force_kill_tree(pid: u32) -> Result<(), ProcessError> {
    #[cfg(target_os = "windows")]
    {
        let output = tokio::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/T", "/F"])
            .creation_flags(0x08000000)
            .output()
            .await
            .map_err(|e| ProcessError::TerminationFailed {
                pid,
                reason: format!("taskkill could not run: {}", e),
            })?;
        if !output.status.success() {
            // taskkill 실패 시 TerminateProcess로 직접 종료 시도
            return terminate_process(pid);
        }
        Ok(())
    }

    #[cfg(not(target_os = "windows"))]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        // 자식부터 먼저 종료 (리더가 먼저 죽으면 자식이 init에 입양되어 추적 불가)
        for child in process_monitor::descendants_async(pid).await {
            let _ = signal::kill(Pid::from_raw(child as i32), Signal::SIGKILL);
        }
        // 직접 띄운 서버는 자기 프로세스 그룹의 리더
        let _ = signal::killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);

        match signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(ProcessError::TerminationFailed {
                pid,
                reason: format!("Failed to send signal: {}", e),
            }),
        }
    }
}

#[cfg(target_os = "windows")]
fn terminate_process(pid: u32) -> Result<(), ProcessError> {
    use winapi::um::handleapi::CloseHandle;
    use winapi::um::processthreadsapi::{OpenProcess, TerminateProcess};
    use winapi::um::winnt::PROCESS_TERMINATE;

    unsafe {
        let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
        if handle.is_null() {
            return Err(ProcessError::TerminationFailed {
                pid,
                reason: "Failed to open process".to_string(),
            });
        }
        let result = TerminateProcess(handle, 1);
        CloseHandle(handle);
        if result == 0 {
            return Err(ProcessError::TerminationFailed {
                pid,
                reason: "TerminateProcess failed".to_string(),
            });
        }
    }
    Ok(())
}

/// Poll the process table until `pid` is gone or `timeout` elapses.
/// Returns `true` when the process exited.
pub async fn wait_for_pid_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !process_monitor::is_running_async(pid).await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_force_kill_tree_kills_child_and_grandchild() {
        use std::os::unix::process::CommandExt;

        // sh -> sleep (손자 프로세스)
        let mut child = std::process::Command::new("sh")
            .args(["-c", "sleep 30 & wait"])
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let grandchildren = process_monitor::descendants(pid);

        force_kill_tree(pid).await.unwrap();
        let _ = child.wait();

        assert!(wait_for_pid_exit(pid, Duration::from_secs(5)).await);
        for gc in grandchildren {
            assert!(wait_for_pid_exit(gc, Duration::from_secs(5)).await, "grandchild {} survived", gc);
        }
    }

    #[tokio::test]
    async fn test_force_kill_missing_pid_is_ok() {
        assert!(force_kill_tree(u32::MAX / 2 - 3).await.is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_pid_exit_times_out_for_live_process() {
        assert!(!wait_for_pid_exit(std::process::id(), Duration::from_millis(300)).await);
    }
}
