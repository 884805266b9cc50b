//! Managed Process - Direct process spawning with stdio capture
//!
//! The supervisor holds one of these for every server it launched itself:
//! - stdout/stderr handed to the descriptor's console relay
//! - stdin kept for command injection (lost forever if the daemon restarts)
//! - exit tracking through a watch channel

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::{ChildStdin, Command as TokioCommand};
use tokio::sync::{watch, Mutex};

use crate::console::ConsoleRelay;
use super::launch::LaunchPlan;

/// How a process ended, as seen by its waiter task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
}

/// A server process spawned and exclusively owned by the supervisor.
pub struct ManagedProcess {
    pub pid: u32,
    stdin: Mutex<Option<ChildStdin>>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
}

impl ManagedProcess {
    /// Spawn the server described by `plan` and bind its output to `relay`.
    pub fn spawn(plan: &LaunchPlan, relay: &ConsoleRelay) -> std::io::Result<Self> {
        let mut cmd = TokioCommand::new(&plan.program);
        cmd.args(&plan.args)
            .current_dir(&plan.working_dir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(false);

        crate::utils::apply_creation_flags(&mut cmd);

        let mut child = cmd.spawn()?;
        let pid = child.id().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "spawned process reported no PID")
        })?;

        let stdin = child.stdin.take();
        let drained = relay.attach(child.stdout.take(), child.stderr.take());

        let (exit_tx, exit_rx) = watch::channel(None);

        // ── process waiter ───────────────────────────────────
        tokio::spawn(async move {
            let info = match child.wait().await {
                Ok(status) => {
                    tracing::info!("Process {} exited with {}", pid, status);
                    ExitInfo { code: status.code() }
                }
                Err(e) => {
                    tracing::warn!("Failed to wait for process {}: {}", pid, e);
                    ExitInfo { code: None }
                }
            };
            // 마지막 출력까지 릴레이된 뒤에 종료를 알림 (손자 프로세스가 파이프를
            // 잡고 있을 수 있으므로 상한을 둠)
            let _ = tokio::time::timeout(Duration::from_secs(2), drained).await;
            let _ = exit_tx.send(Some(info));
        });

        Ok(Self {
            pid,
            stdin: Mutex::new(stdin),
            exit_rx,
        })
    }

    /// Write one command line to stdin and flush.
    pub async fn send_line(&self, command: &str) -> std::io::Result<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stdin already closed")
        })?;

        let data = if command.ends_with('\n') {
            command.to_string()
        } else {
            format!("{}\n", command)
        };
        let result = async {
            stdin.write_all(data.as_bytes()).await?;
            stdin.flush().await
        }
        .await;

        if result.is_err() {
            // 파이프가 깨졌으면 이후 쓰기도 모두 실패하므로 핸들을 버림
            *guard = None;
        }
        result
    }

    /// Whether the process is still running.
    pub fn is_running(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    /// A receiver that resolves once the process has exited.
    pub fn exit_watch(&self) -> watch::Receiver<Option<ExitInfo>> {
        self.exit_rx.clone()
    }

    /// Wait until the process exits, up to `timeout`. Returns the exit info
    /// or `None` on timeout.
    pub async fn wait_for_exit(&self, timeout: Duration) -> Option<ExitInfo> {
        let mut rx = self.exit_rx.clone();
        let waited = tokio::time::timeout(timeout, async {
            loop {
                if let Some(info) = *rx.borrow_and_update() {
                    return Some(info);
                }
                if rx.changed().await.is_err() {
                    return *rx.borrow();
                }
            }
        })
        .await;
        waited.ok().flatten()
    }
}

// ─── Tests ───────────────────────────────────────────────────

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::console::{LineSource, RelayEvent};
    use std::path::PathBuf;

    fn sh(script: &str) -> LaunchPlan {
        LaunchPlan {
            program: PathBuf::from("sh"),
            args: vec!["-c".into(), script.into()],
            working_dir: std::env::temp_dir(),
        }
    }

    #[tokio::test]
    async fn test_stdin_roundtrip_and_exit() {
        let relay = ConsoleRelay::default();
        let mut rx = relay.subscribe();
        let proc = ManagedProcess::spawn(
            &sh(r#"while read line; do echo "got $line"; [ "$line" = stop ] && exit 3; done"#),
            &relay,
        )
        .unwrap();
        assert!(proc.is_running());

        proc.send_line("hello").await.unwrap();
        proc.send_line("stop").await.unwrap();

        let info = proc.wait_for_exit(Duration::from_secs(5)).await.expect("process should exit");
        assert_eq!(info.code, Some(3));
        assert!(!proc.is_running());

        let mut texts = Vec::new();
        while let Ok(RelayEvent::Line(line)) = rx.try_recv() {
            assert_eq!(line.source, LineSource::Stdout);
            texts.push(line.text);
        }
        assert_eq!(texts, vec!["got hello", "got stop"]);
    }

    #[tokio::test]
    async fn test_stderr_is_relayed() {
        let relay = ConsoleRelay::default();
        let proc = ManagedProcess::spawn(&sh("echo oops >&2"), &relay).unwrap();
        proc.wait_for_exit(Duration::from_secs(5)).await.unwrap();
        let lines = relay.recent(10);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].source, LineSource::Stderr);
        assert_eq!(lines[0].text, "oops");
    }

    #[tokio::test]
    async fn test_wait_for_exit_times_out() {
        let relay = ConsoleRelay::default();
        let proc = ManagedProcess::spawn(&sh("sleep 30"), &relay).unwrap();
        assert!(proc.wait_for_exit(Duration::from_millis(200)).await.is_none());
        crate::supervisor::process::force_kill_tree(proc.pid).await.unwrap();
        assert!(proc.wait_for_exit(Duration::from_secs(5)).await.is_some());
    }

    #[tokio::test]
    async fn test_send_after_exit_fails() {
        let relay = ConsoleRelay::default();
        let proc = ManagedProcess::spawn(&sh("exit 0"), &relay).unwrap();
        proc.wait_for_exit(Duration::from_secs(5)).await.unwrap();
        // 읽는 쪽이 닫힌 파이프 → EPIPE
        let mut failed = false;
        for _ in 0..3 {
            if proc.send_line("anything").await.is_err() {
                failed = true;
                break;
            }
        }
        assert!(failed);
    }

    #[test]
    fn test_spawn_missing_program_fails() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let relay = ConsoleRelay::default();
            let plan = LaunchPlan {
                program: PathBuf::from("/definitely/not/a/runtime"),
                args: vec![],
                working_dir: std::env::temp_dir(),
            };
            let err = ManagedProcess::spawn(&plan, &relay).err().expect("spawn must fail");
            assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
        });
    }
}
