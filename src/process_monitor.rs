use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, System, UpdateKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunningProcess {
    pub pid: u32,
    pub name: String,
    /// 프로세스 커맨드라인 인수 (예: ["java", "-jar", "HytaleServer.jar"])
    /// 권한 부족 등으로 읽을 수 없으면 비어 있음
    #[serde(default)]
    pub cmd: Vec<String>,
}

fn is_live(status: ProcessStatus) -> bool {
    // 회수되지 않은 좀비는 이미 종료된 것으로 본다
    !matches!(status, ProcessStatus::Zombie | ProcessStatus::Dead)
}

/// PID로 살아 있는 프로세스 조회 (크로스 플랫폼)
pub fn lookup(pid: u32) -> Option<RunningProcess> {
    // 기본 refresh_processes()는 커맨드라인을 읽지 않으므로 cmd를 명시적으로 요청
    let mut sys = System::new();
    sys.refresh_processes_specifics(ProcessRefreshKind::new().with_cmd(UpdateKind::OnlyIfNotSet));
    sys.process(Pid::from_u32(pid))
        .filter(|p| is_live(p.status()))
        .map(|p| RunningProcess {
            pid,
            name: p.name().to_string(),
            cmd: p.cmd().to_vec(),
        })
}

/// 특정 PID가 실행 중인지 확인
pub fn is_running(pid: u32) -> bool {
    lookup(pid).is_some()
}

/// `root` 아래의 모든 자손 PID (깊은 자식부터, root 제외)
pub fn descendants(root: u32) -> Vec<u32> {
    let mut sys = System::new();
    sys.refresh_processes();

    let mut found = Vec::new();
    let mut frontier = vec![Pid::from_u32(root)];
    while let Some(parent) = frontier.pop() {
        for (pid, process) in sys.processes() {
            if process.parent() == Some(parent) && !found.contains(&pid.as_u32()) {
                found.push(pid.as_u32());
                frontier.push(*pid);
            }
        }
    }
    found.reverse();
    found
}

// ── Async wrappers ─────────────────────────────────────────
// sysinfo 시스템 콜은 동기적으로 OS 프로세스 테이블 전체를 스캔합니다.
// tokio 워커 스레드에서 직접 호출하면 런타임 전체가 블로킹되므로,
// spawn_blocking을 통해 전용 블로킹 스레드풀에서 실행합니다.

/// `lookup`의 비동기 래퍼.
pub async fn lookup_async(pid: u32) -> Option<RunningProcess> {
    tokio::task::spawn_blocking(move || lookup(pid))
        .await
        .unwrap_or(None)
}

/// `is_running`의 비동기 래퍼.
pub async fn is_running_async(pid: u32) -> bool {
    tokio::task::spawn_blocking(move || is_running(pid))
        .await
        .unwrap_or(false)
}

/// `descendants`의 비동기 래퍼.
pub async fn descendants_async(root: u32) -> Vec<u32> {
    tokio::task::spawn_blocking(move || descendants(root))
        .await
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_is_running() {
        assert!(is_running(std::process::id()));
    }

    #[test]
    fn test_lookup_current_process_has_name() {
        let me = lookup(std::process::id()).expect("own process must be visible");
        assert!(!me.name.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_lookup_reads_command_line() {
        let mut child = std::process::Command::new("sleep").arg("31").spawn().unwrap();
        let found = lookup(child.id());
        let _ = child.kill();
        let _ = child.wait();

        let found = found.expect("spawned child must be visible");
        assert!(!found.cmd.is_empty());
        assert!(found.cmd.iter().any(|arg| arg == "31"));
    }

    #[test]
    fn test_unlikely_pid_not_running() {
        assert!(!is_running(u32::MAX - 7));
    }

    #[cfg(unix)]
    #[test]
    fn test_descendants_include_spawned_child() {
        let mut child = std::process::Command::new("sleep").arg("5").spawn().unwrap();
        let kids = descendants(std::process::id());
        assert!(kids.contains(&child.id()));
        let _ = child.kill();
        let _ = child.wait();
    }

    #[tokio::test]
    async fn test_async_wrappers() {
        assert!(is_running_async(std::process::id()).await);
        assert!(lookup_async(u32::MAX - 7).await.is_none());
    }
}
