pub mod error;
pub mod launch;
pub mod managed_process;
pub mod process;
pub mod state_machine;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::config::GlobalConfig;
use crate::console::history::{tail_latest_log, REPLAY_LINES};
use crate::console::{ConsoleLine, ConsoleRelay, RelayEvent, DEFAULT_BUFFER_LINES};
use crate::instance::{DescriptorStore, RunState, ServerDescriptor};
use crate::process_monitor::{self, RunningProcess};
pub use error::SupervisorError;
use launch::{bind_endpoint, LaunchPlan, SERVER_JAR};
use managed_process::{ExitInfo, ManagedProcess};
use state_machine::{Phase, StateMachine};

/// Grace period after writing `stop` before escalating to a forced kill.
pub const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(10);
/// Wait after each forced termination attempt.
pub const FORCED_STOP_TIMEOUT: Duration = Duration::from_secs(5);
/// Pause between stop and start on restart.
pub const RESTART_PAUSE: Duration = Duration::from_secs(2);

const STOP_COMMAND: &str = "stop";

// ─── Outcomes ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct StartOutcome {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    /// Exited on its own after the `stop` command.
    Graceful,
    /// Needed OS-level termination.
    Forced,
    /// Was already gone when the stop began; state was only cleared.
    AlreadyExited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Liveness {
    /// No stored pid, or no live process with it.
    Gone,
    /// A live process holds the pid. `matches` tells whether it looks like
    /// this descriptor's server.
    Alive { matches: bool },
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub console_buffer_lines: usize,
    /// Liveness verdict when a process's command line cannot be read.
    pub trust_unverifiable_process: bool,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            console_buffer_lines: DEFAULT_BUFFER_LINES,
            trust_unverifiable_process: true,
        }
    }
}

impl From<&GlobalConfig> for SupervisorOptions {
    fn from(cfg: &GlobalConfig) -> Self {
        Self {
            console_buffer_lines: cfg.console_buffer_size,
            trust_unverifiable_process: cfg.trust_unverifiable_process,
        }
    }
}

// ─── Per-descriptor slot ─────────────────────────────────────

/// Everything the supervisor keeps in memory for one descriptor.
struct InstanceSlot {
    /// Held for the whole of Start/Stop/Remove; the exit watcher waits on it.
    op_lock: tokio::sync::Mutex<()>,
    phase: Mutex<StateMachine>,
    process: Mutex<Option<Arc<ManagedProcess>>>,
    relay: ConsoleRelay,
    history_replayed: AtomicBool,
}

impl InstanceSlot {
    fn new(initial: RunState, buffer_lines: usize) -> Self {
        Self {
            op_lock: tokio::sync::Mutex::new(()),
            phase: Mutex::new(StateMachine::new(phase_of(initial))),
            process: Mutex::new(None),
            relay: ConsoleRelay::new(buffer_lines),
            history_replayed: AtomicBool::new(false),
        }
    }

    fn phase_guard(&self) -> MutexGuard<'_, StateMachine> {
        self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn process_guard(&self) -> MutexGuard<'_, Option<Arc<ManagedProcess>>> {
        self.process.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn live_process(&self) -> Option<Arc<ManagedProcess>> {
        self.process_guard().clone().filter(|p| p.is_running())
    }

    fn transition(&self, to: Phase) -> Result<(), SupervisorError> {
        self.phase_guard()
            .transition(to)
            .map_err(|e| SupervisorError::Internal(e.into()))
    }

    /// Align the in-memory phase with the persisted run state. Only called
    /// with `op_lock` held, so no transition is in flight.
    fn sync_phase(&self, descriptor: &ServerDescriptor) {
        let _ = self.phase_guard().reset(phase_of(descriptor.run_state));
    }
}

fn phase_of(state: RunState) -> Phase {
    match state {
        RunState::Running => Phase::Running,
        RunState::Stopped => Phase::Stopped,
    }
}

enum ControlHandle {
    /// Spawned by this supervisor: stdin available.
    Owned(Arc<ManagedProcess>),
    /// Rediscovered by pid only: no stdin, signals only.
    Foreign(u32),
}

// ─── Supervisor ──────────────────────────────────────────────

pub struct Supervisor {
    store: Arc<dyn DescriptorStore>,
    slots: Mutex<HashMap<String, Arc<InstanceSlot>>>,
    options: SupervisorOptions,
}

impl Supervisor {
    pub fn new(store: Arc<dyn DescriptorStore>, options: SupervisorOptions) -> Self {
        Self {
            store,
            slots: Mutex::new(HashMap::new()),
            options,
        }
    }

    pub fn store(&self) -> &Arc<dyn DescriptorStore> {
        &self.store
    }

    /// 데몬 시작 시 호출: 저장된 running 상태를 실제 프로세스와 맞춘다.
    pub async fn initialize(&self) -> Result<(), SupervisorError> {
        let descriptors = self.list()?;
        tracing::info!("Loaded {} server instances", descriptors.len());
        let reset = self.reconcile_all().await?;
        if !reset.is_empty() {
            tracing::info!("Reset {} stale running instance(s) to stopped", reset.len());
        }
        Ok(())
    }

    fn slot(&self, descriptor: &ServerDescriptor) -> Arc<InstanceSlot> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .entry(descriptor.id.clone())
            .or_insert_with(|| {
                Arc::new(InstanceSlot::new(
                    descriptor.run_state,
                    self.options.console_buffer_lines,
                ))
            })
            .clone()
    }

    fn lock_op<'a>(
        slot: &'a InstanceSlot,
        id: &str,
    ) -> Result<tokio::sync::MutexGuard<'a, ()>, SupervisorError> {
        slot.op_lock
            .try_lock()
            .map_err(|_| SupervisorError::OperationInProgress(id.to_string()))
    }

    pub fn get(&self, id: &str) -> Result<ServerDescriptor, SupervisorError> {
        self.store
            .load(id)?
            .ok_or_else(|| SupervisorError::InstanceNotFound(id.to_string()))
    }

    pub fn list(&self) -> Result<Vec<ServerDescriptor>, SupervisorError> {
        Ok(self.store.list()?)
    }

    fn save(&self, descriptor: &ServerDescriptor) -> Result<(), SupervisorError> {
        Ok(self.store.save(descriptor)?)
    }

    /// Current lifecycle phase, including the transient in-flight phases.
    pub fn phase(&self, id: &str) -> Result<Phase, SupervisorError> {
        let descriptor = self.get(id)?;
        Ok(self.slot(&descriptor).phase_guard().phase())
    }

    // ── Start ────────────────────────────────────────────────

    /// Launch the server for `id`.
    pub async fn start(&self, id: &str) -> Result<StartOutcome, SupervisorError> {
        let slot = self.slot(&self.get(id)?);
        let _op = Self::lock_op(&slot, id)?;

        // 락을 잡은 뒤 최신 상태로 다시 읽음
        let mut descriptor = self.get(id)?;
        slot.sync_phase(&descriptor);
        if descriptor.is_running() {
            return Err(SupervisorError::AlreadyRunning(id.to_string()));
        }

        let plan = match LaunchPlan::build(&descriptor) {
            Ok(plan) => plan,
            Err(e) => {
                slot.relay.publish_system(format!("ERROR: {}", e));
                return Err(e);
            }
        };

        tracing::info!("Starting server '{}' ({})", descriptor.name, id);
        slot.transition(Phase::Starting)?;

        let process = match ManagedProcess::spawn(&plan, &slot.relay) {
            Ok(p) => Arc::new(p),
            Err(e) => {
                tracing::error!(
                    "Failed to launch '{}' with {}: {}",
                    descriptor.name,
                    plan.program.display(),
                    e
                );
                slot.relay.publish_system(format!("ERROR: Failed to start server: {}", e));
                slot.transition(Phase::Stopped)?;
                return Err(SupervisorError::LaunchFailed(e));
            }
        };

        let pid = process.pid;
        let started_at = Utc::now();
        descriptor.run_state = RunState::Running;
        descriptor.process_id = Some(pid);
        descriptor.last_started = Some(started_at);
        descriptor.console_cleared = false;

        if let Err(e) = self.save(&descriptor) {
            // 기록할 수 없는 서버를 남겨두지 않음
            tracing::error!("Could not persist running state for '{}': {}", id, e);
            if let Err(kill_err) = process::force_kill_tree(pid).await {
                tracing::warn!("{}", kill_err);
            }
            process.wait_for_exit(FORCED_STOP_TIMEOUT).await;
            slot.transition(Phase::Stopped)?;
            return Err(e);
        }

        *slot.process_guard() = Some(process.clone());
        slot.transition(Phase::Running)?;
        slot.relay.publish_system(format!("Server starting (PID {})", pid));
        self.spawn_exit_watcher(id.to_string(), slot.clone(), process);

        tracing::info!("Server '{}' started with PID {}", descriptor.name, pid);
        Ok(StartOutcome { pid, started_at })
    }

    /// Clear run state when the process ends on its own (crash, operator
    /// kill). A Stop in flight clears state itself; the watcher then only
    /// reports the exit.
    fn spawn_exit_watcher(&self, id: String, slot: Arc<InstanceSlot>, process: Arc<ManagedProcess>) {
        let store = self.store.clone();
        tokio::spawn(async move {
            let mut exit = process.exit_watch();
            let info = loop {
                if let Some(info) = *exit.borrow_and_update() {
                    break info;
                }
                if exit.changed().await.is_err() {
                    break ExitInfo { code: None };
                }
            };

            {
                let _op = slot.op_lock.lock().await;
                let still_current = slot
                    .process_guard()
                    .as_ref()
                    .is_some_and(|p| Arc::ptr_eq(p, &process));

                if still_current {
                    *slot.process_guard() = None;
                    match store.load(&id) {
                        Ok(Some(mut descriptor)) if descriptor.process_id == Some(process.pid) => {
                            descriptor.mark_stopped();
                            if let Err(e) = store.save(&descriptor) {
                                tracing::warn!("Failed to persist exit of '{}': {}", id, e);
                            }
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!("Failed to load '{}' after exit: {}", id, e),
                    }
                    if let Err(e) = slot.phase_guard().transition(Phase::Stopped) {
                        tracing::debug!("Exit watcher for '{}': {}", id, e);
                    }
                    tracing::warn!("Server '{}' (PID {}) exited unexpectedly", id, process.pid);
                    slot.relay.publish_system("Server stopped.");
                }
            }

            slot.relay.notify_exit(process.pid, info.code);
        });
    }

    // ── Stop ─────────────────────────────────────────────────

    /// Stop the server for `id`: graceful `stop` over stdin when this
    /// supervisor owns the process, forced termination otherwise.
    pub async fn stop(&self, id: &str) -> Result<StopOutcome, SupervisorError> {
        let slot = self.slot(&self.get(id)?);
        let _op = Self::lock_op(&slot, id)?;

        let mut descriptor = self.get(id)?;
        slot.sync_phase(&descriptor);
        if !descriptor.is_running() {
            return Err(SupervisorError::NotRunning(id.to_string()));
        }

        let handle = match self.resolve_handle(&slot, &descriptor).await {
            Some(handle) => handle,
            None => {
                tracing::info!("Server '{}' is already gone; clearing run state", id);
                self.finish_stop(&slot, &mut descriptor)?;
                return Ok(StopOutcome::AlreadyExited);
            }
        };

        tracing::info!("Stopping server '{}' ({})", descriptor.name, id);
        slot.transition(Phase::Stopping)?;

        let result = match handle {
            ControlHandle::Owned(process) => stop_owned(&process).await,
            ControlHandle::Foreign(pid) => {
                tracing::info!(
                    "No stdin for '{}' (PID {} was started by another session); forcing termination",
                    id,
                    pid
                );
                stop_foreign(pid).await
            }
        };

        match result {
            Ok(outcome) => {
                self.finish_stop(&slot, &mut descriptor)?;
                slot.relay.publish_system("Server stopped.");
                tracing::info!("Server '{}' stopped ({:?})", descriptor.name, outcome);
                Ok(outcome)
            }
            Err(e) => {
                tracing::error!("Failed to stop '{}': {}", id, e);
                slot.transition(Phase::Running)?;
                Err(e)
            }
        }
    }

    /// Pick how to control the recorded process. A foreign pid is only used
    /// when it still looks like this descriptor's server; a reused pid is
    /// treated the same as a dead one and never signalled.
    async fn resolve_handle(
        &self,
        slot: &InstanceSlot,
        descriptor: &ServerDescriptor,
    ) -> Option<ControlHandle> {
        if let Some(process) = slot.live_process() {
            return Some(ControlHandle::Owned(process));
        }
        let pid = descriptor.process_id?;
        match self.probe_descriptor(descriptor).await {
            Liveness::Alive { matches: true } => Some(ControlHandle::Foreign(pid)),
            Liveness::Alive { matches: false } => {
                tracing::warn!(
                    "PID {} no longer belongs to server '{}'; not terminating it",
                    pid,
                    descriptor.name
                );
                None
            }
            Liveness::Gone => None,
        }
    }

    fn finish_stop(
        &self,
        slot: &InstanceSlot,
        descriptor: &mut ServerDescriptor,
    ) -> Result<(), SupervisorError> {
        descriptor.mark_stopped();
        *slot.process_guard() = None;
        if let Err(e) = slot.phase_guard().transition(Phase::Stopped) {
            tracing::debug!("{}", e);
        }
        self.save(descriptor)
    }

    // ── Commands ─────────────────────────────────────────────

    /// Write one command line to the server's stdin.
    pub async fn send_command(&self, id: &str, text: &str) -> Result<(), SupervisorError> {
        let mut descriptor = self.get(id)?;
        if !descriptor.is_running() {
            return Err(SupervisorError::NotRunning(id.to_string()));
        }
        let slot = self.slot(&descriptor);

        if let Some(process) = slot.live_process() {
            return match process.send_line(text).await {
                Ok(()) => {
                    tracing::debug!("Sent command to '{}': {}", id, text);
                    slot.relay.publish_system(format!("> {}", text));
                    Ok(())
                }
                Err(e) => {
                    tracing::warn!("Failed to write to stdin of '{}': {}", id, e);
                    Err(SupervisorError::InputUnavailable(id.to_string()))
                }
            };
        }

        match descriptor.process_id {
            Some(pid) if process_monitor::is_running_async(pid).await => {
                Err(SupervisorError::InputUnavailable(id.to_string()))
            }
            _ => {
                // 저장된 PID가 죽어 있음 → stopped로 정리 (다른 작업 중이면 건드리지 않음)
                if let Ok(_op) = slot.op_lock.try_lock() {
                    self.finish_stop(&slot, &mut descriptor)?;
                }
                Err(SupervisorError::NotRunning(id.to_string()))
            }
        }
    }

    // ── Restart / Remove ─────────────────────────────────────

    pub async fn restart(&self, id: &str) -> Result<StartOutcome, SupervisorError> {
        match self.stop(id).await {
            Ok(_) | Err(SupervisorError::NotRunning(_)) => {}
            Err(e) => return Err(e),
        }
        tokio::time::sleep(RESTART_PAUSE).await;
        self.start(id).await
    }

    /// Forget a descriptor. Server files on disk are left alone.
    pub async fn remove(&self, id: &str) -> Result<ServerDescriptor, SupervisorError> {
        let slot = self.slot(&self.get(id)?);
        let _op = Self::lock_op(&slot, id)?;

        let descriptor = self.get(id)?;
        if descriptor.is_running() {
            return Err(SupervisorError::InstanceRunning(id.to_string()));
        }
        self.store.delete(id)?;
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        tracing::info!("Removed instance '{}' ({})", descriptor.name, id);
        Ok(descriptor)
    }

    // ── Liveness / Reattachment ──────────────────────────────

    pub async fn probe(&self, id: &str) -> Result<Liveness, SupervisorError> {
        let descriptor = self.get(id)?;
        Ok(self.probe_descriptor(&descriptor).await)
    }

    /// Check whether the stored pid still belongs to a live process and,
    /// best-effort, whether that process is this descriptor's server.
    pub async fn probe_descriptor(&self, descriptor: &ServerDescriptor) -> Liveness {
        let Some(pid) = descriptor.process_id else {
            return Liveness::Gone;
        };
        match process_monitor::lookup_async(pid).await {
            None => Liveness::Gone,
            Some(process) => Liveness::Alive {
                matches: command_line_matches(
                    &process,
                    descriptor,
                    self.options.trust_unverifiable_process,
                ),
            },
        }
    }

    /// Reset every `running` descriptor whose process is gone or is not the
    /// expected server. Returns the ids that were reset.
    pub async fn reconcile_all(&self) -> Result<Vec<String>, SupervisorError> {
        let mut reset = Vec::new();
        for mut descriptor in self.list()? {
            if !descriptor.is_running() {
                continue;
            }
            let slot = self.slot(&descriptor);
            if slot.live_process().is_some() {
                continue;
            }
            let Ok(_op) = slot.op_lock.try_lock() else {
                continue;
            };

            match self.probe_descriptor(&descriptor).await {
                Liveness::Alive { matches: true } => {
                    tracing::info!(
                        "Server '{}' still running as PID {:?}; reattached by pid",
                        descriptor.name,
                        descriptor.process_id
                    );
                    slot.sync_phase(&descriptor);
                }
                verdict => {
                    tracing::warn!(
                        "Server '{}' marked running but {:?}; resetting to stopped",
                        descriptor.name,
                        verdict
                    );
                    self.finish_stop(&slot, &mut descriptor)?;
                    reset.push(descriptor.id.clone());
                }
            }
        }
        Ok(reset)
    }

    // ── Console ──────────────────────────────────────────────

    pub fn subscribe(&self, id: &str) -> Result<broadcast::Receiver<RelayEvent>, SupervisorError> {
        let descriptor = self.get(id)?;
        Ok(self.slot(&descriptor).relay.subscribe())
    }

    pub fn console_since(&self, id: &str, since: u64) -> Result<Vec<ConsoleLine>, SupervisorError> {
        let descriptor = self.get(id)?;
        Ok(self.slot(&descriptor).relay.since(since))
    }

    pub fn recent_console(&self, id: &str, count: usize) -> Result<Vec<ConsoleLine>, SupervisorError> {
        let descriptor = self.get(id)?;
        Ok(self.slot(&descriptor).relay.recent(count))
    }

    /// Empty the console buffer and remember it across restarts so log
    /// history is not replayed again.
    pub fn clear_console(&self, id: &str) -> Result<(), SupervisorError> {
        let mut descriptor = self.get(id)?;
        self.slot(&descriptor).relay.clear();
        descriptor.console_cleared = true;
        self.save(&descriptor)
    }

    /// Prepare the console for a newly attached viewer.
    ///
    /// Without an owned process the live streams are unreachable, so the
    /// tail of the newest log file is replayed once (unless the console was
    /// cleared) and a running foreign process gets a warning line.
    pub fn open_console(&self, id: &str) -> Result<Vec<ConsoleLine>, SupervisorError> {
        let descriptor = self.get(id)?;
        let slot = self.slot(&descriptor);

        if slot.live_process().is_none() && !slot.history_replayed.swap(true, Ordering::SeqCst) {
            if !descriptor.console_cleared {
                let replayed = slot
                    .relay
                    .replay(tail_latest_log(&descriptor.logs_dir(), REPLAY_LINES));
                tracing::debug!("Replayed {} log line(s) for '{}'", replayed, id);
            }
            if descriptor.is_running() {
                slot.relay.publish_system(
                    "⚠ Server was started by another session. Console output and commands are unavailable.",
                );
            }
        }
        Ok(slot.relay.recent(self.options.console_buffer_lines))
    }
}

async fn stop_owned(process: &ManagedProcess) -> Result<StopOutcome, SupervisorError> {
    match process.send_line(STOP_COMMAND).await {
        Ok(()) => {
            if process.wait_for_exit(GRACEFUL_STOP_TIMEOUT).await.is_some() {
                return Ok(StopOutcome::Graceful);
            }
            tracing::warn!(
                "PID {} did not exit within {:?}; escalating to forced termination",
                process.pid,
                GRACEFUL_STOP_TIMEOUT
            );
        }
        Err(e) => {
            tracing::warn!("Could not send stop to PID {} ({}); forcing termination", process.pid, e);
        }
    }

    if let Err(e) = process::force_kill_tree(process.pid).await {
        tracing::warn!("{}", e);
    }
    if process.wait_for_exit(FORCED_STOP_TIMEOUT).await.is_some() {
        return Ok(StopOutcome::Forced);
    }
    Err(SupervisorError::TerminationFailed { pid: process.pid })
}

async fn stop_foreign(pid: u32) -> Result<StopOutcome, SupervisorError> {
    for attempt in 1..=2 {
        if let Err(e) = process::force_kill_tree(pid).await {
            tracing::warn!("Forced termination attempt {} failed: {}", attempt, e);
        }
        if process::wait_for_pid_exit(pid, FORCED_STOP_TIMEOUT).await {
            return Ok(StopOutcome::Forced);
        }
    }
    Err(SupervisorError::TerminationFailed { pid })
}

/// Best-effort identity check on a process's command line.
fn command_line_matches(process: &RunningProcess, descriptor: &ServerDescriptor, trust_unverifiable: bool) -> bool {
    if process.cmd.is_empty() {
        return trust_unverifiable;
    }
    let cmdline = process.cmd.join(" ");
    cmdline.contains(SERVER_JAR)
        && cmdline.contains(&format!("--bind {}", bind_endpoint(descriptor)))
}
