//! Device-login automation driven by console output.
//!
//! `begin_login` sends `/auth login device`; the monitor then watches the
//! server's console for the login URL (opened in the browser) and the
//! profile-selection prompt (answered with `/auth select 1`).

pub mod parse;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::console::{LineSource, RelayEvent};
use crate::supervisor::{Supervisor, SupervisorError};

pub const LOGIN_COMMAND: &str = "/auth login device";
pub const SELECT_FIRST_PROFILE: &str = "/auth select 1";

/// Time allowed between the login command and the URL.
pub const URL_WINDOW: Duration = Duration::from_secs(5);
/// Time allowed between the URL and the profile prompt.
pub const PROFILE_WINDOW: Duration = Duration::from_secs(30);
/// Delay before answering a profile prompt (lets the rest of the list print).
pub const PROMPT_DEBOUNCE: Duration = Duration::from_millis(1000);
pub const ENTRY_DEBOUNCE: Duration = Duration::from_millis(500);

const DEADLINE_TICK: Duration = Duration::from_millis(250);
const EVENT_CAPACITY: usize = 16;

// ─── Seams ───────────────────────────────────────────────────

/// Where the monitor writes server commands.
#[async_trait]
pub trait CommandSink: Send + Sync {
    async fn send(&self, command: &str) -> Result<(), SupervisorError>;
}

/// Opens a URL for the operator.
pub trait UrlOpener: Send + Sync {
    fn open(&self, url: &str) -> std::io::Result<()>;
}

/// The OS default URL handler.
pub struct SystemBrowser;

impl UrlOpener for SystemBrowser {
    fn open(&self, url: &str) -> std::io::Result<()> {
        #[cfg(target_os = "windows")]
        let mut cmd = {
            use std::os::windows::process::CommandExt;
            let mut c = std::process::Command::new("cmd");
            // start의 첫 번째 인자는 창 제목
            c.args(["/C", "start", "", url]).creation_flags(crate::utils::CREATE_NO_WINDOW);
            c
        };
        #[cfg(target_os = "macos")]
        let mut cmd = {
            let mut c = std::process::Command::new("open");
            c.arg(url);
            c
        };
        #[cfg(not(any(target_os = "windows", target_os = "macos")))]
        let mut cmd = {
            let mut c = std::process::Command::new("xdg-open");
            c.arg(url);
            c
        };

        cmd.stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map(|_| ())
    }
}

/// Commands go to one descriptor's server through the supervisor.
pub struct SupervisorSink {
    supervisor: Arc<Supervisor>,
    instance_id: String,
}

impl SupervisorSink {
    pub fn new(supervisor: Arc<Supervisor>, instance_id: impl Into<String>) -> Self {
        Self {
            supervisor,
            instance_id: instance_id.into(),
        }
    }
}

#[async_trait]
impl CommandSink for SupervisorSink {
    async fn send(&self, command: &str) -> Result<(), SupervisorError> {
        self.supervisor.send_command(&self.instance_id, command).await
    }
}

// ─── Session ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthPhase {
    Idle,
    AwaitingUrl,
    AwaitingProfile,
    Completed,
    Expired,
}

/// Externally visible view of the current session.
#[derive(Debug, Clone, Serialize)]
pub struct AuthSnapshot {
    pub phase: AuthPhase,
    pub url: Option<String>,
    pub device_code: Option<String>,
    pub profile_selected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    /// Fires once per session with the URL handed to the browser.
    UrlResolved(String),
}

/// Side effects decided by the session; carried out by the monitor.
#[derive(Debug, PartialEq, Eq)]
enum Action {
    Resolved(String),
    SelectProfileAfter(Duration),
}

#[derive(Debug)]
struct AuthSession {
    phase: AuthPhase,
    phase_started: Instant,
    /// URL seen without a code yet
    pending_url: Option<String>,
    url: Option<String>,
    device_code: Option<String>,
    profile_selected: bool,
}

impl AuthSession {
    fn idle() -> Self {
        Self {
            phase: AuthPhase::Idle,
            phase_started: Instant::now(),
            pending_url: None,
            url: None,
            device_code: None,
            profile_selected: false,
        }
    }

    fn begin(&mut self, now: Instant) {
        *self = Self::idle();
        self.phase = AuthPhase::AwaitingUrl;
        self.phase_started = now;
    }

    fn enter(&mut self, phase: AuthPhase, now: Instant) {
        tracing::debug!("Auth session {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
        self.phase_started = now;
    }

    fn resolve(&mut self, url: String, now: Instant) -> Action {
        self.pending_url = None;
        self.url = Some(url.clone());
        self.enter(AuthPhase::AwaitingProfile, now);
        Action::Resolved(url)
    }

    fn observe(&mut self, line: &str, now: Instant) -> Option<Action> {
        match self.phase {
            AuthPhase::AwaitingUrl => {
                if let Some(code) = parse::find_device_code(line) {
                    tracing::debug!("Device code found: {}", code);
                    self.device_code = Some(code);
                }
                if let Some(url) = parse::find_login_url(line) {
                    tracing::debug!("Login URL found: {}", url);
                    self.pending_url = Some(url);
                }

                let pending = self.pending_url.as_deref()?;
                let resolved = if parse::has_user_code(pending) {
                    pending.to_string()
                } else {
                    parse::with_user_code(pending, self.device_code.as_deref()?)
                };
                Some(self.resolve(resolved, now))
            }
            AuthPhase::AwaitingProfile if !self.profile_selected => {
                let debounce = if parse::is_profile_prompt(line) {
                    PROMPT_DEBOUNCE
                } else if let Some(name) = parse::first_profile_entry(line) {
                    tracing::debug!("First profile listed: {}", name);
                    ENTRY_DEBOUNCE
                } else {
                    return None;
                };
                self.profile_selected = true;
                self.enter(AuthPhase::Completed, now);
                Some(Action::SelectProfileAfter(debounce))
            }
            _ => None,
        }
    }

    fn check_deadlines(&mut self, now: Instant) -> Option<Action> {
        let elapsed = now.saturating_duration_since(self.phase_started);
        match self.phase {
            AuthPhase::AwaitingUrl if elapsed >= URL_WINDOW => match self.pending_url.take() {
                // 코드 없이 URL만 나온 경우 그대로 사용
                Some(bare) => Some(self.resolve(bare, now)),
                None => {
                    self.enter(AuthPhase::Expired, now);
                    None
                }
            },
            AuthPhase::AwaitingProfile if elapsed >= PROFILE_WINDOW => {
                self.enter(AuthPhase::Expired, now);
                None
            }
            _ => None,
        }
    }

    fn snapshot(&self) -> AuthSnapshot {
        AuthSnapshot {
            phase: self.phase,
            url: self.url.clone(),
            device_code: self.device_code.clone(),
            profile_selected: self.profile_selected,
        }
    }
}

// ─── Monitor ─────────────────────────────────────────────────

/// Runs the login automaton for one server.
pub struct AuthFlowMonitor {
    session: Mutex<AuthSession>,
    sink: Arc<dyn CommandSink>,
    opener: Arc<dyn UrlOpener>,
    events: broadcast::Sender<AuthEvent>,
}

impl AuthFlowMonitor {
    pub fn new(sink: Arc<dyn CommandSink>, opener: Arc<dyn UrlOpener>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            session: Mutex::new(AuthSession::idle()),
            sink,
            opener,
            events,
        }
    }

    fn session(&self) -> std::sync::MutexGuard<'_, AuthSession> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> AuthSnapshot {
        self.session().snapshot()
    }

    /// Start a fresh session and send the login command.
    pub async fn begin_login(&self) -> Result<(), SupervisorError> {
        // 명령 전송 전에 세션을 열어야 즉시 출력되는 URL도 놓치지 않음
        self.session().begin(Instant::now());
        if let Err(e) = self.sink.send(LOGIN_COMMAND).await {
            *self.session() = AuthSession::idle();
            return Err(e);
        }
        tracing::info!("Device login requested");
        Ok(())
    }

    /// Feed one console line to the session.
    pub fn observe(&self, text: &str) {
        let line = crate::utils::strip_ansi(text);
        let action = self.session().observe(&line, Instant::now());
        if let Some(action) = action {
            self.dispatch(action);
        }
    }

    /// Apply the URL and profile windows.
    pub fn check_deadlines(&self) {
        let action = self.session().check_deadlines(Instant::now());
        if let Some(action) = action {
            self.dispatch(action);
        }
    }

    fn dispatch(&self, action: Action) {
        match action {
            Action::Resolved(url) => {
                tracing::info!("Opening login URL: {}", url);
                if let Err(e) = self.opener.open(&url) {
                    tracing::warn!("Failed to open browser for {}: {}", url, e);
                }
                let _ = self.events.send(AuthEvent::UrlResolved(url));
            }
            Action::SelectProfileAfter(delay) => {
                let sink = self.sink.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    match sink.send(SELECT_FIRST_PROFILE).await {
                        Ok(()) => tracing::info!("Selected first auth profile"),
                        Err(e) => tracing::warn!("Failed to select auth profile: {}", e),
                    }
                });
            }
        }
    }

    /// Consume relay events until the relay goes away.
    pub fn spawn(self: Arc<Self>, mut relay: broadcast::Receiver<RelayEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(DEADLINE_TICK);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    event = relay.recv() => match event {
                        Ok(RelayEvent::Line(line)) => {
                            if matches!(line.source, LineSource::Stdout | LineSource::Stderr) {
                                self.observe(&line.text);
                            }
                        }
                        Ok(RelayEvent::Exited { .. }) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::debug!("Auth monitor skipped {} console lines", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = tick.tick() => self.check_deadlines(),
                }
            }
        })
    }
}

// ─── Registry ────────────────────────────────────────────────

/// One monitor per descriptor, created on first use.
pub struct AuthRegistry {
    supervisor: Arc<Supervisor>,
    opener: Arc<dyn UrlOpener>,
    monitors: Mutex<HashMap<String, (Arc<AuthFlowMonitor>, JoinHandle<()>)>>,
}

impl AuthRegistry {
    pub fn new(supervisor: Arc<Supervisor>, opener: Arc<dyn UrlOpener>) -> Self {
        Self {
            supervisor,
            opener,
            monitors: Mutex::new(HashMap::new()),
        }
    }

    pub fn monitor(&self, id: &str) -> Result<Arc<AuthFlowMonitor>, SupervisorError> {
        let mut monitors = self.monitors.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((monitor, task)) = monitors.get(id) {
            if !task.is_finished() {
                return Ok(monitor.clone());
            }
        }

        let relay = self.supervisor.subscribe(id)?;
        let sink = Arc::new(SupervisorSink::new(self.supervisor.clone(), id));
        let monitor = Arc::new(AuthFlowMonitor::new(sink, self.opener.clone()));
        let task = monitor.clone().spawn(relay);
        monitors.insert(id.to_string(), (monitor.clone(), task));
        Ok(monitor)
    }

    pub async fn begin_login(&self, id: &str) -> Result<AuthSnapshot, SupervisorError> {
        let monitor = self.monitor(id)?;
        monitor.begin_login().await?;
        Ok(monitor.snapshot())
    }

    /// Current session; `Idle` when no login was ever started.
    pub fn snapshot(&self, id: &str) -> AuthSnapshot {
        let monitors = self.monitors.lock().unwrap_or_else(|e| e.into_inner());
        match monitors.get(id) {
            Some((monitor, _)) => monitor.snapshot(),
            None => AuthSession::idle().snapshot(),
        }
    }

    pub fn forget(&self, id: &str) {
        let removed = self
            .monitors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        if let Some((_, task)) = removed {
            task.abort();
        }
    }
}
