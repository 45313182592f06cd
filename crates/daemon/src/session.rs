//! Session lifecycle management
//!
//! Each connect spawns an external client (xfreerdp, vncviewer, or a
//! terminal wrapping ssh) detached into its own process group, tracks
//! the child in a registry keyed by session id, and terminates it
//! gracefully-then-forcefully on disconnect. A background reaper purges
//! handles whose process has exited.

use crate::hypr::WmBridge;
use chrono::{DateTime, Utc};
use fleetdeck_common::{Error, Geometry, Result, ScreenPosition, SessionKind, SessionState};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Read;
use std::os::unix::process::CommandExt;
use std::process::{Child, ChildStderr, Command, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Parameters carried from the registry/request into a session
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub username: String,
    pub password: String,
    pub geometry: Geometry,
    /// Workspace to place the window on; `None` skips placement
    pub workspace: Option<i64>,
    pub position: ScreenPosition,
    /// Place in the overlay workspace instead of a numbered one
    pub scratchpad: bool,
}

/// One external client invocation
#[derive(Debug, Clone)]
pub struct ClientCommand {
    pub program: String,
    pub args: Vec<String>,
}

/// Builds client command lines and the window titles they produce.
/// Injectable so tests never launch real remote-desktop clients.
pub trait ClientLauncher: Send + Sync {
    /// Command variants tried in order until one stays alive
    fn command_variants(
        &self,
        address: &str,
        kind: SessionKind,
        params: &SessionParams,
    ) -> Vec<ClientCommand>;

    /// Canonical window title first, then fallback formats
    fn window_titles(&self, address: &str, kind: SessionKind) -> Vec<String> {
        match kind {
            SessionKind::Rdp => vec![
                format!("FreeRDP: {}", address),
                format!("FreeRDP:{}", address),
                address.to_string(),
            ],
            SessionKind::Vnc => vec![format!("{} - TigerVNC", address), address.to_string()],
            SessionKind::Ssh => vec![format!("SSH: {}", address)],
        }
    }
}

/// Launcher for the real fleet clients.
pub struct DefaultLauncher;

impl ClientLauncher for DefaultLauncher {
    fn command_variants(
        &self,
        address: &str,
        kind: SessionKind,
        params: &SessionParams,
    ) -> Vec<ClientCommand> {
        match kind {
            SessionKind::Rdp => rdp_variants(address, params),
            SessionKind::Vnc => vec![ClientCommand {
                program: "vncviewer".to_string(),
                args: vec![format!("{}:5900", address)],
            }],
            SessionKind::Ssh => ssh_variants(address, params),
        }
    }
}

/// xfreerdp invocations, from most to least strict security. Later
/// variants disable NLA and pin the security protocol for hosts that
/// reject the standard handshake.
fn rdp_variants(address: &str, params: &SessionParams) -> Vec<ClientCommand> {
    let base = |extra: &[&str]| {
        let mut args = vec![
            format!("/v:{}", address),
            format!("/u:{}", params.username),
            format!("/p:{}", params.password),
            format!("/w:{}", params.geometry.width),
            format!("/h:{}", params.geometry.height),
            "/cert:ignore".to_string(),
            "/clipboard".to_string(),
        ];
        args.extend(extra.iter().map(|s| s.to_string()));
        args.push("/log-level:ERROR".to_string());
        ClientCommand {
            program: "xfreerdp".to_string(),
            args,
        }
    };

    vec![
        base(&["/compression", "+auto-reconnect"]),
        base(&["/compression", "-authentication"]),
        base(&["/compression", "/sec:rdp", "-authentication"]),
        base(&["/sec:tls", "-authentication"]),
    ]
}

/// Terminal emulator candidates wrapping ssh; the variant walk finds
/// whichever one is installed.
fn ssh_variants(address: &str, params: &SessionParams) -> Vec<ClientCommand> {
    let title = format!("SSH: {}", address);
    let target = format!("{}@{}", params.username, address);
    let cmd = |program: &str, args: Vec<String>| ClientCommand {
        program: program.to_string(),
        args,
    };

    vec![
        cmd("kitty", vec!["--title".into(), title.clone(), "ssh".into(), target.clone()]),
        cmd("gnome-terminal", vec!["--title".into(), title.clone(), "--".into(), "ssh".into(), target.clone()]),
        cmd("konsole", vec!["--title".into(), title.clone(), "-e".into(), "ssh".into(), target.clone()]),
        cmd("xterm", vec!["-title".into(), title.clone(), "-e".into(), "ssh".into(), target.clone()]),
        cmd("alacritty", vec!["--title".into(), title, "-e".into(), "ssh".into(), target]),
    ]
}

/// Wire summary of an active session
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub address: String,
    pub kind: SessionKind,
    pub state: SessionState,
    pub resolution: String,
    pub started_at: DateTime<Utc>,
    pub pid: u32,
    pub last_error: Option<String>,
}

/// Registry entry owning the child process.
struct Session {
    id: String,
    address: String,
    kind: SessionKind,
    state: SessionState,
    child: Child,
    started_at: DateTime<Utc>,
    resolution: String,
    last_error: Option<String>,
}

impl Session {
    fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            address: self.address.clone(),
            kind: self.kind,
            state: self.state,
            resolution: self.resolution.clone(),
            started_at: self.started_at,
            pid: self.child.id(),
            last_error: self.last_error.clone(),
        }
    }
}

/// Lifecycle pacing, shortened in tests
#[derive(Debug, Clone, Copy)]
pub struct SessionTiming {
    /// Wait before polling a fresh spawn for early exit
    pub settle: Duration,
    /// Graceful-termination window before SIGKILL
    pub kill_grace: Duration,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(2),
            kill_grace: Duration::from_secs(5),
        }
    }
}

struct Inner {
    sessions: Mutex<HashMap<String, Session>>,
    launcher: Box<dyn ClientLauncher>,
    bridge: Option<Arc<WmBridge>>,
    timing: SessionTiming,
}

/// Manages the lifecycle of remote session client processes.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(
        launcher: Box<dyn ClientLauncher>,
        bridge: Option<Arc<WmBridge>>,
        timing: SessionTiming,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: Mutex::new(HashMap::new()),
                launcher,
                bridge,
                timing,
            }),
        }
    }

    /// Spawn a client for `address`. Rejects when a live session for
    /// the address already exists. Returns the new session id; the
    /// running/failed determination happens asynchronously.
    pub fn connect(
        &self,
        address: &str,
        kind: SessionKind,
        params: SessionParams,
    ) -> Result<String> {
        let variants = self.inner.launcher.command_variants(address, kind, &params);
        if variants.is_empty() {
            return Err(Error::SpawnFailed("no client command available".to_string()));
        }

        {
            let mut sessions = self.inner.sessions.lock();
            // A dead leftover for this address does not block a new connect
            let mut dead = Vec::new();
            for (id, s) in sessions.iter_mut() {
                if s.address == address && !process_alive(&mut s.child) {
                    dead.push(id.clone());
                }
            }
            for id in dead {
                sessions.remove(&id);
            }
            if sessions.values().any(|s| s.address == address) {
                return Err(Error::AlreadyConnected {
                    address: address.to_string(),
                });
            }
        }

        // Try variants until one spawns; OS-level failures (binary
        // missing) move straight to the next candidate.
        let mut remaining = variants.into_iter();
        let (child, rest) = loop {
            let Some(variant) = remaining.next() else {
                return Err(Error::SpawnFailed(format!(
                    "no client for {} could be started",
                    address
                )));
            };
            match spawn_detached(&variant) {
                Ok(child) => break (child, remaining.collect::<Vec<_>>()),
                Err(e) => {
                    warn!("spawn {} failed: {}", variant.program, e);
                    continue;
                }
            }
        };

        let id = format!("{}_{}_{}", kind, address, Uuid::new_v4().simple());
        let session = Session {
            id: id.clone(),
            address: address.to_string(),
            kind,
            state: SessionState::Spawned,
            child,
            started_at: Utc::now(),
            resolution: params.geometry.to_string(),
            last_error: None,
        };
        self.inner.sessions.lock().insert(id.clone(), session);
        info!("Session {} spawned for {} ({})", id, address, kind);

        // Settle, classify early exits, walk the remaining variants,
        // and place the window once something stays alive.
        let manager = self.clone();
        let monitor_id = id.clone();
        let monitor_addr = address.to_string();
        tokio::spawn(async move {
            manager.monitor(monitor_id, monitor_addr, kind, params, rest).await;
        });

        Ok(id)
    }

    /// Watch a fresh spawn through the `Spawned -> Running | Failed`
    /// transition.
    async fn monitor(
        &self,
        id: String,
        address: String,
        kind: SessionKind,
        params: SessionParams,
        mut remaining: Vec<ClientCommand>,
    ) {
        loop {
            tokio::time::sleep(self.inner.timing.settle).await;

            // Poll under the lock, but read stderr outside it: the
            // write end may live on in forked grandchildren long after
            // the client itself exits.
            let early_exit = {
                let mut sessions = self.inner.sessions.lock();
                let Some(session) = sessions.get_mut(&id) else {
                    // Disconnected while settling
                    return;
                };
                if session.state == SessionState::Terminated {
                    return;
                }
                match session.child.try_wait() {
                    Ok(None) => {
                        session.state = SessionState::Running;
                        None
                    }
                    Ok(Some(status)) => Some(Ok((session.child.stderr.take(), status.code()))),
                    Err(e) => Some(Err(e.to_string())),
                }
            };

            let Some(exit) = early_exit else {
                info!("Session {} running", id);
                self.place(&address, kind, &params).await;
                return;
            };

            let reason = match exit {
                Ok((stderr, code)) => classify_exit(&drain_stderr(stderr).await, code),
                Err(e) => e,
            };
            warn!("Session {} client exited early: {}", id, reason);

            // Try the next command variant, if any
            let next = loop {
                if remaining.is_empty() {
                    break None;
                }
                let variant = remaining.remove(0);
                match spawn_detached(&variant) {
                    Ok(child) => break Some(child),
                    Err(e) => {
                        warn!("spawn {} failed: {}", variant.program, e);
                        continue;
                    }
                }
            };

            let mut sessions = self.inner.sessions.lock();
            match sessions.get_mut(&id) {
                Some(session) if session.state != SessionState::Terminated => {
                    session.last_error = Some(reason);
                    match next {
                        Some(child) => {
                            // Reap the dead child before replacing it
                            let _ = session.child.wait();
                            session.child = child;
                            session.state = SessionState::Spawned;
                        }
                        None => {
                            session.state = SessionState::Failed;
                            warn!("Session {} failed: all client variants exhausted", id);
                            return;
                        }
                    }
                }
                _ => {
                    // Torn down while classifying; discard any respawn
                    drop(sessions);
                    if let Some(mut child) = next {
                        let _ = child.kill();
                        let _ = child.wait();
                    }
                    return;
                }
            }
        }
    }

    /// Best-effort window placement after a session reaches Running.
    async fn place(&self, address: &str, kind: SessionKind, params: &SessionParams) {
        let Some(bridge) = &self.inner.bridge else {
            return;
        };
        let Some(workspace) = params.workspace else {
            return;
        };

        for title in self.inner.launcher.window_titles(address, kind) {
            let placed = if params.scratchpad {
                bridge
                    .assign_to_overlay(&title, params.position, params.geometry)
                    .await
            } else {
                bridge
                    .place_window(&title, workspace, params.position, params.geometry)
                    .await
            };
            if placed {
                info!("Placed window '{}' for {}", title, address);
                return;
            }
        }
        warn!("No window placed for {} (all title formats failed)", address);
    }

    /// Terminate the session owning `address`.
    pub async fn disconnect(&self, address: &str) -> Result<()> {
        let id = {
            let sessions = self.inner.sessions.lock();
            sessions
                .values()
                .find(|s| s.address == address)
                .map(|s| s.id.clone())
        }
        .ok_or_else(|| Error::not_found("connection", address))?;

        self.kill(&id).await
    }

    /// Terminate one session by id: SIGTERM to the process group, a
    /// bounded grace wait, then SIGKILL. The entry stays in the
    /// registry until the process is gone, so the address remains
    /// claimed for the whole grace window; it is removed afterward
    /// either way.
    pub async fn kill(&self, id: &str) -> Result<()> {
        let pgid = {
            let mut sessions = self.inner.sessions.lock();
            let session = sessions
                .get_mut(id)
                .ok_or_else(|| Error::not_found("connection", id))?;
            if session.state == SessionState::Terminated {
                // Another disconnect is already tearing this down
                return Err(Error::not_found("connection", id));
            }
            session.state = SessionState::Terminated;
            Pid::from_raw(session.child.id() as i32)
        };

        info!("Disconnecting session {} (pgid {})", id, pgid);
        let _ = killpg(pgid, Signal::SIGTERM);

        let deadline = tokio::time::Instant::now() + self.inner.timing.kill_grace;
        let exited = loop {
            {
                let mut sessions = self.inner.sessions.lock();
                match sessions.get_mut(id) {
                    Some(session) => {
                        if !process_alive(&mut session.child) {
                            break true;
                        }
                    }
                    None => break true,
                }
            }
            if tokio::time::Instant::now() >= deadline {
                break false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        };

        if !exited {
            warn!("Session {} ignored SIGTERM, escalating", id);
            let _ = killpg(pgid, Signal::SIGKILL);
        }
        let removed = self.inner.sessions.lock().remove(id);
        if let Some(mut session) = removed {
            // Reap
            let _ = session.child.wait();
        }
        info!("Session {} terminated", id);
        Ok(())
    }

    /// Summaries of live sessions; dead handles are purged first so the
    /// listing never shows an exited process.
    pub fn list_active(&self) -> Vec<SessionSummary> {
        let mut sessions = self.inner.sessions.lock();
        let mut dead = Vec::new();
        for (id, s) in sessions.iter_mut() {
            if !process_alive(&mut s.child) {
                dead.push(id.clone());
            }
        }
        for id in &dead {
            info!("Reaping dead session {}", id);
            sessions.remove(id);
        }
        sessions.values().map(|s| s.summary()).collect()
    }

    /// Expected window titles for a session on `address`.
    pub fn window_titles(&self, address: &str, kind: SessionKind) -> Vec<String> {
        self.inner.launcher.window_titles(address, kind)
    }

    /// Kind of the live session per address, for status assembly.
    pub fn active_kinds(&self) -> HashMap<String, SessionKind> {
        self.inner
            .sessions
            .lock()
            .values()
            .map(|s| (s.address.clone(), s.kind))
            .collect()
    }

    /// Periodic sweep bounding growth from abandoned sessions.
    pub async fn run_reaper(self, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;
            let before = self.inner.sessions.lock().len();
            let after = self.list_active().len();
            if before != after {
                info!("Reaper purged {} dead sessions", before - after);
            }
        }
    }
}

/// `try_wait` both polls and reaps; `None` means still running.
fn process_alive(child: &mut Child) -> bool {
    matches!(child.try_wait(), Ok(None))
}

/// Spawn into a fresh process group so terminate signals reach any
/// children the client forks.
fn spawn_detached(cmd: &ClientCommand) -> std::io::Result<Child> {
    Command::new(&cmd.program)
        .args(&cmd.args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .process_group(0)
        .spawn()
}

const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Read what a dead client wrote to stderr. The pipe's write end may
/// be inherited by grandchildren that outlive the client, so the read
/// runs on a blocking thread with a bounded wait instead of stalling
/// the async workers.
async fn drain_stderr(pipe: Option<ChildStderr>) -> String {
    let Some(mut pipe) = pipe else {
        return String::new();
    };
    let read = tokio::task::spawn_blocking(move || {
        let mut buf = String::new();
        let _ = pipe.read_to_string(&mut buf);
        buf
    });
    match tokio::time::timeout(STDERR_DRAIN_TIMEOUT, read).await {
        Ok(Ok(buf)) => buf,
        _ => String::new(),
    }
}

/// Pattern-match captured stderr into a failure class.
fn classify_exit(stderr: &str, code: Option<i32>) -> String {
    let lower = stderr.to_lowercase();

    let class = if lower.contains("authentication") || lower.contains("logon failure") {
        "authentication failed"
    } else if lower.contains("refused") {
        "connection refused"
    } else if lower.contains("unreachable") || lower.contains("network") {
        "network error"
    } else if lower.contains("timeout") || lower.contains("timed out") {
        "timed out"
    } else {
        "client exited"
    };

    match code {
        Some(code) => format!("{} (exit code {})", class, code),
        None => format!("{} (killed by signal)", class),
    }
}
