//! The sing-box process supervisor.
//!
//! One child, one state machine: validate before spawning, stream child
//! stdio into the log ring, give a newly spawned child 500 ms to prove
//! it is alive, escalate SIGTERM to SIGKILL on stop, SIGHUP on reload,
//! and schedule bounded exponential-backoff restarts on unexpected
//! exits.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use orbit_logbuf::LogRing;
use orbit_process::{Signal, send_signal};
use orbit_types::{NodeError, NodeResult, NodeSettings};

use crate::store::ReloadHook;
use crate::validate::{ConfigValidator, binary_version};

/// How long a fresh child must stay alive before `start` reports success.
const STARTUP_GRACE: Duration = Duration::from_millis(500);
/// SIGTERM grace before SIGKILL escalation.
const STOP_GRACE: Duration = Duration::from_secs(5);
/// Backoff doubles per attempt up to `delay * 2^5`.
const BACKOFF_CAP_EXP: u32 = 5;

/// Supervisor lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    NotRunning,
    Starting,
    Running,
    Stopping,
    Restarting,
    Exhausted,
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SupervisorState::NotRunning => "not_running",
            SupervisorState::Starting => "starting",
            SupervisorState::Running => "running",
            SupervisorState::Stopping => "stopping",
            SupervisorState::Restarting => "restarting",
            SupervisorState::Exhausted => "exhausted",
        };
        f.write_str(name)
    }
}

/// Knobs the supervisor consumes, extracted from [`NodeSettings`].
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub binary: std::path::PathBuf,
    pub config_path: std::path::PathBuf,
    pub working_dir: std::path::PathBuf,
    pub auto_restart: bool,
    pub restart_delay: Duration,
    pub max_restarts: u32,
    pub restart_window: Duration,
}

impl From<&NodeSettings> for SupervisorSettings {
    fn from(settings: &NodeSettings) -> Self {
        Self {
            binary: settings.binary.clone(),
            config_path: settings.config_path.clone(),
            working_dir: settings.effective_working_dir(),
            auto_restart: settings.auto_restart,
            restart_delay: settings.restart_delay,
            max_restarts: settings.max_restarts,
            restart_window: settings.restart_window,
        }
    }
}

/// Restart bookkeeping exposed by [`Supervisor::status`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartStats {
    /// Total auto-restart attempts over the supervisor's lifetime.
    pub total: u64,
    /// Attempts inside the current sliding window.
    pub in_window: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_restart_at: Option<DateTime<Utc>>,
    /// Milliseconds until the scheduled restart fires, when one is armed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_restart_in: Option<u64>,
}

/// Snapshot returned by [`Supervisor::status`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorStatus {
    pub running: bool,
    pub state: SupervisorState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Seconds since the child started, while running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Detected binary version; probed once and cached.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub restart_stats: RestartStats,
}

/// Returned by [`Supervisor::reload`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReloadOutcome {
    pub pid: u32,
    pub reloaded_at: DateTime<Utc>,
}

struct SupState {
    state: SupervisorState,
    pid: Option<u32>,
    started_at: Option<DateTime<Utc>>,
    exit_rx: Option<watch::Receiver<Option<i32>>>,
    restart_timestamps: Vec<Instant>,
    restart_total: u64,
    last_restart_at: Option<DateTime<Utc>>,
    restart_deadline: Option<Instant>,
    restart_task: Option<JoinHandle<()>>,
    shutting_down: bool,
    // Ties waiter tasks to the spawn they observed; a stale waiter from
    // an earlier child must not touch current state.
    generation: u64,
}

struct Inner {
    settings: SupervisorSettings,
    validator: Arc<dyn ConfigValidator>,
    logs: LogRing,
    state: StdMutex<SupState>,
    version: tokio::sync::OnceCell<Option<String>>,
}

/// Spawn/stop/reload state machine around one sing-box child.
///
/// Cloning is cheap; all clones drive the same child.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.lock();
        f.debug_struct("Supervisor")
            .field("state", &st.state)
            .field("pid", &st.pid)
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Build a supervisor; nothing is spawned until [`Supervisor::start`].
    pub fn new(
        settings: SupervisorSettings,
        validator: Arc<dyn ConfigValidator>,
        logs: LogRing,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                validator,
                logs,
                state: StdMutex::new(SupState {
                    state: SupervisorState::NotRunning,
                    pid: None,
                    started_at: None,
                    exit_rx: None,
                    restart_timestamps: Vec::new(),
                    restart_total: 0,
                    last_restart_at: None,
                    restart_deadline: None,
                    restart_task: None,
                    shutting_down: false,
                    generation: 0,
                }),
                version: tokio::sync::OnceCell::new(),
            }),
        }
    }

    /// The captured child log ring.
    pub fn logs(&self) -> &LogRing {
        &self.inner.logs
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SupervisorState {
        self.lock().state
    }

    /// Validate, spawn, and confirm the child stays alive for 500 ms.
    pub async fn start(&self) -> NodeResult<u32> {
        {
            let mut st = self.lock();
            match st.state {
                SupervisorState::NotRunning => {}
                SupervisorState::Exhausted => {
                    return Err(NodeError::process(
                        "restart limit reached; reset restart stats before starting",
                    ));
                }
                other => {
                    return Err(NodeError::process(format!(
                        "cannot start while {}",
                        other
                    )));
                }
            }
            st.shutting_down = false;
            st.state = SupervisorState::Starting;
        }

        match self.spawn_child().await {
            Ok(pid) => {
                info!(pid, "sing-box started");
                Ok(pid)
            }
            Err(e) => {
                let mut st = self.lock();
                // A scheduled restart may already own the state if the
                // child died mid-grace; only roll back a plain Starting.
                if st.state == SupervisorState::Starting {
                    st.state = SupervisorState::NotRunning;
                }
                st.pid = None;
                st.started_at = None;
                Err(e)
            }
        }
    }

    async fn spawn_child(&self) -> NodeResult<u32> {
        let settings = &self.inner.settings;

        if !tokio::fs::try_exists(&settings.config_path)
            .await
            .unwrap_or(false)
        {
            return Err(NodeError::process(format!(
                "configuration file not found at {}",
                settings.config_path.display()
            )));
        }

        let report = self
            .inner
            .validator
            .validate_file(&settings.config_path)
            .await?;
        if !report.valid {
            return Err(NodeError::ConfigValidation(report));
        }

        self.inner.logs.clear();

        let config_arg = settings.config_path.to_string_lossy().to_string();
        let mut child = Command::new(&settings.binary)
            .args(["run", "-c", config_arg.as_str()])
            .current_dir(&settings.working_dir)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                NodeError::process(format!(
                    "failed to spawn {}: {}",
                    settings.binary.display(),
                    e
                ))
            })?;

        let pid = child.id().ok_or_else(|| {
            NodeError::process("child exited before a pid could be observed")
        })?;

        let (exit_tx, exit_rx) = watch::channel(None::<i32>);
        let generation = {
            let mut st = self.lock();
            st.generation += 1;
            st.pid = Some(pid);
            st.started_at = Some(Utc::now());
            st.exit_rx = Some(exit_rx.clone());
            st.generation
        };

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_stream(stdout, self.inner.logs.clone(), false));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_stream(stderr, self.inner.logs.clone(), true));
        }

        let supervisor = self.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(e) => {
                    warn!(error = %e, "failed to await child exit");
                    -1
                }
            };
            let _ = exit_tx.send(Some(code));
            supervisor.on_child_exit(generation, code);
        });

        tokio::time::sleep(STARTUP_GRACE).await;

        let mut exit_probe = exit_rx;
        if let Some(code) = *exit_probe.borrow_and_update() {
            return Err(NodeError::process(format!(
                "process exited immediately after start (code {})",
                code
            )));
        }

        let mut st = self.lock();
        // stop() may have intervened during the grace window; do not
        // overwrite its transition.
        if st.state != SupervisorState::Starting {
            return Err(NodeError::process(format!(
                "start interrupted while {}",
                st.state
            )));
        }
        st.state = SupervisorState::Running;
        Ok(pid)
    }

    fn on_child_exit(&self, generation: u64, code: i32) {
        let mut st = self.lock();
        if st.generation != generation {
            return;
        }
        st.pid = None;

        match st.state {
            SupervisorState::Running => {
                warn!(code, "sing-box exited unexpectedly");
                st.started_at = None;
                if !st.shutting_down && self.inner.settings.auto_restart {
                    self.schedule_restart_locked(&mut st);
                } else {
                    st.state = SupervisorState::NotRunning;
                }
            }
            // start() is still inside its grace period and will surface
            // the failure; stop() finalizes its own transition.
            SupervisorState::Starting | SupervisorState::Stopping => {}
            _ => {}
        }
    }

    fn schedule_restart_locked(&self, st: &mut SupState) {
        let now = Instant::now();
        let window = self.inner.settings.restart_window;
        st.restart_timestamps
            .retain(|t| now.duration_since(*t) < window);

        if st.restart_timestamps.len() >= self.inner.settings.max_restarts as usize {
            error!(
                attempts = st.restart_timestamps.len(),
                window_ms = window.as_millis() as u64,
                "restart limit reached; giving up until stats are reset"
            );
            st.state = SupervisorState::Exhausted;
            st.started_at = None;
            return;
        }

        let attempts = st.restart_timestamps.len() as u32;
        let delay = self.inner.settings.restart_delay * (1u32 << attempts.min(BACKOFF_CAP_EXP));
        st.state = SupervisorState::Restarting;
        st.restart_deadline = Some(now + delay);
        info!(delay_ms = delay.as_millis() as u64, attempt = attempts + 1, "scheduling restart");

        let supervisor = self.clone();
        st.restart_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            supervisor.fire_restart().await;
        }));
    }

    async fn fire_restart(&self) {
        {
            let mut st = self.lock();
            if st.shutting_down || st.state != SupervisorState::Restarting {
                return;
            }
            st.restart_task = None;
            st.restart_deadline = None;
            st.restart_total += 1;
            st.restart_timestamps.push(Instant::now());
            st.last_restart_at = Some(Utc::now());
            st.state = SupervisorState::NotRunning;
        }
        if let Err(e) = self.start().await {
            // A failed attempt does not add window entries beyond the
            // one recorded at fire time.
            error!(error = %e, "automatic restart failed");
        }
    }

    /// Idempotent graceful stop: SIGTERM, 5 s grace, then SIGKILL.
    ///
    /// Cancels any pending restart before signalling.
    pub async fn stop(&self) -> NodeResult<()> {
        let (pid, exit_rx) = {
            let mut st = self.lock();
            st.shutting_down = true;
            if let Some(task) = st.restart_task.take() {
                task.abort();
            }
            st.restart_deadline = None;

            let Some(pid) = st.pid else {
                if st.state != SupervisorState::Exhausted {
                    st.state = SupervisorState::NotRunning;
                }
                return Ok(());
            };
            st.state = SupervisorState::Stopping;
            (pid, st.exit_rx.clone())
        };

        if let Err(e) = send_signal(pid, Signal::SIGTERM) {
            debug!(pid, error = %e, "SIGTERM delivery failed (child may have exited)");
        }

        let graceful = match exit_rx.clone() {
            Some(mut rx) => tokio::time::timeout(STOP_GRACE, rx.wait_for(|v| v.is_some()))
                .await
                .is_ok(),
            None => false,
        };

        if !graceful {
            warn!(pid, "graceful stop timed out; sending SIGKILL");
            if let Err(e) = send_signal(pid, Signal::SIGKILL) {
                debug!(pid, error = %e, "SIGKILL delivery failed");
            }
            if let Some(mut rx) = exit_rx {
                let _ = tokio::time::timeout(STOP_GRACE, rx.wait_for(|v| v.is_some())).await;
            }
        }

        let mut st = self.lock();
        st.state = SupervisorState::NotRunning;
        st.pid = None;
        st.started_at = None;
        info!("sing-box stopped");
        Ok(())
    }

    /// Validate the on-disk config, then SIGHUP the running child.
    ///
    /// The on-disk bytes are checked exactly as the child will read
    /// them, so a corrupted file fails here without disturbing the
    /// running process.
    pub async fn reload(&self) -> NodeResult<ReloadOutcome> {
        let pid = {
            let st = self.lock();
            if st.state != SupervisorState::Running {
                return Err(NodeError::process("process is not running"));
            }
            st.pid
                .ok_or_else(|| NodeError::process("process is not running"))?
        };

        let report = self
            .inner
            .validator
            .validate_file(&self.inner.settings.config_path)
            .await?;
        if !report.valid {
            return Err(NodeError::ConfigValidation(report));
        }

        send_signal(pid, Signal::SIGHUP)
            .map_err(|e| NodeError::process(format!("failed to send SIGHUP: {:#}", e)))?;
        info!(pid, "sent SIGHUP for config reload");
        Ok(ReloadOutcome {
            pid,
            reloaded_at: Utc::now(),
        })
    }

    /// Clear restart bookkeeping; leaves `Exhausted` back to `NotRunning`.
    pub fn reset_restart_stats(&self) {
        let mut st = self.lock();
        st.restart_timestamps.clear();
        st.restart_total = 0;
        st.last_restart_at = None;
        if st.state == SupervisorState::Exhausted {
            st.state = SupervisorState::NotRunning;
        }
    }

    /// Status snapshot; the binary version is probed once and cached.
    pub async fn status(&self) -> SupervisorStatus {
        let binary = self.inner.settings.binary.clone();
        let version = self
            .inner
            .version
            .get_or_init(|| async move { binary_version(&binary).await })
            .await
            .clone();

        let st = self.lock();
        let now = Instant::now();
        let window = self.inner.settings.restart_window;
        let running = st.state == SupervisorState::Running;

        SupervisorStatus {
            running,
            state: st.state,
            pid: st.pid,
            uptime: if running {
                st.started_at
                    .map(|t| (Utc::now() - t).num_seconds().max(0) as u64)
            } else {
                None
            },
            started_at: st.started_at,
            version,
            restart_stats: RestartStats {
                total: st.restart_total,
                in_window: st
                    .restart_timestamps
                    .iter()
                    .filter(|t| now.duration_since(**t) < window)
                    .count(),
                last_restart_at: st.last_restart_at,
                next_restart_in: st
                    .restart_deadline
                    .map(|d| d.saturating_duration_since(now).as_millis() as u64),
            },
        }
    }

    fn lock(&self) -> MutexGuard<'_, SupState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ReloadHook for Supervisor {
    async fn reload_if_running(&self) -> anyhow::Result<bool> {
        if self.state() != SupervisorState::Running {
            return Ok(false);
        }
        self.reload().await.map(|_| true).map_err(anyhow::Error::new)
    }
}

/// Stream one child pipe into the log ring, line by line.
///
/// EOF ends the loop; the exit waiter never races a partially appended
/// line because each line is appended before the next read is awaited.
async fn pump_stream<R>(stream: R, logs: LogRing, is_stderr: bool)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
                logs.add(format!("[{}] {}", stamp, line));
                if is_stderr {
                    warn!(target: "singbox", "{}", line);
                } else {
                    debug!(target: "singbox", "{}", line);
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "child log stream read failed");
                break;
            }
        }
    }
}
