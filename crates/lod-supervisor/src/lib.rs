//! Supervision engine for the deck's local child processes.
//!
//! One [`ProcessManager`] owns the registry of managed processes and is the
//! only place that mutates it; everything observable leaves through a single
//! event channel, so consumers see transitions in the order they happened.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch, Mutex};

use lod_core::{
    now_ts, LogStream, LoopEvent, ProcessLogPayload, ProcessRole, ProcessSnapshot, ProcessState,
};

pub mod kill_switch;
pub mod log_tail;
pub mod proc_kill;
pub mod state_watch;

pub use kill_switch::{ArmedToken, ConfirmOutcome, KillSwitch, DEFAULT_ARM_WINDOW_MS};
pub use log_tail::{TailCursor, TailSettings, TAIL_MAX_CHUNK_BYTES, TAIL_POLL_INTERVAL};
pub use state_watch::{StateWatcher, STATE_POLL_INTERVAL};

/// Tunable supervision constants. The defaults are the contract; deployments
/// may widen or tighten them through configuration.
#[derive(Debug, Clone)]
pub struct SupervisorPolicy {
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub max_restarts: u32,
    /// Uptime after which a crash no longer counts toward the restart cap.
    pub healthy_uptime: Duration,
    /// Wait after the polite termination signal before escalating.
    pub graceful_stop: Duration,
    /// Wait for exit confirmation after the hard kill; a miss is tolerated.
    pub kill_confirm_wait: Duration,
}

impl Default for SupervisorPolicy {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_millis(1000),
            backoff_cap: Duration::from_millis(8000),
            max_restarts: 3,
            healthy_uptime: Duration::from_secs(30),
            graceful_stop: Duration::from_millis(3500),
            kill_confirm_wait: Duration::from_millis(2000),
        }
    }
}

/// Delay before restart attempt `attempt` (zero-based): base doubled per
/// attempt, capped.
pub fn restart_delay(attempt: u32, policy: &SupervisorPolicy) -> Duration {
    let base = policy.backoff_base.as_millis() as u64;
    let cap = policy.backoff_cap.as_millis() as u64;
    Duration::from_millis(base.saturating_mul(2u64.saturating_pow(attempt)).min(cap))
}

/// Immutable launch recipe for a spawned process.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<std::path::PathBuf>,
    pub env: Vec<(String, String)>,
    pub auto_restart: bool,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            auto_restart: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn {id}: {source}")]
    Spawn {
        id: ProcessRole,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to kill {id}: {source}")]
    Kill {
        id: ProcessRole,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Clone)]
enum LaunchKind {
    Child(ProcessSpec),
    Tail(TailSettings),
}

struct ManagedEntry {
    launch: LaunchKind,
    state: ProcessState,
    pid: Option<u32>,
    restart_count: u32,
    exit_code: Option<i32>,
    exit_signal: Option<i32>,
    last_error: Option<String>,
    updated_at: String,
    stop_requested: bool,
    /// Bumped on every launch; stale waiters and scheduled restarts compare
    /// against it before touching the record.
    epoch: u64,
    pgid: Option<i32>,
    exit_rx: Option<watch::Receiver<bool>>,
    tail_cancel: Option<watch::Sender<bool>>,
}

impl ManagedEntry {
    fn new(launch: LaunchKind) -> Self {
        Self {
            launch,
            state: ProcessState::Stopped,
            pid: None,
            restart_count: 0,
            exit_code: None,
            exit_signal: None,
            last_error: None,
            updated_at: now_ts(),
            stop_requested: false,
            epoch: 0,
            pgid: None,
            exit_rx: None,
            tail_cancel: None,
        }
    }

    fn auto_restart(&self) -> bool {
        match &self.launch {
            LaunchKind::Child(spec) => spec.auto_restart,
            LaunchKind::Tail(_) => false,
        }
    }

    fn snapshot(&self, id: ProcessRole) -> ProcessSnapshot {
        ProcessSnapshot {
            id,
            state: self.state,
            pid: self.pid,
            restart_count: self.restart_count,
            exit_code: self.exit_code,
            exit_signal: self.exit_signal,
            last_error: self.last_error.clone(),
            updated_at: self.updated_at.clone(),
            auto_restart: self.auto_restart(),
        }
    }
}

/// Fixed-shape registry, one slot per role. Total lookups, no map misses.
struct Registry {
    monitor: ManagedEntry,
    agent: ManagedEntry,
    tail: ManagedEntry,
}

impl Registry {
    fn entry(&self, id: ProcessRole) -> &ManagedEntry {
        match id {
            ProcessRole::Monitor => &self.monitor,
            ProcessRole::Agent => &self.agent,
            ProcessRole::LogTail => &self.tail,
        }
    }

    fn entry_mut(&mut self, id: ProcessRole) -> &mut ManagedEntry {
        match id {
            ProcessRole::Monitor => &mut self.monitor,
            ProcessRole::Agent => &mut self.agent,
            ProcessRole::LogTail => &mut self.tail,
        }
    }
}

#[derive(Clone)]
pub struct ProcessManager {
    policy: SupervisorPolicy,
    event_tx: mpsc::UnboundedSender<LoopEvent>,
    registry: Arc<Mutex<Registry>>,
}

impl ProcessManager {
    pub fn new(
        policy: SupervisorPolicy,
        monitor: ProcessSpec,
        agent: ProcessSpec,
        tail: TailSettings,
        event_tx: mpsc::UnboundedSender<LoopEvent>,
    ) -> Self {
        let registry = Registry {
            monitor: ManagedEntry::new(LaunchKind::Child(monitor)),
            agent: ManagedEntry::new(LaunchKind::Child(agent)),
            tail: ManagedEntry::new(LaunchKind::Tail(tail)),
        };
        Self {
            policy,
            event_tx,
            registry: Arc::new(Mutex::new(registry)),
        }
    }

    /// Start a process. No-op while it is already starting, running, or
    /// winding down from a stop; only one live process may ever exist per
    /// record. An explicit start grants a fresh restart budget and clears
    /// the stop-requested flag.
    pub async fn start(&self, id: ProcessRole) -> Result<ProcessSnapshot, SupervisorError> {
        let mut reg = self.registry.lock().await;
        {
            let entry = reg.entry_mut(id);
            if entry.state.is_active() || entry.state == ProcessState::Stopping {
                tracing::debug!(id = %id, state = %entry.state, "start ignored");
                return Ok(entry.snapshot(id));
            }
            entry.restart_count = 0;
        }
        self.launch_locked(&mut reg, id)
    }

    /// Stop a process. Graceful path signals the process tree and waits out
    /// the grace period before the hard kill; `force` goes straight to the
    /// hard kill. Stopping something already stopped is a no-op.
    pub async fn stop(&self, id: ProcessRole, force: bool) -> Result<ProcessSnapshot, SupervisorError> {
        let (pgid, exit_rx) = {
            let mut reg = self.registry.lock().await;
            let entry = reg.entry_mut(id);
            entry.stop_requested = true;
            match entry.state {
                ProcessState::Stopped | ProcessState::Error => {
                    tracing::debug!(id = %id, state = %entry.state, "stop ignored, nothing to stop");
                    return Ok(entry.snapshot(id));
                }
                ProcessState::BackingOff => {
                    // The scheduled restart re-checks and finds this.
                    entry.state = ProcessState::Stopped;
                    self.emit_status(id, entry);
                    return Ok(entry.snapshot(id));
                }
                _ => {}
            }
            if matches!(entry.launch, LaunchKind::Tail(_)) {
                // The virtual tail walks the same transitions a child does.
                entry.state = ProcessState::Stopping;
                self.emit_status(id, entry);
                if let Some(cancel) = entry.tail_cancel.take() {
                    let _ = cancel.send(true);
                }
                entry.state = ProcessState::Stopped;
                entry.pid = None;
                self.emit_status(id, entry);
                return Ok(entry.snapshot(id));
            }
            entry.state = ProcessState::Stopping;
            self.emit_status(id, entry);
            (entry.pgid, entry.exit_rx.clone())
        };

        let Some(mut exit_rx) = exit_rx else {
            return Ok(self.snapshot_one(id).await);
        };

        if !force {
            if let Some(pgid) = pgid {
                if let Err(source) = proc_kill::terminate_tree(pgid) {
                    self.record_kill_failure(id, &source).await;
                    return Err(SupervisorError::Kill { id, source });
                }
            }
            // The watch guard must not live past the wait itself.
            let exited = tokio::time::timeout(
                self.policy.graceful_stop,
                exit_rx.wait_for(|exited| *exited),
            )
            .await
            .is_ok();
            if exited {
                return Ok(self.snapshot_one(id).await);
            }
            tracing::warn!(id = %id, "graceful stop timed out, killing process tree");
        }

        if let Some(pgid) = pgid {
            if let Err(source) = proc_kill::kill_tree(pgid) {
                self.record_kill_failure(id, &source).await;
                return Err(SupervisorError::Kill { id, source });
            }
        }
        let confirmed = tokio::time::timeout(
            self.policy.kill_confirm_wait,
            exit_rx.wait_for(|exited| *exited),
        )
        .await
        .is_ok();
        if !confirmed {
            tracing::warn!(id = %id, "kill confirmation not observed, proceeding");
        }
        Ok(self.snapshot_one(id).await)
    }

    /// Stop then start, with a zeroed restart counter in between.
    pub async fn restart(&self, id: ProcessRole) -> Result<ProcessSnapshot, SupervisorError> {
        self.stop(id, false).await?;
        self.start(id).await
    }

    /// Start every managed process at once. Failures are reported after all
    /// starts were attempted; the first one in role order wins.
    pub async fn start_all(&self) -> Result<(), SupervisorError> {
        let results = join_all(ProcessRole::ALL.map(|id| self.start(id))).await;
        let mut first_failure = None;
        for (id, result) in ProcessRole::ALL.into_iter().zip(results) {
            if let Err(error) = result {
                tracing::warn!(id = %id, %error, "start_all: process failed to start");
                first_failure.get_or_insert(error);
            }
        }
        match first_failure {
            None => Ok(()),
            Some(error) => Err(error),
        }
    }

    /// Stop every managed process at once, overlapping the graceful windows.
    pub async fn stop_all(&self, force: bool) -> Result<(), SupervisorError> {
        let results = join_all(ProcessRole::ALL.map(|id| self.stop(id, force))).await;
        let mut first_failure = None;
        for (id, result) in ProcessRole::ALL.into_iter().zip(results) {
            if let Err(error) = result {
                tracing::warn!(id = %id, %error, "stop_all: process failed to stop");
                first_failure.get_or_insert(error);
            }
        }
        match first_failure {
            None => Ok(()),
            Some(error) => Err(error),
        }
    }

    pub async fn snapshot(&self) -> Vec<ProcessSnapshot> {
        let reg = self.registry.lock().await;
        ProcessRole::ALL
            .into_iter()
            .map(|id| reg.entry(id).snapshot(id))
            .collect()
    }

    pub async fn snapshot_one(&self, id: ProcessRole) -> ProcessSnapshot {
        let reg = self.registry.lock().await;
        reg.entry(id).snapshot(id)
    }

    /// Spawn (or start the virtual tail) for a record known to be inactive.
    /// Caller holds the registry lock.
    fn launch_locked(
        &self,
        reg: &mut Registry,
        id: ProcessRole,
    ) -> Result<ProcessSnapshot, SupervisorError> {
        let entry = reg.entry_mut(id);
        entry.stop_requested = false;
        entry.exit_code = None;
        entry.exit_signal = None;
        entry.last_error = None;
        entry.epoch += 1;
        entry.state = ProcessState::Starting;
        self.emit_status(id, entry);

        match entry.launch.clone() {
            LaunchKind::Tail(settings) => {
                let (cancel_tx, cancel_rx) = watch::channel(false);
                entry.tail_cancel = Some(cancel_tx);
                tokio::spawn(log_tail::run_tail_loop(self.clone(), settings, cancel_rx));
                entry.state = ProcessState::Running;
                self.emit_status(id, entry);
                Ok(entry.snapshot(id))
            }
            LaunchKind::Child(spec) => {
                let mut cmd = Command::new(&spec.program);
                cmd.args(&spec.args)
                    .stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .kill_on_drop(true);
                if let Some(dir) = &spec.cwd {
                    cmd.current_dir(dir);
                }
                for (key, value) in &spec.env {
                    cmd.env(key, value);
                }
                // Own process group so stop can address the whole tree.
                #[cfg(unix)]
                cmd.process_group(0);

                match cmd.spawn() {
                    Err(source) => {
                        entry.state = ProcessState::Error;
                        entry.last_error = Some(format!("spawn failed: {source}"));
                        self.emit_status(id, entry);
                        Err(SupervisorError::Spawn { id, source })
                    }
                    Ok(mut child) => {
                        let pid = child.id();
                        entry.pid = pid;
                        entry.pgid = pid.map(|p| p as i32);
                        if let Some(stdout) = child.stdout.take() {
                            self.spawn_line_reader(id, LogStream::Stdout, stdout);
                        }
                        if let Some(stderr) = child.stderr.take() {
                            self.spawn_line_reader(id, LogStream::Stderr, stderr);
                        }
                        let (exit_tx, exit_rx) = watch::channel(false);
                        entry.exit_rx = Some(exit_rx);
                        entry.state = ProcessState::Running;
                        self.emit_status(id, entry);
                        tracing::info!(id = %id, pid = ?pid, program = %spec.program, "process started");
                        tokio::spawn(self.clone().watch_exit(
                            id,
                            entry.epoch,
                            child,
                            exit_tx,
                            Instant::now(),
                        ));
                        Ok(entry.snapshot(id))
                    }
                }
            }
        }
    }

    /// Forwards one pipe line by line. Bytes that are not UTF-8 are replaced,
    /// never dropped, and never end the reader; only EOF or a real read error
    /// does.
    fn spawn_line_reader<R>(&self, id: ProcessRole, stream: LogStream, reader: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(error) => {
                        tracing::debug!(id = %id, stream = %stream, %error, "log pipe read failed");
                        break;
                    }
                }
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                    if buf.last() == Some(&b'\r') {
                        buf.pop();
                    }
                }
                let event = LoopEvent::ProcessLog(ProcessLogPayload {
                    id,
                    stream,
                    line: String::from_utf8_lossy(&buf).into_owned(),
                    ts: now_ts(),
                });
                if tx.send(event).is_err() {
                    break;
                }
            }
        });
    }

    /// Owns the child handle until it exits, then settles the record: a
    /// requested stop lands in `stopped`, any other exit of a non-restarting
    /// process is `error`, a crash of an auto-restart process runs the
    /// backoff protocol, exhaustion is terminal `error`.
    async fn watch_exit(
        self,
        id: ProcessRole,
        epoch: u64,
        mut child: Child,
        exit_tx: watch::Sender<bool>,
        started: Instant,
    ) {
        let status = child.wait().await;
        {
            let mut reg = self.registry.lock().await;
            let entry = reg.entry_mut(id);
            if entry.epoch == epoch {
                entry.pid = None;
                entry.pgid = None;
                entry.exit_rx = None;
                match &status {
                    Ok(st) => {
                        entry.exit_code = st.code();
                        entry.exit_signal = exit_signal(st);
                    }
                    Err(error) => {
                        entry.last_error = Some(format!("wait failed: {error}"));
                    }
                }
                tracing::info!(
                    id = %id,
                    code = ?entry.exit_code,
                    signal = ?entry.exit_signal,
                    requested = entry.stop_requested,
                    "process exited"
                );
                if entry.stop_requested || !entry.auto_restart() {
                    // Only a requested stop is voluntary; an exit code alone
                    // cannot say the component was meant to go away.
                    entry.state = if entry.stop_requested {
                        ProcessState::Stopped
                    } else {
                        ProcessState::Error
                    };
                    if entry.state == ProcessState::Error && entry.last_error.is_none() {
                        entry.last_error = Some(describe_exit(&status));
                    }
                    self.emit_status(id, entry);
                } else {
                    if started.elapsed() > self.policy.healthy_uptime {
                        entry.restart_count = 0;
                    }
                    if entry.restart_count >= self.policy.max_restarts {
                        entry.state = ProcessState::Error;
                        entry.last_error = Some(format!(
                            "crash loop: {} consecutive exits, giving up",
                            entry.restart_count
                        ));
                        self.emit_status(id, entry);
                    } else {
                        let delay = restart_delay(entry.restart_count, &self.policy);
                        entry.restart_count += 1;
                        entry.state = ProcessState::BackingOff;
                        self.emit_status(id, entry);
                        tracing::info!(
                            id = %id,
                            attempt = entry.restart_count,
                            delay_ms = delay.as_millis() as u64,
                            "scheduling restart"
                        );
                        let mgr = self.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            mgr.resume_after_backoff(id, epoch).await;
                        });
                    }
                }
            }
        }
        let _ = exit_tx.send(true);
    }

    async fn resume_after_backoff(&self, id: ProcessRole, epoch: u64) {
        let mut reg = self.registry.lock().await;
        {
            let entry = reg.entry_mut(id);
            if entry.epoch != epoch
                || entry.stop_requested
                || entry.state != ProcessState::BackingOff
            {
                tracing::debug!(id = %id, "scheduled restart superseded");
                return;
            }
        }
        if let Err(error) = self.launch_locked(&mut reg, id) {
            tracing::warn!(id = %id, %error, "restart after crash failed");
        }
    }

    async fn record_kill_failure(&self, id: ProcessRole, source: &std::io::Error) {
        let mut reg = self.registry.lock().await;
        let entry = reg.entry_mut(id);
        entry.last_error = Some(format!("kill failed: {source}"));
        self.emit_status(id, entry);
    }

    /// Tail read health lands on the `logTail` record without a state change.
    pub(crate) async fn note_tail_health(&self, error: Option<String>) {
        let mut reg = self.registry.lock().await;
        let entry = reg.entry_mut(ProcessRole::LogTail);
        if entry.state != ProcessState::Running || entry.last_error == error {
            return;
        }
        entry.last_error = error;
        self.emit_status(ProcessRole::LogTail, entry);
    }

    pub(crate) fn emit_event(&self, event: LoopEvent) {
        let _ = self.event_tx.send(event);
    }

    fn emit_status(&self, id: ProcessRole, entry: &mut ManagedEntry) {
        entry.updated_at = now_ts();
        let _ = self.event_tx.send(LoopEvent::ProcessStatus(entry.snapshot(id)));
    }
}

fn describe_exit(status: &std::io::Result<std::process::ExitStatus>) -> String {
    match status {
        Ok(st) => match st.code() {
            Some(code) => format!("exited with code {code}"),
            None => "terminated by signal".to_string(),
        },
        Err(error) => format!("wait failed: {error}"),
    }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}
