use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

pub mod command_gate;
pub mod deck_ipc;

/// RFC 3339 timestamp with millisecond precision, the stamp every event and
/// envelope carries.
pub fn now_ts() -> String {
    chrono::Utc::now()
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Closed set of supervised process roles. `logTail` is the in-process
/// virtual tailer; it reports lifecycle state like any spawned process.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ProcessRole {
    Monitor,
    Agent,
    LogTail,
}

impl ProcessRole {
    pub const ALL: [ProcessRole; 3] = [ProcessRole::Monitor, ProcessRole::Agent, ProcessRole::LogTail];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessRole::Monitor => "monitor",
            ProcessRole::Agent => "agent",
            ProcessRole::LogTail => "logTail",
        }
    }

    pub fn spawns_child(&self) -> bool {
        !matches!(self, ProcessRole::LogTail)
    }
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessRole {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "monitor" => Ok(ProcessRole::Monitor),
            "agent" => Ok(ProcessRole::Agent),
            "logtail" | "log-tail" | "log_tail" => Ok(ProcessRole::LogTail),
            other => Err(format!("Unknown process id: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Stopping,
    BackingOff,
    Error,
}

impl Default for ProcessState {
    fn default() -> Self {
        Self::Stopped
    }
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Stopped => "stopped",
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Stopping => "stopping",
            ProcessState::BackingOff => "backing_off",
            ProcessState::Error => "error",
        }
    }

    /// Already started or starting; `start` is a no-op in these states and
    /// the tray counts them as "something is running".
    pub fn is_active(&self) -> bool {
        matches!(self, ProcessState::Starting | ProcessState::Running)
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
        }
    }
}

impl fmt::Display for LogStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SocketChannel {
    Status,
    Monitor,
}

impl SocketChannel {
    pub const ALL: [SocketChannel; 2] = [SocketChannel::Status, SocketChannel::Monitor];

    pub fn as_str(&self) -> &'static str {
        match self {
            SocketChannel::Status => "status",
            SocketChannel::Monitor => "monitor",
        }
    }
}

impl fmt::Display for SocketChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SocketState {
    Connected,
    Disconnected,
    ConnectError,
}

impl Default for SocketState {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl SocketState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SocketState::Connected => "connected",
            SocketState::Disconnected => "disconnected",
            SocketState::ConnectError => "connect_error",
        }
    }
}

impl fmt::Display for SocketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TrafficLight {
    Red,
    Yellow,
    Green,
}

impl TrafficLight {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrafficLight::Red => "red",
            TrafficLight::Yellow => "yellow",
            TrafficLight::Green => "green",
        }
    }
}

impl fmt::Display for TrafficLight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of one managed process. `updated_at` is the RFC 3339
/// time of the last state transition and doubles as the event timestamp when
/// a snapshot rides a `process_status` event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessSnapshot {
    pub id: ProcessRole,
    pub state: ProcessState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub restart_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_signal: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub updated_at: String,
    pub auto_restart: bool,
}

/// Externally-owned loop progress file. Read-only here; producers have been
/// seen writing epoch numbers where timestamps belong, so those fields accept
/// either form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoopStateFile {
    #[serde(deserialize_with = "deserialize_time_string")]
    pub started_at: String,
    pub loop_active: bool,
    pub iterations: u64,
    #[serde(deserialize_with = "deserialize_time_string")]
    pub last_check: String,
    #[serde(default)]
    pub last_seen_transcript_path: Option<String>,
    #[serde(default, deserialize_with = "deserialize_opt_time_string")]
    pub completed_at: Option<String>,
}

fn deserialize_time_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(serde::de::Error::custom(
            "expected string or number timestamp",
        )),
    }
}

fn deserialize_opt_time_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Option::<Value>::deserialize(deserializer)?;
    match val {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(_) => Err(serde::de::Error::custom(
            "expected string or number timestamp",
        )),
    }
}

// Event payloads

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessLogPayload {
    pub id: ProcessRole,
    pub stream: LogStream,
    pub line: String,
    pub ts: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SocketStatusPayload {
    pub channel: SocketChannel,
    pub state: SocketState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub ts: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SocketDropPayload {
    pub channel: SocketChannel,
    pub event: String,
    pub bytes: usize,
    pub max: usize,
    pub ts: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoopStatePayload {
    pub state: LoopStateFile,
    pub ts: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchErrorPayload {
    pub path: String,
    pub message: String,
    pub ts: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatcherStatusPayload {
    pub watching: bool,
    pub path: String,
    pub ts: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendEventPayload {
    pub channel: SocketChannel,
    pub payload: Value,
    pub ts: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendNotePayload {
    pub text: String,
    pub ts: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitorIterationPayload {
    pub iteration: u64,
    #[serde(default)]
    pub payload: Value,
    pub ts: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitorTranscriptPayload {
    pub path: String,
    pub ts: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendUnknownPayload {
    pub channel: SocketChannel,
    pub name: String,
    pub payload: Value,
    pub ts: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrayStatusPayload {
    pub light: TrafficLight,
    pub anything_running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub objective: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<String>,
    pub ts: String,
}

/// Everything a UI surface may observe, as one tagged union. Variants are
/// immutable once constructed; the deck appends them to its event log and
/// broadcasts, nothing rewrites them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum LoopEvent {
    ProcessStatus(ProcessSnapshot),
    ProcessLog(ProcessLogPayload),
    SocketStatus(SocketStatusPayload),
    SocketDrop(SocketDropPayload),
    LoopState(LoopStatePayload),
    WatchError(WatchErrorPayload),
    WatcherStatus(WatcherStatusPayload),
    BackendStatus(BackendEventPayload),
    BackendActivity(BackendEventPayload),
    BackendObjective(BackendNotePayload),
    BackendGate(BackendNotePayload),
    MonitorIteration(MonitorIterationPayload),
    MonitorCheck(BackendEventPayload),
    MonitorTranscript(MonitorTranscriptPayload),
    MonitorAlert(BackendEventPayload),
    BackendUnknown(BackendUnknownPayload),
    TrayStatus(TrayStatusPayload),
}

impl LoopEvent {
    pub fn ts(&self) -> &str {
        match self {
            LoopEvent::ProcessStatus(p) => &p.updated_at,
            LoopEvent::ProcessLog(p) => &p.ts,
            LoopEvent::SocketStatus(p) => &p.ts,
            LoopEvent::SocketDrop(p) => &p.ts,
            LoopEvent::LoopState(p) => &p.ts,
            LoopEvent::WatchError(p) => &p.ts,
            LoopEvent::WatcherStatus(p) => &p.ts,
            LoopEvent::BackendStatus(p)
            | LoopEvent::BackendActivity(p)
            | LoopEvent::MonitorCheck(p)
            | LoopEvent::MonitorAlert(p) => &p.ts,
            LoopEvent::BackendObjective(p) | LoopEvent::BackendGate(p) => &p.ts,
            LoopEvent::MonitorIteration(p) => &p.ts,
            LoopEvent::MonitorTranscript(p) => &p.ts,
            LoopEvent::BackendUnknown(p) => &p.ts,
            LoopEvent::TrayStatus(p) => &p.ts,
        }
    }
}

/// Tray aggregation: red wins over yellow wins over green. An empty socket
/// slice counts as disconnected.
pub fn derive_tray(
    processes: &[ProcessSnapshot],
    sockets: &[SocketStatusPayload],
    objective: Option<String>,
    gate: Option<String>,
    ts: String,
) -> TrayStatusPayload {
    let any_error = processes.iter().any(|p| p.state == ProcessState::Error);
    let all_connected =
        !sockets.is_empty() && sockets.iter().all(|s| s.state == SocketState::Connected);
    let light = if any_error {
        TrafficLight::Red
    } else if !all_connected {
        TrafficLight::Yellow
    } else {
        TrafficLight::Green
    };
    let anything_running = processes.iter().any(|p| p.state.is_active());
    TrayStatusPayload {
        light,
        anything_running,
        objective,
        gate,
        ts,
    }
}
