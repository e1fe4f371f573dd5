//! Wire protocol between the deck core and its UI surfaces.
//!
//! Every frame is one JSON envelope per WebSocket text message. The envelope
//! carries routing metadata plus a flattened `{type, payload}` message body,
//! so peers can switch on `type` without unwrapping nesting.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::{LoopEvent, ProcessSnapshot, SocketStatusPayload, TrayStatusPayload, WatcherStatusPayload};

/// Hard cap on a single frame. Oversized frames are dropped, never truncated.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

pub const CURRENT_PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion(1);

/// Protocol version, carried as a string on the wire so non-Rust peers that
/// stringify everything stay compatible. Numeric and missing forms are
/// accepted on input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion(pub u16);

impl Default for ProtocolVersion {
    fn default() -> Self {
        CURRENT_PROTOCOL_VERSION
    }
}

impl Serialize for ProtocolVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for ProtocolVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let val = Value::deserialize(deserializer)?;
        match val {
            Value::String(s) => s
                .trim()
                .parse::<u16>()
                .map(ProtocolVersion)
                .map_err(|_| serde::de::Error::custom(format!("bad protocol version: {s}"))),
            Value::Number(n) => n
                .as_u64()
                .and_then(|n| u16::try_from(n).ok())
                .map(ProtocolVersion)
                .ok_or_else(|| serde::de::Error::custom(format!("bad protocol version: {n}"))),
            other => Err(serde::de::Error::custom(format!(
                "bad protocol version: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeckEnvelope {
    #[serde(default)]
    pub version: ProtocolVersion,
    pub session_id: String,
    pub sender_id: String,
    pub ts: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub msg: DeckMsg,
}

impl DeckEnvelope {
    pub fn new(session_id: impl Into<String>, sender_id: impl Into<String>, msg: DeckMsg) -> Self {
        Self {
            version: CURRENT_PROTOCOL_VERSION,
            session_id: session_id.into(),
            sender_id: sender_id.into(),
            ts: crate::now_ts(),
            request_id: None,
            msg,
        }
    }

    /// Reply envelope for a request: same session, request_id echoed back.
    pub fn reply_to(request: &DeckEnvelope, sender_id: impl Into<String>, msg: DeckMsg) -> Self {
        Self {
            request_id: request.request_id.clone(),
            ..Self::new(request.session_id.clone(), sender_id, msg)
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

/// Message body. Event variants mirror [`LoopEvent`] one to one so that a
/// broadcast event and a standalone event share the same wire tag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum DeckMsg {
    Hello(HelloPayload),
    Snapshot(SnapshotPayload),
    Command(CommandPayload),
    CommandResult(CommandResultPayload),
    /// Protocol-level rejection (oversized or malformed frame, bad session).
    /// Command failures ride `CommandResult` instead.
    Fault(CommandError),
    ProcessStatus(ProcessSnapshot),
    ProcessLog(crate::ProcessLogPayload),
    SocketStatus(SocketStatusPayload),
    SocketDrop(crate::SocketDropPayload),
    LoopState(crate::LoopStatePayload),
    WatchError(crate::WatchErrorPayload),
    WatcherStatus(WatcherStatusPayload),
    BackendStatus(crate::BackendEventPayload),
    BackendActivity(crate::BackendEventPayload),
    BackendObjective(crate::BackendNotePayload),
    BackendGate(crate::BackendNotePayload),
    MonitorIteration(crate::MonitorIterationPayload),
    MonitorCheck(crate::BackendEventPayload),
    MonitorTranscript(crate::MonitorTranscriptPayload),
    MonitorAlert(crate::BackendEventPayload),
    BackendUnknown(crate::BackendUnknownPayload),
    TrayStatus(TrayStatusPayload),
}

impl From<LoopEvent> for DeckMsg {
    fn from(event: LoopEvent) -> Self {
        match event {
            LoopEvent::ProcessStatus(p) => DeckMsg::ProcessStatus(p),
            LoopEvent::ProcessLog(p) => DeckMsg::ProcessLog(p),
            LoopEvent::SocketStatus(p) => DeckMsg::SocketStatus(p),
            LoopEvent::SocketDrop(p) => DeckMsg::SocketDrop(p),
            LoopEvent::LoopState(p) => DeckMsg::LoopState(p),
            LoopEvent::WatchError(p) => DeckMsg::WatchError(p),
            LoopEvent::WatcherStatus(p) => DeckMsg::WatcherStatus(p),
            LoopEvent::BackendStatus(p) => DeckMsg::BackendStatus(p),
            LoopEvent::BackendActivity(p) => DeckMsg::BackendActivity(p),
            LoopEvent::BackendObjective(p) => DeckMsg::BackendObjective(p),
            LoopEvent::BackendGate(p) => DeckMsg::BackendGate(p),
            LoopEvent::MonitorIteration(p) => DeckMsg::MonitorIteration(p),
            LoopEvent::MonitorCheck(p) => DeckMsg::MonitorCheck(p),
            LoopEvent::MonitorTranscript(p) => DeckMsg::MonitorTranscript(p),
            LoopEvent::MonitorAlert(p) => DeckMsg::MonitorAlert(p),
            LoopEvent::BackendUnknown(p) => DeckMsg::BackendUnknown(p),
            LoopEvent::TrayStatus(p) => DeckMsg::TrayStatus(p),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HelloPayload {
    pub client: String,
    /// Ask for the retained event backlog after the snapshot.
    #[serde(default = "default_replay")]
    pub replay: bool,
}

fn default_replay() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotPayload {
    pub processes: Vec<ProcessSnapshot>,
    pub sockets: Vec<SocketStatusPayload>,
    pub watcher: WatcherStatusPayload,
    pub tray: TrayStatusPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandPayload {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandResultPayload {
    pub name: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CommandError>,
}

impl CommandResultPayload {
    pub fn ok(name: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            name: name.into(),
            ok: true,
            data,
            error: None,
        }
    }

    pub fn err(name: impl Into<String>, error: CommandError) -> Self {
        Self {
            name: name.into(),
            ok: false,
            data: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandError {
    pub code: String,
    pub message: String,
}

impl CommandError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame of {size} bytes exceeds cap of {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
}

pub fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn encode_frame(envelope: &DeckEnvelope, max_bytes: usize) -> Result<String, FrameError> {
    let text = serde_json::to_string(envelope).map_err(|e| FrameError::Encode(e.to_string()))?;
    if text.len() > max_bytes {
        return Err(FrameError::OversizedFrame {
            size: text.len(),
            max: max_bytes,
        });
    }
    Ok(text)
}

pub fn decode_frame(text: &str, max_bytes: usize) -> Result<DeckEnvelope, FrameError> {
    if text.len() > max_bytes {
        return Err(FrameError::OversizedFrame {
            size: text.len(),
            max: max_bytes,
        });
    }
    serde_json::from_str(text).map_err(|e| FrameError::Decode(e.to_string()))
}

const MAX_ID_LEN: usize = 128;

/// Sanity checks before a received envelope is dispatched. Rejections here
/// mean a broken peer, not a user error, so they surface as [`FrameError`].
pub fn validate_envelope(envelope: &DeckEnvelope) -> Result<(), FrameError> {
    if envelope.version != CURRENT_PROTOCOL_VERSION {
        return Err(FrameError::Protocol(format!(
            "unsupported protocol version {}",
            envelope.version.0
        )));
    }
    for (field, value) in [
        ("session_id", &envelope.session_id),
        ("sender_id", &envelope.sender_id),
    ] {
        if value.trim().is_empty() {
            return Err(FrameError::Protocol(format!("{field} is blank")));
        }
        if value.len() > MAX_ID_LEN {
            return Err(FrameError::Protocol(format!(
                "{field} exceeds {MAX_ID_LEN} bytes"
            )));
        }
    }
    if chrono::DateTime::parse_from_rfc3339(&envelope.ts).is_err() {
        return Err(FrameError::Protocol(format!(
            "ts is not RFC 3339: {}",
            envelope.ts
        )));
    }
    Ok(())
}
