//! Boundary between untrusted command frames and the typed control surface.
//!
//! Raw `{name, args}` pairs from any UI client pass through [`decode_command`]
//! exactly once; everything past the gate works with [`DeckCommand`] and can
//! trust its fields.

use serde_json::Value;
use url::Url;

use crate::deck_ipc::CommandError;
use crate::ProcessRole;

pub const MAX_STRING_LEN: usize = 1024;
pub const MAX_TOKEN_LEN: usize = 128;

pub fn default_allowed_hosts() -> Vec<String> {
    ["github.com", "docs.rs", "localhost"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeckCommand {
    GetVersion,
    StartProcess { id: ProcessRole },
    StopProcess { id: ProcessRole, force: bool },
    RestartProcess { id: ProcessRole },
    GetSnapshot,
    ArmKill,
    ConfirmKill { token: String },
    GetSocketStatus,
    ConnectSocket,
    DisconnectSocket,
    StartWatcher,
    StopWatcher,
    GetWatcherStatus,
    OpenExternal { url: Url },
}

pub fn decode_command(
    name: &str,
    args: &Value,
    allowed_hosts: &[String],
) -> Result<DeckCommand, CommandError> {
    if !matches!(args, Value::Object(_) | Value::Null) {
        return Err(CommandError::new("invalid_args", "args must be an object"));
    }
    match name {
        "get_version" => Ok(DeckCommand::GetVersion),
        "start_process" => Ok(DeckCommand::StartProcess {
            id: process_id(args)?,
        }),
        "stop_process" => Ok(DeckCommand::StopProcess {
            id: process_id(args)?,
            force: optional_bool(args, "force", false)?,
        }),
        "restart_process" => Ok(DeckCommand::RestartProcess {
            id: process_id(args)?,
        }),
        "get_snapshot" => Ok(DeckCommand::GetSnapshot),
        "arm_kill" => Ok(DeckCommand::ArmKill),
        "confirm_kill" => Ok(DeckCommand::ConfirmKill {
            token: kill_token(args)?,
        }),
        "get_socket_status" => Ok(DeckCommand::GetSocketStatus),
        "connect_socket" => Ok(DeckCommand::ConnectSocket),
        "disconnect_socket" => Ok(DeckCommand::DisconnectSocket),
        "start_watcher" => Ok(DeckCommand::StartWatcher),
        "stop_watcher" => Ok(DeckCommand::StopWatcher),
        "get_watcher_status" => Ok(DeckCommand::GetWatcherStatus),
        "open_external" => Ok(DeckCommand::OpenExternal {
            url: external_url(args, allowed_hosts)?,
        }),
        other => Err(CommandError::new(
            "unknown_command",
            format!("unknown command: {other}"),
        )),
    }
}

fn require_str(args: &Value, key: &str) -> Result<String, CommandError> {
    let value = args
        .get(key)
        .ok_or_else(|| CommandError::new("invalid_args", format!("missing field: {key}")))?;
    let text = value
        .as_str()
        .ok_or_else(|| CommandError::new("invalid_args", format!("{key} must be a string")))?;
    if text.trim().is_empty() {
        return Err(CommandError::new("invalid_args", format!("{key} is blank")));
    }
    if text.len() > MAX_STRING_LEN {
        return Err(CommandError::new(
            "invalid_args",
            format!("{key} exceeds {MAX_STRING_LEN} bytes"),
        ));
    }
    Ok(text.to_string())
}

fn optional_bool(args: &Value, key: &str, default: bool) -> Result<bool, CommandError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Bool(b)) => Ok(*b),
        Some(_) => Err(CommandError::new(
            "invalid_args",
            format!("{key} must be a boolean"),
        )),
    }
}

fn process_id(args: &Value) -> Result<ProcessRole, CommandError> {
    let raw = require_str(args, "id")?;
    raw.parse::<ProcessRole>()
        .map_err(|message| CommandError::new("invalid_process_id", message))
}

fn kill_token(args: &Value) -> Result<String, CommandError> {
    let token = require_str(args, "token")?;
    let well_formed = token.len() <= MAX_TOKEN_LEN
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if !well_formed {
        return Err(CommandError::new("invalid_token", "malformed kill token"));
    }
    Ok(token)
}

fn external_url(args: &Value, allowed_hosts: &[String]) -> Result<Url, CommandError> {
    let raw = require_str(args, "url")?;
    let url =
        Url::parse(&raw).map_err(|e| CommandError::new("invalid_url", format!("bad url: {e}")))?;
    if url.scheme() != "https" {
        return Err(CommandError::new(
            "invalid_url",
            "only https urls may be opened",
        ));
    }
    let host = url
        .host_str()
        .ok_or_else(|| CommandError::new("invalid_url", "url has no host"))?;
    let allowed = allowed_hosts.iter().any(|h| h.eq_ignore_ascii_case(host));
    if !allowed {
        return Err(CommandError::new(
            "forbidden_host",
            format!("host not on the allow list: {host}"),
        ));
    }
    Ok(url)
}
