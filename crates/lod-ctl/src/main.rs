use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use lod_core::deck_ipc::{
    decode_frame, encode_frame, new_request_id, CommandPayload, CommandResultPayload,
    DeckEnvelope, DeckMsg, HelloPayload, DEFAULT_MAX_FRAME_BYTES,
};

const CTL_SENDER_ID: &str = "lod-ctl";
const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

type DeckSocket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Parser)]
#[command(name = "lod-ctl")]
#[command(about = "Loop ops deck control client", long_about = None)]
struct Cli {
    /// Deck WebSocket url; defaults to the session-derived local port.
    #[arg(long, default_value = "")]
    url: String,
    #[arg(long, default_value = "")]
    session: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deck build and protocol versions
    Version,
    /// Full deck snapshot
    Status,
    /// Start a managed process
    Start { id: String },
    /// Stop a managed process
    Stop {
        id: String,
        /// Skip the graceful phase
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Restart a managed process
    Restart { id: String },
    /// Arm the kill switch and print the confirm token
    Arm,
    /// Confirm an armed kill with its token
    Kill { token: String },
    /// Backend socket bridges
    Socket {
        #[command(subcommand)]
        action: SocketCommands,
    },
    /// Loop state file watcher
    Watcher {
        #[command(subcommand)]
        action: WatcherCommands,
    },
    /// Vet an external link through the deck
    Open { url: String },
    /// Stream deck events to stdout, one JSON frame per line
    Watch {
        /// Skip the retained backlog, print only new events
        #[arg(long, default_value_t = false)]
        no_replay: bool,
    },
}

#[derive(Subcommand)]
enum SocketCommands {
    Connect,
    Disconnect,
    Status,
}

#[derive(Subcommand)]
enum WatcherCommands {
    Start,
    Stop,
    Status,
}

enum Request {
    Command { name: &'static str, args: Value },
    Watch { replay: bool },
}

fn plan(command: Commands) -> Request {
    let (name, args) = match command {
        Commands::Watch { no_replay } => return Request::Watch { replay: !no_replay },
        Commands::Version => ("get_version", Value::Null),
        Commands::Status => ("get_snapshot", Value::Null),
        Commands::Start { id } => ("start_process", json!({ "id": id })),
        Commands::Stop { id, force } => ("stop_process", json!({ "id": id, "force": force })),
        Commands::Restart { id } => ("restart_process", json!({ "id": id })),
        Commands::Arm => ("arm_kill", Value::Null),
        Commands::Kill { token } => ("confirm_kill", json!({ "token": token })),
        Commands::Socket { action } => match action {
            SocketCommands::Connect => ("connect_socket", Value::Null),
            SocketCommands::Disconnect => ("disconnect_socket", Value::Null),
            SocketCommands::Status => ("get_socket_status", Value::Null),
        },
        Commands::Watcher { action } => match action {
            WatcherCommands::Start => ("start_watcher", Value::Null),
            WatcherCommands::Stop => ("stop_watcher", Value::Null),
            WatcherCommands::Status => ("get_watcher_status", Value::Null),
        },
        Commands::Open { url } => ("open_external", json!({ "url": url })),
    };
    Request::Command { name, args }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (url, session_id) = resolve_target(&cli.url, &cli.session);
    match plan(cli.command) {
        Request::Watch { replay } => watch_events(&url, &session_id, replay).await,
        Request::Command { name, args } => {
            let result = run_command(&url, &session_id, name, args).await?;
            let failed = !result.ok;
            print_result(&result);
            if failed {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

async fn open_deck(url: &str, session_id: &str, replay: bool) -> Result<DeckSocket> {
    let (mut ws, _) = connect_async(url)
        .await
        .with_context(|| format!("cannot reach deck at {url}"))?;
    let hello = DeckEnvelope::new(
        session_id,
        CTL_SENDER_ID,
        DeckMsg::Hello(HelloPayload {
            client: CTL_SENDER_ID.to_string(),
            replay,
        }),
    );
    let frame = encode_frame(&hello, DEFAULT_MAX_FRAME_BYTES).context("hello encode failed")?;
    ws.send(Message::Text(frame))
        .await
        .context("hello send failed")?;
    Ok(ws)
}

async fn run_command(
    url: &str,
    session_id: &str,
    name: &str,
    args: Value,
) -> Result<CommandResultPayload> {
    let mut ws = open_deck(url, session_id, false).await?;
    let request_id = new_request_id();
    let request = DeckEnvelope::new(
        session_id,
        CTL_SENDER_ID,
        DeckMsg::Command(CommandPayload {
            name: name.to_string(),
            args,
        }),
    )
    .with_request_id(request_id.clone());
    let frame = encode_frame(&request, DEFAULT_MAX_FRAME_BYTES).context("request encode failed")?;
    ws.send(Message::Text(frame))
        .await
        .context("request send failed")?;

    // The snapshot and any live events arrive on the same stream; only the
    // frame echoing our request id settles the call.
    let reply = tokio::time::timeout(REPLY_TIMEOUT, async {
        loop {
            match ws.next().await {
                None => bail!("deck closed the connection"),
                Some(Err(error)) => return Err(error).context("read from deck failed"),
                Some(Ok(Message::Text(text))) => {
                    let envelope =
                        decode_frame(&text, DEFAULT_MAX_FRAME_BYTES).context("bad frame from deck")?;
                    if envelope.request_id.as_deref() != Some(request_id.as_str()) {
                        continue;
                    }
                    match envelope.msg {
                        DeckMsg::CommandResult(result) => return Ok(result),
                        DeckMsg::Fault(fault) => {
                            bail!("deck rejected the request: {} ({})", fault.message, fault.code)
                        }
                        _ => {}
                    }
                }
                Some(Ok(Message::Close(_))) => bail!("deck closed the connection"),
                Some(Ok(_)) => {}
            }
        }
    })
    .await
    .map_err(|_| anyhow::anyhow!("no reply from the deck within {}s", REPLY_TIMEOUT.as_secs()))??;
    Ok(reply)
}

async fn watch_events(url: &str, session_id: &str, replay: bool) -> Result<()> {
    let mut ws = open_deck(url, session_id, replay).await?;
    while let Some(msg) = ws.next().await {
        match msg.context("read from deck failed")? {
            Message::Text(text) => {
                // Frames are already one JSON document each.
                println!("{text}");
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    Ok(())
}

fn print_result(result: &CommandResultPayload) {
    if result.ok {
        match &result.data {
            Some(data) => match serde_json::to_string_pretty(data) {
                Ok(text) => println!("{text}"),
                Err(_) => println!("{data}"),
            },
            None => println!("ok"),
        }
    } else {
        match &result.error {
            Some(error) => eprintln!("{}: {} ({})", result.name, error.message, error.code),
            None => eprintln!("{}: failed", result.name),
        }
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn resolve_session_id(flag: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.trim().to_string();
    }
    env_value("LOD_SESSION_ID").unwrap_or_else(|| format!("pid-{}", std::process::id()))
}

/// Same FNV-1a fold the deck uses, so both sides land on one port without
/// coordination.
fn derive_port(session_id: &str) -> u16 {
    let mut hash: u32 = 2166136261;
    for byte in session_id.as_bytes() {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    43000 + (hash % 2000) as u16
}

fn resolve_target(url_flag: &str, session_flag: &str) -> (String, String) {
    let session_id = resolve_session_id(session_flag);
    if !url_flag.trim().is_empty() {
        return (url_flag.trim().to_string(), session_id);
    }
    let port = env_value("LOD_DECK_PORT")
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or_else(|| derive_port(&session_id));
    (format!("ws://127.0.0.1:{port}/ws"), session_id)
}
