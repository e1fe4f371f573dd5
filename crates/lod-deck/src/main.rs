use axum::{
    extract::{ws::Message, ws::WebSocket, ws::WebSocketUpgrade, ConnectInfo, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::{
    collections::{HashMap, VecDeque},
    fs::OpenOptions,
    io::{self, Write},
    net::SocketAddr,
    path::{Path, PathBuf},
    process::Stdio,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::{mpsc, Mutex as AsyncMutex, RwLock};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

use lod_core::command_gate::{decode_command, default_allowed_hosts, DeckCommand};
use lod_core::deck_ipc::{
    decode_frame, encode_frame, validate_envelope, CommandError, CommandResultPayload,
    DeckEnvelope, DeckMsg, FrameError, SnapshotPayload, CURRENT_PROTOCOL_VERSION,
    DEFAULT_MAX_FRAME_BYTES,
};
use lod_core::{
    derive_tray, now_ts, LoopEvent, ProcessRole, ProcessSnapshot, SocketChannel, SocketState,
    SocketStatusPayload, TrayStatusPayload, WatcherStatusPayload,
};
use lod_supervisor::{
    ConfirmOutcome, KillSwitch, ProcessManager, ProcessSpec, StateWatcher, SupervisorError,
    SupervisorPolicy, TailSettings, DEFAULT_ARM_WINDOW_MS, STATE_POLL_INTERVAL,
};

mod bridge;

use bridge::BridgeManager;

const DECK_SENDER_ID: &str = "lod-deck";
const DEFAULT_BACKEND_URL: &str = "ws://127.0.0.1:4600";
/// Retained event backlog replayed to late-joining clients.
const EVENT_RING_CAP: usize = 500;
const CLIENT_QUEUE_DEPTH: usize = 256;
const PING_INTERVAL: Duration = Duration::from_secs(20);
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "lod-deck")]
struct Args {
    /// Listen port; 0 derives one from the session id.
    #[arg(long, default_value_t = 0)]
    port: u16,
    #[arg(long, default_value = "")]
    session: String,
    #[arg(long, default_value = "")]
    log_dir: String,
    #[arg(long, default_value = "")]
    backend_url: String,
    #[arg(long, default_value = "")]
    state_file: String,
    #[arg(long, default_value = "")]
    tail_file: String,
    #[arg(long, default_value = "")]
    monitor_cmd: String,
    #[arg(long, default_value = "")]
    monitor_args: String,
    #[arg(long, default_value = "")]
    monitor_cwd: String,
    #[arg(long, default_value = "")]
    agent_cmd: String,
    #[arg(long, default_value = "")]
    agent_args: String,
    #[arg(long, default_value = "")]
    agent_cwd: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[derive(Clone, Debug)]
struct DeckConfig {
    session_id: String,
    port: u16,
    log_dir: PathBuf,
    backend_url: url::Url,
    state_file: PathBuf,
    tail_file: PathBuf,
    monitor: ProcessSpec,
    agent: ProcessSpec,
    policy: SupervisorPolicy,
    kill_window_ms: i64,
    allowed_hosts: Vec<String>,
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(args)?;
    let _log_guard = init_logging(&config);

    let lock = SessionLock::acquire(&config.log_dir, &config.session_id)
        .context("failed to open the session lockfile")?;
    let Some(_lock) = lock else {
        anyhow::bail!("another deck already owns session {}", config.session_id);
    };

    info!(
        event = "deck_start",
        session_id = %config.session_id,
        port = config.port,
        state_file = %config.state_file.display(),
        tail_file = %config.tail_file.display(),
        backend_url = %config.backend_url,
    );

    let (deck, event_rx) = build_deck(config.clone());
    deck.seed_view().await;
    tokio::spawn(dispatcher_loop(deck.clone(), event_rx));

    // Observers come up on boot; monitor and agent wait for an operator.
    if let Err(err) = deck.manager.start(ProcessRole::LogTail).await {
        warn!(event = "tail_start_failed", error = %err);
    }
    deck.watcher.start().await;
    if let Err(err) = deck.bridges.connect().await {
        warn!(event = "bridge_connect_failed", error = %err);
    }

    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(event = "deck_listening", addr = %listener.local_addr()?);

    let app = build_router(deck.clone());
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("deck server failed")?;

    info!(event = "deck_shutdown");
    if let Err(err) = deck.manager.stop_all(false).await {
        warn!(event = "shutdown_stop_failed", error = %err);
    }
    deck.watcher.stop().await;
    deck.bridges.disconnect().await;
    Ok(())
}

fn build_deck(config: DeckConfig) -> (Arc<DeckState>, mpsc::UnboundedReceiver<LoopEvent>) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let manager = ProcessManager::new(
        config.policy.clone(),
        config.monitor.clone(),
        config.agent.clone(),
        TailSettings::new(&config.tail_file),
        event_tx.clone(),
    );
    let watcher = StateWatcher::new(&config.state_file, STATE_POLL_INTERVAL, event_tx.clone());
    let bridges = BridgeManager::new(config.backend_url.clone(), event_tx);
    (
        Arc::new(DeckState::new(config, manager, watcher, bridges)),
        event_rx,
    )
}

fn build_router(deck: Arc<DeckState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(deck)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(deck): State<Arc<DeckState>>,
) -> impl IntoResponse {
    if !addr.ip().is_loopback() {
        return axum::http::StatusCode::FORBIDDEN.into_response();
    }
    ws.on_upgrade(move |socket| async move {
        deck.handle_socket(socket, addr).await;
    })
}

async fn dispatcher_loop(deck: Arc<DeckState>, mut event_rx: mpsc::UnboundedReceiver<LoopEvent>) {
    while let Some(event) = event_rx.recv().await {
        for frame in deck.apply_event(event).await {
            deck.broadcast(&frame).await;
        }
    }
}

struct DeckClient {
    conn_id: String,
    name: String,
    sender: mpsc::Sender<Message>,
}

impl DeckClient {
    async fn send(&self, text: String) -> bool {
        self.sender.send(Message::Text(text)).await.is_ok()
    }

    /// Non-blocking push for broadcast fan-out. A full queue reports failure
    /// instead of waiting on the consumer.
    fn try_push(&self, text: String) -> bool {
        self.sender.try_send(Message::Text(text)).is_ok()
    }

    /// Best-effort close frame. A queue already full of unread frames simply
    /// loses the courtesy goodbye; the socket is torn down either way.
    fn close(&self, reason: &str) {
        let _ = self
            .sender
            .try_send(Message::Close(Some(axum::extract::ws::CloseFrame {
                code: 1008,
                reason: reason.to_string().into(),
            })));
    }
}

/// Projection of the core state kept current by the dispatcher. Snapshots,
/// tray aggregation and the replay backlog all read from here.
struct DeckView {
    processes: HashMap<ProcessRole, ProcessSnapshot>,
    sockets: HashMap<SocketChannel, SocketStatusPayload>,
    watcher: WatcherStatusPayload,
    objective: Option<String>,
    gate: Option<String>,
    last_tray: Option<TrayStatusPayload>,
    ring: VecDeque<String>,
}

impl DeckView {
    fn new(watcher: WatcherStatusPayload) -> Self {
        let sockets = SocketChannel::ALL
            .into_iter()
            .map(|channel| {
                (
                    channel,
                    SocketStatusPayload {
                        channel,
                        state: SocketState::Disconnected,
                        reason: None,
                        ts: now_ts(),
                    },
                )
            })
            .collect();
        Self {
            processes: HashMap::new(),
            sockets,
            watcher,
            objective: None,
            gate: None,
            last_tray: None,
            ring: VecDeque::new(),
        }
    }

    fn processes_vec(&self) -> Vec<ProcessSnapshot> {
        ProcessRole::ALL
            .into_iter()
            .filter_map(|role| self.processes.get(&role).cloned())
            .collect()
    }

    fn sockets_vec(&self) -> Vec<SocketStatusPayload> {
        SocketChannel::ALL
            .into_iter()
            .filter_map(|channel| self.sockets.get(&channel).cloned())
            .collect()
    }

    /// Recompute the tray aggregate; `Some` only when it differs from the
    /// last emitted one (timestamps excluded from the comparison).
    fn refresh_tray(&mut self) -> Option<TrayStatusPayload> {
        let next = derive_tray(
            &self.processes_vec(),
            &self.sockets_vec(),
            self.objective.clone(),
            self.gate.clone(),
            now_ts(),
        );
        let changed = match &self.last_tray {
            None => true,
            Some(prev) => {
                prev.light != next.light
                    || prev.anything_running != next.anything_running
                    || prev.objective != next.objective
                    || prev.gate != next.gate
            }
        };
        if changed {
            self.last_tray = Some(next.clone());
            Some(next)
        } else {
            None
        }
    }

    fn remember(&mut self, frame: String) {
        self.ring.push_back(frame);
        while self.ring.len() > EVENT_RING_CAP {
            self.ring.pop_front();
        }
    }
}

struct DeckState {
    config: DeckConfig,
    manager: ProcessManager,
    watcher: StateWatcher,
    bridges: BridgeManager,
    kill: AsyncMutex<KillSwitch>,
    conn_counter: AtomicU64,
    clients: RwLock<HashMap<String, Arc<DeckClient>>>,
    view: AsyncMutex<DeckView>,
}

impl DeckState {
    fn new(
        config: DeckConfig,
        manager: ProcessManager,
        watcher: StateWatcher,
        bridges: BridgeManager,
    ) -> Self {
        let placeholder = WatcherStatusPayload {
            watching: false,
            path: config.state_file.display().to_string(),
            ts: now_ts(),
        };
        let kill = AsyncMutex::new(KillSwitch::new(config.kill_window_ms));
        Self {
            config,
            manager,
            watcher,
            bridges,
            kill,
            conn_counter: AtomicU64::new(0),
            clients: RwLock::new(HashMap::new()),
            view: AsyncMutex::new(DeckView::new(placeholder)),
        }
    }

    /// Prime the projection before the first event arrives so an early hello
    /// still sees the full process table.
    async fn seed_view(&self) {
        let snapshots = self.manager.snapshot().await;
        let watcher = self.watcher.status().await;
        let mut view = self.view.lock().await;
        for snapshot in snapshots {
            view.processes.insert(snapshot.id, snapshot);
        }
        view.watcher = watcher;
    }

    fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("conn-{id}")
    }

    async fn apply_event(&self, event: LoopEvent) -> Vec<String> {
        let tray_relevant = matches!(
            &event,
            LoopEvent::ProcessStatus(_)
                | LoopEvent::SocketStatus(_)
                | LoopEvent::BackendObjective(_)
                | LoopEvent::BackendGate(_)
        );
        let mut frames = Vec::new();
        let mut view = self.view.lock().await;
        match &event {
            LoopEvent::ProcessStatus(snapshot) => {
                view.processes.insert(snapshot.id, snapshot.clone());
            }
            LoopEvent::SocketStatus(status) => {
                view.sockets.insert(status.channel, status.clone());
            }
            LoopEvent::WatcherStatus(watcher) => view.watcher = watcher.clone(),
            LoopEvent::BackendObjective(note) => view.objective = Some(note.text.clone()),
            LoopEvent::BackendGate(note) => view.gate = Some(note.text.clone()),
            _ => {}
        }
        if let Some(frame) = self.encode_event(DeckMsg::from(event)) {
            view.remember(frame.clone());
            frames.push(frame);
        }
        if tray_relevant {
            if let Some(tray) = view.refresh_tray() {
                if let Some(frame) = self.encode_event(DeckMsg::TrayStatus(tray)) {
                    view.remember(frame.clone());
                    frames.push(frame);
                }
            }
        }
        frames
    }

    fn encode_event(&self, msg: DeckMsg) -> Option<String> {
        let envelope = DeckEnvelope::new(self.config.session_id.clone(), DECK_SENDER_ID, msg);
        match encode_frame(&envelope, DEFAULT_MAX_FRAME_BYTES) {
            Ok(frame) => Some(frame),
            Err(err) => {
                warn!(event = "event_encode_failed", error = %err);
                None
            }
        }
    }

    async fn build_snapshot(&self) -> SnapshotPayload {
        let view = self.view.lock().await;
        let processes = view.processes_vec();
        let sockets = view.sockets_vec();
        let tray = derive_tray(
            &processes,
            &sockets,
            view.objective.clone(),
            view.gate.clone(),
            now_ts(),
        );
        SnapshotPayload {
            processes,
            sockets,
            watcher: view.watcher.clone(),
            tray,
        }
    }

    async fn register_client(&self, client: Arc<DeckClient>) {
        self.clients
            .write()
            .await
            .insert(client.conn_id.clone(), client.clone());
        info!(
            event = "client_connected",
            conn_id = %client.conn_id,
            client = %client.name
        );
    }

    async fn remove_client(&self, client: &DeckClient, reason: &str) {
        client.close(reason);
        self.clients.write().await.remove(&client.conn_id);
        info!(
            event = "client_disconnected",
            conn_id = %client.conn_id,
            client = %client.name,
            reason = reason
        );
    }

    /// Best-effort fan-out. A client with a full queue is dropped so the
    /// dispatcher never waits on a slow consumer.
    async fn broadcast(&self, frame: &str) {
        let clients: Vec<Arc<DeckClient>> = self.clients.read().await.values().cloned().collect();
        for client in clients {
            if !client.try_push(frame.to_string()) {
                warn!(event = "client_lagging", conn_id = %client.conn_id);
                self.remove_client(&client, "slow_consumer").await;
            }
        }
    }

    fn start_ping(self: Arc<Self>, client: Arc<DeckClient>) {
        let deck = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PING_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if client.sender.send(Message::Ping(Vec::new())).await.is_err() {
                    debug!(event = "ping_failed", conn_id = %client.conn_id);
                    deck.remove_client(&client, "ping_failed").await;
                    return;
                }
            }
        });
    }

    async fn handle_socket(self: Arc<Self>, socket: WebSocket, remote: SocketAddr) {
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Message>(CLIENT_QUEUE_DEPTH);
        let write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                match tokio::time::timeout(WRITE_TIMEOUT, ws_sender.send(msg)).await {
                    Ok(Ok(())) => {}
                    _ => return,
                }
            }
        });

        let first = match ws_receiver.next().await {
            Some(Ok(msg)) => msg,
            _ => return,
        };
        let text = match message_text(first) {
            Some(text) => text,
            None => return,
        };
        let envelope = match decode_frame(&text, DEFAULT_MAX_FRAME_BYTES)
            .and_then(|env| validate_envelope(&env).map(|_| env))
        {
            Ok(env) => env,
            Err(err) => {
                warn!(event = "hello_invalid", remote = %remote, error = %err);
                return;
            }
        };
        let DeckMsg::Hello(hello) = envelope.msg.clone() else {
            warn!(event = "expected_hello", remote = %remote);
            return;
        };
        if envelope.session_id != self.config.session_id {
            warn!(
                event = "session_mismatch",
                remote = %remote,
                got = %envelope.session_id
            );
            return;
        }

        let client = Arc::new(DeckClient {
            conn_id: self.next_conn_id(),
            name: hello.client,
            sender: tx.clone(),
        });
        self.register_client(client.clone()).await;
        self.clone().start_ping(client.clone());

        let snapshot = DeckMsg::Snapshot(self.build_snapshot().await);
        let reply = DeckEnvelope::reply_to(&envelope, DECK_SENDER_ID, snapshot);
        match encode_frame(&reply, DEFAULT_MAX_FRAME_BYTES) {
            Ok(frame) => {
                if !client.send(frame).await {
                    self.remove_client(&client, "snapshot_error").await;
                    return;
                }
            }
            Err(err) => warn!(event = "snapshot_encode_failed", error = %err),
        }
        if hello.replay {
            let backlog: Vec<String> = {
                let view = self.view.lock().await;
                view.ring.iter().cloned().collect()
            };
            let count = backlog.len();
            for frame in backlog {
                if !client.send(frame).await {
                    self.remove_client(&client, "replay_error").await;
                    return;
                }
            }
            info!(event = "replay_sent", conn_id = %client.conn_id, count = count);
        }

        while let Some(result) = ws_receiver.next().await {
            let msg = match result {
                Ok(msg) => msg,
                Err(err) => {
                    warn!(event = "read_error", conn_id = %client.conn_id, error = %err);
                    break;
                }
            };
            let text = match msg {
                Message::Text(text) => text,
                Message::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(_) => {
                        self.send_fault(
                            &client,
                            None,
                            CommandError::new("invalid_frame", "frame is not utf-8"),
                        )
                        .await;
                        continue;
                    }
                },
                Message::Close(_) => {
                    info!(event = "client_close", conn_id = %client.conn_id);
                    break;
                }
                Message::Ping(_) | Message::Pong(_) => continue,
            };
            let envelope = match decode_frame(&text, DEFAULT_MAX_FRAME_BYTES)
                .and_then(|env| validate_envelope(&env).map(|_| env))
            {
                Ok(env) => env,
                Err(err) => {
                    warn!(event = "frame_invalid", conn_id = %client.conn_id, error = %err);
                    self.send_fault(&client, None, frame_fault(&err)).await;
                    continue;
                }
            };
            if envelope.session_id != self.config.session_id {
                warn!(
                    event = "session_mismatch",
                    conn_id = %client.conn_id,
                    got = %envelope.session_id
                );
                self.send_fault(
                    &client,
                    Some(&envelope),
                    CommandError::new("session_mismatch", "frame belongs to another session"),
                )
                .await;
                break;
            }
            match envelope.msg.clone() {
                DeckMsg::Command(command) => {
                    let result = match decode_command(
                        &command.name,
                        &command.args,
                        &self.config.allowed_hosts,
                    ) {
                        Ok(cmd) => self.execute_command(&command.name, cmd).await,
                        Err(err) => CommandResultPayload::err(&command.name, err),
                    };
                    let reply = DeckEnvelope::reply_to(
                        &envelope,
                        DECK_SENDER_ID,
                        DeckMsg::CommandResult(result),
                    );
                    self.send_envelope(&client, &reply).await;
                }
                DeckMsg::Hello(_) => {
                    self.send_fault(
                        &client,
                        Some(&envelope),
                        CommandError::new("unexpected_hello", "handshake already completed"),
                    )
                    .await;
                }
                _ => {
                    self.send_fault(
                        &client,
                        Some(&envelope),
                        CommandError::new(
                            "unexpected_message",
                            "clients send hello and command frames only",
                        ),
                    )
                    .await;
                }
            }
        }

        self.remove_client(&client, "disconnect").await;
        drop(tx);
        let _ = write_task.await;
    }

    async fn send_envelope(&self, client: &DeckClient, envelope: &DeckEnvelope) {
        match encode_frame(envelope, DEFAULT_MAX_FRAME_BYTES) {
            Ok(frame) => {
                if !client.send(frame).await {
                    self.remove_client(client, "send_error").await;
                }
            }
            Err(err) => warn!(event = "reply_encode_failed", error = %err),
        }
    }

    async fn send_fault(
        &self,
        client: &DeckClient,
        request: Option<&DeckEnvelope>,
        fault: CommandError,
    ) {
        let msg = DeckMsg::Fault(fault);
        let envelope = match request {
            Some(request) => DeckEnvelope::reply_to(request, DECK_SENDER_ID, msg),
            None => DeckEnvelope::new(self.config.session_id.clone(), DECK_SENDER_ID, msg),
        };
        self.send_envelope(client, &envelope).await;
    }

    async fn execute_command(&self, name: &str, cmd: DeckCommand) -> CommandResultPayload {
        match cmd {
            DeckCommand::GetVersion => CommandResultPayload::ok(
                name,
                Some(json!({
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                    "protocol": CURRENT_PROTOCOL_VERSION,
                })),
            ),
            DeckCommand::StartProcess { id } => match self.manager.start(id).await {
                Ok(snapshot) => CommandResultPayload::ok(name, serde_json::to_value(snapshot).ok()),
                Err(err) => CommandResultPayload::err(name, supervisor_fault(&err)),
            },
            DeckCommand::StopProcess { id, force } => match self.manager.stop(id, force).await {
                Ok(snapshot) => CommandResultPayload::ok(name, serde_json::to_value(snapshot).ok()),
                Err(err) => CommandResultPayload::err(name, supervisor_fault(&err)),
            },
            DeckCommand::RestartProcess { id } => match self.manager.restart(id).await {
                Ok(snapshot) => CommandResultPayload::ok(name, serde_json::to_value(snapshot).ok()),
                Err(err) => CommandResultPayload::err(name, supervisor_fault(&err)),
            },
            DeckCommand::GetSnapshot => {
                CommandResultPayload::ok(name, serde_json::to_value(self.build_snapshot().await).ok())
            }
            DeckCommand::ArmKill => {
                let armed = self.kill.lock().await.arm(Utc::now());
                info!(event = "kill_armed", expires_at = %armed.expires_at.to_rfc3339());
                CommandResultPayload::ok(
                    name,
                    Some(json!({
                        "token": armed.token,
                        "expires_at": armed.expires_at.to_rfc3339(),
                    })),
                )
            }
            DeckCommand::ConfirmKill { token } => {
                let outcome = self.kill.lock().await.confirm(&token, Utc::now());
                match outcome {
                    ConfirmOutcome::Confirmed => {
                        info!(event = "kill_confirmed");
                        let stopped = self.manager.stop_all(true).await;
                        self.bridges.disconnect().await;
                        match stopped {
                            Ok(()) => CommandResultPayload::ok(
                                name,
                                Some(json!({ "result": "confirmed" })),
                            ),
                            Err(err) => CommandResultPayload::err(name, supervisor_fault(&err)),
                        }
                    }
                    other => {
                        warn!(event = "kill_rejected", reason = other.reason());
                        CommandResultPayload::err(
                            name,
                            CommandError::new(confirm_code(&other), other.reason()),
                        )
                    }
                }
            }
            DeckCommand::GetSocketStatus => CommandResultPayload::ok(
                name,
                Some(json!({ "sockets": self.bridges.socket_status().await })),
            ),
            DeckCommand::ConnectSocket => match self.bridges.connect().await {
                Ok(()) => CommandResultPayload::ok(
                    name,
                    Some(json!({ "sockets": self.bridges.socket_status().await })),
                ),
                Err(err) => CommandResultPayload::err(
                    name,
                    CommandError::new("invalid_backend_url", err.to_string()),
                ),
            },
            DeckCommand::DisconnectSocket => {
                self.bridges.disconnect().await;
                CommandResultPayload::ok(
                    name,
                    Some(json!({ "sockets": self.bridges.socket_status().await })),
                )
            }
            DeckCommand::StartWatcher => {
                let status = self.watcher.start().await;
                CommandResultPayload::ok(name, serde_json::to_value(status).ok())
            }
            DeckCommand::StopWatcher => {
                let status = self.watcher.stop().await;
                CommandResultPayload::ok(name, serde_json::to_value(status).ok())
            }
            DeckCommand::GetWatcherStatus => {
                let status = self.watcher.status().await;
                CommandResultPayload::ok(name, serde_json::to_value(status).ok())
            }
            DeckCommand::OpenExternal { url } => match launch_external(opener_program(), url.as_str()) {
                Ok(()) => {
                    info!(event = "open_external", url = %url);
                    CommandResultPayload::ok(name, Some(json!({ "url": url.to_string() })))
                }
                Err(error) => {
                    warn!(event = "open_external_failed", url = %url, error = %error);
                    CommandResultPayload::err(
                        name,
                        CommandError::new("open_failed", format!("failed to launch the browser: {error}")),
                    )
                }
            },
        }
    }
}

fn message_text(msg: Message) -> Option<String> {
    match msg {
        Message::Text(text) => Some(text),
        Message::Binary(bytes) => String::from_utf8(bytes).ok(),
        Message::Close(_) => None,
        Message::Ping(_) => None,
        Message::Pong(_) => None,
    }
}

fn opener_program() -> &'static str {
    if cfg!(target_os = "macos") {
        "open"
    } else if cfg!(target_os = "windows") {
        "cmd"
    } else {
        "xdg-open"
    }
}

/// Hands a vetted URL to the platform opener. Fire and forget: the opener's
/// own exit status is not watched, only the spawn can fail.
fn launch_external(program: &str, url: &str) -> io::Result<()> {
    let mut command = tokio::process::Command::new(program);
    if cfg!(target_os = "windows") {
        // `start` needs an explicit empty title before the URL.
        command.args(["/C", "start", "", url]);
    } else {
        command.arg(url);
    }
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map(|_| ())
}

fn frame_fault(err: &FrameError) -> CommandError {
    let code = match err {
        FrameError::OversizedFrame { .. } => "oversized_frame",
        FrameError::Decode(_) => "invalid_frame",
        FrameError::Protocol(_) => "invalid_envelope",
        FrameError::Encode(_) => "internal",
    };
    CommandError::new(code, err.to_string())
}

fn supervisor_fault(err: &SupervisorError) -> CommandError {
    let code = match err {
        SupervisorError::Spawn { .. } => "spawn_failed",
        SupervisorError::Kill { .. } => "kill_failed",
    };
    CommandError::new(code, err.to_string())
}

fn confirm_code(outcome: &ConfirmOutcome) -> &'static str {
    match outcome {
        ConfirmOutcome::NotArmed => "not_armed",
        ConfirmOutcome::Expired => "expired",
        ConfirmOutcome::WrongToken => "invalid_token",
        ConfirmOutcome::Confirmed => "confirmed",
    }
}

fn load_config(args: Args) -> anyhow::Result<DeckConfig> {
    let session_id = resolve_session_id(&args.session);
    let port = resolve_port(args.port, &session_id);
    let log_dir = resolve_log_dir(&args.log_dir);
    let backend_raw = resolve_backend_url(&args.backend_url);
    let backend_url = url::Url::parse(&backend_raw)
        .with_context(|| format!("invalid backend url: {backend_raw}"))?;
    let state_file = resolve_state_file(&args.state_file);
    let tail_file = resolve_tail_file(&args.tail_file, &log_dir, &session_id);
    let monitor = resolve_process_spec(
        &args.monitor_cmd,
        &args.monitor_args,
        &args.monitor_cwd,
        "MONITOR",
        "loop-monitor",
    );
    let agent = resolve_process_spec(
        &args.agent_cmd,
        &args.agent_args,
        &args.agent_cwd,
        "AGENT",
        "loop-agent",
    );
    Ok(DeckConfig {
        session_id,
        port,
        log_dir,
        backend_url,
        state_file,
        tail_file,
        monitor,
        agent,
        policy: resolve_policy(),
        kill_window_ms: resolve_kill_window(),
        allowed_hosts: default_allowed_hosts(),
        debug: args.debug || env_true("LOD_DECK_DEBUG"),
    })
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn resolve_session_id(flag: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.trim().to_string();
    }
    env_value("LOD_SESSION_ID").unwrap_or_else(|| format!("pid-{}", std::process::id()))
}

/// FNV-1a over the session id, folded into the deck port range.
fn derive_port(session_id: &str) -> u16 {
    let mut hash: u32 = 2166136261;
    for byte in session_id.as_bytes() {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    43000 + (hash % 2000) as u16
}

fn resolve_port(flag: u16, session_id: &str) -> u16 {
    if flag != 0 {
        return flag;
    }
    if let Some(value) = env_value("LOD_DECK_PORT") {
        match value.parse::<u16>() {
            Ok(port) => return port,
            Err(_) => eprintln!("ignoring unparsable LOD_DECK_PORT: {value}"),
        }
    }
    derive_port(session_id)
}

fn resolve_log_dir(flag: &str) -> PathBuf {
    if !flag.trim().is_empty() {
        return PathBuf::from(flag.trim());
    }
    if let Some(value) = env_value("LOD_LOG_DIR") {
        return PathBuf::from(value);
    }
    match std::env::var_os("HOME") {
        Some(home) if !home.is_empty() => PathBuf::from(home).join(".lod").join("logs"),
        _ => PathBuf::from(".lod/logs"),
    }
}

fn activity_log_path(log_dir: &Path, session_id: &str) -> PathBuf {
    log_dir.join(format!("deck-{session_id}.log"))
}

fn resolve_backend_url(flag: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.trim().to_string();
    }
    env_value("LOD_BACKEND_URL").unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string())
}

fn resolve_state_file(flag: &str) -> PathBuf {
    if !flag.trim().is_empty() {
        return PathBuf::from(flag.trim());
    }
    if let Some(value) = env_value("LOD_STATE_FILE") {
        return PathBuf::from(value);
    }
    std::env::current_dir()
        .map(|dir| dir.join("loop-state.json"))
        .unwrap_or_else(|_| PathBuf::from("loop-state.json"))
}

/// Default tail target is the deck's own activity log.
fn resolve_tail_file(flag: &str, log_dir: &Path, session_id: &str) -> PathBuf {
    if !flag.trim().is_empty() {
        return PathBuf::from(flag.trim());
    }
    if let Some(value) = env_value("LOD_TAIL_FILE") {
        return PathBuf::from(value);
    }
    activity_log_path(log_dir, session_id)
}

fn resolve_process_spec(
    cmd_flag: &str,
    args_flag: &str,
    cwd_flag: &str,
    env_prefix: &str,
    default_cmd: &str,
) -> ProcessSpec {
    let program = if !cmd_flag.trim().is_empty() {
        cmd_flag.trim().to_string()
    } else {
        env_value(&format!("LOD_{env_prefix}_CMD")).unwrap_or_else(|| default_cmd.to_string())
    };
    let raw_args = if !args_flag.trim().is_empty() {
        Some(args_flag.trim().to_string())
    } else {
        env_value(&format!("LOD_{env_prefix}_ARGS"))
    };
    let args = raw_args
        .map(|raw| raw.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default();
    let cwd = if !cwd_flag.trim().is_empty() {
        Some(PathBuf::from(cwd_flag.trim()))
    } else {
        env_value(&format!("LOD_{env_prefix}_CWD")).map(PathBuf::from)
    };
    ProcessSpec {
        program,
        args,
        cwd,
        env: Vec::new(),
        auto_restart: true,
    }
}

fn env_ms(key: &str, default_ms: u64) -> u64 {
    env_value(key)
        .and_then(|value| value.parse().ok())
        .unwrap_or(default_ms)
}

fn resolve_policy() -> SupervisorPolicy {
    let defaults = SupervisorPolicy::default();
    SupervisorPolicy {
        backoff_base: Duration::from_millis(env_ms(
            "LOD_BACKOFF_BASE_MS",
            defaults.backoff_base.as_millis() as u64,
        )),
        backoff_cap: Duration::from_millis(env_ms(
            "LOD_BACKOFF_CAP_MS",
            defaults.backoff_cap.as_millis() as u64,
        )),
        max_restarts: env_value("LOD_MAX_RESTARTS")
            .and_then(|value| value.parse().ok())
            .unwrap_or(defaults.max_restarts),
        healthy_uptime: Duration::from_millis(env_ms(
            "LOD_HEALTHY_UPTIME_MS",
            defaults.healthy_uptime.as_millis() as u64,
        )),
        graceful_stop: Duration::from_millis(env_ms(
            "LOD_GRACEFUL_STOP_MS",
            defaults.graceful_stop.as_millis() as u64,
        )),
        kill_confirm_wait: Duration::from_millis(env_ms(
            "LOD_KILL_CONFIRM_MS",
            defaults.kill_confirm_wait.as_millis() as u64,
        )),
    }
}

fn resolve_kill_window() -> i64 {
    env_value("LOD_KILL_WINDOW_MS")
        .and_then(|value| value.parse().ok())
        .unwrap_or(DEFAULT_ARM_WINDOW_MS)
}

fn init_logging(config: &DeckConfig) -> Option<LogGuard> {
    let level = if config.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_env("LOD_DECK_LOG").unwrap_or_else(|_| EnvFilter::new(level));
    let guard = match open_log_file(&config.log_dir, &config.session_id) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = guard.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(guard)
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

/// Fans every log line out to stdout and the session activity log.
struct MultiWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &Path, session_id: &str) -> io::Result<LogGuard> {
    if std::fs::create_dir_all(log_dir).is_err() {
        return Ok(LogGuard { file: None });
    }
    let path = activity_log_path(log_dir, session_id);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .write(true)
        .open(path)?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}

/// Advisory one-deck-per-session lock under the log directory.
struct SessionLock {
    file: std::fs::File,
}

impl SessionLock {
    fn acquire(log_dir: &Path, session_id: &str) -> io::Result<Option<Self>> {
        use fs2::FileExt;

        std::fs::create_dir_all(log_dir)?;
        let path = log_dir.join(format!("deck-{session_id}.lock"));
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        if file.try_lock_exclusive().is_err() {
            return Ok(None);
        }
        file.set_len(0)?;
        file.write_all(format!("pid={}\n", std::process::id()).as_bytes())?;
        file.flush()?;
        Ok(Some(Self { file }))
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        use fs2::FileExt;
        let _ = self.file.unlock();
    }
}
