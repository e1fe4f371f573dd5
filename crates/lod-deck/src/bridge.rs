//! Outbound WebSocket bridges to the loop backend.
//!
//! Two channels share one engine: a generic status feed and the namespaced
//! monitor feed. Each runs an unlimited reconnect loop and turns raw backend
//! frames into [`LoopEvent`]s; recognized names are re-tagged, everything
//! else rides the unknown fallback with name and payload intact.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use url::Url;

use lod_core::{
    now_ts, BackendEventPayload, BackendNotePayload, BackendUnknownPayload, LoopEvent,
    MonitorIterationPayload, MonitorTranscriptPayload, SocketChannel, SocketDropPayload,
    SocketState, SocketStatusPayload,
};

pub const BRIDGE_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const BRIDGE_BACKOFF_START: Duration = Duration::from_millis(500);
pub const BRIDGE_BACKOFF_CAP: Duration = Duration::from_secs(8);
/// Serialized size cap per backend event. Anything above is dropped and
/// reported through a `socket_drop` diagnostic.
pub const MAX_EVENT_BYTES: usize = 200 * 1024;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("cannot derive channel url from {base}: {source}")]
    Address {
        base: String,
        #[source]
        source: url::ParseError,
    },
}

/// One frame off the backend socket.
#[derive(Debug, Deserialize)]
struct BackendFrame {
    event: String,
    #[serde(default)]
    payload: Value,
}

struct ChannelSlot {
    cancel: Option<watch::Sender<bool>>,
    last: SocketStatusPayload,
}

impl ChannelSlot {
    fn new(channel: SocketChannel) -> Self {
        Self {
            cancel: None,
            last: SocketStatusPayload {
                channel,
                state: SocketState::Disconnected,
                reason: None,
                ts: now_ts(),
            },
        }
    }
}

struct ChannelPair {
    status: ChannelSlot,
    monitor: ChannelSlot,
}

impl ChannelPair {
    fn slot_mut(&mut self, channel: SocketChannel) -> &mut ChannelSlot {
        match channel {
            SocketChannel::Status => &mut self.status,
            SocketChannel::Monitor => &mut self.monitor,
        }
    }

    fn slot(&self, channel: SocketChannel) -> &ChannelSlot {
        match channel {
            SocketChannel::Status => &self.status,
            SocketChannel::Monitor => &self.monitor,
        }
    }
}

#[derive(Clone)]
pub struct BridgeManager {
    base_url: Url,
    event_tx: mpsc::UnboundedSender<LoopEvent>,
    channels: Arc<Mutex<ChannelPair>>,
}

impl BridgeManager {
    pub fn new(base_url: Url, event_tx: mpsc::UnboundedSender<LoopEvent>) -> Self {
        Self {
            base_url,
            event_tx,
            channels: Arc::new(Mutex::new(ChannelPair {
                status: ChannelSlot::new(SocketChannel::Status),
                monitor: ChannelSlot::new(SocketChannel::Monitor),
            })),
        }
    }

    /// Bring both channels up. Idempotent: a channel that already has a
    /// runner keeps it.
    pub async fn connect(&self) -> Result<(), BridgeError> {
        let mut pair = self.channels.lock().await;
        for channel in SocketChannel::ALL {
            if pair.slot(channel).cancel.is_some() {
                tracing::debug!(channel = %channel, "bridge channel already running");
                continue;
            }
            let url = channel_url(&self.base_url, channel)?;
            let (cancel_tx, cancel_rx) = watch::channel(false);
            pair.slot_mut(channel).cancel = Some(cancel_tx);
            tokio::spawn(self.clone().run_channel(channel, url, cancel_rx));
        }
        Ok(())
    }

    /// Tear down both channels and reset their reported status. Idempotent.
    pub async fn disconnect(&self) {
        let mut pair = self.channels.lock().await;
        for channel in SocketChannel::ALL {
            let slot = pair.slot_mut(channel);
            let Some(cancel_tx) = slot.cancel.take() else {
                continue;
            };
            let _ = cancel_tx.send(true);
            slot.last = SocketStatusPayload {
                channel,
                state: SocketState::Disconnected,
                reason: Some("disconnect requested".to_string()),
                ts: now_ts(),
            };
            let _ = self.event_tx.send(LoopEvent::SocketStatus(slot.last.clone()));
            tracing::info!(channel = %channel, "bridge channel stopped");
        }
    }

    /// Last reported status of both channels, status channel first.
    pub async fn socket_status(&self) -> Vec<SocketStatusPayload> {
        let pair = self.channels.lock().await;
        SocketChannel::ALL
            .into_iter()
            .map(|channel| pair.slot(channel).last.clone())
            .collect()
    }

    async fn run_channel(self, channel: SocketChannel, url: Url, mut cancel_rx: watch::Receiver<bool>) {
        let mut backoff = BRIDGE_BACKOFF_START;
        let mut last_failure: Option<String> = None;
        loop {
            if *cancel_rx.borrow() {
                return;
            }
            let attempt = tokio::select! {
                changed = cancel_rx.changed() => {
                    if changed.is_err() || *cancel_rx.borrow() {
                        return;
                    }
                    continue;
                }
                outcome = timeout(BRIDGE_CONNECT_TIMEOUT, connect_async(url.clone())) => outcome,
            };
            match attempt {
                Ok(Ok((mut ws, _response))) => {
                    last_failure = None;
                    backoff = BRIDGE_BACKOFF_START;
                    self.set_state(channel, SocketState::Connected, None, &cancel_rx)
                        .await;
                    tracing::info!(channel = %channel, url = %url, "bridge connected");
                    let reason = loop {
                        tokio::select! {
                            changed = cancel_rx.changed() => {
                                if changed.is_err() || *cancel_rx.borrow() {
                                    let _ = ws.close(None).await;
                                    return;
                                }
                            }
                            frame = ws.next() => match frame {
                                Some(Ok(WsMessage::Text(text))) => self.forward(channel, &text),
                                Some(Ok(WsMessage::Close(_))) => break "closed by backend".to_string(),
                                Some(Ok(_)) => {}
                                Some(Err(err)) => break err.to_string(),
                                None => break "stream ended".to_string(),
                            },
                        }
                    };
                    tracing::warn!(channel = %channel, reason = %reason, "bridge connection lost");
                    self.set_state(channel, SocketState::Disconnected, Some(reason), &cancel_rx)
                        .await;
                }
                Ok(Err(err)) => {
                    self.note_connect_failure(channel, err.to_string(), &mut last_failure, &cancel_rx)
                        .await;
                }
                Err(_) => {
                    let reason = format!(
                        "connect timed out after {}ms",
                        BRIDGE_CONNECT_TIMEOUT.as_millis()
                    );
                    self.note_connect_failure(channel, reason, &mut last_failure, &cancel_rx)
                        .await;
                }
            }
            tokio::select! {
                changed = cancel_rx.changed() => {
                    if changed.is_err() || *cancel_rx.borrow() {
                        return;
                    }
                }
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = next_backoff(backoff);
        }
    }

    /// Repeat failures with the same reason collapse to one event.
    async fn note_connect_failure(
        &self,
        channel: SocketChannel,
        reason: String,
        last_failure: &mut Option<String>,
        cancel_rx: &watch::Receiver<bool>,
    ) {
        if last_failure.as_deref() == Some(reason.as_str()) {
            return;
        }
        tracing::warn!(channel = %channel, reason = %reason, "bridge connect failed");
        self.set_state(
            channel,
            SocketState::ConnectError,
            Some(reason.clone()),
            cancel_rx,
        )
        .await;
        *last_failure = Some(reason);
    }

    async fn set_state(
        &self,
        channel: SocketChannel,
        state: SocketState,
        reason: Option<String>,
        cancel_rx: &watch::Receiver<bool>,
    ) {
        let mut pair = self.channels.lock().await;
        // A disconnect flips the flag while holding this lock; a runner that
        // lost that race must not overwrite the reset status.
        if *cancel_rx.borrow() {
            return;
        }
        let slot = pair.slot_mut(channel);
        slot.last = SocketStatusPayload {
            channel,
            state,
            reason,
            ts: now_ts(),
        };
        let _ = self.event_tx.send(LoopEvent::SocketStatus(slot.last.clone()));
    }

    fn forward(&self, channel: SocketChannel, text: &str) {
        if text.len() > MAX_EVENT_BYTES {
            let event = serde_json::from_str::<BackendFrame>(text)
                .map(|frame| frame.event)
                .unwrap_or_else(|_| "invalid".to_string());
            tracing::warn!(
                channel = %channel,
                event = %event,
                bytes = text.len(),
                "dropping oversized backend event"
            );
            let _ = self.event_tx.send(LoopEvent::SocketDrop(SocketDropPayload {
                channel,
                event,
                bytes: text.len(),
                max: MAX_EVENT_BYTES,
                ts: now_ts(),
            }));
            return;
        }
        let frame: BackendFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::debug!(channel = %channel, error = %err, "ignoring malformed backend frame");
                return;
            }
        };
        let _ = self
            .event_tx
            .send(retag(channel, frame.event, frame.payload, now_ts()));
    }
}

fn channel_url(base: &Url, channel: SocketChannel) -> Result<Url, BridgeError> {
    let path = match channel {
        SocketChannel::Status => "/events",
        SocketChannel::Monitor => "/monitor",
    };
    base.join(path).map_err(|source| BridgeError::Address {
        base: base.to_string(),
        source,
    })
}

fn retag(channel: SocketChannel, name: String, payload: Value, ts: String) -> LoopEvent {
    match (channel, name.as_str()) {
        (SocketChannel::Status, "status") => {
            LoopEvent::BackendStatus(BackendEventPayload { channel, payload, ts })
        }
        (SocketChannel::Status, "activity") => {
            LoopEvent::BackendActivity(BackendEventPayload { channel, payload, ts })
        }
        (SocketChannel::Status, "objective") => LoopEvent::BackendObjective(BackendNotePayload {
            text: note_text(&payload),
            ts,
        }),
        (SocketChannel::Status, "gate") => LoopEvent::BackendGate(BackendNotePayload {
            text: note_text(&payload),
            ts,
        }),
        (SocketChannel::Monitor, "monitor:iteration") => {
            LoopEvent::MonitorIteration(MonitorIterationPayload {
                iteration: iteration_number(&payload),
                payload,
                ts,
            })
        }
        (SocketChannel::Monitor, "monitor:check") => {
            LoopEvent::MonitorCheck(BackendEventPayload { channel, payload, ts })
        }
        (SocketChannel::Monitor, "monitor:transcript") => {
            LoopEvent::MonitorTranscript(MonitorTranscriptPayload {
                path: transcript_path(&payload),
                ts,
            })
        }
        (SocketChannel::Monitor, "monitor:alert") => {
            LoopEvent::MonitorAlert(BackendEventPayload { channel, payload, ts })
        }
        _ => LoopEvent::BackendUnknown(BackendUnknownPayload {
            channel,
            name,
            payload,
            ts,
        }),
    }
}

/// Objective and gate notes arrive as a bare string or `{ "text": ... }`.
fn note_text(payload: &Value) -> String {
    if let Some(text) = payload.as_str() {
        return text.to_string();
    }
    if let Some(text) = payload.get("text").and_then(Value::as_str) {
        return text.to_string();
    }
    payload.to_string()
}

fn transcript_path(payload: &Value) -> String {
    if let Some(path) = payload.as_str() {
        return path.to_string();
    }
    if let Some(path) = payload.get("path").and_then(Value::as_str) {
        return path.to_string();
    }
    payload.to_string()
}

fn iteration_number(payload: &Value) -> u64 {
    if let Some(n) = payload.as_u64() {
        return n;
    }
    payload
        .get("iteration")
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

fn next_backoff(current: Duration) -> Duration {
    let next = current + current;
    if next > BRIDGE_BACKOFF_CAP {
        BRIDGE_BACKOFF_CAP
    } else {
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use tokio_tungstenite::accept_async;

    fn manager() -> (BridgeManager, mpsc::UnboundedReceiver<LoopEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let base = Url::parse("ws://127.0.0.1:4600").expect("base url");
        (BridgeManager::new(base, tx), rx)
    }

    type ServerWs = tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>;

    /// Accepts every connection and parks the handshaken stream so the test
    /// controls when the backend side goes away.
    async fn local_backend() -> (std::net::SocketAddr, Arc<Mutex<Vec<ServerWs>>>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind backend listener");
        let addr = listener.local_addr().expect("listener addr");
        let held: Arc<Mutex<Vec<ServerWs>>> = Arc::new(Mutex::new(Vec::new()));
        let accepted = held.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                if let Ok(ws) = accept_async(stream).await {
                    accepted.lock().await.push(ws);
                }
            }
        });
        (addr, held)
    }

    fn contains_in_order(history: &[SocketState], pattern: &[SocketState]) -> bool {
        let mut wanted = pattern.iter();
        let mut next = wanted.next();
        for state in history {
            if Some(state) == next {
                next = wanted.next();
            }
        }
        next.is_none()
    }

    /// Folds socket status events into per-channel histories until `done`
    /// says the shape under test has appeared.
    async fn drive_states(
        rx: &mut mpsc::UnboundedReceiver<LoopEvent>,
        history: &mut HashMap<SocketChannel, Vec<SocketState>>,
        done: impl Fn(&HashMap<SocketChannel, Vec<SocketState>>) -> bool,
    ) {
        timeout(Duration::from_secs(15), async {
            while !done(history) {
                match rx.recv().await {
                    Some(LoopEvent::SocketStatus(status)) => {
                        history.entry(status.channel).or_default().push(status.state);
                    }
                    Some(_) => {}
                    None => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("socket lifecycle within deadline");
    }

    #[test]
    fn backoff_doubles_to_the_cap() {
        let mut delay = BRIDGE_BACKOFF_START;
        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(delay.as_millis() as u64);
            delay = next_backoff(delay);
        }
        assert_eq!(seen, vec![500, 1000, 2000, 4000, 8000, 8000]);
    }

    #[test]
    fn channel_urls_join_the_base() {
        let base = Url::parse("ws://127.0.0.1:4600").expect("base url");
        assert_eq!(
            channel_url(&base, SocketChannel::Status).expect("status url").as_str(),
            "ws://127.0.0.1:4600/events"
        );
        assert_eq!(
            channel_url(&base, SocketChannel::Monitor).expect("monitor url").as_str(),
            "ws://127.0.0.1:4600/monitor"
        );
    }

    #[test]
    fn recognized_status_events_are_retagged() {
        let event = retag(
            SocketChannel::Status,
            "status".to_string(),
            json!({"phase": "building"}),
            "t".to_string(),
        );
        match event {
            LoopEvent::BackendStatus(p) => {
                assert_eq!(p.channel, SocketChannel::Status);
                assert_eq!(p.payload["phase"], "building");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn note_text_handles_string_object_and_fallback() {
        assert_eq!(note_text(&json!("ship it")), "ship it");
        assert_eq!(note_text(&json!({"text": "hold"})), "hold");
        assert_eq!(note_text(&json!({"other": 1})), r#"{"other":1}"#);
    }

    #[test]
    fn iteration_counter_is_extracted_from_either_shape() {
        let bare = retag(
            SocketChannel::Monitor,
            "monitor:iteration".to_string(),
            json!(41),
            "t".to_string(),
        );
        let nested = retag(
            SocketChannel::Monitor,
            "monitor:iteration".to_string(),
            json!({"iteration": 42, "elapsed_ms": 1800}),
            "t".to_string(),
        );
        match (bare, nested) {
            (LoopEvent::MonitorIteration(a), LoopEvent::MonitorIteration(b)) => {
                assert_eq!(a.iteration, 41);
                assert_eq!(b.iteration, 42);
                assert_eq!(b.payload["elapsed_ms"], 1800);
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn unrecognized_names_fall_through_with_payload_intact() {
        let event = retag(
            SocketChannel::Monitor,
            "telemetry:gc".to_string(),
            json!({"pause_ms": 3}),
            "t".to_string(),
        );
        match event {
            LoopEvent::BackendUnknown(p) => {
                assert_eq!(p.name, "telemetry:gc");
                assert_eq!(p.payload["pause_ms"], 3);
                assert_eq!(p.channel, SocketChannel::Monitor);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn status_names_are_not_recognized_on_the_monitor_channel() {
        let event = retag(
            SocketChannel::Monitor,
            "objective".to_string(),
            json!("finish the refactor"),
            "t".to_string(),
        );
        assert!(matches!(event, LoopEvent::BackendUnknown(_)));
    }

    #[test]
    fn oversized_frames_drop_with_a_diagnostic() {
        let (bridge, mut rx) = manager();
        let big = format!(
            r#"{{"event":"activity","payload":"{}"}}"#,
            "x".repeat(MAX_EVENT_BYTES)
        );
        bridge.forward(SocketChannel::Status, &big);
        match rx.try_recv().expect("drop event") {
            LoopEvent::SocketDrop(p) => {
                assert_eq!(p.channel, SocketChannel::Status);
                assert_eq!(p.event, "activity");
                assert_eq!(p.bytes, big.len());
                assert_eq!(p.max, MAX_EVENT_BYTES);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn malformed_frames_are_ignored() {
        let (bridge, mut rx) = manager();
        bridge.forward(SocketChannel::Status, "{not json");
        bridge.forward(SocketChannel::Status, r#"{"payload": 1}"#);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn channels_reconnect_after_the_backend_drops() {
        let (addr, held) = local_backend().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let base = Url::parse(&format!("ws://{addr}")).expect("base url");
        let bridge = BridgeManager::new(base, tx);
        bridge.connect().await.expect("connect");

        let mut history: HashMap<SocketChannel, Vec<SocketState>> = HashMap::new();
        drive_states(&mut rx, &mut history, |seen| {
            SocketChannel::ALL.iter().all(|channel| {
                seen.get(channel)
                    .is_some_and(|states| states.contains(&SocketState::Connected))
            })
        })
        .await;

        // Both handshakes must be parked before the cut, or a late arrival
        // would survive it.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let mut conns = held.lock().await;
            if conns.len() >= 2 {
                conns.clear();
                break;
            }
            drop(conns);
            assert!(
                tokio::time::Instant::now() < deadline,
                "backend never held both channels"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        let lifecycle = [
            SocketState::Connected,
            SocketState::Disconnected,
            SocketState::Connected,
        ];
        drive_states(&mut rx, &mut history, |seen| {
            SocketChannel::ALL.iter().all(|channel| {
                seen.get(channel)
                    .is_some_and(|states| contains_in_order(states, &lifecycle))
            })
        })
        .await;

        bridge.disconnect().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn repeated_connect_failures_collapse_to_one_event() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind throwaway listener");
        let addr = listener.local_addr().expect("listener addr");
        drop(listener);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let base = Url::parse(&format!("ws://{addr}")).expect("base url");
        let bridge = BridgeManager::new(base, tx);
        bridge.connect().await.expect("connect");

        // Long enough for the first retry and the one after it.
        tokio::time::sleep(Duration::from_millis(1800)).await;
        bridge.disconnect().await;

        let mut failures: HashMap<SocketChannel, usize> = HashMap::new();
        while let Ok(event) = rx.try_recv() {
            if let LoopEvent::SocketStatus(status) = event {
                if status.state == SocketState::ConnectError {
                    assert!(status.reason.is_some(), "connect errors carry a reason");
                    *failures.entry(status.channel).or_insert(0) += 1;
                }
            }
        }
        for channel in SocketChannel::ALL {
            assert_eq!(
                failures.get(&channel),
                Some(&1),
                "one collapsed failure on {channel}"
            );
        }
    }
}
