//! Poll watcher for the externally owned loop state file.
//!
//! The file belongs to the monitoring backend; this side only reads. A
//! missing file and a torn mid-write document are ordinary conditions and
//! skip silently; only changed parses produce events.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{interval, MissedTickBehavior};

use lod_core::{
    now_ts, LoopEvent, LoopStateFile, LoopStatePayload, WatchErrorPayload, WatcherStatusPayload,
};

pub const STATE_POLL_INTERVAL: Duration = Duration::from_millis(1500);

#[derive(Clone)]
pub struct StateWatcher {
    path: PathBuf,
    poll_interval: Duration,
    event_tx: mpsc::UnboundedSender<LoopEvent>,
    cancel: Arc<Mutex<Option<watch::Sender<bool>>>>,
}

impl StateWatcher {
    pub fn new(
        path: impl Into<PathBuf>,
        poll_interval: Duration,
        event_tx: mpsc::UnboundedSender<LoopEvent>,
    ) -> Self {
        Self {
            path: path.into(),
            poll_interval,
            event_tx,
            cancel: Arc::new(Mutex::new(None)),
        }
    }

    /// Begin watching; the first read happens immediately. Idempotent: a
    /// second start warns and leaves the running watch alone.
    pub async fn start(&self) -> WatcherStatusPayload {
        let mut cancel = self.cancel.lock().await;
        if cancel.is_some() {
            tracing::warn!(path = %self.path.display(), "state watcher already running");
            return self.payload(true);
        }
        let (cancel_tx, cancel_rx) = watch::channel(false);
        *cancel = Some(cancel_tx);
        tokio::spawn(self.clone().run(cancel_rx));
        let status = self.payload(true);
        let _ = self
            .event_tx
            .send(LoopEvent::WatcherStatus(status.clone()));
        status
    }

    /// Cancel the poll. The change cache dies with the task, so the next
    /// start re-reports the first read.
    pub async fn stop(&self) -> WatcherStatusPayload {
        let mut cancel = self.cancel.lock().await;
        if let Some(cancel_tx) = cancel.take() {
            let _ = cancel_tx.send(true);
            let status = self.payload(false);
            let _ = self
                .event_tx
                .send(LoopEvent::WatcherStatus(status.clone()));
            return status;
        }
        self.payload(false)
    }

    pub async fn status(&self) -> WatcherStatusPayload {
        let watching = self.cancel.lock().await.is_some();
        self.payload(watching)
    }

    fn payload(&self, watching: bool) -> WatcherStatusPayload {
        WatcherStatusPayload {
            watching,
            path: self.path.display().to_string(),
            ts: now_ts(),
        }
    }

    async fn run(self, mut cancel_rx: watch::Receiver<bool>) {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_seen: Option<LoopStateFile> = None;
        let mut last_failure: Option<String> = None;
        loop {
            tokio::select! {
                changed = cancel_rx.changed() => {
                    if changed.is_err() || *cancel_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.poll(&mut last_seen, &mut last_failure).await;
                }
            }
        }
        tracing::debug!(path = %self.path.display(), "state watcher stopped");
    }

    async fn poll(
        &self,
        last_seen: &mut Option<LoopStateFile>,
        last_failure: &mut Option<String>,
    ) {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return,
            Err(error) => {
                // Repeat failures collapse until the message changes.
                let message = error.to_string();
                if last_failure.as_deref() != Some(message.as_str()) {
                    *last_failure = Some(message.clone());
                    let _ = self.event_tx.send(LoopEvent::WatchError(WatchErrorPayload {
                        path: self.path.display().to_string(),
                        message,
                        ts: now_ts(),
                    }));
                }
                return;
            }
        };
        *last_failure = None;
        let parsed: LoopStateFile = match serde_json::from_str(&raw) {
            Ok(parsed) => parsed,
            // Torn mid-write read; the next tick sees the full document.
            Err(_) => return,
        };
        if last_seen.as_ref() == Some(&parsed) {
            return;
        }
        *last_seen = Some(parsed.clone());
        let _ = self.event_tx.send(LoopEvent::LoopState(LoopStatePayload {
            state: parsed,
            ts: now_ts(),
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::error::TryRecvError;

    fn state_doc(iterations: u64) -> String {
        format!(
            r#"{{
                "started_at": "2026-03-01T09:00:00Z",
                "loop_active": true,
                "iterations": {iterations},
                "last_check": "2026-03-01T10:00:00Z"
            }}"#
        )
    }

    fn watcher_with_channel(
        path: &std::path::Path,
    ) -> (StateWatcher, mpsc::UnboundedReceiver<LoopEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (StateWatcher::new(path, STATE_POLL_INTERVAL, tx), rx)
    }

    #[tokio::test]
    async fn identical_reads_emit_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("loop-state.json");
        std::fs::write(&path, state_doc(3)).expect("write state");
        let (watcher, mut rx) = watcher_with_channel(&path);
        let mut last_seen = None;
        let mut last_failure = None;

        watcher.poll(&mut last_seen, &mut last_failure).await;
        watcher.poll(&mut last_seen, &mut last_failure).await;

        match rx.try_recv() {
            Ok(LoopEvent::LoopState(payload)) => assert_eq!(payload.state.iterations, 3),
            other => panic!("expected one loop_state event, got {other:?}"),
        }
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn changed_iterations_emit_again() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("loop-state.json");
        std::fs::write(&path, state_doc(1)).expect("write state");
        let (watcher, mut rx) = watcher_with_channel(&path);
        let mut last_seen = None;
        let mut last_failure = None;

        watcher.poll(&mut last_seen, &mut last_failure).await;
        std::fs::write(&path, state_doc(2)).expect("rewrite state");
        watcher.poll(&mut last_seen, &mut last_failure).await;

        let mut iterations = Vec::new();
        while let Ok(LoopEvent::LoopState(payload)) = rx.try_recv() {
            iterations.push(payload.state.iterations);
        }
        assert_eq!(iterations, vec![1, 2]);
    }

    #[tokio::test]
    async fn missing_file_skips_silently() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("absent.json");
        let (watcher, mut rx) = watcher_with_channel(&path);
        let mut last_seen = None;
        let mut last_failure = None;

        watcher.poll(&mut last_seen, &mut last_failure).await;

        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn torn_write_skips_then_full_document_lands() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("loop-state.json");
        std::fs::write(&path, r#"{"started_at": "2026-"#).expect("write torn");
        let (watcher, mut rx) = watcher_with_channel(&path);
        let mut last_seen = None;
        let mut last_failure = None;

        watcher.poll(&mut last_seen, &mut last_failure).await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        std::fs::write(&path, state_doc(9)).expect("write full");
        watcher.poll(&mut last_seen, &mut last_failure).await;
        match rx.try_recv() {
            Ok(LoopEvent::LoopState(payload)) => assert_eq!(payload.state.iterations, 9),
            other => panic!("expected loop_state event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fresh_cache_re_reports_current_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("loop-state.json");
        std::fs::write(&path, state_doc(5)).expect("write state");
        let (watcher, mut rx) = watcher_with_channel(&path);

        let mut last_seen = None;
        let mut last_failure = None;
        watcher.poll(&mut last_seen, &mut last_failure).await;
        assert!(matches!(rx.try_recv(), Ok(LoopEvent::LoopState(_))));

        // A stopped-then-restarted watch starts with an empty cache.
        let mut fresh = None;
        watcher.poll(&mut fresh, &mut last_failure).await;
        assert!(matches!(rx.try_recv(), Ok(LoopEvent::LoopState(_))));
    }
}
