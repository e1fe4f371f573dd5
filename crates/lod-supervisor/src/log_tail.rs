//! Virtual `logTail` process: follows a file by byte offset on a fixed poll.
//!
//! The ticker never overlaps itself; when a tick runs long the missed ones
//! are skipped, not queued. Each tick reads at most one bounded chunk of
//! newly appended bytes.

use std::io::{self, SeekFrom};
use std::path::PathBuf;
use std::time::Duration;

use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use lod_core::{now_ts, LogStream, LoopEvent, ProcessLogPayload, ProcessRole};

use crate::ProcessManager;

pub const TAIL_POLL_INTERVAL: Duration = Duration::from_millis(250);
pub const TAIL_MAX_CHUNK_BYTES: u64 = 256 * 1024;

#[derive(Debug, Clone)]
pub struct TailSettings {
    pub path: PathBuf,
    pub poll_interval: Duration,
    pub max_chunk_bytes: u64,
}

impl TailSettings {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            poll_interval: TAIL_POLL_INTERVAL,
            max_chunk_bytes: TAIL_MAX_CHUNK_BYTES,
        }
    }
}

/// Consumed-byte cursor with a carry buffer for the trailing partial line.
#[derive(Debug, Default)]
pub struct TailCursor {
    offset: u64,
    partial: Vec<u8>,
}

impl TailCursor {
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Report the current file size before reading. A size below the offset
    /// means the file was truncated or replaced: rewind and drop the carry.
    /// Returns whether that reset happened.
    pub fn observe_size(&mut self, size: u64) -> bool {
        if size < self.offset {
            self.offset = 0;
            self.partial.clear();
            return true;
        }
        false
    }

    /// Feed bytes read at the current offset; returns the completed lines.
    /// The trailing fragment stays buffered until its terminator arrives.
    pub fn ingest(&mut self, chunk: &[u8]) -> Vec<String> {
        self.offset += chunk.len() as u64;
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' {
                if self.partial.last() == Some(&b'\r') {
                    self.partial.pop();
                }
                lines.push(String::from_utf8_lossy(&self.partial).into_owned());
                self.partial.clear();
            } else {
                self.partial.push(byte);
            }
        }
        lines
    }
}

pub(crate) async fn run_tail_loop(
    manager: ProcessManager,
    settings: TailSettings,
    mut cancel_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval(settings.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut cursor = TailCursor::default();
    loop {
        tokio::select! {
            changed = cancel_rx.changed() => {
                if changed.is_err() || *cancel_rx.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                match poll_once(&manager, &settings, &mut cursor).await {
                    Ok(()) => manager.note_tail_health(None).await,
                    Err(error) => {
                        tracing::warn!(path = %settings.path.display(), %error, "tail read failed");
                        manager.note_tail_health(Some(error.to_string())).await;
                    }
                }
            }
        }
    }
    tracing::debug!(path = %settings.path.display(), "tail loop stopped");
}

async fn poll_once(
    manager: &ProcessManager,
    settings: &TailSettings,
    cursor: &mut TailCursor,
) -> io::Result<()> {
    let meta = match fs::metadata(&settings.path).await {
        Ok(meta) => meta,
        // Target not created yet; keep polling.
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(error) => return Err(error),
    };
    if cursor.observe_size(meta.len()) {
        tracing::debug!(path = %settings.path.display(), "tail target truncated, rewinding");
    }
    if meta.len() <= cursor.offset() {
        return Ok(());
    }
    let mut file = fs::File::open(&settings.path).await?;
    file.seek(SeekFrom::Start(cursor.offset())).await?;
    let want = (meta.len() - cursor.offset()).min(settings.max_chunk_bytes);
    let mut chunk = Vec::with_capacity(want as usize);
    file.take(want).read_to_end(&mut chunk).await?;
    for line in cursor.ingest(&chunk) {
        manager.emit_event(LoopEvent::ProcessLog(ProcessLogPayload {
            id: ProcessRole::LogTail,
            stream: LogStream::Stdout,
            line,
            ts: now_ts(),
        }));
    }
    Ok(())
}
