#![cfg(unix)]

use std::io::Write;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::timeout;

use lod_core::{LogStream, LoopEvent, ProcessLogPayload, ProcessRole, ProcessSnapshot, ProcessState};
use lod_supervisor::{ProcessManager, ProcessSpec, SupervisorError, SupervisorPolicy, TailSettings};

fn sh(script: &str) -> ProcessSpec {
    ProcessSpec {
        program: "/bin/sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
        cwd: None,
        env: Vec::new(),
        auto_restart: true,
    }
}

fn quick_policy() -> SupervisorPolicy {
    SupervisorPolicy {
        backoff_base: Duration::from_millis(40),
        backoff_cap: Duration::from_millis(160),
        max_restarts: 3,
        healthy_uptime: Duration::from_secs(60),
        graceful_stop: Duration::from_millis(1500),
        kill_confirm_wait: Duration::from_millis(1000),
    }
}

struct Rig {
    manager: ProcessManager,
    events: mpsc::UnboundedReceiver<LoopEvent>,
    _scratch: tempfile::TempDir,
    tail_path: std::path::PathBuf,
}

fn rig(monitor: ProcessSpec, agent: ProcessSpec, policy: SupervisorPolicy) -> Rig {
    let scratch = tempfile::tempdir().expect("tempdir");
    let tail_path = scratch.path().join("tail.log");
    let mut tail = TailSettings::new(&tail_path);
    tail.poll_interval = Duration::from_millis(25);
    let (tx, events) = mpsc::unbounded_channel();
    Rig {
        manager: ProcessManager::new(policy, monitor, agent, tail, tx),
        events,
        _scratch: scratch,
        tail_path,
    }
}

async fn await_state(
    rx: &mut mpsc::UnboundedReceiver<LoopEvent>,
    id: ProcessRole,
    state: ProcessState,
) -> ProcessSnapshot {
    timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Some(LoopEvent::ProcessStatus(snap)) if snap.id == id && snap.state == state => {
                    return snap;
                }
                Some(_) => {}
                None => panic!("event channel closed while waiting for {state:?}"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {id} to reach {state:?}"))
}

async fn await_log(
    rx: &mut mpsc::UnboundedReceiver<LoopEvent>,
    id: ProcessRole,
    needle: &str,
) -> ProcessLogPayload {
    timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Some(LoopEvent::ProcessLog(log)) if log.id == id && log.line.contains(needle) => {
                    return log;
                }
                Some(_) => {}
                None => panic!("event channel closed while waiting for log {needle:?}"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {id} log containing {needle:?}"))
}

#[tokio::test(flavor = "multi_thread")]
async fn start_is_idempotent_and_stop_lands_stopped() {
    let mut rig = rig(sh("sleep 30"), sh("sleep 30"), quick_policy());

    let first = rig.manager.start(ProcessRole::Monitor).await.expect("start");
    assert_eq!(first.state, ProcessState::Running);
    assert!(first.pid.is_some());

    let second = rig.manager.start(ProcessRole::Monitor).await.expect("second start");
    assert_eq!(second.pid, first.pid, "second start must not respawn");

    let stopped = rig.manager.stop(ProcessRole::Monitor, false).await.expect("stop");
    assert_eq!(stopped.state, ProcessState::Stopped);
    assert!(stopped.pid.is_none());

    let again = rig.manager.stop(ProcessRole::Monitor, false).await.expect("stop again");
    assert_eq!(again.state, ProcessState::Stopped);

    await_state(&mut rig.events, ProcessRole::Monitor, ProcessState::Stopped).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn crash_loop_backs_off_then_errors() {
    let mut rig = rig(sh("exit 7"), sh("sleep 30"), quick_policy());
    rig.manager.start(ProcessRole::Monitor).await.expect("start");

    let mut backoffs = 0;
    timeout(Duration::from_secs(10), async {
        loop {
            match rig.events.recv().await {
                Some(LoopEvent::ProcessStatus(snap)) if snap.id == ProcessRole::Monitor => {
                    match snap.state {
                        ProcessState::BackingOff => backoffs += 1,
                        ProcessState::Error => break,
                        _ => {}
                    }
                }
                Some(_) => {}
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("crash loop never reached terminal error");

    assert_eq!(backoffs, 3);
    let snap = rig.manager.snapshot_one(ProcessRole::Monitor).await;
    assert_eq!(snap.state, ProcessState::Error);
    assert_eq!(snap.restart_count, 3);
    assert_eq!(snap.exit_code, Some(7));
    assert!(snap.last_error.as_deref().unwrap_or("").contains("crash loop"));
}

#[tokio::test(flavor = "multi_thread")]
async fn unrequested_exit_with_restarts_disabled_lands_error() {
    let mut monitor = sh("exit 0");
    monitor.auto_restart = false;
    let mut rig = rig(monitor, sh("sleep 30"), quick_policy());
    rig.manager.start(ProcessRole::Monitor).await.expect("start");

    let snap = await_state(&mut rig.events, ProcessRole::Monitor, ProcessState::Error).await;
    assert_eq!(snap.exit_code, Some(0));
    assert!(snap
        .last_error
        .as_deref()
        .unwrap_or("")
        .contains("exited with code 0"));
}

#[tokio::test(flavor = "multi_thread")]
async fn healthy_uptime_resets_the_restart_budget() {
    let policy = SupervisorPolicy {
        healthy_uptime: Duration::from_millis(50),
        ..quick_policy()
    };
    let mut rig = rig(sh("sleep 0.2; exit 3"), sh("sleep 30"), policy);
    rig.manager.start(ProcessRole::Monitor).await.expect("start");

    let mut cycles = 0;
    timeout(Duration::from_secs(10), async {
        while cycles < 4 {
            if let Some(LoopEvent::ProcessStatus(snap)) = rig.events.recv().await {
                if snap.id == ProcessRole::Monitor && snap.state == ProcessState::BackingOff {
                    assert_eq!(snap.restart_count, 1, "healthy uptime must reset the counter");
                    cycles += 1;
                }
            }
        }
    })
    .await
    .expect("did not observe repeated healthy restarts");

    rig.manager.stop(ProcessRole::Monitor, false).await.expect("stop");
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_during_backoff_cancels_the_restart() {
    let policy = SupervisorPolicy {
        backoff_base: Duration::from_millis(300),
        ..quick_policy()
    };
    let mut rig = rig(sh("exit 1"), sh("sleep 30"), policy);
    rig.manager.start(ProcessRole::Monitor).await.expect("start");
    await_state(&mut rig.events, ProcessRole::Monitor, ProcessState::BackingOff).await;

    let stopped = rig.manager.stop(ProcessRole::Monitor, false).await.expect("stop");
    assert_eq!(stopped.state, ProcessState::Stopped);

    tokio::time::sleep(Duration::from_millis(700)).await;
    let mut saw_restart = false;
    while let Ok(event) = rig.events.try_recv() {
        if let LoopEvent::ProcessStatus(snap) = event {
            if snap.id == ProcessRole::Monitor && snap.state.is_active() {
                saw_restart = true;
            }
        }
    }
    assert!(!saw_restart, "scheduled restart must observe the stop");
    let snap = rig.manager.snapshot_one(ProcessRole::Monitor).await;
    assert_eq!(snap.state, ProcessState::Stopped);
}

#[tokio::test(flavor = "multi_thread")]
async fn stdout_and_stderr_lines_are_tagged() {
    let mut rig = rig(sh("sleep 30"), sh("echo out; echo err 1>&2; sleep 30"), quick_policy());
    rig.manager.start(ProcessRole::Agent).await.expect("start");

    let out = await_log(&mut rig.events, ProcessRole::Agent, "out").await;
    assert_eq!(out.stream, LogStream::Stdout);
    let err = await_log(&mut rig.events, ProcessRole::Agent, "err").await;
    assert_eq!(err.stream, LogStream::Stderr);

    rig.manager.stop(ProcessRole::Agent, false).await.expect("stop");
}

#[tokio::test(flavor = "multi_thread")]
async fn log_streams_survive_non_utf8_lines() {
    let mut rig = rig(
        sh("printf 'before\\n'; printf '\\377\\377\\n'; printf 'after\\n'; sleep 30"),
        sh("sleep 30"),
        quick_policy(),
    );
    rig.manager.start(ProcessRole::Monitor).await.expect("start");

    await_log(&mut rig.events, ProcessRole::Monitor, "before").await;
    let garbled = await_log(&mut rig.events, ProcessRole::Monitor, "\u{FFFD}").await;
    assert_eq!(garbled.line, "\u{FFFD}\u{FFFD}");
    await_log(&mut rig.events, ProcessRole::Monitor, "after").await;

    rig.manager.stop(ProcessRole::Monitor, true).await.expect("stop");
}

#[tokio::test(flavor = "multi_thread")]
async fn force_stop_skips_the_graceful_phase() {
    let policy = SupervisorPolicy {
        graceful_stop: Duration::from_secs(3),
        ..quick_policy()
    };
    let mut rig = rig(sh("trap '' TERM; while :; do sleep 1; done"), sh("sleep 30"), policy);
    rig.manager.start(ProcessRole::Monitor).await.expect("start");
    await_state(&mut rig.events, ProcessRole::Monitor, ProcessState::Running).await;

    let began = Instant::now();
    let stopped = rig.manager.stop(ProcessRole::Monitor, true).await.expect("force stop");
    assert!(began.elapsed() < Duration::from_secs(2), "force must not wait out the grace period");
    assert_eq!(stopped.state, ProcessState::Stopped);
}

#[tokio::test(flavor = "multi_thread")]
async fn graceful_timeout_escalates_to_the_hard_kill() {
    let policy = SupervisorPolicy {
        graceful_stop: Duration::from_millis(300),
        ..quick_policy()
    };
    let mut rig = rig(sh("trap '' TERM; while :; do sleep 1; done"), sh("sleep 30"), policy);
    rig.manager.start(ProcessRole::Monitor).await.expect("start");
    await_state(&mut rig.events, ProcessRole::Monitor, ProcessState::Running).await;

    let began = Instant::now();
    let stopped = rig.manager.stop(ProcessRole::Monitor, false).await.expect("stop");
    let elapsed = began.elapsed();
    assert!(elapsed >= Duration::from_millis(300), "the grace period must elapse first");
    assert!(elapsed < Duration::from_secs(3), "escalation must not hang");
    assert_eq!(stopped.state, ProcessState::Stopped);
    assert_eq!(stopped.exit_signal, Some(libc::SIGKILL));
}

#[tokio::test(flavor = "multi_thread")]
async fn start_during_a_graceful_stop_does_not_respawn() {
    let policy = SupervisorPolicy {
        graceful_stop: Duration::from_millis(800),
        ..quick_policy()
    };
    let mut rig = rig(sh("trap '' TERM; while :; do sleep 1; done"), sh("sleep 30"), policy);
    let first = rig.manager.start(ProcessRole::Monitor).await.expect("start");
    await_state(&mut rig.events, ProcessRole::Monitor, ProcessState::Running).await;

    let manager = rig.manager.clone();
    let stopping = tokio::spawn(async move { manager.stop(ProcessRole::Monitor, false).await });
    await_state(&mut rig.events, ProcessRole::Monitor, ProcessState::Stopping).await;

    let during = rig.manager.start(ProcessRole::Monitor).await.expect("start during stop");
    assert_eq!(during.state, ProcessState::Stopping, "start must not interrupt the stop");
    assert_eq!(during.pid, first.pid, "no second process may appear");

    let stopped = stopping.await.expect("join stop").expect("stop");
    assert_eq!(stopped.state, ProcessState::Stopped);
    let settled = rig.manager.snapshot_one(ProcessRole::Monitor).await;
    assert_eq!(settled.state, ProcessState::Stopped);
    assert!(settled.pid.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn restart_after_terminal_error_grants_a_fresh_budget() {
    let mut rig = rig(sh("exit 7"), sh("sleep 30"), quick_policy());
    rig.manager.start(ProcessRole::Monitor).await.expect("start");
    await_state(&mut rig.events, ProcessRole::Monitor, ProcessState::Error).await;

    rig.manager.restart(ProcessRole::Monitor).await.expect("restart");
    let starting = await_state(&mut rig.events, ProcessRole::Monitor, ProcessState::Starting).await;
    assert_eq!(starting.restart_count, 0);

    rig.manager.stop(ProcessRole::Monitor, false).await.expect("stop");
}

#[tokio::test(flavor = "multi_thread")]
async fn tail_follows_appends_partials_and_truncation() {
    let mut rig = rig(sh("sleep 30"), sh("sleep 30"), quick_policy());
    let tail_path = rig.tail_path.clone();

    let started = rig.manager.start(ProcessRole::LogTail).await.expect("start tail");
    assert_eq!(started.state, ProcessState::Running);
    assert!(started.pid.is_none(), "the tail never spawns");

    // Target created only after the watch began.
    std::fs::write(&tail_path, b"alpha\nbet").expect("seed file");
    let line = await_log(&mut rig.events, ProcessRole::LogTail, "alpha").await;
    assert_eq!(line.stream, LogStream::Stdout);

    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(&tail_path)
        .expect("open for append");
    file.write_all(b"a\n").expect("append");
    drop(file);
    await_log(&mut rig.events, ProcessRole::LogTail, "beta").await;

    // Rewrite shorter than the consumed offset.
    std::fs::write(&tail_path, b"zulu\n").expect("truncate");
    await_log(&mut rig.events, ProcessRole::LogTail, "zulu").await;

    let stopped = rig.manager.stop(ProcessRole::LogTail, false).await.expect("stop tail");
    assert_eq!(stopped.state, ProcessState::Stopped);
}

#[tokio::test(flavor = "multi_thread")]
async fn tail_stop_reports_the_stopping_transition() {
    let mut rig = rig(sh("sleep 30"), sh("sleep 30"), quick_policy());
    rig.manager.start(ProcessRole::LogTail).await.expect("start tail");
    await_state(&mut rig.events, ProcessRole::LogTail, ProcessState::Running).await;

    rig.manager.stop(ProcessRole::LogTail, false).await.expect("stop tail");
    await_state(&mut rig.events, ProcessRole::LogTail, ProcessState::Stopping).await;
    await_state(&mut rig.events, ProcessRole::LogTail, ProcessState::Stopped).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn start_all_attempts_everything_and_reports_the_first_failure() {
    let mut rig = rig(
        ProcessSpec::new("/nonexistent/lod-monitor-test-binary"),
        sh("sleep 30"),
        quick_policy(),
    );

    let error = rig.manager.start_all().await.expect_err("monitor spawn must fail");
    match error {
        SupervisorError::Spawn { id, .. } => assert_eq!(id, ProcessRole::Monitor),
        other => panic!("unexpected error: {other}"),
    }

    let snaps = rig.manager.snapshot().await;
    let by_id = |id: ProcessRole| {
        snaps
            .iter()
            .find(|s| s.id == id)
            .unwrap_or_else(|| panic!("missing snapshot for {id}"))
            .clone()
    };
    assert_eq!(by_id(ProcessRole::Monitor).state, ProcessState::Error);
    assert_eq!(by_id(ProcessRole::Agent).state, ProcessState::Running);
    assert_eq!(by_id(ProcessRole::LogTail).state, ProcessState::Running);

    await_state(&mut rig.events, ProcessRole::Agent, ProcessState::Running).await;
    rig.manager.stop_all(true).await.expect("stop all");
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_all_overlaps_the_graceful_windows() {
    let policy = SupervisorPolicy {
        graceful_stop: Duration::from_millis(1000),
        ..quick_policy()
    };
    let stubborn = "trap '' TERM; while :; do sleep 1; done";
    let mut rig = rig(sh(stubborn), sh(stubborn), policy);
    rig.manager.start(ProcessRole::Monitor).await.expect("start monitor");
    rig.manager.start(ProcessRole::Agent).await.expect("start agent");
    await_state(&mut rig.events, ProcessRole::Monitor, ProcessState::Running).await;
    await_state(&mut rig.events, ProcessRole::Agent, ProcessState::Running).await;

    let began = Instant::now();
    rig.manager.stop_all(false).await.expect("stop all");
    let elapsed = began.elapsed();
    assert!(elapsed >= Duration::from_millis(1000), "the grace period must elapse");
    assert!(
        elapsed < Duration::from_millis(1900),
        "graceful waits must overlap, took {elapsed:?}"
    );

    let snaps = rig.manager.snapshot().await;
    assert!(snaps.iter().all(|s| s.state == ProcessState::Stopped));
}
