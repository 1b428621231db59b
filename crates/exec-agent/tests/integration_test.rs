//! Integration tests for exec-agent ProcessSupervisor
//!
//! These tests run real `/bin/sh` processes and verify:
//! - Event ordering per process (started, output, died)
//! - Output payloads for stdout and stderr
//! - Kill, exit codes and process listing

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{TimeZone, Utc};
use tokio::sync::broadcast;

use exec_agent::{AgentConfig, AgentError, EventBus, ProcessSupervisor};
use exec_protocol::{
    FixedClock, ProcessEvent, ProcessEventBody, ProcessEventType, ProcessSnapshot,
    StartProcessParams,
};

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Create a ProcessSupervisor with a receiver subscribed before any process starts
fn create_supervisor() -> (ProcessSupervisor, broadcast::Receiver<ProcessEvent>) {
    let supervisor = ProcessSupervisor::new(&AgentConfig::default(), EventBus::new(256));
    let rx = supervisor.events().subscribe();
    (supervisor, rx)
}

fn params(name: &str, command_line: &str) -> StartProcessParams {
    StartProcessParams {
        name: name.to_string(),
        command_line: command_line.to_string(),
        workdir: None,
    }
}

/// Collect every event for `pid` up to and including its died event
async fn collect_until_died(rx: &mut broadcast::Receiver<ProcessEvent>, pid: u64) -> Vec<ProcessEvent> {
    tokio::time::timeout(EVENT_TIMEOUT, async {
        let mut events = Vec::new();
        loop {
            let event = rx.recv().await.expect("event bus closed or lagged");
            if event.pid() != pid {
                continue;
            }
            let done = event.is_died();
            events.push(event);
            if done {
                return events;
            }
        }
    })
    .await
    .expect("timed out waiting for process_died")
}

fn output_text(events: &[ProcessEvent], event_type: ProcessEventType) -> String {
    events
        .iter()
        .filter(|e| e.process_event_type() == Some(event_type))
        .map(|e| match &e.body {
            ProcessEventBody::Output(body) => body.text.clone(),
            other => panic!("expected output body for {}, got {:?}", event_type, other),
        })
        .collect()
}

fn status_snapshot(event: &ProcessEvent) -> &ProcessSnapshot {
    match &event.body {
        ProcessEventBody::Status(body) => &body.process,
        other => panic!("expected status body, got {:?}", other),
    }
}

#[tokio::test]
async fn test_echo_lifecycle() {
    let (supervisor, mut rx) = create_supervisor();

    let process = supervisor.start(params("greet", "echo hello")).await.unwrap();
    assert_eq!(process.pid, 1);
    assert!(process.native_pid > 0, "expected OS pid");
    assert_eq!(process.name, "greet");
    assert_eq!(process.command_line, "echo hello");

    let events = collect_until_died(&mut rx, process.pid).await;

    let first = events.first().unwrap();
    assert_eq!(first.process_event_type(), Some(ProcessEventType::Started));
    assert_eq!(status_snapshot(first), &process);

    let last = events.last().unwrap();
    assert_eq!(last.process_event_type(), Some(ProcessEventType::Died));
    assert_eq!(status_snapshot(last), &process);

    assert_eq!(output_text(&events, ProcessEventType::Stdout), "hello\n");
    assert_eq!(output_text(&events, ProcessEventType::Stderr), "");

    let info = supervisor.get(process.pid).await.unwrap();
    assert!(!info.alive);
    assert_eq!(info.exit_code, Some(0));
}

#[tokio::test]
async fn test_stderr_output() {
    let (supervisor, mut rx) = create_supervisor();

    let process = supervisor
        .start(params("warn", "echo oops 1>&2; echo fine"))
        .await
        .unwrap();
    let events = collect_until_died(&mut rx, process.pid).await;

    assert_eq!(output_text(&events, ProcessEventType::Stderr), "oops\n");
    assert_eq!(output_text(&events, ProcessEventType::Stdout), "fine\n");
}

#[tokio::test]
async fn test_output_order_is_preserved() {
    let (supervisor, mut rx) = create_supervisor();

    let process = supervisor
        .start(params("count", "for i in 1 2 3 4 5; do echo line $i; done"))
        .await
        .unwrap();
    let events = collect_until_died(&mut rx, process.pid).await;

    let types: Vec<_> = events.iter().filter_map(|e| e.process_event_type()).collect();
    assert_eq!(types.first(), Some(&ProcessEventType::Started));
    assert_eq!(types.last(), Some(&ProcessEventType::Died));
    assert_eq!(types.iter().filter(|t| t.is_status()).count(), 2);

    assert_eq!(
        output_text(&events, ProcessEventType::Stdout),
        "line 1\nline 2\nline 3\nline 4\nline 5\n"
    );
    for event in events.iter().filter(|e| !e.is_died()) {
        if let ProcessEventBody::Output(body) = &event.body {
            assert!(!body.text.is_empty(), "empty output chunk emitted");
        }
    }
}

#[tokio::test]
async fn test_partial_line_is_delivered() {
    let (supervisor, mut rx) = create_supervisor();

    let process = supervisor.start(params("prompt", "printf 'no newline'")).await.unwrap();
    let events = collect_until_died(&mut rx, process.pid).await;

    assert_eq!(output_text(&events, ProcessEventType::Stdout), "no newline");
}

#[tokio::test]
async fn test_exit_code_is_recorded() {
    let (supervisor, mut rx) = create_supervisor();

    let process = supervisor.start(params("fail", "exit 3")).await.unwrap();
    collect_until_died(&mut rx, process.pid).await;

    let info = supervisor.get(process.pid).await.unwrap();
    assert!(!info.alive);
    assert_eq!(info.exit_code, Some(3));
}

#[tokio::test]
async fn test_kill_process() {
    let (supervisor, mut rx) = create_supervisor();

    let process = supervisor.start(params("sleeper", "exec sleep 30")).await.unwrap();
    assert!(supervisor.get(process.pid).await.unwrap().alive);

    supervisor.kill(process.pid).await.unwrap();
    let events = collect_until_died(&mut rx, process.pid).await;
    assert!(events.last().unwrap().is_died());

    let info = supervisor.get(process.pid).await.unwrap();
    assert!(!info.alive);
    // Killed by a signal, so there is no exit code
    assert_eq!(info.exit_code, None);

    assert!(matches!(
        supervisor.kill(process.pid).await,
        Err(AgentError::ProcessNotAlive(pid)) if pid == process.pid
    ));
}

#[tokio::test]
async fn test_kill_all() {
    let (supervisor, mut rx) = create_supervisor();

    let first = supervisor.start(params("a", "exec sleep 30")).await.unwrap();
    let second = supervisor.start(params("b", "exec sleep 30")).await.unwrap();
    assert_eq!(supervisor.list(false).await.len(), 2);

    supervisor.kill_all().await;

    let mut died = Vec::new();
    tokio::time::timeout(EVENT_TIMEOUT, async {
        while died.len() < 2 {
            let event = rx.recv().await.unwrap();
            if event.is_died() {
                died.push(event.pid());
            }
        }
    })
    .await
    .expect("timed out waiting for both processes to die");

    died.sort();
    assert_eq!(died, vec![first.pid, second.pid]);
    assert!(supervisor.list(false).await.is_empty());
}

#[tokio::test]
async fn test_pids_are_sequential_and_listed() {
    let (supervisor, mut rx) = create_supervisor();

    let short = supervisor.start(params("short", "true")).await.unwrap();
    let long = supervisor.start(params("long", "exec sleep 30")).await.unwrap();
    assert_eq!(short.pid, 1);
    assert_eq!(long.pid, 2);

    collect_until_died(&mut rx, short.pid).await;

    let alive = supervisor.list(false).await;
    assert_eq!(alive.len(), 1);
    assert_eq!(alive[0].process, long);

    let all = supervisor.list(true).await;
    let pids: Vec<u64> = all.iter().map(|info| info.process.pid).collect();
    assert_eq!(pids, vec![1, 2]);

    supervisor.kill(long.pid).await.unwrap();
    collect_until_died(&mut rx, long.pid).await;
}

#[tokio::test]
async fn test_workdir() {
    let temp_dir = tempfile::tempdir().expect("failed to create temp dir");
    std::fs::write(temp_dir.path().join("marker.txt"), "").unwrap();

    let (supervisor, mut rx) = create_supervisor();
    let mut params = params("list", "ls");
    params.workdir = Some(temp_dir.path().to_string_lossy().to_string());

    let process = supervisor.start(params).await.unwrap();
    let events = collect_until_died(&mut rx, process.pid).await;

    assert!(output_text(&events, ProcessEventType::Stdout).contains("marker.txt"));
}

#[tokio::test]
async fn test_fixed_clock_stamps_events() {
    let time = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
    let supervisor = ProcessSupervisor::new(&AgentConfig::default(), EventBus::new(64))
        .with_clock(Arc::new(FixedClock::new(time)));
    let mut rx = supervisor.events().subscribe();

    let process = supervisor.start(params("echo", "echo tick")).await.unwrap();
    let events = collect_until_died(&mut rx, process.pid).await;

    assert!(events.len() >= 3);
    for event in &events {
        assert_eq!(event.body.time(), time);
    }
}

#[tokio::test]
async fn test_started_event_wire_format() {
    let (supervisor, mut rx) = create_supervisor();

    let process = supervisor.start(params("build", "echo make all")).await.unwrap();
    let events = collect_until_died(&mut rx, process.pid).await;

    let value = serde_json::to_value(&events[0]).unwrap();
    assert_eq!(value["type"], "process_started");
    assert_eq!(value["body"]["pid"], process.pid);
    assert_eq!(value["body"]["nativePid"], process.native_pid);
    assert_eq!(value["body"]["name"], "build");
    assert_eq!(value["body"]["commandLine"], "echo make all");
    assert!(value["body"]["time"].is_string());
}

#[tokio::test]
async fn test_long_output_without_newline_is_chunked() {
    let (supervisor, mut rx) = create_supervisor();

    let process = supervisor
        .start(params("flood", "head -c 100000 /dev/zero | tr '\\0' a"))
        .await
        .unwrap();
    let events = collect_until_died(&mut rx, process.pid).await;

    let chunks: Vec<&str> = events
        .iter()
        .filter_map(|e| match &e.body {
            ProcessEventBody::Output(body) => Some(body.text.as_str()),
            ProcessEventBody::Status(_) => None,
        })
        .collect();
    assert!(chunks.len() > 1, "expected the output to be split");
    assert!(chunks.iter().all(|chunk| !chunk.is_empty() && chunk.len() <= 8 * 1024));
    assert_eq!(chunks.concat(), "a".repeat(100_000));
}

#[tokio::test]
async fn test_background_child_does_not_block_died() {
    let (supervisor, mut rx) = create_supervisor();

    // The backgrounded sleep keeps both pipes open after the shell exits
    let started = Instant::now();
    let process = supervisor
        .start(params("detach", "sleep 10 & echo hi"))
        .await
        .unwrap();
    let events = collect_until_died(&mut rx, process.pid).await;
    let elapsed = started.elapsed();

    let types: Vec<_> = events.iter().filter_map(|e| e.process_event_type()).collect();
    assert_eq!(
        types,
        vec![ProcessEventType::Started, ProcessEventType::Stdout, ProcessEventType::Died]
    );
    assert_eq!(output_text(&events, ProcessEventType::Stdout), "hi\n");
    // Both streams share a single drain window
    assert!(elapsed < Duration::from_secs(4), "died took {:?}", elapsed);

    // Nothing for this process is published after its died event
    tokio::time::sleep(Duration::from_millis(200)).await;
    while let Ok(event) = rx.try_recv() {
        assert_ne!(event.pid(), process.pid, "event after process_died: {:?}", event);
    }
}
