// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

use serial_test::serial;

use corral_core::Event;

use crate::evpub::EventPublisher;
use crate::sockets::SocketRegistry;

fn cfg(name: &str, cmd: &str, numprocesses: usize) -> WatcherCfg {
    let mut cfg = WatcherCfg::new(name, cmd);
    cfg.numprocesses = numprocesses;
    cfg.graceful_timeout = 2.0;
    cfg
}

fn initialized(cfg: WatcherCfg) -> (Watcher, tokio::sync::broadcast::Receiver<Event>) {
    let publisher = EventPublisher::new();
    let rx = publisher.subscribe();
    let mut watcher = Watcher::new(cfg);
    watcher
        .initialize(publisher, &SocketRegistry::default())
        .unwrap();
    (watcher, rx)
}

fn pid_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[test]
fn uninitialized_watcher_cannot_start() {
    let mut watcher = Watcher::new(cfg("w", "sleep 30", 1));
    assert!(matches!(watcher.start(), Err(ArbiterError::Init(_))));
}

#[test]
fn unresolved_socket_marker_fails_initialize() {
    let mut watcher = Watcher::new({
        let mut cfg = cfg("w", "CORRAL_FD=corral.sockets.missing exec sleep 30", 1);
        cfg.use_sockets = true;
        cfg
    });
    let err = watcher
        .initialize(EventPublisher::new(), &SocketRegistry::default())
        .unwrap_err();
    assert!(matches!(err, ArbiterError::Init(_)));
}

#[test]
#[serial]
fn start_spawns_numprocesses_children() {
    let (mut watcher, mut rx) = initialized(cfg("w", "sleep 30", 2));
    assert_eq!(watcher.status(), WatcherStatus::Stopped);

    watcher.start().unwrap();
    assert_eq!(watcher.status(), WatcherStatus::Active);
    assert_eq!(watcher.len(), 2);
    for pid in watcher.pids() {
        assert!(pid_alive(pid), "child {pid} should be running");
    }

    // One start event, then one spawn per child.
    let events = drain(&mut rx);
    assert_eq!(events[0].kind, EventKind::Start);
    let spawns = events
        .iter()
        .filter(|e| matches!(e.kind, EventKind::Spawn { .. }))
        .count();
    assert_eq!(spawns, 2);

    watcher.stop();
}

#[test]
#[serial]
fn start_is_idempotent_while_running() {
    let (mut watcher, _rx) = initialized(cfg("w", "sleep 30", 1));
    watcher.start().unwrap();
    let pids = watcher.pids();
    watcher.start().unwrap();
    assert_eq!(watcher.pids(), pids);
    watcher.stop();
}

#[test]
#[serial]
fn stop_terminates_and_reaps_children() {
    let (mut watcher, mut rx) = initialized(cfg("w", "sleep 30", 2));
    watcher.start().unwrap();
    let pids = watcher.pids();
    drain(&mut rx);

    watcher.stop();
    assert_eq!(watcher.status(), WatcherStatus::Stopped);
    assert!(watcher.is_empty());
    for pid in pids {
        assert!(!pid_alive(pid), "child {pid} should be gone");
    }

    // An exit per child precedes the stop event.
    let events = drain(&mut rx);
    let exits = events
        .iter()
        .filter(|e| matches!(e.kind, EventKind::Exit { .. }))
        .count();
    assert_eq!(exits, 2);
    assert_eq!(events.last().map(|e| &e.kind), Some(&EventKind::Stop));

    // Idempotent.
    watcher.stop();
}

#[test]
#[serial]
fn manage_processes_respawns_reaped_children() {
    let (mut watcher, _rx) = initialized(cfg("w", "sleep 30", 1));
    watcher.start().unwrap();
    let old_pid = watcher.pids()[0];

    let _ = kill(Pid::from_raw(old_pid as i32), Signal::SIGKILL);
    // The arbiter's wait loop would deliver this; simulate it.
    watcher.reap_process(old_pid, ProcessExit::signaled(9));
    assert!(watcher.is_empty());

    watcher.manage_processes();
    assert_eq!(watcher.len(), 1);
    assert_ne!(watcher.pids()[0], old_pid);

    watcher.stop();
    // The SIGKILLed child is reaped out-of-band here; stop only reaped
    // the replacement.
    let _ = waitpid(Pid::from_raw(old_pid as i32), Some(WaitPidFlag::WNOHANG));
}

#[test]
#[serial]
fn manage_processes_is_a_noop_when_stopped() {
    let (mut watcher, _rx) = initialized(cfg("w", "sleep 30", 1));
    watcher.manage_processes();
    assert!(watcher.is_empty());
}

#[test]
#[serial]
fn graceful_reload_replaces_the_fleet() {
    let (mut watcher, mut rx) = initialized(cfg("w", "sleep 30", 1));
    watcher.start().unwrap();
    let old_pid = watcher.pids()[0];
    drain(&mut rx);

    watcher.reload(true).unwrap();
    assert_eq!(watcher.len(), 1);
    let new_pid = watcher.pids()[0];
    assert_ne!(new_pid, old_pid);
    assert!(!pid_alive(old_pid));
    assert!(pid_alive(new_pid));

    // The replacement spawn comes before the old child's exit.
    let events = drain(&mut rx);
    let spawn_idx = events
        .iter()
        .position(|e| matches!(e.kind, EventKind::Spawn { .. }))
        .unwrap();
    let exit_idx = events
        .iter()
        .position(|e| matches!(e.kind, EventKind::Exit { .. }))
        .unwrap();
    assert!(spawn_idx < exit_idx);
    assert_eq!(events.last().map(|e| &e.kind), Some(&EventKind::Reload));

    watcher.stop();
}

#[test]
#[serial]
fn non_graceful_reload_is_stop_then_start() {
    let (mut watcher, _rx) = initialized(cfg("w", "sleep 30", 1));
    watcher.start().unwrap();
    let old_pid = watcher.pids()[0];

    watcher.reload(false).unwrap();
    assert_eq!(watcher.status(), WatcherStatus::Active);
    assert_eq!(watcher.len(), 1);
    assert_ne!(watcher.pids()[0], old_pid);

    watcher.stop();
}

#[test]
fn set_numprocesses_updates_target_only() {
    let (mut watcher, _rx) = initialized(cfg("w", "sleep 30", 1));
    assert_eq!(watcher.set_numprocesses(3), 3);
    assert_eq!(watcher.numprocesses(), 3);
    // Nothing spawned until the next manage pass.
    assert!(watcher.is_empty());
}

#[test]
fn singleton_stays_pinned_at_one() {
    let mut cfg = cfg("w", "sleep 30", 1);
    cfg.singleton = true;
    let (mut watcher, _rx) = initialized(cfg);
    assert_eq!(watcher.set_numprocesses(5), 1);
}

#[test]
#[serial]
fn children_ignoring_sigterm_are_killed() {
    let mut cfg = cfg("w", "trap '' TERM; sleep 30", 1);
    cfg.graceful_timeout = 0.2;
    let (mut watcher, _rx) = initialized(cfg);
    watcher.start().unwrap();
    let pid = watcher.pids()[0];
    // Give the shell a moment to install the trap.
    std::thread::sleep(Duration::from_millis(100));

    let begin = Instant::now();
    watcher.stop();
    assert!(watcher.is_empty());
    assert!(!pid_alive(pid));
    // Bounded: grace period plus the kill window, not the full sleep.
    assert!(begin.elapsed() < Duration::from_secs(5));
}

#[test]
#[serial]
fn stdout_stream_appends_child_output() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("w.out");
    let mut cfg = cfg("w", "echo hello", 1);
    cfg.stdout_stream = Some(out.clone());
    let (mut watcher, _rx) = initialized(cfg);
    watcher.start().unwrap();
    let pid = watcher.pids()[0];

    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if std::fs::read_to_string(&out)
            .map(|s| s.contains("hello"))
            .unwrap_or(false)
        {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(std::fs::read_to_string(&out).unwrap().contains("hello"));

    let _ = waitpid(Pid::from_raw(pid as i32), Some(WaitPidFlag::WNOHANG));
}

#[test]
#[serial]
fn children_inherit_referenced_sockets() {
    let mut registry = SocketRegistry::new([corral_core::SocketCfg::inet("web", "127.0.0.1", 0)]);
    registry.bind_and_listen_all().unwrap();

    // The shell dup fails and exits immediately if the descriptor was
    // not inherited.
    let mut watcher_cfg = cfg("w", "exec 3<&corral.sockets.web && sleep 30", 1);
    watcher_cfg.use_sockets = true;

    let publisher = EventPublisher::new();
    let mut watcher = Watcher::new(watcher_cfg);
    watcher.initialize(publisher, &registry).unwrap();
    watcher.start().unwrap();
    let pid = watcher.pids()[0];

    std::thread::sleep(Duration::from_millis(300));
    assert!(pid_alive(pid), "child exited: socket fd was not inherited");

    watcher.stop();
}
