// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

use std::sync::Arc;
use std::time::Duration;

use serial_test::serial;
use tempfile::tempdir;

use corral_core::config::WatcherCfg;
use corral_core::{ArbiterError, Config, EventKind};

use crate::arbiter::materialize;

const THREE_WATCHERS: &str = r#"
[watcher.low]
cmd = "sleep 30"
priority = 1
graceful_timeout = 2.0

[watcher.high]
cmd = "sleep 30"
priority = 5
graceful_timeout = 2.0

[watcher.Mid]
cmd = "sleep 30"
priority = 3
graceful_timeout = 2.0
"#;

#[test]
fn initialize_registers_lowercased_names() {
    let dir = tempdir().unwrap();
    let path = write_config(dir.path(), "corral.toml", THREE_WATCHERS);
    let arbiter = arbiter_from(&path);
    arbiter.initialize().unwrap();

    // Lookup is case-insensitive.
    assert!(arbiter.get_watcher("mid").is_some());
    assert!(arbiter.get_watcher("MID").is_some());
    assert!(arbiter.get_watcher("nope").is_none());

    // Every watcher in the table is reachable through the name map.
    for watcher in arbiter.iter_watchers(true) {
        let name = watcher.lock().name().to_string();
        let via_name = arbiter.get_watcher(&name).unwrap();
        assert!(Arc::ptr_eq(&watcher, &via_name));
    }
}

#[test]
fn iter_watchers_orders_by_priority() {
    let dir = tempdir().unwrap();
    let path = write_config(dir.path(), "corral.toml", THREE_WATCHERS);
    let arbiter = arbiter_from(&path);
    arbiter.initialize().unwrap();

    assert_eq!(watcher_names(&arbiter, true), ["high", "Mid", "low"]);
    assert_eq!(watcher_names(&arbiter, false), ["low", "Mid", "high"]);
}

#[tokio::test]
#[serial]
async fn start_emits_start_events_in_decreasing_priority() {
    let dir = tempdir().unwrap();
    let path = write_config(dir.path(), "corral.toml", THREE_WATCHERS);
    let arbiter = arbiter_from(&path);
    arbiter.initialize().unwrap();

    let mut rx = arbiter.evpub().subscribe();
    arbiter.start_watchers().await.unwrap();

    let mut start_order = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if event.kind == EventKind::Start {
            start_order.push(event.watcher);
        }
    }
    assert_eq!(start_order, ["high", "Mid", "low"]);

    arbiter.stop();
}

#[tokio::test]
#[serial]
async fn start_stop_start_yields_the_same_watcher_set() {
    let dir = tempdir().unwrap();
    let path = write_config(dir.path(), "corral.toml", THREE_WATCHERS);
    let arbiter = started_arbiter(&path).await;
    let names = watcher_names(&arbiter, true);
    assert_eq!(arbiter.numprocesses(), 3);

    arbiter.stop_watchers(false);
    assert_eq!(arbiter.numprocesses(), 0);
    assert!(arbiter.alive());

    arbiter.start_watchers().await.unwrap();
    assert_eq!(watcher_names(&arbiter, true), names);
    assert_eq!(arbiter.numprocesses(), 3);

    arbiter.stop();
}

#[tokio::test]
#[serial]
async fn stop_is_idempotent_and_kills_alive_once() {
    let dir = tempdir().unwrap();
    let path = write_config(dir.path(), "corral.toml", THREE_WATCHERS);
    let arbiter = started_arbiter(&path).await;

    arbiter.stop();
    assert!(!arbiter.alive());
    assert_eq!(arbiter.numprocesses(), 0);

    arbiter.stop();
    assert!(!arbiter.alive());
}

#[tokio::test]
#[serial]
async fn manage_watchers_is_a_noop_once_dead() {
    let dir = tempdir().unwrap();
    let path = write_config(dir.path(), "corral.toml", THREE_WATCHERS);
    let arbiter = started_arbiter(&path).await;

    arbiter.stop();
    arbiter.manage_watchers().unwrap();
    // No children respawned after death.
    assert_eq!(arbiter.numprocesses(), 0);
}

#[tokio::test]
#[serial]
async fn manage_watchers_respawns_a_killed_child() {
    let dir = tempdir().unwrap();
    let path = write_config(
        dir.path(),
        "corral.toml",
        "[watcher.solo]\ncmd = \"sleep 30\"\ngraceful_timeout = 2.0\n",
    );
    let arbiter = started_arbiter(&path).await;

    let watcher = arbiter.get_watcher("solo").unwrap();
    let old_pid = watcher.lock().pids()[0];
    let _ = nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(old_pid as i32),
        nix::sys::signal::Signal::SIGKILL,
    );

    // check_delay bounds respawn latency in the daemon; here we drive
    // the ticks ourselves.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        arbiter.manage_watchers().unwrap();
        let pids = watcher.lock().pids();
        if pids.len() == 1 && pids[0] != old_pid {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "child was never respawned"
        );
        std::thread::sleep(Duration::from_millis(20));
    }

    arbiter.stop();
}

#[test]
#[serial]
fn reap_processes_with_no_children_returns_cleanly() {
    let dir = tempdir().unwrap();
    let path = write_config(dir.path(), "corral.toml", "");
    let arbiter = arbiter_from(&path);
    arbiter.initialize().unwrap();
    // ECHILD path: no children at all.
    arbiter.reap_processes().unwrap();
}

#[test]
fn add_watcher_registers_without_starting() {
    let dir = tempdir().unwrap();
    let path = write_config(dir.path(), "corral.toml", "");
    let arbiter = arbiter_from(&path);
    arbiter.initialize().unwrap();
    assert_eq!(arbiter.numwatchers(), 0);

    let watcher = arbiter
        .add_watcher(WatcherCfg::new("fresh", "sleep 30"))
        .unwrap();
    assert_eq!(arbiter.numwatchers(), 1);
    assert!(watcher.lock().is_stopped());
    assert_eq!(arbiter.numprocesses(), 0);
}

#[test]
fn add_watcher_with_taken_name_fails_without_mutation() {
    let dir = tempdir().unwrap();
    let path = write_config(dir.path(), "corral.toml", "[watcher.web]\ncmd = \"sleep 30\"\n");
    let arbiter = arbiter_from(&path);
    arbiter.initialize().unwrap();
    let before = watcher_names(&arbiter, true);

    // Case-insensitive collision.
    let err = arbiter
        .add_watcher(WatcherCfg::new("WEB", "sleep 30"))
        .unwrap_err();
    assert!(matches!(err, ArbiterError::AlreadyExists(name) if name == "WEB"));
    assert_eq!(watcher_names(&arbiter, true), before);
    assert!(arbiter.get_watcher("WEB").is_some());
}

#[tokio::test]
#[serial]
async fn add_then_rm_restores_numwatchers() {
    let dir = tempdir().unwrap();
    let path = write_config(dir.path(), "corral.toml", "[watcher.web]\ncmd = \"sleep 30\"\n");
    let arbiter = arbiter_from(&path);
    arbiter.initialize().unwrap();
    let before = arbiter.numwatchers();

    let mut cfg = WatcherCfg::new("Extra", "sleep 30");
    cfg.graceful_timeout = 2.0;
    let watcher = arbiter.add_watcher(cfg).unwrap();
    watcher.lock().start().unwrap();
    assert_eq!(arbiter.numwatchers(), before + 1);

    // Lowercased on both insert and remove.
    arbiter.rm_watcher("extra").unwrap();
    assert_eq!(arbiter.numwatchers(), before);
    assert!(arbiter.get_watcher("extra").is_none());
    assert!(watcher.lock().is_stopped());
}

#[test]
fn rm_unknown_watcher_reports_not_found() {
    let dir = tempdir().unwrap();
    let path = write_config(dir.path(), "corral.toml", "");
    let arbiter = arbiter_from(&path);
    assert!(matches!(
        arbiter.rm_watcher("ghost"),
        Err(ArbiterError::NotFound(name)) if name == "ghost"
    ));
}

#[tokio::test]
#[serial]
async fn statuses_reports_every_watcher() {
    let dir = tempdir().unwrap();
    let path = write_config(dir.path(), "corral.toml", THREE_WATCHERS);
    let arbiter = started_arbiter(&path).await;

    let statuses = arbiter.statuses();
    assert_eq!(statuses.len(), 3);
    assert!(statuses.values().all(|s| s == "active"));

    arbiter.get_watcher("low").unwrap().lock().stop();
    let statuses = arbiter.statuses();
    assert_eq!(statuses.get("low").map(String::as_str), Some("stopped"));
    assert_eq!(statuses.get("high").map(String::as_str), Some("active"));

    arbiter.stop();
}

#[test]
fn materialize_adds_tool_watchers() {
    let text = r#"
[corral]
endpoint = "/tmp/c.sock"
pubsub_endpoint = "/tmp/e.sock"
stats_endpoint = "/tmp/s.sock"
httpd = true
httpd_port = 9999

[plugin.flapping]
use = "corral-flapping"
window = 10

[watcher.web]
cmd = "sleep 30"
"#;
    let config = Config::from_toml_str(text).unwrap();
    let (watchers, sockets) = materialize(&config);

    let names: Vec<&str> = watchers.iter().map(|w| w.name.as_str()).collect();
    assert_eq!(
        names,
        ["web", "corrald-stats", "corral-httpd", "plugin:flapping"]
    );

    let stats = watchers.iter().find(|w| w.name == "corrald-stats").unwrap();
    assert!(stats.singleton);
    assert!(stats.cmd.contains("--statspoint /tmp/s.sock"));

    let httpd = watchers.iter().find(|w| w.name == "corral-httpd").unwrap();
    assert!(httpd.use_sockets);
    assert!(httpd.cmd.contains("corral.sockets.corral-httpd"));
    assert!(sockets.iter().any(|s| s.name == "corral-httpd" && s.port == Some(9999)));

    let plugin = watchers.iter().find(|w| w.name == "plugin:flapping").unwrap();
    assert_eq!(plugin.priority, 1);
    assert!(plugin.cmd.starts_with("corral-flapping "));
    assert!(plugin.cmd.contains("--config window=10"));
}
