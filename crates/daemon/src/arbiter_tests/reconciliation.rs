// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

use std::sync::Arc;

use serial_test::serial;
use tempfile::tempdir;

use corral_core::ArbiterError;

const RELOAD1: &str = r#"
[watcher.test1]
cmd = "sleep 30"
graceful_timeout = 2.0
"#;

const RELOAD2: &str = r#"
[watcher.test1]
cmd = "sleep 30"
graceful_timeout = 2.0

[watcher.test2]
cmd = "sleep 30"
graceful_timeout = 2.0
"#;

const RELOAD3: &str = RELOAD1;

const RELOAD4: &str = r#"
[watcher.test3]
cmd = "sleep 30"
graceful_timeout = 2.0
"#;

const RELOAD5: &str = r#"
[watcher.test3]
cmd = "sleep 30"
numprocesses = 2
graceful_timeout = 2.0
"#;

/// Socket fixture: watcher `w` inherits socket `s1`.
fn socket_config(port: u16) -> String {
    format!(
        "[socket.s1]\nhost = \"127.0.0.1\"\nport = {port}\n\n\
         [watcher.w]\ncmd = \"CORRAL_FD=corral.sockets.s1 exec sleep 30\"\n\
         use_sockets = true\ngraceful_timeout = 2.0\n"
    )
}

#[tokio::test]
#[serial]
async fn baseline_load_starts_the_declared_watchers() {
    let dir = tempdir().unwrap();
    let path = write_config(dir.path(), "reload1.toml", RELOAD1);
    let arbiter = started_arbiter(&path).await;

    assert_eq!(arbiter.numwatchers(), 1);
    assert_eq!(arbiter.numprocesses(), 1);

    arbiter.stop();
}

#[tokio::test]
#[serial]
async fn reconcile_adds_a_new_watcher_without_touching_the_old() {
    let dir = tempdir().unwrap();
    let path1 = write_config(dir.path(), "reload1.toml", RELOAD1);
    let path2 = write_config(dir.path(), "reload2.toml", RELOAD2);
    let arbiter = started_arbiter(&path1).await;

    let test1 = arbiter.get_watcher("test1").unwrap();
    let test1_pids = test1.lock().pids();

    arbiter.reload_from_config(Some(&path2)).await.unwrap();

    assert_eq!(arbiter.numwatchers(), 2);
    assert!(arbiter.get_watcher("test2").is_some());
    // test1 was neither replaced nor restarted.
    assert!(Arc::ptr_eq(&test1, &arbiter.get_watcher("test1").unwrap()));
    assert!(!test1.lock().is_stopped());
    assert_eq!(test1.lock().pids(), test1_pids);
    // The new watcher is running.
    assert!(!arbiter.get_watcher("test2").unwrap().lock().is_stopped());

    arbiter.stop();
}

#[tokio::test]
#[serial]
async fn reconcile_deletes_a_removed_watcher() {
    let dir = tempdir().unwrap();
    let path2 = write_config(dir.path(), "reload2.toml", RELOAD2);
    let path3 = write_config(dir.path(), "reload3.toml", RELOAD3);
    let arbiter = started_arbiter(&path2).await;
    assert_eq!(arbiter.numwatchers(), 2);

    let test1 = arbiter.get_watcher("test1").unwrap();
    let test2 = arbiter.get_watcher("test2").unwrap();

    arbiter.reload_from_config(Some(&path3)).await.unwrap();

    assert_eq!(arbiter.numwatchers(), 1);
    assert!(arbiter.get_watcher("test2").is_none());
    assert!(test2.lock().is_stopped());
    assert!(test2.lock().is_empty());
    // test1 untouched, identity preserved.
    assert!(Arc::ptr_eq(&test1, &arbiter.get_watcher("test1").unwrap()));
    assert!(!test1.lock().is_stopped());

    arbiter.stop();
}

#[tokio::test]
#[serial]
async fn numprocesses_only_change_preserves_the_watcher() {
    let dir = tempdir().unwrap();
    let path4 = write_config(dir.path(), "reload4.toml", RELOAD4);
    let path5 = write_config(dir.path(), "reload5.toml", RELOAD5);
    let arbiter = started_arbiter(&path4).await;
    assert_eq!(arbiter.numprocesses(), 1);

    let test3 = arbiter.get_watcher("test3").unwrap();
    let original_pid = test3.lock().pids()[0];

    arbiter.reload_from_config(Some(&path5)).await.unwrap();

    // Same watcher object, scaled in place; the original child survived.
    assert!(Arc::ptr_eq(&test3, &arbiter.get_watcher("test3").unwrap()));
    assert_eq!(test3.lock().numprocesses(), 2);
    assert_eq!(arbiter.numprocesses(), 2);
    assert!(test3.lock().pids().contains(&original_pid));

    arbiter.stop();
}

#[tokio::test]
#[serial]
async fn socket_change_cascades_to_referencing_watchers() {
    let dir = tempdir().unwrap();
    let port_a = free_port();
    // The kernel may hand the just-released port straight back.
    let port_b = loop {
        let port = free_port();
        if port != port_a {
            break port;
        }
    };
    let config_a = write_config(dir.path(), "a.toml", &socket_config(port_a));
    let config_b = write_config(dir.path(), "b.toml", &socket_config(port_b));
    let arbiter = started_arbiter(&config_a).await;

    let old_watcher = arbiter.get_watcher("w").unwrap();
    let old_pid = old_watcher.lock().pids()[0];
    assert_eq!(arbiter.get_socket_cfg("s1").unwrap().port, Some(port_a));

    arbiter.reload_from_config(Some(&config_b)).await.unwrap();

    // The socket was closed and re-bound on the new port.
    assert_eq!(arbiter.get_socket_cfg("s1").unwrap().port, Some(port_b));
    std::net::TcpStream::connect(("127.0.0.1", port_b)).expect("rebound socket is listening");

    // The watcher was stopped and re-started.
    let new_watcher = arbiter.get_watcher("w").unwrap();
    assert!(!Arc::ptr_eq(&old_watcher, &new_watcher));
    assert!(old_watcher.lock().is_stopped());
    assert!(!new_watcher.lock().is_stopped());
    let new_pid = new_watcher.lock().pids()[0];
    assert_ne!(new_pid, old_pid);

    arbiter.stop();
}

#[tokio::test]
#[serial]
async fn reload_orphaning_a_referenced_socket_is_refused() {
    let dir = tempdir().unwrap();
    let port = free_port();
    let config_a = write_config(dir.path(), "a.toml", &socket_config(port));
    // Same watcher, socket gone.
    let config_b = write_config(
        dir.path(),
        "b.toml",
        "[watcher.w]\ncmd = \"CORRAL_FD=corral.sockets.s1 exec sleep 30\"\n\
         use_sockets = true\ngraceful_timeout = 2.0\n",
    );
    let arbiter = started_arbiter(&config_a).await;
    let watcher = arbiter.get_watcher("w").unwrap();
    let pids = watcher.lock().pids();

    let err = arbiter
        .reload_from_config(Some(&config_b))
        .await
        .unwrap_err();
    assert!(matches!(err, ArbiterError::ConfigConflict(_)));

    // State remains as before the attempt.
    assert_eq!(arbiter.numwatchers(), 1);
    assert!(Arc::ptr_eq(&watcher, &arbiter.get_watcher("w").unwrap()));
    assert!(!watcher.lock().is_stopped());
    assert_eq!(watcher.lock().pids(), pids);
    assert_eq!(arbiter.get_socket_cfg("s1").unwrap().port, Some(port));
    std::net::TcpStream::connect(("127.0.0.1", port)).expect("socket still listening");

    arbiter.stop();
}

#[tokio::test]
#[serial]
async fn reconciling_the_same_file_twice_is_a_noop() {
    let dir = tempdir().unwrap();
    let path2 = write_config(dir.path(), "reload2.toml", RELOAD2);
    let arbiter = started_arbiter(&path2).await;

    arbiter.reload_from_config(Some(&path2)).await.unwrap();

    let test1 = arbiter.get_watcher("test1").unwrap();
    let test2 = arbiter.get_watcher("test2").unwrap();
    let pids1 = test1.lock().pids();
    let pids2 = test2.lock().pids();

    arbiter.reload_from_config(Some(&path2)).await.unwrap();

    assert_eq!(arbiter.numwatchers(), 2);
    assert!(Arc::ptr_eq(&test1, &arbiter.get_watcher("test1").unwrap()));
    assert!(Arc::ptr_eq(&test2, &arbiter.get_watcher("test2").unwrap()));
    assert_eq!(test1.lock().pids(), pids1);
    assert_eq!(test2.lock().pids(), pids2);

    arbiter.stop();
}

#[tokio::test]
#[serial]
async fn changed_arbiter_identity_forces_a_full_reload() {
    let dir = tempdir().unwrap();
    let path1 = write_config(dir.path(), "reload1.toml", RELOAD1);
    // Same watcher set, different arbiter identity.
    let changed = format!("check_delay = 7.5\n{RELOAD1}");
    let path_changed = dir.path().join("changed.toml");
    std::fs::write(
        &path_changed,
        format!(
            "[corral]\nendpoint = \"/tmp/corral-test-control.sock\"\n\
             pubsub_endpoint = \"/tmp/corral-test-events.sock\"\n{changed}"
        ),
    )
    .unwrap();

    let arbiter = started_arbiter(&path1).await;
    let old_watcher = arbiter.get_watcher("test1").unwrap();

    arbiter.reload_from_config(Some(&path_changed)).await.unwrap();

    assert_eq!(arbiter.cfg().check_delay, 7.5);
    // Rebuilt, not diffed: fresh watcher object, running again.
    let new_watcher = arbiter.get_watcher("test1").unwrap();
    assert!(!Arc::ptr_eq(&old_watcher, &new_watcher));
    assert!(old_watcher.lock().is_stopped());
    assert!(!new_watcher.lock().is_stopped());
    assert_eq!(arbiter.numprocesses(), 1);
    assert!(arbiter.alive());

    arbiter.stop();
}

#[tokio::test]
#[serial]
async fn watcher_cmd_change_replaces_the_watcher() {
    let dir = tempdir().unwrap();
    let path1 = write_config(dir.path(), "reload1.toml", RELOAD1);
    let changed = write_config(
        dir.path(),
        "changed.toml",
        "[watcher.test1]\ncmd = \"sleep 60\"\ngraceful_timeout = 2.0\n",
    );
    let arbiter = started_arbiter(&path1).await;
    let old_watcher = arbiter.get_watcher("test1").unwrap();

    arbiter.reload_from_config(Some(&changed)).await.unwrap();

    let new_watcher = arbiter.get_watcher("test1").unwrap();
    assert!(!Arc::ptr_eq(&old_watcher, &new_watcher));
    assert!(old_watcher.lock().is_stopped());
    assert_eq!(new_watcher.lock().cmd(), "sleep 60");
    assert!(!new_watcher.lock().is_stopped());
    assert_eq!(arbiter.numwatchers(), 1);

    arbiter.stop();
}

#[tokio::test]
async fn reload_without_a_stored_config_file_fails() {
    let config = corral_core::Config::from_toml_str(
        "[corral]\nendpoint = \"/tmp/c.sock\"\npubsub_endpoint = \"/tmp/e.sock\"\n",
    )
    .unwrap();
    let arbiter = crate::arbiter::Arbiter::from_config(&config, None);
    assert!(matches!(
        arbiter.reload_from_config(None).await,
        Err(ArbiterError::MissingConfigFile)
    ));
}
