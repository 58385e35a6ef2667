// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

use std::time::Duration;

use serial_test::serial;
use tempfile::tempdir;

use corral_core::Config;

fn arbiter_with(body: &str) -> Arc<Arbiter> {
    let text = format!(
        "[corral]\nendpoint = \"/tmp/corral-test-control.sock\"\n\
         pubsub_endpoint = \"/tmp/corral-test-events.sock\"\n\n{body}"
    );
    let config = Config::from_toml_str(&text).unwrap();
    let arbiter = Arc::new(Arbiter::from_config(&config, None));
    arbiter.initialize().unwrap();
    arbiter
}

fn assert_ok(reply: &Reply) {
    assert!(reply.is_ok(), "expected ok, got {reply:?}");
}

fn assert_error_containing(reply: &Reply, needle: &str) {
    match reply {
        Reply {
            status: protocol::Status::Error,
            reason: Some(reason),
            ..
        } => assert!(
            reason.contains(needle),
            "reason `{reason}` should mention `{needle}`"
        ),
        other => panic!("expected error reply, got {other:?}"),
    }
}

#[tokio::test]
async fn numwatchers_counts_registered_watchers() {
    let arbiter = arbiter_with("[watcher.a]\ncmd = \"sleep 30\"\n\n[watcher.b]\ncmd = \"sleep 30\"\n");
    let shutdown = Notify::new();

    let reply = dispatch(Request::NumWatchers, &arbiter, &shutdown).await;
    assert_eq!(
        reply,
        Reply::with(ReplyBody::NumWatchers { numwatchers: 2 })
    );
}

#[tokio::test]
async fn list_reports_names_in_start_order() {
    let arbiter = arbiter_with(
        "[watcher.back]\ncmd = \"sleep 30\"\npriority = 1\n\n\
         [watcher.front]\ncmd = \"sleep 30\"\npriority = 9\n",
    );
    let shutdown = Notify::new();

    let reply = dispatch(Request::List { name: None }, &arbiter, &shutdown).await;
    assert_eq!(
        reply,
        Reply::with(ReplyBody::Watchers {
            watchers: vec!["front".to_string(), "back".to_string()]
        })
    );
}

#[tokio::test]
async fn status_of_unknown_watcher_is_an_error_reply() {
    let arbiter = arbiter_with("");
    let shutdown = Notify::new();

    let reply = dispatch(
        Request::Status {
            name: Some("ghost".to_string()),
        },
        &arbiter,
        &shutdown,
    )
    .await;
    assert_error_containing(&reply, "ghost");
}

#[tokio::test]
async fn add_registers_without_starting_and_rejects_duplicates() {
    let arbiter = arbiter_with("");
    let shutdown = Notify::new();

    let reply = dispatch(
        Request::Add {
            name: "web".to_string(),
            cmd: "sleep 30".to_string(),
            options: AddOptions {
                numprocesses: Some(2),
                ..AddOptions::default()
            },
        },
        &arbiter,
        &shutdown,
    )
    .await;
    assert_ok(&reply);
    assert_eq!(arbiter.numwatchers(), 1);
    // Registered but not started.
    assert_eq!(arbiter.numprocesses(), 0);
    let status = dispatch(
        Request::Status {
            name: Some("web".to_string()),
        },
        &arbiter,
        &shutdown,
    )
    .await;
    assert_eq!(
        status,
        Reply::with(ReplyBody::WatcherStatus {
            state: "stopped".to_string()
        })
    );

    let reply = dispatch(
        Request::Add {
            name: "web".to_string(),
            cmd: "sleep 30".to_string(),
            options: AddOptions::default(),
        },
        &arbiter,
        &shutdown,
    )
    .await;
    assert_error_containing(&reply, "already exists");
    assert_eq!(arbiter.numwatchers(), 1);
}

#[tokio::test]
#[serial]
async fn start_stop_one_watcher_through_the_controller() {
    let arbiter = arbiter_with("[watcher.web]\ncmd = \"sleep 30\"\ngraceful_timeout = 2.0\n");
    let shutdown = Notify::new();

    let reply = dispatch(
        Request::Start {
            name: Some("web".to_string()),
        },
        &arbiter,
        &shutdown,
    )
    .await;
    assert_ok(&reply);
    assert_eq!(arbiter.numprocesses(), 1);

    let reply = dispatch(
        Request::NumProcesses {
            name: Some("web".to_string()),
        },
        &arbiter,
        &shutdown,
    )
    .await;
    assert_eq!(
        reply,
        Reply::with(ReplyBody::NumProcesses { numprocesses: 1 })
    );

    let reply = dispatch(
        Request::Stop {
            name: Some("web".to_string()),
        },
        &arbiter,
        &shutdown,
    )
    .await;
    assert_ok(&reply);
    assert_eq!(arbiter.numprocesses(), 0);
}

#[tokio::test]
#[serial]
async fn set_numprocesses_applies_immediately() {
    let arbiter = arbiter_with("[watcher.web]\ncmd = \"sleep 30\"\ngraceful_timeout = 2.0\n");
    let shutdown = Notify::new();
    dispatch(
        Request::Start {
            name: Some("web".to_string()),
        },
        &arbiter,
        &shutdown,
    )
    .await;

    let reply = dispatch(
        Request::Set {
            name: "web".to_string(),
            options: [("numprocesses".to_string(), serde_json::json!(3))]
                .into_iter()
                .collect(),
        },
        &arbiter,
        &shutdown,
    )
    .await;
    assert_ok(&reply);
    assert_eq!(arbiter.numprocesses(), 3);

    arbiter.stop();
}

#[tokio::test]
async fn set_rejects_unknown_or_malformed_options() {
    let arbiter = arbiter_with("[watcher.web]\ncmd = \"sleep 30\"\n");
    let shutdown = Notify::new();

    let reply = dispatch(
        Request::Set {
            name: "web".to_string(),
            options: [("cmd".to_string(), serde_json::json!("rm -rf /"))]
                .into_iter()
                .collect(),
        },
        &arbiter,
        &shutdown,
    )
    .await;
    assert_error_containing(&reply, "cannot be changed");

    let reply = dispatch(
        Request::Set {
            name: "web".to_string(),
            options: [("numprocesses".to_string(), serde_json::json!("many"))]
                .into_iter()
                .collect(),
        },
        &arbiter,
        &shutdown,
    )
    .await;
    assert_error_containing(&reply, "numprocesses");
}

#[tokio::test]
async fn get_returns_requested_options() {
    let arbiter = arbiter_with(
        "[watcher.web]\ncmd = \"sleep 30\"\nnumprocesses = 4\npriority = 2\n",
    );
    let shutdown = Notify::new();

    let reply = dispatch(
        Request::Get {
            name: "web".to_string(),
            keys: vec!["numprocesses".to_string(), "priority".to_string()],
        },
        &arbiter,
        &shutdown,
    )
    .await;
    match reply {
        Reply {
            body: ReplyBody::Options { options },
            ..
        } => {
            assert_eq!(options.get("numprocesses"), Some(&serde_json::json!(4)));
            assert_eq!(options.get("priority"), Some(&serde_json::json!(2)));
        }
        other => panic!("expected options reply, got {other:?}"),
    }

    let reply = dispatch(
        Request::Get {
            name: "web".to_string(),
            keys: vec!["shoe_size".to_string()],
        },
        &arbiter,
        &shutdown,
    )
    .await;
    assert_error_containing(&reply, "shoe_size");
}

#[tokio::test]
#[serial]
async fn stats_lists_pids_per_watcher() {
    let arbiter = arbiter_with("[watcher.web]\ncmd = \"sleep 30\"\ngraceful_timeout = 2.0\n");
    let shutdown = Notify::new();
    dispatch(
        Request::Start {
            name: Some("web".to_string()),
        },
        &arbiter,
        &shutdown,
    )
    .await;

    let reply = dispatch(Request::Stats { name: None }, &arbiter, &shutdown).await;
    match reply {
        Reply {
            body: ReplyBody::Stats { infos },
            ..
        } => {
            assert_eq!(infos.len(), 1);
            assert_eq!(infos.get("web").map(Vec::len), Some(1));
        }
        other => panic!("expected stats reply, got {other:?}"),
    }

    arbiter.stop();
}

#[tokio::test]
async fn quit_signals_shutdown() {
    let arbiter = arbiter_with("");
    let shutdown = Notify::new();

    let reply = dispatch(Request::Quit, &arbiter, &shutdown).await;
    assert_ok(&reply);

    // The permit is stored, so the waiter completes immediately.
    tokio::time::timeout(Duration::from_secs(1), shutdown.notified())
        .await
        .expect("shutdown was signalled");
}

#[tokio::test]
#[serial]
async fn reloadconfig_reconciles_against_the_stored_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("corral.toml");
    let header = "[corral]\nendpoint = \"/tmp/corral-test-control.sock\"\n\
                  pubsub_endpoint = \"/tmp/corral-test-events.sock\"\n\n";
    std::fs::write(
        &path,
        format!("{header}[watcher.one]\ncmd = \"sleep 30\"\ngraceful_timeout = 2.0\n"),
    )
    .unwrap();

    let config = Config::load(&path).unwrap();
    let arbiter = Arc::new(Arbiter::from_config(&config, Some(path.clone())));
    arbiter.initialize().unwrap();
    arbiter.start_watchers().await.unwrap();
    let shutdown = Notify::new();

    // Grow the file, then ask the controller to reconcile.
    std::fs::write(
        &path,
        format!(
            "{header}[watcher.one]\ncmd = \"sleep 30\"\ngraceful_timeout = 2.0\n\n\
             [watcher.two]\ncmd = \"sleep 30\"\ngraceful_timeout = 2.0\n"
        ),
    )
    .unwrap();

    let reply = dispatch(Request::ReloadConfig, &arbiter, &shutdown).await;
    assert_ok(&reply);
    assert_eq!(arbiter.numwatchers(), 2);

    arbiter.stop();
}
