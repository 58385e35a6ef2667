// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

use std::path::Path;

#[path = "arbiter_tests/lifecycle.rs"]
mod lifecycle;
#[path = "arbiter_tests/reconciliation.rs"]
mod reconciliation;

/// `[corral]` header shared by every fixture. The endpoints are only
/// bound by the run loop, so placeholder paths are fine here.
fn corral_header() -> String {
    "[corral]\nendpoint = \"/tmp/corral-test-control.sock\"\n\
     pubsub_endpoint = \"/tmp/corral-test-events.sock\"\n\n"
        .to_string()
}

fn write_config(dir: &Path, file: &str, body: &str) -> PathBuf {
    let path = dir.join(file);
    std::fs::write(&path, format!("{}{}", corral_header(), body)).unwrap();
    path
}

/// Load a fixture and build an uninitialized arbiter from it.
fn arbiter_from(path: &Path) -> Arc<Arbiter> {
    let config = Config::load(path).unwrap();
    Arc::new(Arbiter::from_config(&config, Some(path.to_path_buf())))
}

/// Load, initialize, and start: the state a running daemon would be in.
async fn started_arbiter(path: &Path) -> Arc<Arbiter> {
    let arbiter = arbiter_from(path);
    arbiter.initialize().unwrap();
    arbiter.start_watchers().await.unwrap();
    arbiter
}

fn watcher_names(arbiter: &Arbiter, reverse: bool) -> Vec<String> {
    arbiter
        .iter_watchers(reverse)
        .iter()
        .map(|w| w.lock().name().to_string())
        .collect()
}

/// Pick ports the kernel considers free right now.
fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}
