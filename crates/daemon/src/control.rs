// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Control-plane listener.
//!
//! Accepts connections on the control endpoint, reads one request per
//! connection, dispatches it onto the arbiter, and writes the reply.
//! Errors become `{"status": "error"}` replies; the arbiter keeps
//! running. No handler holds the arbiter for longer than one watcher
//! operation.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde_json::json;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use corral_core::config::WatcherCfg;
use corral_core::ArbiterError;

use crate::arbiter::Arbiter;
use crate::protocol::{self, AddOptions, Reply, ReplyBody, Request, WireError, IPC_TIMEOUT};
use crate::watcher::Watcher;

/// Listener task for the control endpoint.
pub struct Controller {
    socket: UnixListener,
    arbiter: Arc<Arbiter>,
    shutdown: Arc<Notify>,
}

impl Controller {
    /// Bind the control socket, replacing any stale file at the path.
    pub fn bind(
        path: &Path,
        arbiter: Arc<Arbiter>,
        shutdown: Arc<Notify>,
    ) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let socket = UnixListener::bind(path)?;
        Ok(Controller {
            socket,
            arbiter,
            shutdown,
        })
    }

    /// Accept loop; each connection is served on its own task.
    pub async fn run(self) {
        loop {
            match self.socket.accept().await {
                Ok((stream, _)) => {
                    let arbiter = Arc::clone(&self.arbiter);
                    let shutdown = Arc::clone(&self.shutdown);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, &arbiter, &shutdown).await {
                            match e {
                                WireError::Closed => debug!("client disconnected"),
                                WireError::Deadline(_) => warn!("client connection timed out"),
                                _ => error!("connection error: {}", e),
                            }
                        }
                    });
                }
                Err(e) => {
                    error!("accept error: {}", e);
                }
            }
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    arbiter: &Arbiter,
    shutdown: &Notify,
) -> Result<(), WireError> {
    let (mut reader, mut writer) = stream.into_split();

    let reply = match protocol::recv_timed::<_, Request>(&mut reader, IPC_TIMEOUT).await {
        Ok(request) => {
            info!(request = ?request, "received command");
            dispatch(request, arbiter, shutdown).await
        }
        Err(WireError::Malformed(e)) => Reply::error(format!("malformed request: {e}")),
        Err(e) => return Err(e),
    };

    debug!(reply = ?reply, "sending reply");
    protocol::send_timed(&mut writer, &reply, IPC_TIMEOUT).await
}

/// Execute one command against the arbiter.
pub async fn dispatch(request: Request, arbiter: &Arbiter, shutdown: &Notify) -> Reply {
    match request {
        Request::ReloadConfig => reply_from(arbiter.reload_from_config(None).await),

        Request::Add { name, cmd, options } => {
            match arbiter.add_watcher(watcher_cfg_from(name, cmd, options)) {
                Ok(_) => Reply::ok(),
                Err(e) => e.into(),
            }
        }

        Request::Rm { name } => reply_from(arbiter.rm_watcher(&name)),

        Request::Start { name: Some(name) } => {
            with_watcher(arbiter, &name, |w| reply_from(w.start()))
        }
        Request::Start { name: None } => reply_from(arbiter.start_watchers().await),

        Request::Stop { name: Some(name) } => with_watcher(arbiter, &name, |w| {
            w.stop();
            Reply::ok()
        }),
        Request::Stop { name: None } => {
            arbiter.stop_watchers(false);
            Reply::ok()
        }

        Request::Restart { name: Some(name) } => with_watcher(arbiter, &name, |w| {
            w.stop();
            reply_from(w.start())
        }),
        Request::Restart { name: None } => reply_from(arbiter.restart().await),

        Request::Reload {
            name: Some(name),
            graceful,
        } => with_watcher(arbiter, &name, |w| reply_from(w.reload(graceful))),
        Request::Reload {
            name: None,
            graceful,
        } => reply_from(arbiter.reload(graceful).await),

        Request::Status { name: Some(name) } => with_watcher(arbiter, &name, |w| {
            Reply::with(ReplyBody::WatcherStatus {
                state: w.status().to_string(),
            })
        }),
        Request::Status { name: None } => Reply::with(ReplyBody::Statuses {
            statuses: arbiter.statuses(),
        }),

        Request::List { name: Some(name) } => {
            with_watcher(arbiter, &name, |w| Reply::with(ReplyBody::Pids { pids: sorted_pids(w) }))
        }
        Request::List { name: None } => {
            let watchers = arbiter
                .iter_watchers(true)
                .iter()
                .map(|w| w.lock().name().to_string())
                .collect();
            Reply::with(ReplyBody::Watchers { watchers })
        }

        Request::NumWatchers => Reply::with(ReplyBody::NumWatchers {
            numwatchers: arbiter.numwatchers(),
        }),

        Request::NumProcesses { name: Some(name) } => with_watcher(arbiter, &name, |w| {
            Reply::with(ReplyBody::NumProcesses {
                numprocesses: w.len(),
            })
        }),
        Request::NumProcesses { name: None } => Reply::with(ReplyBody::NumProcesses {
            numprocesses: arbiter.numprocesses(),
        }),

        Request::Get { name, keys } => with_watcher(arbiter, &name, |w| get_options(w, &keys)),

        Request::Set { name, options } => with_watcher(arbiter, &name, |w| set_options(w, options)),

        Request::Stats { name: Some(name) } => with_watcher(arbiter, &name, |w| {
            let mut infos = BTreeMap::new();
            infos.insert(w.name().to_string(), sorted_pids(w));
            Reply::with(ReplyBody::Stats { infos })
        }),
        Request::Stats { name: None } => {
            let infos = arbiter
                .iter_watchers(true)
                .iter()
                .map(|w| {
                    let guard = w.lock();
                    (guard.name().to_string(), {
                        let mut pids = guard.pids();
                        pids.sort_unstable();
                        pids
                    })
                })
                .collect();
            Reply::with(ReplyBody::Stats { infos })
        }

        Request::Quit => {
            shutdown.notify_one();
            Reply::ok()
        }
    }
}

fn reply_from(result: Result<(), ArbiterError>) -> Reply {
    match result {
        Ok(()) => Reply::ok(),
        Err(e) => e.into(),
    }
}

fn with_watcher(arbiter: &Arbiter, name: &str, f: impl FnOnce(&mut Watcher) -> Reply) -> Reply {
    match arbiter.get_watcher(name) {
        Some(watcher) => f(&mut watcher.lock()),
        None => ArbiterError::NotFound(name.to_string()).into(),
    }
}

fn sorted_pids(watcher: &Watcher) -> Vec<u32> {
    let mut pids = watcher.pids();
    pids.sort_unstable();
    pids
}

fn watcher_cfg_from(name: String, cmd: String, options: AddOptions) -> WatcherCfg {
    let mut cfg = WatcherCfg::new(name, cmd);
    if let Some(numprocesses) = options.numprocesses {
        cfg.numprocesses = numprocesses;
    }
    if let Some(priority) = options.priority {
        cfg.priority = priority;
    }
    if let Some(singleton) = options.singleton {
        cfg.singleton = singleton;
    }
    if let Some(use_sockets) = options.use_sockets {
        cfg.use_sockets = use_sockets;
    }
    if let Some(copy_env) = options.copy_env {
        cfg.copy_env = copy_env;
    }
    if let Some(copy_path) = options.copy_path {
        cfg.copy_path = copy_path;
    }
    cfg.working_dir = options.working_dir;
    cfg.env = options.env;
    if let Some(graceful_timeout) = options.graceful_timeout {
        cfg.graceful_timeout = graceful_timeout;
    }
    if cfg.singleton {
        cfg.numprocesses = 1;
    }
    cfg
}

fn get_options(watcher: &Watcher, keys: &[String]) -> Reply {
    let cfg = watcher.cfg();
    let mut options = BTreeMap::new();
    for key in keys {
        let value = match key.as_str() {
            "cmd" => json!(cfg.cmd),
            "numprocesses" => json!(cfg.numprocesses),
            "priority" => json!(cfg.priority),
            "singleton" => json!(cfg.singleton),
            "use_sockets" => json!(cfg.use_sockets),
            "copy_env" => json!(cfg.copy_env),
            "copy_path" => json!(cfg.copy_path),
            "working_dir" => json!(cfg.working_dir),
            "graceful_timeout" => json!(cfg.graceful_timeout),
            _ => return Reply::error(format!("unknown option `{key}`")),
        };
        options.insert(key.clone(), value);
    }
    Reply::with(ReplyBody::Options { options })
}

fn set_options(watcher: &mut Watcher, options: BTreeMap<String, serde_json::Value>) -> Reply {
    for (key, value) in options {
        match key.as_str() {
            "numprocesses" => match value.as_u64() {
                Some(count) => {
                    watcher.set_numprocesses(count as usize);
                    watcher.manage_processes();
                }
                None => return Reply::error("numprocesses must be a non-negative integer"),
            },
            _ => return Reply::error(format!("option `{key}` cannot be changed at runtime")),
        }
    }
    Reply::ok()
}

#[cfg(test)]
#[path = "control_tests.rs"]
mod tests;
