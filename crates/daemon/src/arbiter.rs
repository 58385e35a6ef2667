// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The arbiter: watcher table, process reaper, and lifecycle state.
//!
//! All mutable state sits behind one `parking_lot::Mutex` shared by the
//! controller tasks and the run loop. Public methods take the lock;
//! `*_locked` internals exist for callers that already hold it (the
//! reconciler), so no reentrant lock is needed.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tracing::{info, instrument, warn};

use corral_core::config::{socket_ref_token, ArbiterCfg, Config, PluginCfg, SocketCfg, WatcherCfg};
use corral_core::{ArbiterError, EventKind, ProcessExit};

use crate::evpub::EventPublisher;
use crate::sockets::SocketRegistry;
use crate::watcher::Watcher;

mod reconcile;

/// Shared handle to one watcher. Pointer identity is watcher identity.
pub type WatcherRef = Arc<Mutex<Watcher>>;

struct ArbiterState {
    /// Priority-sortable sequence of watchers.
    watchers: Vec<WatcherRef>,
    /// Lowercased name → watcher; consistent with `watchers` outside a
    /// critical section.
    watchers_names: HashMap<String, WatcherRef>,
    sockets: SocketRegistry,
    cfg: ArbiterCfg,
    config_file: Option<PathBuf>,
}

/// Supervisor for a fleet of watchers and their shared sockets.
pub struct Arbiter {
    state: Mutex<ArbiterState>,
    evpub: EventPublisher,
    /// Goes false exactly once, at stop. Once false, management is a no-op.
    alive: AtomicBool,
    pid: u32,
    proc_name: String,
}

impl Arbiter {
    /// Build an arbiter from a loaded config, materialising the stats,
    /// dashboard, and plugin watchers alongside the declared ones.
    pub fn from_config(config: &Config, config_file: Option<PathBuf>) -> Self {
        let (watcher_cfgs, socket_cfgs) = materialize(config);
        let watchers = watcher_cfgs
            .into_iter()
            .map(|cfg| Arc::new(Mutex::new(Watcher::new(cfg))))
            .collect();

        Arbiter {
            state: Mutex::new(ArbiterState {
                watchers,
                watchers_names: HashMap::new(),
                sockets: SocketRegistry::new(socket_cfgs),
                cfg: config.arbiter_cfg(),
                config_file,
            }),
            evpub: EventPublisher::new(),
            alive: AtomicBool::new(true),
            pid: std::process::id(),
            proc_name: config.proc_name.clone(),
        }
    }

    pub fn alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn proc_name(&self) -> &str {
        &self.proc_name
    }

    pub fn evpub(&self) -> &EventPublisher {
        &self.evpub
    }

    /// The arbiter-identity config currently applied.
    pub fn cfg(&self) -> ArbiterCfg {
        self.state.lock().cfg.clone()
    }

    pub fn config_file(&self) -> Option<PathBuf> {
        self.state.lock().config_file.clone()
    }

    pub fn check_delay(&self) -> Duration {
        self.state.lock().cfg.check_delay()
    }

    fn warmup_delay(&self) -> Duration {
        self.state.lock().cfg.warmup_delay()
    }

    /// Bind the sockets and wire every watcher, registering lowercased
    /// names, in decreasing priority order. Idempotent; called again
    /// after a socket reset to re-wire watchers.
    #[instrument(skip(self))]
    pub fn initialize(&self) -> Result<(), ArbiterError> {
        let mut state = self.state.lock();
        self.initialize_locked(&mut state)
    }

    fn initialize_locked(&self, state: &mut ArbiterState) -> Result<(), ArbiterError> {
        if !state.sockets.is_empty() {
            state.sockets.bind_and_listen_all()?;
            info!("sockets listening");
        }

        for watcher in Self::sorted(state, true) {
            let mut guard = watcher.lock();
            guard.initialize(self.evpub.clone(), &state.sockets)?;
            state
                .watchers_names
                .insert(guard.name().to_lowercase(), Arc::clone(&watcher));
        }
        Ok(())
    }

    /// Start every watcher in decreasing priority, sleeping
    /// `warmup_delay` between starts.
    #[instrument(skip(self))]
    pub async fn start_watchers(&self) -> Result<(), ArbiterError> {
        let warmup = self.warmup_delay();
        for watcher in self.iter_watchers(true) {
            watcher.lock().start()?;
            if !warmup.is_zero() {
                tokio::time::sleep(warmup).await;
            }
        }
        Ok(())
    }

    /// Stop every watcher in increasing priority. With `stop_alive`, the
    /// arbiter is marked dead first so racing ticks stop managing.
    /// No-op once the arbiter is dead.
    #[instrument(skip(self))]
    pub fn stop_watchers(&self, stop_alive: bool) {
        if !self.alive() {
            return;
        }
        if stop_alive {
            info!("arbiter exiting");
            self.alive.store(false, Ordering::SeqCst);
        }
        for watcher in self.iter_watchers(false) {
            watcher.lock().stop();
        }
    }

    /// Idempotent full stop: watchers down, sockets closed.
    pub fn stop(&self) {
        if self.alive() {
            self.stop_watchers(true);
        }
        let mut state = self.state.lock();
        state.sockets.close_all();
    }

    pub async fn restart(&self) -> Result<(), ArbiterError> {
        self.stop_watchers(false);
        self.start_watchers().await
    }

    /// Drain every completed child and route each exit to its watcher.
    pub fn reap_processes(&self) -> Result<(), ArbiterError> {
        let state = self.state.lock();
        Self::reap_locked(&state)
    }

    fn reap_locked(state: &ArbiterState) -> Result<(), ArbiterError> {
        let mut by_pid: HashMap<u32, WatcherRef> = HashMap::new();
        for watcher in &state.watchers {
            let guard = watcher.lock();
            if !guard.is_stopped() {
                for pid in guard.pids() {
                    by_pid.insert(pid, Arc::clone(watcher));
                }
            }
        }

        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                // No more children ready.
                Ok(WaitStatus::StillAlive) => break,
                Ok(WaitStatus::Exited(pid, code)) => {
                    Self::deliver_exit(&by_pid, pid, ProcessExit::exited(code));
                }
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    Self::deliver_exit(&by_pid, pid, ProcessExit::signaled(signal as i32));
                }
                // Stop/continue traces are not exits.
                Ok(_) => continue,
                // No children at all.
                Err(Errno::ECHILD) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => {
                    std::thread::sleep(Duration::from_millis(1));
                    continue;
                }
                Err(errno) => {
                    return Err(ArbiterError::Io(std::io::Error::from_raw_os_error(
                        errno as i32,
                    )))
                }
            }
        }
        Ok(())
    }

    fn deliver_exit(by_pid: &HashMap<u32, WatcherRef>, pid: Pid, exit: ProcessExit) {
        let pid = pid.as_raw() as u32;
        if let Some(watcher) = by_pid.get(&pid) {
            watcher.lock().reap_process(pid, exit);
        }
    }

    /// One management tick: reap, then let every watcher converge its
    /// fleet. No-op once the arbiter is dead.
    pub fn manage_watchers(&self) -> Result<(), ArbiterError> {
        if !self.alive() {
            return Ok(());
        }
        let state = self.state.lock();
        Self::reap_locked(&state)?;
        for watcher in Self::sorted(&state, true) {
            watcher.lock().manage_processes();
        }
        Ok(())
    }

    /// Run the prereload hook, reopen the log file, then reload every
    /// watcher in decreasing priority with `warmup_delay` between them.
    #[instrument(skip(self))]
    pub async fn reload(&self, graceful: bool) -> Result<(), ArbiterError> {
        let (prereload, warmup) = {
            let state = self.state.lock();
            (state.cfg.prereload_cmd.clone(), state.cfg.warmup_delay())
        };
        if let Some(cmd) = prereload {
            run_prereload(&cmd);
        }
        crate::log::reopen();

        for watcher in self.iter_watchers(true) {
            watcher.lock().reload(graceful)?;
            if !warmup.is_zero() {
                tokio::time::sleep(warmup).await;
            }
        }
        Ok(())
    }

    /// Register a watcher. It is constructed, initialised, and
    /// registered, but not started; the caller chooses when.
    pub fn add_watcher(&self, cfg: WatcherCfg) -> Result<WatcherRef, ArbiterError> {
        let mut state = self.state.lock();
        self.add_watcher_locked(&mut state, cfg)
    }

    fn add_watcher_locked(
        &self,
        state: &mut ArbiterState,
        cfg: WatcherCfg,
    ) -> Result<WatcherRef, ArbiterError> {
        if cfg.name.is_empty() {
            return Err(ArbiterError::Init("watcher name must not be empty".into()));
        }
        let key = cfg.name.to_lowercase();
        if state.watchers_names.contains_key(&key) {
            return Err(ArbiterError::AlreadyExists(cfg.name));
        }

        let name = cfg.name.clone();
        let watcher = Arc::new(Mutex::new(Watcher::new(cfg)));
        watcher
            .lock()
            .initialize(self.evpub.clone(), &state.sockets)?;
        state.watchers.push(Arc::clone(&watcher));
        state.watchers_names.insert(key, Arc::clone(&watcher));
        self.evpub.publish(&name, EventKind::Add);
        Ok(watcher)
    }

    /// Remove a watcher from both tables, then stop it. Removal comes
    /// first so a racing manage tick cannot respawn its children.
    pub fn rm_watcher(&self, name: &str) -> Result<(), ArbiterError> {
        let mut state = self.state.lock();
        self.rm_watcher_locked(&mut state, name)
    }

    fn rm_watcher_locked(&self, state: &mut ArbiterState, name: &str) -> Result<(), ArbiterError> {
        let key = name.to_lowercase();
        let watcher = state
            .watchers_names
            .remove(&key)
            .ok_or_else(|| ArbiterError::NotFound(name.to_string()))?;
        state.watchers.retain(|w| !Arc::ptr_eq(w, &watcher));

        let mut guard = watcher.lock();
        let registered_name = guard.name().to_string();
        guard.stop();
        self.evpub.publish(&registered_name, EventKind::Remove);
        Ok(())
    }

    /// Number of processes running across all watchers.
    pub fn numprocesses(&self) -> usize {
        let state = self.state.lock();
        state.watchers.iter().map(|w| w.lock().len()).sum()
    }

    pub fn numwatchers(&self) -> usize {
        self.state.lock().watchers.len()
    }

    pub fn statuses(&self) -> BTreeMap<String, String> {
        let state = self.state.lock();
        state
            .watchers
            .iter()
            .map(|w| {
                let guard = w.lock();
                (guard.name().to_string(), guard.status().to_string())
            })
            .collect()
    }

    /// Case-insensitive watcher lookup.
    pub fn get_watcher(&self, name: &str) -> Option<WatcherRef> {
        self.state
            .lock()
            .watchers_names
            .get(&name.to_lowercase())
            .cloned()
    }

    pub fn get_socket_cfg(&self, name: &str) -> Option<SocketCfg> {
        self.state.lock().sockets.get(name).map(|s| s.cfg().clone())
    }

    pub fn socket_names(&self) -> std::collections::HashSet<String> {
        self.state.lock().sockets.names()
    }

    /// Watchers in decreasing priority when `reverse` (start order),
    /// increasing otherwise (stop order). Ties keep insertion order.
    pub fn iter_watchers(&self, reverse: bool) -> Vec<WatcherRef> {
        let state = self.state.lock();
        Self::sorted(&state, reverse)
    }

    fn sorted(state: &ArbiterState, reverse: bool) -> Vec<WatcherRef> {
        let mut keyed: Vec<(i32, usize, WatcherRef)> = state
            .watchers
            .iter()
            .enumerate()
            .map(|(idx, w)| (w.lock().priority(), idx, Arc::clone(w)))
            .collect();
        if reverse {
            keyed.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        } else {
            keyed.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        }
        keyed.into_iter().map(|(_, _, w)| w).collect()
    }
}

fn run_prereload(cmd: &str) {
    info!(cmd, "running prereload hook");
    match std::process::Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .status()
    {
        Ok(status) if status.success() => {}
        Ok(status) => warn!(%status, "prereload hook failed"),
        Err(e) => warn!(error = %e, "prereload hook could not run"),
    }
}

/// Expand a config into the full watcher and socket sets: the declared
/// entries plus the stats collector, the dashboard, and one watcher per
/// plugin, with their command strings materialised.
pub(crate) fn materialize(config: &Config) -> (Vec<WatcherCfg>, Vec<SocketCfg>) {
    let mut watchers = config.watchers.clone();
    let mut sockets = config.sockets.clone();

    if let Some(stats_endpoint) = &config.stats_endpoint {
        let mut cmd = format!(
            "corral-stats --endpoint {} --pubsub {} --statspoint {}",
            config.endpoint.display(),
            config.pubsub_endpoint.display(),
            stats_endpoint.display(),
        );
        append_common_flags(&mut cmd, config);
        watchers.push(tool_watcher("corrald-stats", cmd));
    }

    if config.httpd {
        let mut cmd = format!(
            "corral-httpd --endpoint {} --fd {}",
            config.endpoint.display(),
            socket_ref_token("corral-httpd"),
        );
        append_common_flags(&mut cmd, config);
        let mut cfg = tool_watcher("corral-httpd", cmd);
        cfg.use_sockets = true;
        watchers.push(cfg);
        sockets.push(SocketCfg::inet(
            "corral-httpd",
            config.httpd_host.clone(),
            config.httpd_port,
        ));
    }

    for plugin in &config.plugins {
        watchers.push(plugin_watcher(config, plugin));
    }

    (watchers, sockets)
}

fn tool_watcher(name: impl Into<String>, cmd: String) -> WatcherCfg {
    let mut cfg = WatcherCfg::new(name, cmd);
    cfg.singleton = true;
    cfg.copy_env = true;
    cfg.copy_path = true;
    cfg
}

fn append_common_flags(cmd: &mut String, config: &Config) {
    if let Some(ssh) = &config.ssh_server {
        cmd.push_str(&format!(" --ssh {ssh}"));
    }
    if config.debug {
        cmd.push_str(" --log-level debug");
    }
}

fn plugin_watcher(config: &Config, plugin: &PluginCfg) -> WatcherCfg {
    let mut cmd = format!(
        "{} --endpoint {} --pubsub {} --check-delay {}",
        plugin.use_cmd,
        config.endpoint.display(),
        config.pubsub_endpoint.display(),
        config.check_delay,
    );
    append_common_flags(&mut cmd, config);
    for (key, value) in &plugin.options {
        cmd.push_str(&format!(" --config {key}={}", plugin_opt(value)));
    }

    let mut cfg = tool_watcher(format!("plugin:{}", plugin.name), cmd);
    cfg.priority = 1;
    cfg
}

fn plugin_opt(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
#[path = "arbiter_tests.rs"]
mod tests;
