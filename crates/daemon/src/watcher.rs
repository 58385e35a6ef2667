// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-group child process lifecycle.
//!
//! A watcher owns the children of one named group: it spawns them from a
//! single command template, keeps the fleet at `numprocesses`, and walks
//! them through graceful shutdown with SIGKILL escalation. Reaping of
//! children that die on their own happens in the arbiter's wait loop,
//! which routes each exit back through [`Watcher::reap_process`].

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use corral_core::config::{socket_ref_token, WatcherCfg, SOCKET_REF_PREFIX};
use corral_core::{ArbiterError, EventKind, ProcessExit};

use crate::evpub::EventPublisher;
use crate::sockets::SocketRegistry;

/// Poll interval while waiting out a graceful shutdown.
const SHUTDOWN_POLL: Duration = Duration::from_millis(20);

/// How long to wait for a SIGKILLed child before abandoning it.
const KILL_GRACE: Duration = Duration::from_secs(1);

/// One OS child belonging to exactly one watcher.
#[derive(Debug, Clone, Copy)]
pub struct Process {
    pub pid: u32,
    pub started_at: Instant,
}

/// Watcher state as reported to the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherStatus {
    Active,
    Stopped,
}

impl std::fmt::Display for WatcherStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatcherStatus::Active => write!(f, "active"),
            WatcherStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// A named group of interchangeable child processes.
#[derive(Debug)]
pub struct Watcher {
    cfg: WatcherCfg,
    stopped: bool,
    processes: HashMap<u32, Process>,
    /// Command with socket markers resolved to descriptor numbers.
    substituted_cmd: Option<String>,
    evpub: Option<EventPublisher>,
}

impl Watcher {
    pub fn new(cfg: WatcherCfg) -> Self {
        Watcher {
            cfg,
            stopped: true,
            processes: HashMap::new(),
            substituted_cmd: None,
            evpub: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.cfg.name
    }

    /// The raw command template, markers included.
    pub fn cmd(&self) -> &str {
        &self.cfg.cmd
    }

    pub fn priority(&self) -> i32 {
        self.cfg.priority
    }

    pub fn numprocesses(&self) -> usize {
        self.cfg.numprocesses
    }

    pub fn singleton(&self) -> bool {
        self.cfg.singleton
    }

    pub fn cfg(&self) -> &WatcherCfg {
        &self.cfg
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn status(&self) -> WatcherStatus {
        if self.stopped {
            WatcherStatus::Stopped
        } else {
            WatcherStatus::Active
        }
    }

    pub fn pids(&self) -> Vec<u32> {
        self.processes.keys().copied().collect()
    }

    /// Number of live children.
    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    /// Wire the event publisher and resolve socket markers in the command.
    ///
    /// Called before the first `start` and again whenever the socket set
    /// changes; idempotent. Fails if the command references a socket that
    /// is not registered and listening.
    pub fn initialize(
        &mut self,
        evpub: EventPublisher,
        sockets: &SocketRegistry,
    ) -> Result<(), ArbiterError> {
        self.evpub = Some(evpub);

        let mut cmd = self.cfg.cmd.clone();
        if self.cfg.use_sockets {
            for socket in sockets.iter() {
                if let Some(fd) = socket.fd() {
                    cmd = cmd.replace(&socket_ref_token(socket.name()), &fd.to_string());
                }
            }
        }
        if cmd.contains(SOCKET_REF_PREFIX) {
            return Err(ArbiterError::Init(format!(
                "watcher `{}` references a socket that is not listening (cmd: {cmd})",
                self.cfg.name
            )));
        }
        self.substituted_cmd = Some(cmd);
        Ok(())
    }

    /// Spawn up to `numprocesses` children.
    pub fn start(&mut self) -> Result<(), ArbiterError> {
        if !self.stopped {
            return Ok(());
        }
        self.stopped = false;
        info!(watcher = %self.cfg.name, "starting");
        self.publish(EventKind::Start);

        while self.processes.len() < self.cfg.target_processes() {
            self.spawn_process()?;
        }
        Ok(())
    }

    /// Graceful shutdown of every child; bounded even when children
    /// ignore signals. Idempotent.
    pub fn stop(&mut self) {
        if self.stopped && self.processes.is_empty() {
            return;
        }
        self.stopped = true;
        info!(watcher = %self.cfg.name, "stopping");

        let pids = self.pids();
        self.shutdown_pids(&pids);
        self.publish(EventKind::Stop);
    }

    /// Replace the fleet.
    ///
    /// Graceful: start replacements first, then retire the old children.
    /// Otherwise equivalent to `stop` followed by `start`.
    pub fn reload(&mut self, graceful: bool) -> Result<(), ArbiterError> {
        if self.stopped {
            return Ok(());
        }
        info!(watcher = %self.cfg.name, graceful, "reloading");

        if graceful {
            let old = self.pids();
            for _ in 0..self.cfg.target_processes() {
                self.spawn_process()?;
            }
            self.shutdown_pids(&old);
        } else {
            self.stop();
            self.start()?;
        }
        self.publish(EventKind::Reload);
        Ok(())
    }

    /// Reconcile the actual child count to `numprocesses`.
    ///
    /// Respawns dead children and retires the oldest extras; the reap
    /// loop collects the retired pids.
    pub fn manage_processes(&mut self) {
        if self.stopped {
            return;
        }

        let target = self.cfg.target_processes();
        while self.processes.len() < target {
            match self.spawn_process() {
                Ok(_) => {}
                Err(e) => {
                    warn!(watcher = %self.cfg.name, error = %e, "failed to respawn child");
                    break;
                }
            }
        }

        let extra = self.processes.len().saturating_sub(target);
        if extra > 0 {
            let mut by_age: Vec<(Instant, u32)> = self
                .processes
                .values()
                .map(|p| (p.started_at, p.pid))
                .collect();
            by_age.sort();
            for (_, pid) in by_age.into_iter().take(extra) {
                debug!(watcher = %self.cfg.name, pid, "retiring extra child");
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
        }
    }

    /// Record that a child exited with the given status.
    pub fn reap_process(&mut self, pid: u32, exit: ProcessExit) {
        if self.processes.remove(&pid).is_some() {
            debug!(watcher = %self.cfg.name, pid, ?exit, "child exited");
            self.publish(exit.into_event(pid));
        }
    }

    /// Change the target count without disturbing running children; the
    /// next `manage_processes` converges. Singletons stay pinned at 1.
    pub fn set_numprocesses(&mut self, count: usize) -> usize {
        if !self.cfg.singleton {
            self.cfg.numprocesses = count;
        }
        self.cfg.numprocesses
    }

    fn publish(&self, kind: EventKind) {
        if let Some(evpub) = &self.evpub {
            evpub.publish(&self.cfg.name, kind);
        }
    }

    fn spawn_process(&mut self) -> Result<u32, ArbiterError> {
        let cmd = self.substituted_cmd.clone().ok_or_else(|| {
            ArbiterError::Init(format!("watcher `{}` is not initialized", self.cfg.name))
        })?;

        let mut command = Command::new("/bin/sh");
        command.arg("-c").arg(&cmd);
        if !self.cfg.copy_env {
            command.env_clear();
            if self.cfg.copy_path {
                if let Ok(path) = std::env::var("PATH") {
                    command.env("PATH", path);
                }
            }
        }
        command.envs(&self.cfg.env);
        if let Some(dir) = &self.cfg.working_dir {
            command.current_dir(dir);
        }
        command.stdin(Stdio::null());
        command.stdout(stream_target(&self.cfg.stdout_stream)?);
        command.stderr(stream_target(&self.cfg.stderr_stream)?);

        let child = command.spawn().map_err(ArbiterError::Io)?;
        let pid = child.id();
        // The handle is dropped without waiting; the arbiter's wait loop
        // owns reaping.
        drop(child);

        self.processes.insert(
            pid,
            Process {
                pid,
                started_at: Instant::now(),
            },
        );
        debug!(watcher = %self.cfg.name, pid, "spawned child");
        self.publish(EventKind::Spawn { pid });
        Ok(pid)
    }

    /// SIGTERM the given pids, wait out the grace period, SIGKILL the
    /// survivors, and reap everything that died.
    fn shutdown_pids(&mut self, pids: &[u32]) {
        if pids.is_empty() {
            return;
        }
        for pid in pids {
            let _ = kill(Pid::from_raw(*pid as i32), Signal::SIGTERM);
        }

        let mut remaining: Vec<u32> = pids.to_vec();
        let deadline = Instant::now() + self.cfg.graceful_timeout();
        loop {
            remaining.retain(|pid| !self.try_reap(*pid));
            if remaining.is_empty() {
                return;
            }
            if Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(SHUTDOWN_POLL);
        }

        warn!(
            watcher = %self.cfg.name,
            pids = ?remaining,
            "children ignored SIGTERM, escalating to SIGKILL"
        );
        for pid in &remaining {
            let _ = kill(Pid::from_raw(*pid as i32), Signal::SIGKILL);
        }
        let deadline = Instant::now() + KILL_GRACE;
        loop {
            remaining.retain(|pid| !self.try_reap(*pid));
            if remaining.is_empty() || Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(SHUTDOWN_POLL);
        }

        // Whatever survived SIGKILL is stuck in the kernel; forget it so
        // stop stays bounded.
        for pid in remaining {
            if self.processes.remove(&pid).is_some() {
                warn!(watcher = %self.cfg.name, pid, "abandoning unkillable child");
            }
        }
    }

    /// Non-blocking reap of one of our own pids. Returns true once the
    /// pid is gone from the process table.
    fn try_reap(&mut self, pid: u32) -> bool {
        match waitpid(Pid::from_raw(pid as i32), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => {
                self.reap_process(pid, ProcessExit::exited(code));
                true
            }
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                self.reap_process(pid, ProcessExit::signaled(signal as i32));
                true
            }
            Ok(_) => false,
            Err(Errno::ECHILD) => {
                // Someone else already reaped it; just drop the record.
                self.processes.remove(&pid);
                true
            }
            Err(_) => false,
        }
    }
}

fn stream_target(path: &Option<PathBuf>) -> Result<Stdio, ArbiterError> {
    match path {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(ArbiterError::Io)?;
            Ok(Stdio::from(file))
        }
        None => Ok(Stdio::null()),
    }
}

#[cfg(test)]
#[path = "watcher_tests.rs"]
mod tests;
