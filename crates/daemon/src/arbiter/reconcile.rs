// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Convergence of running state toward a new configuration file.
//!
//! The diff runs in phases with a fail-fast orphan check up front:
//! sockets are fully converged before any watcher mutation, so a new or
//! restarted watcher always sees the final socket set.

use std::collections::HashSet;
use std::path::Path;

use super::*;
use crate::sockets::Socket;

impl Arbiter {
    /// Re-converge against `path`, defaulting to the file the arbiter
    /// was loaded from.
    ///
    /// A changed arbiter identity falls back to a full reload; anything
    /// else is applied as a socket/watcher diff under one lock hold.
    #[instrument(skip(self))]
    pub async fn reload_from_config(&self, path: Option<&Path>) -> Result<(), ArbiterError> {
        let config_file = match path {
            Some(path) => path.to_path_buf(),
            None => self.config_file().ok_or(ArbiterError::MissingConfigFile)?,
        };
        let config = Config::load(&config_file)?;

        if config.arbiter_cfg() != self.cfg() {
            info!("arbiter configuration changed, falling back to full reload");
            return self.full_reload(config, config_file).await;
        }

        let mut state = self.state.lock();
        self.reconcile_locked(&mut state, &config)?;
        state.config_file = Some(config_file);
        Ok(())
    }

    /// Tear everything down and rebuild from the new config, keeping the
    /// arbiter alive throughout.
    async fn full_reload(&self, config: Config, config_file: PathBuf) -> Result<(), ArbiterError> {
        {
            let mut state = self.state.lock();

            let endpoints_moved = state.cfg.endpoint != config.endpoint
                || state.cfg.pubsub_endpoint != config.pubsub_endpoint;
            if endpoints_moved {
                warn!("control/event endpoints changed; new addresses take effect on the next restart");
            }

            for watcher in Self::sorted(&state, false) {
                watcher.lock().stop();
            }
            state.sockets.close_all();

            let (watcher_cfgs, socket_cfgs) = materialize(&config);
            state.watchers = watcher_cfgs
                .into_iter()
                .map(|cfg| Arc::new(Mutex::new(Watcher::new(cfg))))
                .collect();
            state.watchers_names.clear();
            state.sockets = SocketRegistry::new(socket_cfgs);
            state.cfg = config.arbiter_cfg();
            state.config_file = Some(config_file);

            self.initialize_locked(&mut state)?;
        }
        self.start_watchers().await
    }

    fn reconcile_locked(
        &self,
        state: &mut ArbiterState,
        config: &Config,
    ) -> Result<(), ArbiterError> {
        let (new_watchers, new_sockets) = materialize(config);

        // Socket diff, computed before anything is touched.
        let current_sockets = state.sockets.names();
        let new_socket_names: HashSet<String> =
            new_sockets.iter().map(|s| s.name.clone()).collect();

        let mut added_sockets: HashSet<String> = new_socket_names
            .difference(&current_sockets)
            .cloned()
            .collect();
        let mut deleted_sockets: HashSet<String> = current_sockets
            .difference(&new_socket_names)
            .cloned()
            .collect();

        // A changed socket is a delete + add, and the watchers using it
        // restart so they pick up the fresh descriptor.
        let mut watchers_with_changed_socket: HashSet<String> = HashSet::new();
        for name in current_sockets.intersection(&new_socket_names) {
            let running = match state.sockets.get(name) {
                Some(socket) => socket.cfg().clone(),
                None => continue,
            };
            let next = match new_sockets.iter().find(|s| &s.name == name) {
                Some(cfg) => cfg,
                None => continue,
            };
            if &running != next {
                deleted_sockets.insert(name.clone());
                added_sockets.insert(name.clone());
                for watcher in &state.watchers {
                    let guard = watcher.lock();
                    if guard.cmd().contains(&socket_ref_token(name)) {
                        watchers_with_changed_socket.insert(guard.name().to_string());
                    }
                }
            }
        }

        let mut watchers_with_deleted_socket: HashSet<String> = HashSet::new();
        for name in &deleted_sockets {
            for watcher in &state.watchers {
                let guard = watcher.lock();
                if guard.cmd().contains(&socket_ref_token(name)) {
                    watchers_with_deleted_socket.insert(guard.name().to_string());
                }
            }
        }

        // Watcher name sets.
        let current_watchers: HashSet<String> = state
            .watchers
            .iter()
            .map(|w| w.lock().name().to_string())
            .collect();
        let new_watcher_names: HashSet<String> =
            new_watchers.iter().map(|w| w.name.clone()).collect();

        // Fail fast: a watcher that keeps existing must not reference a
        // socket that is going away. Nothing has been mutated yet, so a
        // refused reload leaves the running state untouched.
        for name in &watchers_with_deleted_socket {
            let kept = new_watcher_names.contains(name);
            let readded = watchers_with_changed_socket.contains(name);
            if kept && !readded {
                return Err(ArbiterError::ConfigConflict(format!(
                    "watcher `{name}` uses a socket which is deleted"
                )));
            }
        }

        let mut added_watchers: HashSet<String> = new_watcher_names
            .difference(&current_watchers)
            .cloned()
            .collect();
        added_watchers.extend(
            watchers_with_changed_socket
                .iter()
                .filter(|n| new_watcher_names.contains(*n))
                .cloned(),
        );
        let mut deleted_watchers: HashSet<String> = current_watchers
            .difference(&new_watcher_names)
            .cloned()
            .collect();
        deleted_watchers.extend(watchers_with_changed_socket.iter().cloned());

        // Apply socket changes.
        for name in &deleted_sockets {
            state.sockets.remove(name);
        }
        for name in &added_sockets {
            let cfg = match new_sockets.iter().find(|s| &s.name == name) {
                Some(cfg) => cfg.clone(),
                None => continue,
            };
            let mut socket = Socket::new(cfg);
            socket.bind_and_listen()?;
            state.sockets.add(socket);
        }

        // Surviving watchers re-resolve their markers against the new
        // socket set; watchers about to go away are skipped.
        if !added_sockets.is_empty() || !deleted_sockets.is_empty() {
            for watcher in &state.watchers {
                let mut guard = watcher.lock();
                if deleted_watchers.contains(guard.name()) {
                    continue;
                }
                guard.initialize(self.evpub.clone(), &state.sockets)?;
            }
        }

        // Changed watchers: a diff isolated to `numprocesses` adjusts the
        // running watcher in place; anything else is a delete + add.
        for name in current_watchers.intersection(&new_watcher_names) {
            if deleted_watchers.contains(name) {
                continue;
            }
            let watcher = match state.watchers_names.get(&name.to_lowercase()) {
                Some(watcher) => Arc::clone(watcher),
                None => continue,
            };
            let next = match new_watchers.iter().find(|w| &w.name == name) {
                Some(cfg) => cfg,
                None => continue,
            };

            let mut guard = watcher.lock();
            if guard.cfg() == next {
                continue;
            }
            if only_numprocesses_changed(guard.cfg(), next) {
                info!(
                    watcher = %name,
                    numprocesses = next.numprocesses,
                    "adjusting process count in place"
                );
                guard.set_numprocesses(next.numprocesses);
                guard.manage_processes();
            } else {
                drop(guard);
                deleted_watchers.insert(name.clone());
                added_watchers.insert(name.clone());
            }
        }

        // Delete in stop order (increasing priority).
        let mut to_delete: Vec<String> = deleted_watchers.into_iter().collect();
        to_delete.sort_by_key(|name| {
            state
                .watchers_names
                .get(&name.to_lowercase())
                .map(|w| w.lock().priority())
                .unwrap_or_default()
        });
        for name in to_delete {
            self.rm_watcher_locked(state, &name)?;
        }

        // Add in start order (decreasing priority): construct,
        // initialise, start, register.
        let mut to_add: Vec<&WatcherCfg> = new_watchers
            .iter()
            .filter(|w| added_watchers.contains(&w.name))
            .collect();
        to_add.sort_by(|a, b| b.priority.cmp(&a.priority));
        for cfg in to_add {
            let watcher = self.add_watcher_locked(state, cfg.clone())?;
            watcher.lock().start()?;
        }

        Ok(())
    }
}

/// True when the two configs differ in `numprocesses` and nothing else.
fn only_numprocesses_changed(running: &WatcherCfg, next: &WatcherCfg) -> bool {
    let mut aligned = next.clone();
    aligned.numprocesses = running.numprocesses;
    &aligned == running
}
