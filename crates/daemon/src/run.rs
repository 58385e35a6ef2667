// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The run loop, and the background-thread variant for embedding.
//!
//! The loop multiplexes: controller requests (served by a spawned
//! listener task), the periodic management tick, child-exit signals, and
//! reload/shutdown signals.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use corral_core::ArbiterError;

use crate::arbiter::Arbiter;
use crate::control::Controller;
use crate::evpub;

/// Run the arbiter until it stops. Returns only after a clean shutdown;
/// a fatal error propagates and the process exits non-zero.
pub async fn run(arbiter: Arc<Arbiter>) -> Result<(), ArbiterError> {
    run_with_shutdown(arbiter, Arc::new(Notify::new())).await
}

/// Like [`run`], with an externally triggerable shutdown handle.
pub async fn run_with_shutdown(
    arbiter: Arc<Arbiter>,
    shutdown: Arc<Notify>,
) -> Result<(), ArbiterError> {
    arbiter.initialize()?;

    let cfg = arbiter.cfg();
    let _event_endpoint =
        evpub::serve(&cfg.pubsub_endpoint, arbiter.evpub().clone()).map_err(ArbiterError::Io)?;
    let controller = Controller::bind(&cfg.endpoint, Arc::clone(&arbiter), Arc::clone(&shutdown))
        .map_err(ArbiterError::Io)?;
    tokio::spawn(controller.run());

    arbiter.start_watchers().await?;

    info!(pid = arbiter.pid(), "arbiter now waiting for commands");
    // Parent processes wait on this line to know startup succeeded.
    println!("READY");

    // Created outside the loop: select! re-evaluates branches each pass.
    let mut tick = tokio::time::interval(cfg.check_delay());
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sigchld = signal(SignalKind::child()).map_err(ArbiterError::Io)?;
    let mut sighup = signal(SignalKind::hangup()).map_err(ArbiterError::Io)?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(ArbiterError::Io)?;
    let mut sigint = signal(SignalKind::interrupt()).map_err(ArbiterError::Io)?;

    loop {
        tokio::select! {
            _ = tick.tick() => {
                arbiter.manage_watchers()?;
            }
            _ = sigchld.recv() => {
                arbiter.manage_watchers()?;
            }
            _ = sighup.recv() => {
                info!("received SIGHUP, reloading configuration");
                if let Err(e) = arbiter.reload_from_config(None).await {
                    warn!(error = %e, "configuration reload failed");
                }
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
                break;
            }
            _ = sigint.recv() => {
                info!("received SIGINT, shutting down");
                break;
            }
            _ = shutdown.notified() => {
                info!("shutdown requested via command");
                break;
            }
        }
    }

    arbiter.stop();
    info!("arbiter stopped");
    Ok(())
}

/// Runs the arbiter inside a background worker thread so a host process
/// can embed it.
pub struct ArbiterThread {
    arbiter: Arc<Arbiter>,
    shutdown: Arc<Notify>,
    handle: Mutex<Option<std::thread::JoinHandle<Result<(), ArbiterError>>>>,
}

impl ArbiterThread {
    /// Launch the worker; the arbiter starts immediately.
    pub fn spawn(arbiter: Arc<Arbiter>) -> std::io::Result<ArbiterThread> {
        let shutdown = Arc::new(Notify::new());
        let worker_arbiter = Arc::clone(&arbiter);
        let worker_shutdown = Arc::clone(&shutdown);

        let handle = std::thread::Builder::new()
            .name("corral-arbiter".to_string())
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .map_err(ArbiterError::Io)?;
                runtime.block_on(run_with_shutdown(worker_arbiter, worker_shutdown))
            })?;

        Ok(ArbiterThread {
            arbiter,
            shutdown,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn arbiter(&self) -> &Arc<Arbiter> {
        &self.arbiter
    }

    /// Signal shutdown and join, unless called from the worker itself
    /// (joining our own thread would deadlock).
    pub fn stop(&self) {
        self.shutdown.notify_one();

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if std::thread::current().id() == handle.thread().id() {
                return;
            }
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "arbiter worker exited with error"),
                Err(_) => warn!("arbiter worker panicked"),
            }
        }
    }
}
