// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Lossy broadcast of watcher lifecycle events.
//!
//! One writer (the arbiter and its watchers), many subscribers. A slow
//! subscriber never stalls the arbiter: the channel drops its oldest
//! messages on lag, and the Unix-socket bridge drops the connection on a
//! failed write. Nothing lingers at shutdown; dropping the publisher
//! closes everything.

use std::path::Path;

use tokio::net::UnixListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use corral_core::{Event, EventKind};

use crate::protocol;

/// Messages kept per subscriber before lag starts dropping the oldest.
const CHANNEL_CAPACITY: usize = 256;

/// Handle used to publish lifecycle events.
#[derive(Clone, Debug)]
pub struct EventPublisher {
    tx: broadcast::Sender<Event>,
}

impl EventPublisher {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        EventPublisher { tx }
    }

    /// Publish without blocking; a missing audience is not an error.
    pub fn publish(&self, watcher: &str, kind: EventKind) {
        let _ = self.tx.send(Event::new(watcher, kind));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new()
    }
}

/// Accept subscribers on `path` and forward each event as a
/// length-prefixed JSON message.
pub fn serve(path: &Path, publisher: EventPublisher) -> std::io::Result<JoinHandle<()>> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    let listener = UnixListener::bind(path)?;

    Ok(tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let rx = publisher.subscribe();
                    tokio::spawn(forward_events(stream, rx));
                }
                Err(e) => {
                    warn!("event endpoint accept error: {}", e);
                }
            }
        }
    }))
}

async fn forward_events(mut stream: tokio::net::UnixStream, mut rx: broadcast::Receiver<Event>) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                // Lossy channel; the subscriber reconciles via `status`.
                debug!(skipped, "subscriber lagged, events dropped");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };

        if protocol::send(&mut stream, &event).await.is_err() {
            debug!("event subscriber went away");
            return;
        }
    }
}

#[cfg(test)]
#[path = "evpub_tests.rs"]
mod tests;
