// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Lifecycle events published on the event endpoint.

use serde::{Deserialize, Serialize};

/// How a child process left the process table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessExit {
    /// Exit code, when the child exited normally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    /// Terminating signal number, when it was killed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
}

impl ProcessExit {
    pub fn exited(code: i32) -> Self {
        ProcessExit {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signaled(signal: i32) -> Self {
        ProcessExit {
            code: None,
            signal: Some(signal),
        }
    }

    /// The exit event for one pid.
    pub fn into_event(self, pid: u32) -> EventKind {
        EventKind::Exit {
            pid,
            code: self.code,
            signal: self.signal,
        }
    }
}

/// What happened, tagged `event` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    /// Watcher accepted a start request.
    Start,
    /// One child was spawned.
    Spawn { pid: u32 },
    /// One child exited.
    Exit {
        pid: u32,
        /// Exit code, when the child exited normally.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<i32>,
        /// Terminating signal number, when it was killed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signal: Option<i32>,
    },
    /// Watcher was stopped.
    Stop,
    /// Watcher reloaded its children.
    Reload,
    /// Watcher was registered with the arbiter.
    Add,
    /// Watcher was removed from the arbiter.
    Remove,
}

/// One message on the publish bus: `{"watcher": ..., "event": ..., ...}`.
///
/// Delivery is lossy; subscribers reconcile with `status` queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub watcher: String,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    pub fn new(watcher: impl Into<String>, kind: EventKind) -> Self {
        Event {
            watcher: watcher.into(),
            kind,
        }
    }
}

#[cfg(test)]
#[path = "event_tests.rs"]
mod tests;
