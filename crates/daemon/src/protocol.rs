// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Control-plane protocol.
//!
//! Messages travel as frames: a big-endian `u32` payload length, then a
//! JSON payload. A request is `{"command": <name>, "properties": {...}}`;
//! commands that take no properties may omit them. A reply is
//! `{"status": "ok", ...}` or `{"status": "error", "reason": ...}`.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use corral_core::ArbiterError;

fn default_graceful() -> bool {
    true
}

/// Options accepted by the `add` command alongside `name` and `cmd`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AddOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub numprocesses: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub singleton: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_sockets: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copy_env: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copy_path: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<std::path::PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graceful_timeout: Option<f64>,
}

/// Request from an operator to the arbiter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "command", content = "properties", rename_all = "lowercase")]
pub enum Request {
    /// Re-converge running state against the configuration file.
    ReloadConfig,

    /// Register a new watcher; it is not started.
    Add {
        name: String,
        cmd: String,
        #[serde(default)]
        options: AddOptions,
    },

    /// Remove a watcher, stopping its processes.
    Rm { name: String },

    /// Start one watcher, or all of them.
    Start {
        #[serde(default)]
        name: Option<String>,
    },

    /// Stop one watcher, or all of them.
    Stop {
        #[serde(default)]
        name: Option<String>,
    },

    /// Stop then start one watcher, or all of them.
    Restart {
        #[serde(default)]
        name: Option<String>,
    },

    /// Reload one watcher, or everything (prereload hook + log reopen).
    Reload {
        #[serde(default)]
        name: Option<String>,
        #[serde(default = "default_graceful")]
        graceful: bool,
    },

    /// Watcher status, or every watcher's status.
    Status {
        #[serde(default)]
        name: Option<String>,
    },

    /// Watcher names, or the pids of one watcher.
    List {
        #[serde(default)]
        name: Option<String>,
    },

    NumWatchers,

    /// Process count of one watcher, or across all watchers.
    NumProcesses {
        #[serde(default)]
        name: Option<String>,
    },

    /// Read watcher options by key.
    Get { name: String, keys: Vec<String> },

    /// Change watcher options (currently `numprocesses`).
    Set {
        name: String,
        options: BTreeMap<String, serde_json::Value>,
    },

    /// Pids per watcher.
    Stats {
        #[serde(default)]
        name: Option<String>,
    },

    /// Shut the arbiter down.
    Quit,
}

/// Successful reply payloads, flattened next to `"status": "ok"`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ReplyBody {
    NumWatchers { numwatchers: usize },
    NumProcesses { numprocesses: usize },
    // `state`, not `status`: the reply envelope already owns that key.
    WatcherStatus { state: String },
    Statuses { statuses: BTreeMap<String, String> },
    Watchers { watchers: Vec<String> },
    Pids { pids: Vec<u32> },
    Options { options: BTreeMap<String, serde_json::Value> },
    Stats { infos: BTreeMap<String, Vec<u32>> },
    // Keep last: matches any object with no required fields.
    Empty {},
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
}

/// Reply from the arbiter: `{"status": "ok", ...body}` on success,
/// `{"status": "error", "reason": ...}` on failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reply {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(flatten)]
    pub body: ReplyBody,
}

impl Reply {
    pub fn ok() -> Self {
        Reply::with(ReplyBody::Empty {})
    }

    pub fn with(body: ReplyBody) -> Self {
        Reply {
            status: Status::Ok,
            reason: None,
            body,
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Reply {
            status: Status::Error,
            reason: Some(reason.into()),
            body: ReplyBody::Empty {},
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

impl From<ArbiterError> for Reply {
    fn from(err: ArbiterError) -> Self {
        Reply::error(err.to_string())
    }
}

/// Errors crossing the wire layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("peer closed the connection")]
    Closed,

    #[error("frame of {0} bytes exceeds the {MAX_FRAME} byte limit")]
    Oversized(usize),

    #[error("peer did not respond within {0:?}")]
    Deadline(Duration),

    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Upper bound on one frame's payload. Arbiter replies are tiny; the
/// limit only exists so a garbage length prefix cannot balloon an
/// allocation.
pub const MAX_FRAME: usize = 1024 * 1024;

/// How long either side waits on one request/reply exchange.
pub const IPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Serialize `msg` and write it as one frame: a big-endian `u32` payload
/// length followed by the JSON payload, flushed in a single buffer.
pub async fn send<W, T>(writer: &mut W, msg: &T) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(msg)?;
    if payload.len() > MAX_FRAME {
        return Err(WireError::Oversized(payload.len()));
    }

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame and deserialize its payload.
///
/// An EOF before the length prefix is a clean hangup and maps to
/// [`WireError::Closed`]; an EOF mid-payload is a truncated frame and
/// surfaces as an IO error.
pub async fn recv<R, T>(reader: &mut R) -> Result<T, WireError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::Closed)
        }
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME {
        return Err(WireError::Oversized(len));
    }

    let mut payload = vec![0; len];
    reader.read_exact(&mut payload).await?;
    Ok(serde_json::from_slice(&payload)?)
}

/// [`send`] bounded by a deadline.
pub async fn send_timed<W, T>(writer: &mut W, msg: &T, limit: Duration) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    match tokio::time::timeout(limit, send(writer, msg)).await {
        Ok(result) => result,
        Err(_) => Err(WireError::Deadline(limit)),
    }
}

/// [`recv`] bounded by a deadline.
pub async fn recv_timed<R, T>(reader: &mut R, limit: Duration) -> Result<T, WireError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    match tokio::time::timeout(limit, recv(reader)).await {
        Ok(result) => result,
        Err(_) => Err(WireError::Deadline(limit)),
    }
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
