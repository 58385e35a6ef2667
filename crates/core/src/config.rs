// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Declarative configuration for the arbiter.
//!
//! A config file is TOML with one `[corral]` table for the arbiter itself
//! and one table per socket, watcher, and plugin. Unknown keys inside a
//! known table are ignored; an unknown top-level table is an error.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("socket `{0}` must set either host/port or path")]
    SocketAddress(String),

    #[error("watcher `{0}` declared more than once (names are case-insensitive)")]
    DuplicateWatcher(String),
}

/// Prefix of the literal marker a watcher command uses to reference a
/// named socket.
pub const SOCKET_REF_PREFIX: &str = "corral.sockets.";

/// The literal marker for one named socket.
///
/// The spawner substitutes it with the inherited file-descriptor number,
/// and the reconciler scans commands for it when a socket changes.
pub fn socket_ref_token(name: &str) -> String {
    format!("{SOCKET_REF_PREFIX}{}", name.to_lowercase())
}

fn default_check_delay() -> f64 {
    1.0
}

fn default_httpd_host() -> String {
    "localhost".to_string()
}

fn default_httpd_port() -> u16 {
    8080
}

fn default_proc_name() -> String {
    "corrald".to_string()
}

fn default_numprocesses() -> usize {
    1
}

fn default_backlog() -> i32 {
    128
}

fn default_graceful_timeout() -> f64 {
    30.0
}

/// A named listening socket children inherit by file descriptor.
///
/// Parsing fills every default, so two entries describe the same socket
/// iff they compare equal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocketCfg {
    #[serde(skip)]
    pub name: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
}

impl SocketCfg {
    /// Inet socket on `host:port`.
    pub fn inet(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        SocketCfg {
            name: name.into(),
            host: Some(host.into()),
            port: Some(port),
            path: None,
            backlog: default_backlog(),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let inet = self.host.is_some() || self.port.is_some();
        if inet == self.path.is_some() {
            return Err(ConfigError::SocketAddress(self.name.clone()));
        }
        Ok(())
    }
}

/// One group of interchangeable child processes sharing a command template.
///
/// This is the comparable snapshot the reconciler diffs; `singleton` pins
/// `numprocesses` to 1 at parse time so the pin participates in equality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatcherCfg {
    #[serde(skip)]
    pub name: String,
    pub cmd: String,
    #[serde(default = "default_numprocesses")]
    pub numprocesses: usize,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub singleton: bool,
    #[serde(default)]
    pub use_sockets: bool,
    #[serde(default)]
    pub copy_env: bool,
    #[serde(default)]
    pub copy_path: bool,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub stdout_stream: Option<PathBuf>,
    #[serde(default)]
    pub stderr_stream: Option<PathBuf>,
    /// Seconds to wait after SIGTERM before escalating to SIGKILL.
    #[serde(default = "default_graceful_timeout")]
    pub graceful_timeout: f64,
}

impl WatcherCfg {
    /// Minimal watcher running `cmd`; one process, priority 0.
    pub fn new(name: impl Into<String>, cmd: impl Into<String>) -> Self {
        WatcherCfg {
            name: name.into(),
            cmd: cmd.into(),
            numprocesses: 1,
            priority: 0,
            singleton: false,
            use_sockets: false,
            copy_env: false,
            copy_path: false,
            working_dir: None,
            env: BTreeMap::new(),
            stdout_stream: None,
            stderr_stream: None,
            graceful_timeout: default_graceful_timeout(),
        }
    }

    /// Target child count; 1 when singleton regardless of config.
    pub fn target_processes(&self) -> usize {
        if self.singleton {
            1
        } else {
            self.numprocesses
        }
    }

    pub fn graceful_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.graceful_timeout)
    }

    fn normalize(mut self) -> Self {
        if self.singleton {
            self.numprocesses = 1;
        }
        self
    }
}

/// A plugin entry: an executable plus free-form options forwarded to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginCfg {
    #[serde(skip)]
    pub name: String,
    #[serde(rename = "use")]
    pub use_cmd: String,
    #[serde(flatten)]
    pub options: BTreeMap<String, toml::Value>,
}

/// Immutable snapshot of the declarative intent.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Control request/reply socket path.
    pub endpoint: PathBuf,
    /// Event publish/subscribe socket path.
    pub pubsub_endpoint: PathBuf,
    /// When set, the stats-collector watcher is materialised.
    pub stats_endpoint: Option<PathBuf>,
    /// Seconds between two management ticks.
    pub check_delay: f64,
    /// Seconds slept between two sequential watcher starts.
    pub warmup_delay: f64,
    /// Shell command run before every reload; failures are logged, never fatal.
    pub prereload_cmd: Option<String>,
    pub httpd: bool,
    pub httpd_host: String,
    pub httpd_port: u16,
    pub debug: bool,
    pub proc_name: String,
    pub ssh_server: Option<String>,
    pub sockets: Vec<SocketCfg>,
    pub watchers: Vec<WatcherCfg>,
    pub plugins: Vec<PluginCfg>,
}

/// The subset of [`Config`] that defines the arbiter identity.
///
/// When this differs between the running arbiter and a freshly loaded
/// file, reconciliation falls back to a full restart instead of a diff.
#[derive(Debug, Clone, PartialEq)]
pub struct ArbiterCfg {
    pub endpoint: PathBuf,
    pub pubsub_endpoint: PathBuf,
    pub stats_endpoint: Option<PathBuf>,
    pub check_delay: f64,
    pub prereload_cmd: Option<String>,
    pub plugins: Vec<PluginCfg>,
    pub warmup_delay: f64,
    pub httpd: bool,
    pub httpd_host: String,
    pub httpd_port: u16,
    pub debug: bool,
    pub ssh_server: Option<String>,
}

impl ArbiterCfg {
    pub fn check_delay(&self) -> Duration {
        Duration::from_secs_f64(self.check_delay)
    }

    pub fn warmup_delay(&self) -> Duration {
        Duration::from_secs_f64(self.warmup_delay)
    }
}

#[derive(Debug, Deserialize)]
struct ArbiterSection {
    endpoint: PathBuf,
    pubsub_endpoint: PathBuf,
    #[serde(default)]
    stats_endpoint: Option<PathBuf>,
    #[serde(default = "default_check_delay")]
    check_delay: f64,
    #[serde(default)]
    warmup_delay: f64,
    #[serde(default)]
    prereload_cmd: Option<String>,
    #[serde(default)]
    httpd: bool,
    #[serde(default = "default_httpd_host")]
    httpd_host: String,
    #[serde(default = "default_httpd_port")]
    httpd_port: u16,
    #[serde(default)]
    debug: bool,
    #[serde(default = "default_proc_name")]
    proc_name: String,
    #[serde(default)]
    ssh_server: Option<String>,
}

/// Raw file shape. `deny_unknown_fields` turns an unknown top-level
/// table into a parse error while keys inside each table stay lenient.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    corral: ArbiterSection,
    #[serde(default)]
    socket: IndexMap<String, SocketCfg>,
    #[serde(default)]
    watcher: IndexMap<String, WatcherCfg>,
    #[serde(default)]
    plugin: IndexMap<String, PluginCfg>,
}

impl Config {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Parse a config from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(text)?;

        let mut sockets = Vec::with_capacity(raw.socket.len());
        for (name, mut cfg) in raw.socket {
            cfg.name = name;
            cfg.validate()?;
            sockets.push(cfg);
        }

        let mut watchers = Vec::with_capacity(raw.watcher.len());
        let mut seen = std::collections::HashSet::new();
        for (name, mut cfg) in raw.watcher {
            if !seen.insert(name.to_lowercase()) {
                return Err(ConfigError::DuplicateWatcher(name));
            }
            cfg.name = name;
            watchers.push(cfg.normalize());
        }

        let mut plugins = Vec::with_capacity(raw.plugin.len());
        for (name, mut cfg) in raw.plugin {
            cfg.name = name;
            plugins.push(cfg);
        }

        Ok(Config {
            endpoint: raw.corral.endpoint,
            pubsub_endpoint: raw.corral.pubsub_endpoint,
            stats_endpoint: raw.corral.stats_endpoint,
            check_delay: raw.corral.check_delay,
            warmup_delay: raw.corral.warmup_delay,
            prereload_cmd: raw.corral.prereload_cmd,
            httpd: raw.corral.httpd,
            httpd_host: raw.corral.httpd_host,
            httpd_port: raw.corral.httpd_port,
            debug: raw.corral.debug,
            proc_name: raw.corral.proc_name,
            ssh_server: raw.corral.ssh_server,
            sockets,
            watchers,
            plugins,
        })
    }

    /// The arbiter-identity subset used for the restart-vs-diff decision.
    pub fn arbiter_cfg(&self) -> ArbiterCfg {
        ArbiterCfg {
            endpoint: self.endpoint.clone(),
            pubsub_endpoint: self.pubsub_endpoint.clone(),
            stats_endpoint: self.stats_endpoint.clone(),
            check_delay: self.check_delay,
            prereload_cmd: self.prereload_cmd.clone(),
            plugins: self.plugins.clone(),
            warmup_delay: self.warmup_delay,
            httpd: self.httpd,
            httpd_host: self.httpd_host.clone(),
            httpd_port: self.httpd_port,
            debug: self.debug,
            ssh_server: self.ssh_server.clone(),
        }
    }

    pub fn socket_cfg(&self, name: &str) -> Option<&SocketCfg> {
        self.sockets.iter().find(|s| s.name == name)
    }

    pub fn watcher_cfg(&self, name: &str) -> Option<&WatcherCfg> {
        self.watchers.iter().find(|w| w.name == name)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
