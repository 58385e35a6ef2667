// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! corralctl: operator CLI for the corral arbiter.
//!
//! Each invocation opens one connection to the control socket, sends a
//! single command, and renders the reply.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

mod client;

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::bail;
use clap::{Parser, Subcommand};

use corral_daemon::protocol::{AddOptions, Reply, ReplyBody, Request, Status};

use crate::client::ControlClient;

#[derive(Parser)]
#[command(name = "corralctl", version, about = "Control a running corral arbiter")]
struct Cli {
    /// Path to the arbiter control socket
    #[arg(long, short, default_value = "/run/corral/control.sock")]
    endpoint: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Re-converge the arbiter against its configuration file
    Reloadconfig,

    /// Register a new watcher (it is not started)
    Add {
        name: String,
        cmd: String,
        #[arg(long)]
        numprocesses: Option<usize>,
        #[arg(long)]
        priority: Option<i32>,
        #[arg(long)]
        singleton: bool,
        #[arg(long)]
        use_sockets: bool,
        #[arg(long)]
        copy_env: bool,
        #[arg(long)]
        copy_path: bool,
        #[arg(long)]
        working_dir: Option<PathBuf>,
        #[arg(long)]
        graceful_timeout: Option<f64>,
    },

    /// Remove a watcher, stopping its processes
    Rm { name: String },

    /// Start one watcher, or all of them
    Start { name: Option<String> },

    /// Stop one watcher, or all of them
    Stop { name: Option<String> },

    /// Stop then start one watcher, or all of them
    Restart { name: Option<String> },

    /// Reload one watcher, or everything
    Reload {
        name: Option<String>,
        /// Stop old processes before starting replacements
        #[arg(long)]
        terminate: bool,
    },

    /// Watcher status, or every watcher's status
    Status { name: Option<String> },

    /// Watcher names, or the pids of one watcher
    List { name: Option<String> },

    /// Number of registered watchers
    Numwatchers,

    /// Number of running processes
    Numprocesses { name: Option<String> },

    /// Read watcher options
    Get { name: String, keys: Vec<String> },

    /// Change watcher options (key=value pairs)
    Set { name: String, options: Vec<String> },

    /// Pids per watcher
    Stats { name: Option<String> },

    /// Shut the arbiter down
    Quit,
}

fn build_request(command: Command) -> anyhow::Result<Request> {
    let request = match command {
        Command::Reloadconfig => Request::ReloadConfig,
        Command::Add {
            name,
            cmd,
            numprocesses,
            priority,
            singleton,
            use_sockets,
            copy_env,
            copy_path,
            working_dir,
            graceful_timeout,
        } => Request::Add {
            name,
            cmd,
            options: AddOptions {
                numprocesses,
                priority,
                singleton: singleton.then_some(true),
                use_sockets: use_sockets.then_some(true),
                copy_env: copy_env.then_some(true),
                copy_path: copy_path.then_some(true),
                working_dir,
                env: BTreeMap::new(),
                graceful_timeout,
            },
        },
        Command::Rm { name } => Request::Rm { name },
        Command::Start { name } => Request::Start { name },
        Command::Stop { name } => Request::Stop { name },
        Command::Restart { name } => Request::Restart { name },
        Command::Reload { name, terminate } => Request::Reload {
            name,
            graceful: !terminate,
        },
        Command::Status { name } => Request::Status { name },
        Command::List { name } => Request::List { name },
        Command::Numwatchers => Request::NumWatchers,
        Command::Numprocesses { name } => Request::NumProcesses { name },
        Command::Get { name, keys } => Request::Get { name, keys },
        Command::Set { name, options } => Request::Set {
            name,
            options: parse_set_options(&options)?,
        },
        Command::Stats { name } => Request::Stats { name },
        Command::Quit => Request::Quit,
    };
    Ok(request)
}

/// Parse `key=value` pairs; numeric values go over the wire as numbers.
fn parse_set_options(
    pairs: &[String],
) -> anyhow::Result<BTreeMap<String, serde_json::Value>> {
    let mut options = BTreeMap::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("option `{pair}` is not of the form key=value");
        };
        let value = match value.parse::<u64>() {
            Ok(n) => serde_json::json!(n),
            Err(_) => serde_json::json!(value),
        };
        options.insert(key.to_string(), value);
    }
    Ok(options)
}

fn render(reply: Reply) -> anyhow::Result<()> {
    if reply.status == Status::Error {
        bail!(reply.reason.unwrap_or_else(|| "unknown error".to_string()));
    }
    match reply.body {
        ReplyBody::Empty {} => println!("ok"),
        ReplyBody::NumWatchers { numwatchers } => println!("{numwatchers}"),
        ReplyBody::NumProcesses { numprocesses } => println!("{numprocesses}"),
        ReplyBody::WatcherStatus { state } => println!("{state}"),
        ReplyBody::Statuses { statuses } => {
            for (name, status) in statuses {
                println!("{name}: {status}");
            }
        }
        ReplyBody::Watchers { watchers } => {
            for name in watchers {
                println!("{name}");
            }
        }
        ReplyBody::Pids { pids } => {
            let pids: Vec<String> = pids.iter().map(u32::to_string).collect();
            println!("{}", pids.join(","));
        }
        ReplyBody::Options { options } => {
            for (key, value) in options {
                println!("{key} = {value}");
            }
        }
        ReplyBody::Stats { infos } => {
            for (name, pids) in infos {
                let pids: Vec<String> = pids.iter().map(u32::to_string).collect();
                println!("{name}: {}", pids.join(","));
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let client = ControlClient::new(cli.endpoint);
    let reply = client.request(build_request(cli.command)?).await?;
    render(reply)
}
