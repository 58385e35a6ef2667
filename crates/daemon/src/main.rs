// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! corrald: the corral process arbiter.
//!
//! Supervises fleets of child processes grouped into named watchers,
//! driven by a TOML config file. Operators talk to it over the control
//! socket with `corralctl`.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info};

use corral_core::Config;
use corral_daemon::{log, run, Arbiter};

const USAGE: &str = "Usage: corrald <config.toml> [--log-file PATH]";

struct Args {
    config_file: PathBuf,
    log_file: Option<PathBuf>,
}

fn parse_args() -> Result<Args, String> {
    let mut config_file = None;
    let mut log_file = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" | "-v" => {
                println!("corrald {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" | "help" => {
                println!("corrald {}", env!("CARGO_PKG_VERSION"));
                println!("corral process arbiter - supervises fleets of child processes");
                println!();
                println!("{USAGE}");
                println!();
                println!("OPTIONS:");
                println!("    --log-file PATH  Log to PATH instead of stderr; the file is");
                println!("                     reopened on reload so it can be rotated");
                println!("    -h, --help       Print help information");
                println!("    -v, --version    Print version information");
                std::process::exit(0);
            }
            "--log-file" => {
                let value = args.next().ok_or("--log-file requires a path")?;
                log_file = Some(PathBuf::from(value));
            }
            other if other.starts_with('-') => {
                return Err(format!("unexpected option '{other}'"));
            }
            other => {
                if config_file.replace(PathBuf::from(other)).is_some() {
                    return Err("more than one config file given".to_string());
                }
            }
        }
    }

    Ok(Args {
        config_file: config_file.ok_or("missing config file")?,
        log_file,
    })
}

#[tokio::main]
async fn main() {
    let args = match parse_args() {
        Ok(args) => args,
        Err(reason) => {
            eprintln!("error: {reason}");
            eprintln!("{USAGE}");
            std::process::exit(2);
        }
    };

    let config = match Config::load(&args.config_file) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("corrald: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = log::init(config.debug, args.log_file.as_deref()) {
        eprintln!("corrald: failed to set up logging: {e}");
        std::process::exit(1);
    }

    info!(
        pid = std::process::id(),
        config = %args.config_file.display(),
        "starting arbiter"
    );

    let arbiter = Arc::new(Arbiter::from_config(&config, Some(args.config_file)));
    if let Err(e) = run::run(arbiter).await {
        error!("fatal arbiter error: {}", e);
        eprintln!("corrald: {e}");
        std::process::exit(1);
    }
}
