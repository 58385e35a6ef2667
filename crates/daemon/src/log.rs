// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Logging setup with a reopenable file sink.
//!
//! `reload` closes and reopens the file by path, so an external mover
//! can rotate the log without restarting the daemon.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::info;
use tracing_subscriber::fmt::MakeWriter;

/// File sink that can close and reopen its path on demand.
#[derive(Clone)]
pub struct LogFile {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl LogFile {
    fn open(path: &Path) -> std::io::Result<LogFile> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(LogFile {
            path: path.to_path_buf(),
            file: Arc::new(Mutex::new(file)),
        })
    }

    /// Close the current handle and reopen the path.
    pub fn reopen(&self) -> std::io::Result<()> {
        let fresh = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        *self.file.lock() = fresh;
        Ok(())
    }
}

pub struct LogFileWriter(Arc<Mutex<File>>);

impl Write for LogFileWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.lock().flush()
    }
}

impl<'a> MakeWriter<'a> for LogFile {
    type Writer = LogFileWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogFileWriter(Arc::clone(&self.file))
    }
}

static FILE_SINK: OnceLock<LogFile> = OnceLock::new();

/// Install the global subscriber: file sink when a path is given,
/// stderr otherwise. `debug` lowers the default filter.
pub fn init(debug: bool, log_file: Option<&Path>) -> std::io::Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let sink = LogFile::open(path)?;
            let _ = FILE_SINK.set(sink.clone());
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_ansi(false).with_writer(sink))
                .try_init()
                .map_err(std::io::Error::other)?;
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .try_init()
                .map_err(std::io::Error::other)?;
        }
    }
    Ok(())
}

/// Reopen the file sink, if one is active. Called during reload.
pub fn reopen() {
    if let Some(sink) = FILE_SINK.get() {
        match sink.reopen() {
            Ok(()) => info!("log file reopened"),
            Err(e) => eprintln!("failed to reopen log file: {e}"),
        }
    }
}
