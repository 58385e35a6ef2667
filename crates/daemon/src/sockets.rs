// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Named listening sockets that watcher children inherit by descriptor.

use std::collections::HashSet;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;

use socket2::{Domain, Protocol, SockAddr, Type};
use tracing::debug;

use corral_core::config::SocketCfg;
use corral_core::ArbiterError;

/// One bound listening socket.
///
/// The descriptor stays closed until [`Socket::bind_and_listen`];
/// `FD_CLOEXEC` is cleared at that point so spawned children inherit it.
pub struct Socket {
    cfg: SocketCfg,
    listener: Option<socket2::Socket>,
}

impl Socket {
    pub fn new(cfg: SocketCfg) -> Self {
        Socket {
            cfg,
            listener: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.cfg.name
    }

    pub fn cfg(&self) -> &SocketCfg {
        &self.cfg
    }

    /// Inherited descriptor number, once bound.
    pub fn fd(&self) -> Option<RawFd> {
        self.listener.as_ref().map(|l| l.as_raw_fd())
    }

    pub fn is_bound(&self) -> bool {
        self.listener.is_some()
    }

    /// Local address, for inet sockets once bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener
            .as_ref()
            .and_then(|l| l.local_addr().ok())
            .and_then(|addr| addr.as_socket())
    }

    /// Acquire the address and enter the listening state. Idempotent.
    pub fn bind_and_listen(&mut self) -> Result<(), ArbiterError> {
        if self.listener.is_some() {
            return Ok(());
        }

        let listener = match (&self.cfg.path, self.cfg.host.as_deref(), self.cfg.port) {
            (Some(path), _, _) => bind_unix(path, self.cfg.backlog)?,
            (None, Some(host), Some(port)) => bind_inet(host, port, self.cfg.backlog)?,
            _ => {
                return Err(ArbiterError::Init(format!(
                    "socket `{}` has no usable address",
                    self.cfg.name
                )))
            }
        };

        // Children must inherit the descriptor across exec.
        listener.set_cloexec(false).map_err(ArbiterError::Io)?;

        debug!(socket = %self.cfg.name, fd = listener.as_raw_fd(), "socket listening");
        self.listener = Some(listener);
        Ok(())
    }

    /// Release the descriptor. Idempotent.
    pub fn close(&mut self) {
        if let Some(listener) = self.listener.take() {
            debug!(socket = %self.cfg.name, "socket closed");
            drop(listener);
        }
        if let Some(path) = &self.cfg.path {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn bind_inet(host: &str, port: u16, backlog: i32) -> Result<socket2::Socket, ArbiterError> {
    let addr: SocketAddr = (host, port)
        .to_socket_addrs()
        .map_err(ArbiterError::Io)?
        .next()
        .ok_or_else(|| ArbiterError::Init(format!("cannot resolve {host}:{port}")))?;

    let socket = socket2::Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(ArbiterError::Io)?;
    socket.set_reuse_address(true).map_err(ArbiterError::Io)?;
    socket.bind(&SockAddr::from(addr)).map_err(ArbiterError::Io)?;
    socket.listen(backlog).map_err(ArbiterError::Io)?;
    Ok(socket)
}

fn bind_unix(path: &Path, backlog: i32) -> Result<socket2::Socket, ArbiterError> {
    // A stale path from a previous run would fail the bind.
    if path.exists() {
        std::fs::remove_file(path).map_err(ArbiterError::Io)?;
    }
    let socket =
        socket2::Socket::new(Domain::UNIX, Type::STREAM, None).map_err(ArbiterError::Io)?;
    let addr = SockAddr::unix(path).map_err(ArbiterError::Io)?;
    socket.bind(&addr).map_err(ArbiterError::Io)?;
    socket.listen(backlog).map_err(ArbiterError::Io)?;
    Ok(socket)
}

/// The set of named sockets owned by the arbiter.
#[derive(Default)]
pub struct SocketRegistry {
    sockets: Vec<Socket>,
}

impl SocketRegistry {
    pub fn new(cfgs: impl IntoIterator<Item = SocketCfg>) -> Self {
        SocketRegistry {
            sockets: cfgs.into_iter().map(Socket::new).collect(),
        }
    }

    pub fn add(&mut self, socket: Socket) {
        self.sockets.push(socket);
    }

    /// Close and detach a socket by name.
    pub fn remove(&mut self, name: &str) -> Option<Socket> {
        let idx = self.sockets.iter().position(|s| s.name() == name)?;
        let mut socket = self.sockets.remove(idx);
        socket.close();
        Some(socket)
    }

    pub fn get(&self, name: &str) -> Option<&Socket> {
        self.sockets.iter().find(|s| s.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Socket> {
        self.sockets.iter()
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    pub fn names(&self) -> HashSet<String> {
        self.sockets.iter().map(|s| s.name().to_string()).collect()
    }

    /// Bind every socket. Fails on the first error, leaving previously
    /// bound sockets open for cleanup by [`SocketRegistry::close_all`].
    pub fn bind_and_listen_all(&mut self) -> Result<(), ArbiterError> {
        for socket in &mut self.sockets {
            socket.bind_and_listen()?;
        }
        Ok(())
    }

    /// Release every descriptor. Idempotent.
    pub fn close_all(&mut self) {
        for socket in &mut self.sockets {
            socket.close();
        }
    }
}

#[cfg(test)]
#[path = "sockets_tests.rs"]
mod tests;
