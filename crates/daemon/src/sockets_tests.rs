// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

use corral_core::config::SocketCfg;

fn inet_cfg(name: &str, port: u16) -> SocketCfg {
    SocketCfg::inet(name, "127.0.0.1", port)
}

#[test]
fn bind_and_listen_accepts_connections() {
    let mut socket = Socket::new(inet_cfg("web", 0));
    socket.bind_and_listen().unwrap();
    assert!(socket.is_bound());
    assert!(socket.fd().is_some());

    let port = socket
        .local_addr()
        .expect("bound socket has an address")
        .port();
    std::net::TcpStream::connect(("127.0.0.1", port)).expect("socket is listening");

    socket.close();
    assert!(!socket.is_bound());
    // Idempotent.
    socket.close();
}

#[test]
fn bind_is_idempotent() {
    let mut socket = Socket::new(inet_cfg("web", 0));
    socket.bind_and_listen().unwrap();
    let fd = socket.fd();
    socket.bind_and_listen().unwrap();
    assert_eq!(socket.fd(), fd);
}

#[test]
fn unix_socket_binds_and_removes_its_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.sock");

    let mut cfg = SocketCfg::inet("ipc", "x", 0);
    cfg.host = None;
    cfg.port = None;
    cfg.path = Some(path.clone());

    let mut socket = Socket::new(cfg);
    socket.bind_and_listen().unwrap();
    assert!(path.exists());

    std::os::unix::net::UnixStream::connect(&path).expect("socket is listening");

    socket.close();
    assert!(!path.exists());
}

#[test]
fn registry_lookup_add_remove() {
    let mut registry = SocketRegistry::new([inet_cfg("a", 0), inet_cfg("b", 0)]);
    assert_eq!(registry.len(), 2);
    assert!(registry.get("a").is_some());
    assert!(registry.get("c").is_none());
    assert_eq!(
        registry.names(),
        ["a".to_string(), "b".to_string()].into_iter().collect()
    );

    registry.bind_and_listen_all().unwrap();
    let removed = registry.remove("a").expect("a was registered");
    assert!(!removed.is_bound());
    assert_eq!(registry.len(), 1);
    assert!(registry.remove("a").is_none());

    registry.close_all();
    assert!(!registry.iter().any(|s| s.is_bound()));
}

#[test]
fn bind_all_failure_leaves_earlier_sockets_open_for_cleanup() {
    // Occupy a concrete port first so the second bind collides.
    let mut holder = Socket::new(inet_cfg("holder", 0));
    holder.bind_and_listen().unwrap();
    let taken = holder.local_addr().unwrap().port();

    let mut registry = SocketRegistry::new([inet_cfg("good", 0), inet_cfg("conflict", taken)]);
    let err = registry.bind_and_listen_all().unwrap_err();
    assert!(matches!(err, corral_core::ArbiterError::Io(_)));

    // The first socket stayed bound; close_all releases it.
    assert!(registry.get("good").unwrap().is_bound());
    assert!(!registry.get("conflict").unwrap().is_bound());
    registry.close_all();
    assert!(!registry.get("good").unwrap().is_bound());
}
