// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use yare::parameterized;

const FULL: &str = r#"
[corral]
endpoint = "/tmp/corral/control.sock"
pubsub_endpoint = "/tmp/corral/events.sock"
check_delay = 0.5
warmup_delay = 0.1
prereload_cmd = "scripts/prereload.sh"
debug = true

[socket.web]
host = "127.0.0.1"
port = 9000

[socket.ipc]
path = "/tmp/app.sock"
backlog = 64

[watcher.worker]
cmd = "worker --fd corral.sockets.web"
numprocesses = 3
priority = 10
use_sockets = true
copy_env = true

[watcher.janitor]
cmd = "janitor"
singleton = true
numprocesses = 5

[plugin.flapping]
use = "corral-flapping"
retries = 3
"#;

#[test]
fn parses_a_full_file() {
    let config = Config::from_toml_str(FULL).unwrap();

    assert_eq!(config.endpoint, PathBuf::from("/tmp/corral/control.sock"));
    assert_eq!(config.check_delay, 0.5);
    assert_eq!(config.warmup_delay, 0.1);
    assert_eq!(config.prereload_cmd.as_deref(), Some("scripts/prereload.sh"));
    assert!(config.debug);
    assert_eq!(config.proc_name, "corrald");

    assert_eq!(config.sockets.len(), 2);
    let web = config.socket_cfg("web").unwrap();
    assert_eq!(web.port, Some(9000));
    assert_eq!(web.backlog, 128);
    let ipc = config.socket_cfg("ipc").unwrap();
    assert_eq!(ipc.path, Some(PathBuf::from("/tmp/app.sock")));
    assert_eq!(ipc.backlog, 64);

    assert_eq!(config.watchers.len(), 2);
    let worker = config.watcher_cfg("worker").unwrap();
    assert_eq!(worker.numprocesses, 3);
    assert_eq!(worker.priority, 10);
    assert!(worker.use_sockets);
    assert!(worker.copy_env);

    assert_eq!(config.plugins.len(), 1);
    assert_eq!(config.plugins[0].name, "flapping");
    assert_eq!(config.plugins[0].use_cmd, "corral-flapping");
    assert_eq!(
        config.plugins[0].options.get("retries"),
        Some(&toml::Value::Integer(3))
    );
}

#[test]
fn singleton_pins_numprocesses_to_one() {
    let config = Config::from_toml_str(FULL).unwrap();
    let janitor = config.watcher_cfg("janitor").unwrap();
    assert!(janitor.singleton);
    assert_eq!(janitor.numprocesses, 1);
    assert_eq!(janitor.target_processes(), 1);
}

#[test]
fn unknown_top_level_table_is_an_error() {
    let text = r#"
[corral]
endpoint = "/tmp/c.sock"
pubsub_endpoint = "/tmp/e.sock"

[watchers.typo]
cmd = "true"
"#;
    assert!(matches!(
        Config::from_toml_str(text),
        Err(ConfigError::Parse(_))
    ));
}

#[test]
fn unknown_keys_inside_tables_are_ignored() {
    let text = r#"
[corral]
endpoint = "/tmp/c.sock"
pubsub_endpoint = "/tmp/e.sock"
future_knob = true

[watcher.a]
cmd = "true"
shiny = "yes"
"#;
    let config = Config::from_toml_str(text).unwrap();
    assert_eq!(config.watchers.len(), 1);
}

#[parameterized(
    both_forms = { "host = \"127.0.0.1\"\nport = 9000\npath = \"/tmp/bad.sock\"" },
    neither_form = { "backlog = 10" },
    host_and_path = { "host = \"127.0.0.1\"\npath = \"/tmp/bad.sock\"" },
)]
fn socket_needs_exactly_one_address_form(body: &str) {
    let text = format!(
        "[corral]\nendpoint = \"/tmp/c.sock\"\npubsub_endpoint = \"/tmp/e.sock\"\n\n[socket.bad]\n{body}\n"
    );
    assert!(matches!(
        Config::from_toml_str(&text),
        Err(ConfigError::SocketAddress(name)) if name == "bad"
    ));
}

#[test]
fn case_colliding_watcher_names_are_rejected() {
    let text = r#"
[corral]
endpoint = "/tmp/c.sock"
pubsub_endpoint = "/tmp/e.sock"

[watcher.Web]
cmd = "true"

[watcher.web]
cmd = "true"
"#;
    assert!(matches!(
        Config::from_toml_str(text),
        Err(ConfigError::DuplicateWatcher(_))
    ));
}

#[test]
fn arbiter_cfg_equality_tracks_identity_fields_only() {
    let config = Config::from_toml_str(FULL).unwrap();
    let same = Config::from_toml_str(FULL).unwrap();
    assert_eq!(config.arbiter_cfg(), same.arbiter_cfg());

    // A watcher-level change does not touch the arbiter identity.
    let changed_watcher = FULL.replace("numprocesses = 3", "numprocesses = 4");
    let changed = Config::from_toml_str(&changed_watcher).unwrap();
    assert_eq!(config.arbiter_cfg(), changed.arbiter_cfg());

    // An arbiter-level change does.
    let changed_delay = FULL.replace("check_delay = 0.5", "check_delay = 2.0");
    let changed = Config::from_toml_str(&changed_delay).unwrap();
    assert_ne!(config.arbiter_cfg(), changed.arbiter_cfg());
}

#[test]
fn load_reports_missing_file_with_path() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope.toml");
    match Config::load(&missing) {
        Err(ConfigError::Read { path, .. }) => assert_eq!(path, missing),
        other => panic!("expected read error, got {other:?}"),
    }
}

#[test]
fn socket_ref_token_lowercases() {
    assert_eq!(socket_ref_token("Web"), "corral.sockets.web");
}
