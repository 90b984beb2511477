#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{Duration, Instant};

fn temp_dir(test_name: &str) -> PathBuf {
    let base = std::env::temp_dir();
    let pid = std::process::id();
    let nonce = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let dir = base.join(format!("peerlink_cli_{test_name}_{pid}_{nonce}"));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

/// `peerlink` isolated from the caller's config, runtime dir and registry.
fn peerlink(dir: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_peerlink"));
    for key in [
        "PEERLINK_CONFIG",
        "PEERLINK_DB",
        "PEERLINK_BIND",
        "PEERLINK_PORT",
        "PEERLINK_TOKEN",
        "PEERLINK_TLS_CERT",
        "PEERLINK_TLS_KEY",
    ] {
        cmd.env_remove(key);
    }
    cmd.env("HOME", dir)
        .env("XDG_CONFIG_HOME", dir.join("config"))
        .env("PEERLINK_RUNTIME_DIR", dir.join("run"))
        .env("RUST_LOG", "warn")
        .arg("--db")
        .arg(dir.join("registry.db"));
    cmd
}

fn run(cmd: &mut Command) -> Output {
    let output = cmd.output().expect("run peerlink");
    assert!(
        output.status.success(),
        "peerlink failed (stderr={})",
        String::from_utf8_lossy(&output.stderr)
    );
    output
}

fn peers(dir: &Path, all: bool) -> Vec<serde_json::Value> {
    let mut cmd = peerlink(dir);
    cmd.args(["peers", "--json"]);
    if all {
        cmd.arg("--all");
    }
    let output = run(&mut cmd);
    serde_json::from_slice(&output.stdout).expect("peers json")
}

#[test]
fn help_and_version_exit_zero() {
    let dir = temp_dir("help");
    let output = run(peerlink(&dir).arg("--help"));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("serve"));
    assert!(stdout.contains("invoke"));

    let output = run(peerlink(&dir).arg("--version"));
    assert!(String::from_utf8_lossy(&output.stdout).contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn empty_registry_lists_nothing() {
    let dir = temp_dir("empty");
    assert!(peers(&dir, true).is_empty());

    let output = run(peerlink(&dir).args(["selection", "show", "--json"]));
    let items: Vec<serde_json::Value> = serde_json::from_slice(&output.stdout).expect("json");
    assert!(items.is_empty());
}

#[test]
fn served_peer_answers_invocations_and_unregisters_on_exit() {
    let dir = temp_dir("serve");
    let mut child = peerlink(&dir)
        .args([
            "serve",
            "--document",
            "Tower=C:/work/Tower.rvt",
            "--document",
            "Annex",
            "--duration-secs",
            "8",
        ])
        .spawn()
        .expect("spawn serve");

    let deadline = Instant::now() + Duration::from_secs(5);
    let rows = loop {
        let rows = peers(&dir, false);
        if rows.len() == 2 && rows.iter().all(|row| row["port"].as_u64() != Some(0)) {
            break rows;
        }
        assert!(Instant::now() < deadline, "peer never registered: {rows:?}");
        std::thread::sleep(Duration::from_millis(50));
    };
    let session = rows[0]["session_id"].as_str().expect("session id").to_string();

    let output = run(peerlink(&dir).args(["invoke", &session, "list_documents"]));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("DOCUMENT|C:/work/Tower.rvt"), "stdout={stdout}");
    assert!(stdout.contains("DOCUMENT|untitled:Annex"), "stdout={stdout}");

    run(peerlink(&dir).args([
        "invoke",
        &session,
        "apply_selection",
        "--args",
        r#"{"items":[{"document_title":"Tower","document_path":"C:/work/Tower.rvt","unique_id":"w-1"}]}"#,
    ]));
    let output = run(peerlink(&dir).args(["selection", "show"]));
    assert!(String::from_utf8_lossy(&output.stdout).contains("Tower\tw-1"));

    let status = child.wait().expect("wait for serve");
    assert!(status.success());
    assert!(peers(&dir, true).is_empty());
}
