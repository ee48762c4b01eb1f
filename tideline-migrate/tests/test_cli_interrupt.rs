//! Ctrl-C handling of the CLI binary
//!
//! Test flow: start an apply whose steps take a second each, send SIGINT
//! once the first step is running, then check that the run stopped after
//! committing that step instead of dying mid-step.

#![cfg(unix)]

use std::fs;
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tideline::migration::RecordStore;
use tideline_migrate::JsonFileRecordStore;

#[test]
fn test_interrupt_stops_between_steps() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();
    let dir = root.join("migrations");
    fs::create_dir_all(&dir).unwrap();
    for (version, name) in [("1", "create_users"), ("2", "add_email"), ("3", "add_index")] {
        fs::write(dir.join(format!("{version}_{name}.up.sql")), format!("up {name}\n")).unwrap();
        fs::write(
            dir.join(format!("{version}_{name}.down.sql")),
            format!("down {name}\n"),
        )
        .unwrap();
    }
    let started = root.join("started");
    let state = root.join("state.json");

    let mut child = Command::new(env!("CARGO_BIN_EXE_tideline-migrate"))
        .arg("--config")
        .arg(root.join("missing.toml"))
        .arg("--migrations-dir")
        .arg(&dir)
        .arg("--state-file")
        .arg(&state)
        .arg("--runner")
        .arg(format!("cat > /dev/null; touch {}; sleep 1", started.display()))
        .arg("--quiet")
        .arg("apply")
        .spawn()
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while !started.exists() {
        assert!(Instant::now() < deadline, "first step never started");
        thread::sleep(Duration::from_millis(20));
    }
    let signalled = Command::new("kill")
        .arg("-INT")
        .arg(child.id().to_string())
        .status()
        .unwrap();
    assert!(signalled.success());

    let status = child.wait().unwrap();
    assert_eq!(status.code(), Some(2), "aborted runs exit with 2");
    let records = JsonFileRecordStore::new(&state).current_state().unwrap();
    assert_eq!(records.len(), 1);
    assert!(JsonFileRecordStore::new(&state).lock_holder().unwrap().is_none());
}
