//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use pythia::config::SandboxPaths;
use pythia::message::{Limits, Message, Task};
use pythia::net::Conn;

/// Write an executable shell script standing in for the sandbox binary. The
/// runner passes its block-device arguments, which the script is free to
/// ignore; `$@` still carries them so a script can locate the input file.
pub fn fake_sandbox(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("sandbox.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

pub fn sandbox_paths(dir: &Path, body: &str) -> SandboxPaths {
    SandboxPaths {
        sandbox: fake_sandbox(dir, body),
        env_dir: dir.to_path_buf(),
        tasks_dir: dir.to_path_buf(),
    }
}

/// A task description with the given wall-clock and output limits.
pub fn task(time: u64, output: usize) -> Task {
    Task {
        environment: "test".into(),
        taskfs: "test.sfs".into(),
        limits: Limits {
            time,
            memory: 32,
            disk: 50,
            output,
        },
    }
}

/// Receive the next message within `secs` seconds.
pub async fn expect_msg(conn: &mut Conn, secs: u64) -> Message {
    tokio::time::timeout(Duration::from_secs(secs), conn.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("connection closed while waiting for a message")
}

/// Assert that nothing arrives on `conn` for `millis` milliseconds.
pub async fn expect_silence(conn: &mut Conn, millis: u64) {
    if let Ok(msg) = tokio::time::timeout(Duration::from_millis(millis), conn.recv()).await {
        panic!("unexpected message: {:?}", msg);
    }
}
