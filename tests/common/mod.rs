//! Shared utilities for lifecycle integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::net::TcpListener;
use std::time::{Duration, Instant};

use gem::lifecycle::RestartCommand;

/// A loopback address nobody is listening on right now.
pub fn free_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().to_string()
}

/// Restart command that runs `script` under `/bin/sh` in place of a real server.
pub fn sh_child(script: &str) -> RestartCommand {
    RestartCommand::new("/bin/sh", ["-c", script])
}

/// Poll `check` until it yields a value or `timeout` passes.
pub async fn eventually<T, F, Fut>(timeout: Duration, mut check: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Some(value) = check().await {
            return Some(value);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    None
}

/// Client that never reuses connections, so every request sees the current acceptor.
pub fn fresh_client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

/// Whether a process with this pid exists (zombies included).
pub fn pid_alive(pid: i32) -> bool {
    // SAFETY: signal 0 only checks for existence.
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Read the pid a stand-in child wrote with `echo $$ > path`.
pub async fn read_pid(path: &std::path::Path) -> Option<i32> {
    let text = tokio::fs::read_to_string(path).await.ok()?;
    text.trim().parse().ok()
}
