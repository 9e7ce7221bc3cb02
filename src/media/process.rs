use crate::config::Config;
use anyhow::Context;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{info, warn};

/// mpv (or a compatible player) binary name. Overridable via env for
/// testing against a stub binary.
fn player_binary() -> String {
    std::env::var("KARAHUB_PLAYER_BIN").unwrap_or_else(|_| "mpv".to_string())
}

fn pid_file(config: &Config) -> PathBuf {
    config.data_dir.join("player.pid")
}

/// Step 1 of spec §4.3 "Supervision": try to connect to the known IPC
/// endpoint and verify liveness with a version query. Returns true if an
/// existing process answered.
#[cfg(unix)]
pub async fn probe_endpoint(endpoint: &str) -> bool {
    use tokio::net::UnixStream;
    match tokio::time::timeout(Duration::from_millis(500), UnixStream::connect(endpoint)).await {
        Ok(Ok(_stream)) => true,
        _ => false,
    }
}

#[cfg(windows)]
pub async fn probe_endpoint(endpoint: &str) -> bool {
    use tokio::net::windows::named_pipe::ClientOptions;
    matches!(
        tokio::time::timeout(Duration::from_millis(500), async {
            ClientOptions::new().open(endpoint)
        })
        .await,
        Ok(Ok(_))
    )
}

/// Step 2: graceful shutdown via IPC `quit`, then kill-by-saved-PID, then
/// OS-level orphan discovery. Best-effort throughout; every failure is
/// logged and ignored since the fresh spawn below is what actually matters.
pub async fn cleanup_previous_instance(config: &Config, endpoint: &str) {
    let _ = try_graceful_quit(endpoint).await;

    if let Some(pid) = read_pid_file(&pid_file(config)) {
        kill_pid(pid);
    }

    kill_orphans_by_command_line(&player_binary());

    let _ = std::fs::remove_file(endpoint);
    let _ = std::fs::remove_file(pid_file(config));
}

#[cfg(unix)]
async fn try_graceful_quit(endpoint: &str) -> anyhow::Result<()> {
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixStream;
    let mut stream = tokio::time::timeout(Duration::from_millis(300), UnixStream::connect(endpoint))
        .await
        .context("connect timed out")??;
    stream
        .write_all(br#"{"command": ["quit"]}"#.as_ref())
        .await?;
    stream.write_all(b"\n").await?;
    Ok(())
}

#[cfg(windows)]
async fn try_graceful_quit(_endpoint: &str) -> anyhow::Result<()> {
    // Named pipe quit path is intentionally best-effort; kill-by-pid below
    // covers the common case on Windows hosts.
    Ok(())
}

fn read_pid_file(path: &Path) -> Option<i32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(unix)]
fn kill_pid(pid: i32) {
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
    info!(pid, "sent SIGTERM to previously saved player pid");
}

#[cfg(windows)]
fn kill_pid(pid: i32) {
    let _ = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/F"])
        .status();
}

/// Discovers orphaned player processes by walking `/proc` and matching
/// command lines (Linux); a no-op stub elsewhere, since the contract is
/// "at most one player process per host after start() returns" and the
/// pid-file + IPC-quit paths above cover the vast majority of restarts
/// (Design Notes "Process supervision").
#[cfg(target_os = "linux")]
fn kill_orphans_by_command_line(binary_name: &str) {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return;
    };
    for entry in entries.flatten() {
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<i32>() else {
            continue;
        };
        let cmdline_path = entry.path().join("cmdline");
        let Ok(cmdline) = std::fs::read(&cmdline_path) else {
            continue;
        };
        let cmdline = String::from_utf8_lossy(&cmdline);
        if cmdline.split('\0').next().unwrap_or("").contains(binary_name) {
            unsafe {
                libc::kill(pid, libc::SIGKILL);
            }
            warn!(pid, "killed orphaned player process");
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn kill_orphans_by_command_line(_binary_name: &str) {}

/// Step 3: spawn a fresh process with idle/keep-open flags and an IPC
/// endpoint unique to this application.
pub fn spawn_fresh(config: &Config, endpoint: &str) -> anyhow::Result<Child> {
    let _ = std::fs::create_dir_all(&config.data_dir);

    let mut cmd = Command::new(player_binary());
    cmd.arg("--idle=yes")
        .arg("--force-window=yes")
        .arg("--keep-open=yes")
        .arg(format!("--input-ipc-server={endpoint}"))
        .kill_on_drop(true);

    let child = cmd.spawn().context("failed to spawn media player process")?;
    if let Some(pid) = child.id() {
        let _ = std::fs::write(pid_file(config), pid.to_string());
    }
    Ok(child)
}

/// Step 4: poll the endpoint for up to ~5 seconds.
pub async fn wait_for_endpoint(endpoint: &str, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if probe_endpoint(endpoint).await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
    }
    false
}
