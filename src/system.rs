//! OS-level command shims: reboot, hostname/timezone changes, log retrieval,
//! and one-shot command execution with timeout and capped output.
//!
//! These are pure side effects with no coordination needs; every function
//! shells out, captures what it can, and reports the exit status.

use std::process::Stdio;
use std::time::Instant;

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{error, info};

/// Max captured bytes per stream. Output beyond this is drained but dropped.
const MAX_OUTPUT: usize = 256 * 1024;

/// Result of a completed command.
#[derive(Debug)]
pub struct CmdOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

#[derive(Debug, Error)]
pub enum CmdError {
    #[error("command timed out")]
    Timeout,
    #[error("failed to spawn command: {0}")]
    Spawn(String),
    #[error("command failed: {0}")]
    Io(String),
}

/// Run `sh -c <command>` with a timeout, capturing stdout/stderr.
///
/// The child has `kill_on_drop`, so a timeout also reaps the process.
pub async fn run_command(command: &str, timeout_ms: u64) -> Result<CmdOutput, CmdError> {
    let started = Instant::now();

    let mut child = Command::new("/bin/sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| CmdError::Spawn(e.to_string()))?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| CmdError::Io("missing stdout pipe".to_string()))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| CmdError::Io("missing stderr pipe".to_string()))?;

    let timeout = tokio::time::Duration::from_millis(timeout_ms);
    let body = async {
        // Drain both pipes concurrently so a chatty command cannot deadlock.
        let (out, err) = tokio::join!(
            read_capped(&mut stdout, MAX_OUTPUT),
            read_capped(&mut stderr, MAX_OUTPUT),
        );
        let status = child
            .wait()
            .await
            .map_err(|e| CmdError::Io(e.to_string()))?;
        Ok::<_, CmdError>((out, err, status))
    };

    match tokio::time::timeout(timeout, body).await {
        Ok(Ok((stdout, stderr, status))) => Ok(CmdOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout,
            stderr,
            duration_ms: started.elapsed().as_millis() as u64,
        }),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(CmdError::Timeout),
    }
}

/// Read up to `cap` bytes from a stream, draining the rest.
async fn read_capped<R: AsyncReadExt + Unpin>(reader: &mut R, cap: usize) -> String {
    let mut collected: Vec<u8> = Vec::new();
    let mut buf = [0u8; 8192];
    let mut truncated = false;
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if collected.len() < cap {
                    let take = n.min(cap - collected.len());
                    collected.extend_from_slice(&buf[..take]);
                    if take < n {
                        truncated = true;
                    }
                } else {
                    truncated = true;
                }
            }
        }
    }
    let mut text = String::from_utf8_lossy(&collected).into_owned();
    if truncated {
        text.push_str("\n[output truncated]");
    }
    text
}

/// Schedule an immediate reboot.
pub async fn reboot() -> Result<(), CmdError> {
    info!("system reboot requested");
    run_command("sudo shutdown -r now", 10_000).await.map(|_| ())
}

/// Schedule an immediate power-off.
pub async fn poweroff() -> Result<(), CmdError> {
    info!("system shutdown requested");
    run_command("sudo shutdown -h now", 10_000).await.map(|_| ())
}

/// Apply a hostname via `hostnamectl`. Failure is reported, not fatal — the
/// persisted setting still applies on the next boot image.
pub async fn apply_hostname(hostname: &str) {
    match run_command(&format!("sudo hostnamectl set-hostname '{hostname}'"), 10_000).await {
        Ok(out) if out.exit_code == 0 => info!("hostname set to {hostname}"),
        Ok(out) => error!("hostnamectl exited {}: {}", out.exit_code, out.stderr.trim()),
        Err(e) => error!("hostnamectl failed: {e}"),
    }
}

/// Apply a timezone via `timedatectl`.
pub async fn apply_timezone(timezone: &str) {
    match run_command(&format!("sudo timedatectl set-timezone '{timezone}'"), 10_000).await {
        Ok(out) if out.exit_code == 0 => info!("timezone set to {timezone}"),
        Ok(out) => error!("timedatectl exited {}: {}", out.exit_code, out.stderr.trim()),
        Err(e) => error!("timedatectl failed: {e}"),
    }
}

/// Whether `timezone` names a zoneinfo entry on this system. Rejects any
/// name that could escape the zoneinfo directory.
pub fn timezone_is_valid(timezone: &str) -> bool {
    if timezone.is_empty()
        || timezone.contains("..")
        || !timezone
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '+' | '-'))
    {
        return false;
    }
    std::path::Path::new("/usr/share/zoneinfo")
        .join(timezone)
        .is_file()
}

/// Tail of the service journal, for remote diagnostics.
pub async fn read_logs(lines: u32) -> Result<String, CmdError> {
    let lines = lines.min(1000);
    run_command(&format!("journalctl -u clockd -n {lines} --no-pager"), 10_000)
        .await
        .map(|out| out.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_stderr_and_exit_code() {
        let out = run_command("echo front; echo back >&2; exit 3", 5_000)
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout.trim(), "front");
        assert_eq!(out.stderr.trim(), "back");
    }

    #[tokio::test]
    async fn hung_command_times_out() {
        let result = run_command("sleep 30", 100).await;
        assert!(matches!(result, Err(CmdError::Timeout)));
    }

    #[test]
    fn timezone_traversal_is_rejected() {
        assert!(!timezone_is_valid("../../etc/passwd"));
        assert!(!timezone_is_valid("Europe/..;rm"));
        assert!(!timezone_is_valid(""));
    }
}
