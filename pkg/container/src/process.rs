//! Subprocess and PID helpers shared by the backends.

use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

use pkg_types::error::RuntimeError;
use pkg_types::fsutil::write_atomic;

/// Find a binary in `$PATH`, then in the given fallback locations.
pub async fn find_binary(name: &str, fallbacks: &[PathBuf]) -> Option<PathBuf> {
    if let Ok(output) = tokio::process::Command::new("which")
        .arg(name)
        .output()
        .await
        && output.status.success()
    {
        let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    for path in fallbacks {
        if tokio::fs::metadata(path).await.is_ok() {
            return Some(path.clone());
        }
    }
    None
}

/// Run a tool to completion within `limit`. The child is killed if the
/// deadline passes. A missing program is a `PrerequisiteMissing` error.
pub async fn run_tool<S: AsRef<std::ffi::OsStr>>(
    program: &Path,
    args: &[S],
    limit: Duration,
) -> Result<Output> {
    let label = program
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| program.display().to_string());

    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args).kill_on_drop(true).stdin(std::process::Stdio::null());

    match tokio::time::timeout(limit, cmd.output()).await {
        Ok(Ok(out)) => Ok(out),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(RuntimeError::missing(label).into())
        }
        Ok(Err(e)) => Err(RuntimeError::ProcessLifecycle {
            action: format!("running {}", label),
            source: e,
        }
        .into()),
        Err(_) => Err(RuntimeError::ToolTimeout {
            tool: label,
            secs: limit.as_secs(),
        }
        .into()),
    }
}

/// Like [`run_tool`] but a non-zero exit becomes an error carrying stderr.
pub async fn run_tool_checked<S: AsRef<std::ffi::OsStr>>(
    program: &Path,
    args: &[S],
    limit: Duration,
) -> Result<String> {
    let out = run_tool(program, args, limit).await?;
    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
        anyhow::bail!(
            "{} {} failed ({}): {}",
            program.display(),
            args.iter()
                .map(|a| a.as_ref().to_string_lossy().to_string())
                .collect::<Vec<_>>()
                .join(" "),
            out.status,
            stderr
        );
    }
    Ok(String::from_utf8_lossy(&out.stdout).to_string())
}

// ─── PID files ──────────────────────────────────────────────────────────────

/// Read a PID file, if it exists and holds a number.
pub fn read_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .filter(|pid: &u32| *pid > 0)
}

pub fn write_pid(path: &Path, pid: u32) -> Result<()> {
    write_atomic(path, format!("{}\n", pid).as_bytes())
        .with_context(|| format!("failed to persist PID to {}", path.display()))
}

pub fn remove_pid(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("failed to remove {}: {}", path.display(), e),
    }
}

/// Null-signal liveness check. A process we may not signal still exists.
pub fn is_process_alive(pid: u32) -> bool {
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

pub fn send_signal(pid: u32, signal: Signal) -> Result<()> {
    match kill(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(RuntimeError::ProcessLifecycle {
            action: format!("sending {} to pid {}", signal, pid),
            source: std::io::Error::from(e),
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qemu.pid");
        assert_eq!(read_pid(&path), None);
        write_pid(&path, 4242).unwrap();
        assert_eq!(read_pid(&path), Some(4242));
        remove_pid(&path);
        remove_pid(&path);
        assert!(!path.exists());
    }

    #[test]
    fn test_garbage_pid_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qemu.pid");
        std::fs::write(&path, "not-a-pid").unwrap();
        assert_eq!(read_pid(&path), None);
        std::fs::write(&path, "0").unwrap();
        assert_eq!(read_pid(&path), None);
    }

    #[test]
    fn test_self_is_alive() {
        assert!(is_process_alive(std::process::id()));
    }

    #[tokio::test]
    async fn test_run_tool_missing_program() {
        let err = run_tool(
            Path::new("/nonexistent/winboat-tool"),
            &["--version"],
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RuntimeError>(),
            Some(RuntimeError::PrerequisiteMissing { .. })
        ));
    }

    #[tokio::test]
    async fn test_run_tool_timeout() {
        let err = run_tool(Path::new("sleep"), &["5"], Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RuntimeError>(),
            Some(RuntimeError::ToolTimeout { .. })
        ));
    }
}
