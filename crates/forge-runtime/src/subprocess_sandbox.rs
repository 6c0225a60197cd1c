//! Subprocess isolation helpers for the sandbox verifier.
//!
//! Candidate code runs in a child process that must not inherit secrets
//! from the host environment, and must be killed together with anything it
//! spawned when it overruns its deadline.

use std::path::Path;
use std::time::Duration;

/// Environment variables considered safe to inherit on all platforms.
pub const SAFE_ENV_VARS: &[&str] = &[
    "PATH", "HOME", "TMPDIR", "TMP", "TEMP", "LANG", "LC_ALL", "TERM",
];

/// Additional environment variables considered safe on Windows.
#[cfg(windows)]
pub const SAFE_ENV_VARS_WINDOWS: &[&str] = &[
    "USERPROFILE",
    "SYSTEMROOT",
    "APPDATA",
    "LOCALAPPDATA",
    "COMSPEC",
    "WINDIR",
    "PATHEXT",
];

/// Maximum grace period between SIGTERM and SIGKILL.
pub const MAX_GRACE_MS: u64 = 10_000;

/// Clear the child's environment and re-add only the allow-list plus
/// `allowed_env_vars`. Variables unset in the host are skipped.
pub fn sandbox_command(cmd: &mut tokio::process::Command, allowed_env_vars: &[String]) {
    cmd.env_clear();

    for var in SAFE_ENV_VARS {
        if let Ok(val) = std::env::var(var) {
            cmd.env(var, val);
        }
    }

    #[cfg(windows)]
    for var in SAFE_ENV_VARS_WINDOWS {
        if let Ok(val) = std::env::var(var) {
            cmd.env(var, val);
        }
    }

    for var in allowed_env_vars {
        if let Ok(val) = std::env::var(var) {
            cmd.env(var, val);
        }
    }

    // Own process group, so a timeout kill reaches grandchildren too.
    #[cfg(unix)]
    cmd.process_group(0);

    cmd.kill_on_drop(true);
}

/// Reject interpreter paths containing `..` components.
pub fn validate_executable_path(path: &str) -> Result<(), String> {
    let p = Path::new(path);
    for component in p.components() {
        if let std::path::Component::ParentDir = component {
            return Err(format!(
                "executable path '{path}' contains '..' component which is not allowed"
            ));
        }
    }
    Ok(())
}

/// Kill a child and everything in its process group, then reap it.
///
/// SIGTERM first, SIGKILL once `grace_ms` has passed. Returns once the
/// child has been waited on, so no zombie is left behind.
pub async fn kill_and_reap(child: &mut tokio::process::Child, grace_ms: u64) {
    let grace = Duration::from_millis(grace_ms.min(MAX_GRACE_MS));

    #[cfg(unix)]
    if let Some(pid) = child.id() {
        signal_group(pid, "-TERM").await;
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            // Leader exited; clear out stragglers in the group.
            signal_group(pid, "-KILL").await;
            return;
        }
        tracing::warn!(pid, "Sandbox child ignored SIGTERM, sending SIGKILL");
        signal_group(pid, "-KILL").await;
    }

    #[cfg(not(unix))]
    let _ = grace;

    if let Err(e) = child.start_kill() {
        tracing::debug!("start_kill after group kill: {e}");
    }
    if let Err(e) = child.wait().await {
        tracing::warn!("Failed to reap sandbox child: {e}");
    }
}

#[cfg(unix)]
async fn signal_group(pid: u32, signal: &str) {
    let result = tokio::process::Command::new("kill")
        .args([signal, "--", &format!("-{pid}")])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await;
    if let Err(e) = result {
        tracing::debug!(pid, signal, "kill command failed: {e}");
    }
}

/// SIGKILL whatever is left in the process group led by `pid`.
///
/// Safe to call after the leader has been reaped; the group lives on while
/// any member does.
pub async fn kill_process_group(pid: u32) {
    #[cfg(unix)]
    signal_group(pid, "-KILL").await;

    #[cfg(not(unix))]
    let _ = pid;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_path() {
        assert!(validate_executable_path("forge").is_ok());
        assert!(validate_executable_path("/usr/local/bin/forge").is_ok());
        assert!(validate_executable_path("../bin/evil").is_err());
        assert!(validate_executable_path("/usr/../etc/passwd").is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_env_is_cleared() {
        std::env::set_var("FORGE_TEST_SECRET", "hunter2");
        let mut cmd = tokio::process::Command::new("sh");
        cmd.args(["-c", "echo \"${FORGE_TEST_SECRET:-unset}\""]);
        sandbox_command(&mut cmd, &[]);
        let out = cmd.output().await.unwrap();
        assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "unset");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_allowed_var_passes_through() {
        std::env::set_var("FORGE_TEST_ALLOWED", "visible");
        let mut cmd = tokio::process::Command::new("sh");
        cmd.args(["-c", "echo \"${FORGE_TEST_ALLOWED:-unset}\""]);
        sandbox_command(&mut cmd, &["FORGE_TEST_ALLOWED".to_string()]);
        let out = cmd.output().await.unwrap();
        assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "visible");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_and_reap_stops_running_child() {
        let mut cmd = tokio::process::Command::new("sleep");
        cmd.arg("30");
        sandbox_command(&mut cmd, &[]);
        let mut child = cmd.spawn().unwrap();
        kill_and_reap(&mut child, 100).await;
        // Already reaped: try_wait returns the cached status.
        assert!(child.try_wait().unwrap().is_some());
    }
}
