//! Sandbox verifier: runs candidate source in a separate OS process.
//!
//! The candidate is written to a fresh `forge-candidate-*.wat` temp file and
//! handed to the configured interpreter as its last argument. By default the
//! interpreter is the current executable invoked as `forge sandbox-exec`.
//!
//! The child shares no memory or file handles with the host. The only
//! isolation is the OS process boundary plus a scrubbed environment; there
//! is no CPU, memory, filesystem or network restriction beyond the deadline.

use crate::subprocess_sandbox::{
    kill_and_reap, kill_process_group, sandbox_command, validate_executable_path,
};
use async_trait::async_trait;
use forge_types::config::SandboxSettings;
use forge_types::verification::VerificationResult;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};

/// Subcommand the default interpreter is re-executed with.
pub const SANDBOX_EXEC_SUBCOMMAND: &str = "sandbox-exec";

/// Anything that can judge candidate source.
#[async_trait]
pub trait CodeVerifier: Send + Sync {
    /// Run `source` in isolation and classify the outcome.
    async fn verify(&self, source: &str) -> VerificationResult;
}

/// Resolved sandbox configuration.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Program that runs the candidate file.
    pub program: PathBuf,
    /// Arguments placed before the candidate path.
    pub args: Vec<String>,
    /// Wall-clock limit.
    pub timeout: Duration,
    /// Extra environment variables passed through.
    pub allowed_env_vars: Vec<String>,
    /// Delay between SIGTERM and SIGKILL.
    pub kill_grace_ms: u64,
}

impl SandboxConfig {
    /// Resolve settings; a missing interpreter means "this binary, `sandbox-exec`".
    pub fn from_settings(settings: &SandboxSettings) -> Result<Self, String> {
        let (program, args) = match &settings.interpreter {
            Some(interpreter) => {
                validate_executable_path(interpreter)?;
                (
                    PathBuf::from(interpreter),
                    settings.interpreter_args.clone(),
                )
            }
            None => {
                let exe = std::env::current_exe()
                    .map_err(|e| format!("cannot locate current executable: {e}"))?;
                (exe, vec![SANDBOX_EXEC_SUBCOMMAND.to_string()])
            }
        };
        Ok(Self {
            program,
            args,
            timeout: Duration::from_secs(settings.timeout_secs.max(1)),
            allowed_env_vars: settings.allowed_env_vars.clone(),
            kill_grace_ms: settings.kill_grace_ms,
        })
    }
}

/// Process-isolated verifier.
#[derive(Debug, Clone)]
pub struct SandboxVerifier {
    config: SandboxConfig,
}

impl SandboxVerifier {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Run a candidate. Never fails: sandbox errors become a failed result.
    pub async fn run(&self, source: &str) -> VerificationResult {
        // Dropping the NamedTempFile deletes it, on every path out of here.
        let candidate = match write_candidate(source) {
            Ok(file) => file,
            Err(e) => return VerificationResult::sandbox_error(format!("temp file: {e}")),
        };
        let result = self.execute(candidate.path().to_path_buf()).await;
        if result.passed {
            info!(duration_ms = result.duration_ms, "Sandbox test passed");
        } else {
            warn!(
                timed_out = result.timed_out,
                exit_code = ?result.exit_code,
                "Sandbox test failed"
            );
        }
        result
    }

    async fn execute(&self, path: PathBuf) -> VerificationResult {
        let mut cmd = tokio::process::Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .arg(&path)
            .current_dir(std::env::temp_dir())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        sandbox_command(&mut cmd, &self.config.allowed_env_vars);

        debug!(
            program = %self.config.program.display(),
            candidate = %path.display(),
            "Spawning sandbox child"
        );

        let started = Instant::now();
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return VerificationResult::sandbox_error(format!(
                    "failed to spawn {}: {e}",
                    self.config.program.display()
                ))
            }
        };

        // The deadline covers the pipes too: a grandchild holding them open
        // must not keep us waiting after the direct child exits.
        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let outcome = tokio::time::timeout(self.config.timeout, async {
            tokio::join!(child.wait(), read_pipe(stdout), read_pipe(stderr))
        })
        .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok((Ok(status), stdout, stderr)) => {
                VerificationResult::from_exit(status.code(), stdout, stderr, duration_ms)
            }
            Ok((Err(e), _, _)) => {
                kill_and_reap(&mut child, self.config.kill_grace_ms).await;
                VerificationResult::sandbox_error(format!("Wait error: {e}"))
            }
            Err(_) => {
                warn!("Sandbox child timed out after {:?}, killing", self.config.timeout);
                kill_and_reap(&mut child, self.config.kill_grace_ms).await;
                VerificationResult::timed_out(self.config.timeout.as_secs(), duration_ms)
            }
        };

        // Nothing the candidate started may outlive the verification.
        if let Some(pid) = pid {
            kill_process_group(pid).await;
        }
        result
    }
}

#[async_trait]
impl CodeVerifier for SandboxVerifier {
    async fn verify(&self, source: &str) -> VerificationResult {
        self.run(source).await
    }
}

fn write_candidate(source: &str) -> std::io::Result<tempfile::NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("forge-candidate-")
        .suffix(".wat")
        .tempfile()?;
    file.write_all(source.as_bytes())?;
    file.flush()?;
    Ok(file)
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> String {
    let Some(mut pipe) = pipe else {
        return String::new();
    };
    let mut buf = Vec::new();
    if let Err(e) = pipe.read_to_end(&mut buf).await {
        warn!("Sandbox pipe read failed: {e}");
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    /// Runs candidates as shell scripts, which exercises the process
    /// contract without needing the `forge` binary.
    fn sh_verifier(timeout_secs: u64) -> SandboxVerifier {
        SandboxVerifier::new(SandboxConfig {
            program: PathBuf::from("sh"),
            args: Vec::new(),
            timeout: Duration::from_secs(timeout_secs),
            allowed_env_vars: Vec::new(),
            kill_grace_ms: 100,
        })
    }

    #[tokio::test]
    async fn test_clean_run_passes_with_stdout() {
        let result = sh_verifier(10).verify("echo ok").await;
        assert!(result.passed, "{result:?}");
        assert_eq!(result.diagnostic, "ok\n");
        assert_eq!(result.stdout, "ok\n");
        assert_eq!(result.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_stderr_fails_candidate() {
        let result = sh_verifier(10)
            .verify("echo partial; echo 'ValueError: boom' >&2; exit 1")
            .await;
        assert!(!result.passed);
        assert!(result.diagnostic.contains("ValueError: boom"));
        assert_eq!(result.stdout, "partial\n");
        assert_eq!(result.exit_code, Some(1));
    }

    #[tokio::test]
    async fn test_stderr_with_zero_exit_still_fails() {
        let result = sh_verifier(10).verify("echo warn >&2").await;
        assert!(!result.passed);
        assert_eq!(result.diagnostic, "warn\n");
    }

    #[tokio::test]
    async fn test_silent_nonzero_exit_gets_synthesized_diagnostic() {
        let result = sh_verifier(10).verify("exit 4").await;
        assert!(!result.passed);
        assert!(result.diagnostic.contains("status 4"));
    }

    #[tokio::test]
    async fn test_timeout_kills_child() {
        let marker = tempfile::NamedTempFile::new().unwrap();
        let marker_path = marker.path().display().to_string();
        drop(marker);

        // Write our pid so we can check the process is gone afterwards.
        let script = format!("echo $$ > {marker_path}; sleep 20");
        let started = Instant::now();
        let result = sh_verifier(1).verify(&script).await;
        assert!(!result.passed);
        assert!(result.timed_out);
        assert!(result.diagnostic.contains("timed out after 1 seconds"));
        assert!(started.elapsed() < Duration::from_secs(10));

        let pid = std::fs::read_to_string(&marker_path).unwrap();
        let _ = std::fs::remove_file(&marker_path);
        assert!(!process_alive(pid.trim()), "sandbox child {pid} still running");
    }

    /// Whether `pid` is still a live (non-zombie) process.
    fn process_alive(pid: &str) -> bool {
        let stat = std::path::Path::new("/proc").join(pid).join("stat");
        if std::path::Path::new("/proc/self").exists() {
            return match std::fs::read_to_string(stat) {
                Ok(text) => !text
                    .rsplit(')')
                    .next()
                    .is_some_and(|rest| rest.trim_start().starts_with('Z')),
                Err(_) => false,
            };
        }
        std::process::Command::new("kill")
            .args(["-0", pid])
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    async fn wait_until_gone(pid: &str) -> bool {
        for _ in 0..40 {
            if !process_alive(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_background_job_holding_pipes_hits_deadline() {
        let started = Instant::now();
        let result = sh_verifier(1).verify("sleep 6 & echo hi").await;
        assert!(started.elapsed() < Duration::from_secs(5), "took {:?}", started.elapsed());
        assert!(!result.passed);
        assert!(result.timed_out);
    }

    #[tokio::test]
    async fn test_background_job_killed_after_clean_exit() {
        let marker = tempfile::NamedTempFile::new().unwrap();
        let marker_path = marker.path().display().to_string();

        let script = format!("sleep 30 >/dev/null 2>&1 & echo $! > {marker_path}; echo ok");
        let result = sh_verifier(10).verify(&script).await;
        assert!(result.passed, "{result:?}");
        assert_eq!(result.stdout, "ok\n");

        let pid = std::fs::read_to_string(&marker_path).unwrap();
        assert!(
            wait_until_gone(pid.trim()).await,
            "background job {pid} outlived verification"
        );
    }

    #[tokio::test]
    async fn test_candidate_file_is_removed() {
        let result = sh_verifier(10).verify("echo \"$0\"").await;
        assert!(result.passed);
        let path = result.stdout.trim();
        assert!(path.contains("forge-candidate-"));
        assert!(!std::path::Path::new(path).exists());
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_reported() {
        let verifier = SandboxVerifier::new(SandboxConfig {
            program: PathBuf::from("/nonexistent/forge-interpreter"),
            args: Vec::new(),
            timeout: Duration::from_secs(1),
            allowed_env_vars: Vec::new(),
            kill_grace_ms: 100,
        });
        let result = verifier.verify("(module)").await;
        assert!(!result.passed);
        assert!(result.diagnostic.starts_with("Sandbox error:"));
    }

    #[test]
    fn test_default_interpreter_is_self() {
        let config = SandboxConfig::from_settings(&SandboxSettings::default()).unwrap();
        assert_eq!(config.args, vec![SANDBOX_EXEC_SUBCOMMAND.to_string()]);
        assert_eq!(config.timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_interpreter_traversal_rejected() {
        let settings = SandboxSettings {
            interpreter: Some("../../bin/sh".into()),
            ..Default::default()
        };
        assert!(SandboxConfig::from_settings(&settings).is_err());
    }
}
