//! Sandbox verification outcome.

use serde::{Deserialize, Serialize};

/// Outcome of running a candidate in the sandbox. Ephemeral, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    /// Exit zero and nothing on stderr.
    pub passed: bool,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error, never mixed with stdout.
    pub stderr: String,
    /// The child was killed for exceeding its deadline.
    pub timed_out: bool,
    /// Exit code, if the child exited normally.
    pub exit_code: Option<i32>,
    /// Wall-clock time spent in the child.
    pub duration_ms: u64,
    /// stdout on pass, otherwise the failure diagnostic.
    pub diagnostic: String,
}

impl VerificationResult {
    /// Classify a finished child.
    ///
    /// Any stderr output or a non-zero exit fails the candidate.
    pub fn from_exit(
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
        duration_ms: u64,
    ) -> Self {
        let clean_exit = exit_code == Some(0);
        let passed = clean_exit && stderr.is_empty();
        let diagnostic = if passed {
            stdout.clone()
        } else if !stderr.is_empty() {
            stderr.clone()
        } else {
            match exit_code {
                Some(code) => format!("Error: process exited with status {code} and no output on stderr."),
                None => "Error: process was terminated by a signal.".to_string(),
            }
        };
        Self {
            passed,
            stdout,
            stderr,
            timed_out: false,
            exit_code,
            duration_ms,
            diagnostic,
        }
    }

    /// The child was killed after `timeout_secs`.
    pub fn timed_out(timeout_secs: u64, duration_ms: u64) -> Self {
        Self {
            passed: false,
            stdout: String::new(),
            stderr: String::new(),
            timed_out: true,
            exit_code: None,
            duration_ms,
            diagnostic: format!("Error: code execution timed out after {timeout_secs} seconds."),
        }
    }

    /// The sandbox itself could not run the candidate.
    pub fn sandbox_error(reason: impl std::fmt::Display) -> Self {
        Self {
            passed: false,
            stdout: String::new(),
            stderr: String::new(),
            timed_out: false,
            exit_code: None,
            duration_ms: 0,
            diagnostic: format!("Sandbox error: {reason}"),
        }
    }
}
