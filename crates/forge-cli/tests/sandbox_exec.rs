//! End-to-end checks against the real `forge` binary as the sandbox child.

use async_trait::async_trait;
use forge_kernel::ForgeKernel;
use forge_runtime::context_search::ContextSearch;
use forge_runtime::generator::{GeneratorError, PromptContext, TextGenerator};
use forge_runtime::sandbox::{CodeVerifier, SandboxConfig, SandboxVerifier, SANDBOX_EXEC_SUBCOMMAND};
use forge_types::config::ForgeConfig;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const FORGE: &str = env!("CARGO_BIN_EXE_forge");

const PRINT_OK: &str = r#"(module
  (import "forge" "print" (func $print (param i32 i32)))
  (memory (export "memory") 1)
  (data (i32.const 16) "ok\n")
  (func (export "run") (call $print (i32.const 16) (i32.const 3))))"#;

const RAISES: &str = r#"(module
  (import "forge" "fail" (func $fail (param i32 i32)))
  (memory (export "memory") 1)
  (data (i32.const 16) "ZeroDivisionError: division by zero")
  (func (export "run") (call $fail (i32.const 16) (i32.const 35))))"#;

const SPINS: &str = r#"(module (func (export "run") (loop $l (br $l))))"#;

const NO_ENTRY: &str = r#"(module (func (export "main")))"#;

fn verifier(timeout_secs: u64) -> SandboxVerifier {
    SandboxVerifier::new(SandboxConfig {
        program: PathBuf::from(FORGE),
        args: vec![SANDBOX_EXEC_SUBCOMMAND.to_string()],
        timeout: Duration::from_secs(timeout_secs),
        allowed_env_vars: Vec::new(),
        kill_grace_ms: 100,
    })
}

#[tokio::test]
async fn test_clean_module_passes_with_stdout() {
    let result = verifier(10).verify(PRINT_OK).await;
    assert!(result.passed, "{result:?}");
    assert_eq!(result.diagnostic, "ok\n");
    assert!(result.stderr.is_empty());
}

#[tokio::test]
async fn test_raising_module_fails_with_its_message() {
    let result = verifier(10).verify(RAISES).await;
    assert!(!result.passed);
    assert!(result.diagnostic.contains("ZeroDivisionError: division by zero"));
    assert_eq!(result.exit_code, Some(1));
}

#[tokio::test]
async fn test_syntax_error_and_missing_entry_fail() {
    let result = verifier(10).verify("(module (func").await;
    assert!(!result.passed);
    assert!(result.diagnostic.contains("Compilation failed"));

    let result = verifier(10).verify(NO_ENTRY).await;
    assert!(!result.passed);
    assert!(result.diagnostic.contains("`run`"));
}

#[tokio::test]
async fn test_spinning_module_is_killed_at_deadline() {
    let started = Instant::now();
    let result = verifier(1).verify(SPINS).await;
    assert!(!result.passed);
    assert!(result.timed_out);
    assert!(result.diagnostic.contains("timed out"));
    assert!(started.elapsed() < Duration::from_secs(8));
}

/// Hands out canned replies in order, then repeats the last one.
struct Script(Mutex<Vec<&'static str>>);

impl Script {
    fn new(replies: &[&'static str]) -> Self {
        let mut replies = replies.to_vec();
        replies.reverse();
        Self(Mutex::new(replies))
    }

    fn next(&self) -> Result<String, GeneratorError> {
        let mut replies = self.0.lock().unwrap();
        let reply = if replies.len() > 1 {
            replies.pop()
        } else {
            replies.last().copied()
        };
        reply.map(String::from).ok_or(GeneratorError::Empty)
    }
}

#[async_trait]
impl TextGenerator for Script {
    async fn generate(&self, _context: &PromptContext) -> Result<String, GeneratorError> {
        self.next()
    }

    async fn repair(
        &self,
        _failing_source: &str,
        _diagnostic: &str,
        _context: &PromptContext,
    ) -> Result<String, GeneratorError> {
        self.next()
    }
}

struct NoSearch;

#[async_trait]
impl ContextSearch for NoSearch {
    async fn query(&self, _text: &str) -> Result<String, String> {
        Err("offline".into())
    }
}

fn boot(home: &std::path::Path, script: &[&'static str]) -> ForgeKernel {
    let config = ForgeConfig {
        home_dir: home.to_path_buf(),
        ..Default::default()
    };
    ForgeKernel::boot_with(
        config,
        Arc::new(verifier(10)),
        Arc::new(Script::new(script)),
        Arc::new(NoSearch),
    )
    .unwrap()
}

#[tokio::test]
async fn test_pipeline_repairs_then_survives_restart() {
    let home = tempfile::tempdir().unwrap();
    let name = {
        let kernel = boot(home.path(), &[RAISES, PRINT_OK]);
        let outcome = kernel.propose_capability("print ok").await;
        assert!(outcome.success, "{outcome:?}");
        assert_eq!(outcome.repair_attempts, 1);
        outcome.name
    };

    let kernel = boot(home.path(), &[PRINT_OK]);
    assert_eq!(kernel.list_capabilities(), vec![name.clone()]);
    let out = kernel
        .run_capability(&name)
        .unwrap()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(out.output, "ok\n");
}

#[tokio::test]
async fn test_pipeline_gives_up_after_one_repair() {
    let home = tempfile::tempdir().unwrap();
    let kernel = boot(home.path(), &[RAISES]);
    let outcome = kernel.propose_capability("always broken").await;
    assert!(!outcome.success);
    assert_eq!(outcome.repair_attempts, 1);
    assert!(outcome.error.unwrap().contains("ZeroDivisionError"));
    assert_eq!(outcome.attempted_source.as_deref(), Some(RAISES));
    assert!(kernel.list_capabilities().is_empty());
}

#[test]
fn test_cli_verify_and_list() {
    let home = tempfile::tempdir().unwrap();
    let candidate = home.path().join("candidate.wat");
    std::fs::write(&candidate, PRINT_OK).unwrap();

    let output = Command::new(FORGE)
        .env("FORGE_HOME", home.path())
        .arg("verify")
        .arg(&candidate)
        .output()
        .unwrap();
    assert!(output.status.success(), "{output:?}");
    assert!(String::from_utf8_lossy(&output.stdout).contains("PASSED"));

    let output = Command::new(FORGE)
        .env("FORGE_HOME", home.path())
        .args(["list", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{output:?}");
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["active"], serde_json::json!([]));

    let output = Command::new(FORGE)
        .env("FORGE_HOME", home.path())
        .args(["show", "tool_00000000"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("No capability named"));
}

#[test]
fn test_sandbox_exec_writes_only_guest_output() {
    let dir = tempfile::tempdir().unwrap();
    let candidate = dir.path().join("raise.wat");
    std::fs::write(&candidate, RAISES).unwrap();

    let output = Command::new(FORGE)
        .env("RUST_LOG", "trace")
        .arg(SANDBOX_EXEC_SUBCOMMAND)
        .arg(&candidate)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_eq!(stderr.trim(), "Error: ZeroDivisionError: division by zero");
}
