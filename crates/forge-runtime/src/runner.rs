//! Child side of the sandbox: run one candidate file and report through
//! stdout, stderr and the exit code.
//!
//! Contract with [`crate::sandbox::SandboxVerifier`]:
//! - output written through `forge.print` goes to stdout;
//! - any failure (compile, missing entry point, trap, `forge.fail`) writes
//!   its message to stderr and exits 1;
//! - success exits 0 with nothing on stderr.
//!
//! No limits are applied here; the parent owns the deadline.

use crate::loader::{DynamicLoader, LoadError, LoaderConfig};
use std::io::Write;
use std::path::Path;

/// Name the candidate is loaded under inside the child.
const CANDIDATE_NAME: &str = "candidate";

/// Outcome of a sandboxed run, ready to be written to the process streams.
#[derive(Debug)]
pub struct RunReport {
    pub stdout: String,
    pub error: Option<String>,
}

impl RunReport {
    /// Process exit code for this report.
    pub fn exit_code(&self) -> i32 {
        if self.error.is_some() {
            1
        } else {
            0
        }
    }

    /// Write stdout and stderr and return the exit code.
    pub fn emit(&self) -> i32 {
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(self.stdout.as_bytes());
        let _ = out.flush();
        if let Some(error) = &self.error {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{error}");
            let _ = err.flush();
        }
        self.exit_code()
    }
}

/// Load `source` into a throwaway loader and call its entry point once.
pub fn execute_source(source: &str) -> RunReport {
    let loader = match DynamicLoader::with_config(LoaderConfig::unbounded()) {
        Ok(loader) => loader,
        Err(e) => return failed(String::new(), e),
    };
    let unit = match loader.compile(CANDIDATE_NAME, source) {
        Ok(unit) => unit,
        Err(e) => return failed(String::new(), e),
    };
    match loader.invoke_blocking(&unit) {
        Ok(invocation) => RunReport {
            stdout: invocation.output,
            error: None,
        },
        Err(failure) => failed(failure.partial_output, failure.error),
    }
}

/// Read a candidate file and execute it.
pub fn execute_file(path: &Path) -> RunReport {
    match std::fs::read_to_string(path) {
        Ok(source) => execute_source(&source),
        Err(e) => RunReport {
            stdout: String::new(),
            error: Some(format!("Error: cannot read {}: {e}", path.display())),
        },
    }
}

fn failed(stdout: String, error: LoadError) -> RunReport {
    RunReport {
        stdout,
        error: Some(format!("Error: {error}")),
    }
}
