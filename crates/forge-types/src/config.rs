//! Configuration for the Forge pipeline, deserialized from `config.toml`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForgeConfig {
    /// Root directory for persisted state.
    pub home_dir: PathBuf,
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Sandbox verifier settings.
    pub sandbox: SandboxSettings,
    /// In-process runtime limits for active capabilities.
    pub runtime: RuntimeSettings,
    /// Text generation collaborator.
    pub generator: GeneratorSettings,
    /// Context search collaborator.
    pub search: SearchSettings,
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            home_dir: default_home_dir(),
            log_level: "info".to_string(),
            sandbox: SandboxSettings::default(),
            runtime: RuntimeSettings::default(),
            generator: GeneratorSettings::default(),
            search: SearchSettings::default(),
        }
    }
}

impl ForgeConfig {
    /// Directory holding one source file per capability plus the index.
    pub fn capabilities_dir(&self) -> PathBuf {
        self.home_dir.join("capabilities")
    }
}

/// Sandbox verifier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    /// Wall-clock limit for one candidate run.
    pub timeout_secs: u64,
    /// Program that runs a candidate file. `None` re-executes the current binary.
    pub interpreter: Option<String>,
    /// Arguments placed before the candidate path.
    pub interpreter_args: Vec<String>,
    /// Extra environment variables passed through to the child.
    pub allowed_env_vars: Vec<String>,
    /// Delay between SIGTERM and SIGKILL on timeout.
    pub kill_grace_ms: u64,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            interpreter: None,
            interpreter_args: Vec::new(),
            allowed_env_vars: Vec::new(),
            kill_grace_ms: 200,
        }
    }
}

/// Limits applied when an active capability runs inside the host process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Instruction budget per invocation. 0 = unlimited.
    pub fuel_limit: u64,
    /// Wall-clock limit per invocation. 0 = unlimited.
    pub timeout_secs: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            fuel_limit: 50_000_000,
            timeout_secs: 30,
        }
    }
}

/// OpenAI-compatible chat completion endpoint used to write and repair capabilities.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorSettings {
    /// Base URL, e.g. `http://localhost:11434/v1` for Ollama.
    pub base_url: String,
    /// Model name.
    pub model: String,
    /// Environment variable holding the API key. Empty = no auth header.
    pub api_key_env: String,
    /// Request timeout.
    pub timeout_secs: u64,
    /// Sampling temperature.
    pub temperature: f32,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".to_string(),
            model: "qwen2.5-coder".to_string(),
            api_key_env: String::new(),
            timeout_secs: 120,
            temperature: 0.2,
        }
    }
}

/// Reference-material search used by the learn-a-skill workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    /// Disable to make learn-a-skill fail fast without network access.
    pub enabled: bool,
    /// Results kept per query.
    pub max_results: usize,
    /// Request timeout.
    pub timeout_secs: u64,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_results: 3,
            timeout_secs: 15,
        }
    }
}

/// `~/.forge`, or the temp dir when no home directory is known.
pub fn default_home_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".forge")
}
