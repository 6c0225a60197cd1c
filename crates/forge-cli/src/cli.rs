//! Clap CLI definitions for Forge.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
Examples:
  forge propose \"print the current unix time\"
  forge learn \"send a message to a webhook\"
  forge list
  forge show tool_1a2b3c4d
  forge run tool_1a2b3c4d
  forge verify ./candidate.wat";

/// Forge: grow new capabilities at run time, verified in a sandbox first.
#[derive(Parser, Debug)]
#[command(name = "forge", version, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Print results as JSON.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Generate, verify and register a capability from a prompt.
    Propose {
        /// What the capability should do.
        prompt: String,
        /// Registry name to use instead of the one derived from the prompt.
        #[arg(long)]
        name: Option<String>,
    },
    /// Search for reference material, then build a capability for the task.
    Learn {
        /// Task to learn.
        task: String,
    },
    /// Invoke an active capability.
    Run {
        /// Capability name.
        name: String,
    },
    /// List active capabilities (and quarantined ones).
    List,
    /// Remove a capability, its source file and its stats.
    Remove {
        /// Capability name.
        name: String,
    },
    /// Show a capability's status, metadata and source.
    Show {
        /// Capability name.
        name: String,
    },
    /// Show execution statistics for a capability.
    Stats {
        /// Capability name.
        name: String,
    },
    /// Run a source file through the sandbox without registering it.
    Verify {
        /// Path to a WAT file.
        file: PathBuf,
    },
    /// Re-materialize every persisted capability from disk.
    Reload,
    /// Sandbox child entry point: run one candidate file.
    #[command(name = "sandbox-exec", hide = true)]
    SandboxExec {
        /// Candidate file.
        file: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_propose_with_name() {
        let cli = Cli::parse_from(["forge", "propose", "say hi", "--name", "greeter"]);
        match cli.command {
            Commands::Propose { prompt, name } => {
                assert_eq!(prompt, "say hi");
                assert_eq!(name.as_deref(), Some("greeter"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_sandbox_exec_and_global_config() {
        let cli = Cli::parse_from(["forge", "sandbox-exec", "/tmp/c.wat", "--config", "/etc/forge.toml"]);
        assert!(matches!(cli.command, Commands::SandboxExec { .. }));
        assert_eq!(cli.config, Some(PathBuf::from("/etc/forge.toml")));
    }

    #[test]
    fn test_cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
