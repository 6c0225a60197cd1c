//! Forge CLI: operator interface to the capability pipeline.
//!
//! Every command boots an in-process kernel over `~/.forge` (or
//! `FORGE_HOME`). `forge sandbox-exec <file>` is the child half of the
//! sandbox verifier and bypasses all of that.

mod cli;

use crate::cli::{Cli, Commands};
use clap::Parser;
use forge_kernel::config::load_config;
use forge_kernel::ForgeKernel;
use forge_runtime::sandbox::{SandboxConfig, SandboxVerifier};
use forge_types::capability::ProposalOutcome;
use forge_types::config::ForgeConfig;
use std::path::Path;
use std::process::ExitCode;

fn init_tracing_stderr(default_level: &str) {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // The sandbox child must keep stderr for guest diagnostics only.
    if let Commands::SandboxExec { file } = &cli.command {
        let code = forge_runtime::runner::execute_file(file).emit();
        return ExitCode::from(code.clamp(0, 255) as u8);
    }

    let config = load_config(cli.config.as_deref());
    init_tracing_stderr(&config.log_level);
    tracing::debug!(command = ?cli.command, home = %config.home_dir.display(), "Dispatching");

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    let ok = runtime.block_on(dispatch(cli.command, config, cli.json));
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn dispatch(command: Commands, config: ForgeConfig, json: bool) -> bool {
    if let Commands::Verify { file } = &command {
        return cmd_verify(&config, file, json).await;
    }

    let kernel = match ForgeKernel::boot(config) {
        Ok(k) => k,
        Err(e) => {
            eprintln!("Failed to boot Forge: {e}");
            return false;
        }
    };

    match command {
        Commands::Propose { prompt, name } => {
            let outcome = match name {
                Some(name) => kernel.propose_named(&prompt, &name).await,
                None => kernel.propose_capability(&prompt).await,
            };
            print_outcome(&outcome, json)
        }
        Commands::Learn { task } => print_outcome(&kernel.learn_skill(&task).await, json),
        Commands::Run { name } => cmd_run(&kernel, &name).await,
        Commands::List => cmd_list(&kernel, json),
        Commands::Remove { name } => {
            if kernel.remove_capability(&name) {
                println!("Removed '{name}'.");
                true
            } else {
                eprintln!("No capability named '{name}'.");
                false
            }
        }
        Commands::Show { name } => cmd_show(&kernel, &name, json),
        Commands::Stats { name } => cmd_stats(&kernel, &name, json),
        Commands::Reload => match kernel.reload() {
            Ok(report) => {
                println!("Loaded {} capability(ies).", report.loaded.len());
                for (name, reason) in &report.failed {
                    println!("  quarantined {name}: {reason}");
                }
                report.failed.is_empty()
            }
            Err(e) => {
                eprintln!("Reload failed: {e}");
                false
            }
        },
        // Both handled before the kernel boots.
        Commands::Verify { .. } | Commands::SandboxExec { .. } => false,
    }
}

fn print_outcome(outcome: &ProposalOutcome, json: bool) -> bool {
    if json {
        print_json(outcome);
        return outcome.success;
    }
    println!("{}", outcome.message);
    println!("  trace: {}", outcome.trace.join(" -> "));
    if let Some(error) = &outcome.error {
        println!("  error: {}", error.trim_end());
    }
    if let Some(source) = &outcome.attempted_source {
        println!("  last attempted source:\n{source}");
    }
    outcome.success
}

async fn cmd_run(kernel: &ForgeKernel, name: &str) -> bool {
    let handle = match kernel.run_capability(name) {
        Ok(h) => h,
        Err(e) => {
            eprintln!("{e}");
            return false;
        }
    };
    match handle.await {
        Ok(Ok(invocation)) => {
            print!("{}", invocation.output);
            if invocation.truncated {
                eprintln!("(output truncated)");
            }
            true
        }
        Ok(Err(e)) => {
            eprintln!("{e}");
            false
        }
        Err(e) => {
            eprintln!("Capability task failed: {e}");
            false
        }
    }
}

fn cmd_list(kernel: &ForgeKernel, json: bool) -> bool {
    let active = kernel.list_capabilities();
    let quarantined = kernel.quarantined();
    if json {
        print_json(&serde_json::json!({
            "active": active,
            "quarantined": quarantined
                .iter()
                .map(|(name, reason)| serde_json::json!({"name": name, "reason": reason}))
                .collect::<Vec<_>>(),
        }));
        return true;
    }
    if active.is_empty() && quarantined.is_empty() {
        println!("No capabilities registered.");
        return true;
    }
    for name in &active {
        println!("{name}");
    }
    for (name, reason) in &quarantined {
        println!("{name} (quarantined: {reason})");
    }
    true
}

fn cmd_show(kernel: &ForgeKernel, name: &str, json: bool) -> bool {
    let Some(capability) = kernel.describe_capability(name) else {
        eprintln!("No capability named '{name}'.");
        return false;
    };
    if json {
        print_json(&capability);
        return true;
    }
    println!("{name} ({})", capability.status);
    for (key, value) in &capability.metadata {
        println!("  {key}: {value}");
    }
    if !capability.source.is_empty() {
        println!("{}", capability.source.trim_end());
    }
    true
}

fn cmd_stats(kernel: &ForgeKernel, name: &str, json: bool) -> bool {
    let Some(stats) = kernel.stats(name) else {
        eprintln!("No runs recorded for '{name}'.");
        return false;
    };
    let suggestion = kernel.suggest_optimization(name);
    if json {
        print_json(&serde_json::json!({ "stats": stats, "suggestion": suggestion }));
        return true;
    }
    println!("{name}");
    println!("  runs:         {}", stats.run_count);
    println!("  avg time:     {:.3}s", stats.avg_time_secs);
    if let Some(last) = stats.last_run {
        println!("  last run:     {}", last.to_rfc3339());
    }
    if let Some(ok) = stats.last_success {
        println!("  last success: {ok}");
    }
    if let Some(hint) = suggestion {
        println!("  hint:         {hint}");
    }
    true
}

async fn cmd_verify(config: &ForgeConfig, file: &Path, json: bool) -> bool {
    let source = match std::fs::read_to_string(file) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Cannot read {}: {e}", file.display());
            return false;
        }
    };
    let sandbox = match SandboxConfig::from_settings(&config.sandbox) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Invalid sandbox settings: {e}");
            return false;
        }
    };
    let result = SandboxVerifier::new(sandbox).run(&source).await;
    if json {
        print_json(&result);
    } else if result.passed {
        println!("PASSED in {}ms", result.duration_ms);
        print!("{}", result.stdout);
    } else {
        println!("FAILED{}", if result.timed_out { " (timed out)" } else { "" });
        println!("{}", result.diagnostic.trim_end());
    }
    result.passed
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => eprintln!("Failed to serialize output: {e}"),
    }
}
