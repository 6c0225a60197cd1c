//! ForgeKernel: assembles the pipeline and exposes the caller-facing API.

use crate::error::{KernelError, KernelResult};
use crate::synthesizer::{should_attempt_learning, CapabilitySynthesizer, SynthesisRequest};
use async_trait::async_trait;
use forge_registry::{CapabilityRegistry, ReloadReport};
use forge_runtime::context_search::{ContextSearch, DuckDuckGoSearch};
use forge_runtime::drivers::OpenAiCompatGenerator;
use forge_runtime::generator::TextGenerator;
use forge_runtime::loader::{DynamicLoader, Invocation, LoaderConfig};
use forge_runtime::sandbox::{CodeVerifier, SandboxConfig, SandboxVerifier};
use forge_types::capability::{Capability, CapabilityStats, ProposalOutcome};
use forge_types::config::ForgeConfig;
use forge_types::error::{ForgeError, ForgeResult};
use forge_types::verification::VerificationResult;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Stand-in search when `search.enabled = false`.
struct DisabledSearch;

#[async_trait]
impl ContextSearch for DisabledSearch {
    async fn query(&self, _text: &str) -> Result<String, String> {
        Err("context search is disabled in config".to_string())
    }
}

/// The Forge kernel.
pub struct ForgeKernel {
    config: ForgeConfig,
    registry: Arc<CapabilityRegistry>,
    verifier: Arc<dyn CodeVerifier>,
    synthesizer: CapabilitySynthesizer,
}

impl ForgeKernel {
    /// Boot with the built-in sandbox, generator and search drivers.
    pub fn boot(config: ForgeConfig) -> KernelResult<Self> {
        let sandbox = SandboxConfig::from_settings(&config.sandbox)
            .map_err(|e| KernelError::BootFailed(format!("sandbox: {e}")))?;
        let verifier: Arc<dyn CodeVerifier> = Arc::new(SandboxVerifier::new(sandbox));
        let generator: Arc<dyn TextGenerator> =
            Arc::new(OpenAiCompatGenerator::new(config.generator.clone()));
        let search: Arc<dyn ContextSearch> = if config.search.enabled {
            Arc::new(DuckDuckGoSearch::new(&config.search))
        } else {
            Arc::new(DisabledSearch)
        };
        Self::boot_with(config, verifier, generator, search)
    }

    /// Boot with caller-supplied collaborators.
    ///
    /// Opens the registry and re-materializes every persisted capability;
    /// entries that fail are quarantined, not fatal.
    pub fn boot_with(
        config: ForgeConfig,
        verifier: Arc<dyn CodeVerifier>,
        generator: Arc<dyn TextGenerator>,
        search: Arc<dyn ContextSearch>,
    ) -> KernelResult<Self> {
        info!(home = %config.home_dir.display(), "Booting Forge kernel");

        let loader = DynamicLoader::with_config(LoaderConfig::from(&config.runtime))
            .map_err(|e| KernelError::BootFailed(format!("loader: {e}")))?;
        let registry = CapabilityRegistry::open(config.capabilities_dir(), Arc::new(loader))
            .map_err(|e| KernelError::BootFailed(format!("registry: {e}")))?;
        let report = registry
            .reload_all()
            .map_err(|e| KernelError::BootFailed(format!("registry reload: {e}")))?;
        for (name, reason) in &report.failed {
            warn!(capability = %name, "Capability quarantined at boot: {reason}");
        }
        info!(
            active = report.loaded.len(),
            quarantined = report.failed.len(),
            "Forge kernel booted"
        );

        let registry = Arc::new(registry);
        let synthesizer =
            CapabilitySynthesizer::new(registry.clone(), verifier.clone(), generator, search);
        Ok(Self {
            config,
            registry,
            verifier,
            synthesizer,
        })
    }

    pub fn config(&self) -> &ForgeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    /// Direct forge from a free-form task description.
    pub async fn propose_capability(&self, task: &str) -> ProposalOutcome {
        self.synthesizer
            .synthesize(SynthesisRequest::forge(task))
            .await
    }

    /// Direct forge into an explicitly named slot.
    pub async fn propose_named(&self, task: &str, name: &str) -> ProposalOutcome {
        self.synthesizer
            .synthesize(SynthesisRequest::Forge {
                prompt: task.to_string(),
                name: Some(name.to_string()),
            })
            .await
    }

    /// Learn-a-skill: search for reference material, then forge.
    pub async fn learn_skill(&self, task: &str) -> ProposalOutcome {
        self.synthesizer
            .synthesize(SynthesisRequest::learn(task))
            .await
    }

    /// Pick learn-a-skill or direct forge for a request nothing can serve yet.
    pub async fn acquire(&self, request: &str) -> ProposalOutcome {
        if should_attempt_learning(request) {
            self.learn_skill(request).await
        } else {
            self.propose_capability(request).await
        }
    }

    /// Start the active unit for `name` on its own task.
    ///
    /// The handle resolves to the invocation or a `ForgeError::Runtime`.
    /// A failing run is recorded in the stats; the capability stays
    /// registered. Must be called from within a Tokio runtime.
    pub fn run_capability(&self, name: &str) -> ForgeResult<JoinHandle<ForgeResult<Invocation>>> {
        if self.registry.get(name).is_none() {
            return Err(ForgeError::NotFound(name.to_string()));
        }
        let unit = self
            .registry
            .loader()
            .get(name)
            .ok_or_else(|| ForgeError::NotFound(name.to_string()))?;

        let registry = self.registry.clone();
        let name = name.to_string();
        Ok(tokio::spawn(async move {
            let started = Instant::now();
            let result = registry.loader().invoke(unit).await;
            let elapsed = started.elapsed().as_secs_f64();
            let stats_registry = registry.clone();
            let stats_name = name.clone();
            let success = result.is_ok();
            // Stats are written to disk; keep that off the async workers.
            if let Err(e) = tokio::task::spawn_blocking(move || {
                stats_registry.record_run(&stats_name, elapsed, success)
            })
            .await
            {
                warn!(capability = %name, "Failed to record run stats: {e}");
            }
            match result {
                Ok(invocation) => Ok(invocation),
                Err(failure) => {
                    warn!(capability = %name, "Capability run failed: {failure}");
                    Err(ForgeError::Runtime {
                        name,
                        reason: failure.to_string(),
                    })
                }
            }
        }))
    }

    /// Active capability names, sorted.
    pub fn list_capabilities(&self) -> Vec<String> {
        self.registry.list()
    }

    /// Remove a capability. `false` if it was unknown or could not be removed.
    pub fn remove_capability(&self, name: &str) -> bool {
        match self.registry.remove(name) {
            Ok(removed) => removed,
            Err(e) => {
                warn!(capability = %name, "Failed to remove capability: {e}");
                false
            }
        }
    }

    /// Source, metadata and current status of any indexed capability.
    pub fn describe_capability(&self, name: &str) -> Option<Capability> {
        self.registry.capability(name)
    }

    pub fn stats(&self, name: &str) -> Option<CapabilityStats> {
        self.registry.stats(name)
    }

    pub fn suggest_optimization(&self, name: &str) -> Option<String> {
        self.registry.suggest_optimization(name)
    }

    /// Names that failed to reload, with reasons.
    pub fn quarantined(&self) -> Vec<(String, String)> {
        self.registry.quarantined()
    }

    /// Re-materialize everything from disk.
    pub fn reload(&self) -> KernelResult<ReloadReport> {
        self.registry
            .reload_all()
            .map_err(|e| KernelError::Forge(e.into()))
    }

    /// Run source through the sandbox without registering it.
    pub async fn verify_source(&self, source: &str) -> VerificationResult {
        self.verifier.verify(source).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthesizer::direct_name;
    use crate::synthesizer::testing::*;

    fn config(home: &std::path::Path) -> ForgeConfig {
        ForgeConfig {
            home_dir: home.to_path_buf(),
            ..Default::default()
        }
    }

    fn kernel(home: &std::path::Path, generator: ScriptedGenerator) -> ForgeKernel {
        ForgeKernel::boot_with(
            config(home),
            Arc::new(InProcessVerifier::new()),
            Arc::new(generator),
            Arc::new(FixedSearch(Ok("reference".into()))),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_propose_and_run() {
        let home = tempfile::tempdir().unwrap();
        let kernel = kernel(home.path(), ScriptedGenerator::always(PRINT_OK));

        let outcome = kernel.propose_capability("say ok").await;
        assert!(outcome.success, "{outcome:?}");
        assert_eq!(kernel.list_capabilities(), vec![outcome.name.clone()]);

        let handle = kernel.run_capability(&outcome.name).unwrap();
        let invocation = handle.await.unwrap().unwrap();
        assert_eq!(invocation.output, "ok\n");

        let stats = kernel.stats(&outcome.name).unwrap();
        assert_eq!(stats.run_count, 1);
        assert_eq!(stats.last_success, Some(true));

        let described = kernel.describe_capability(&outcome.name).unwrap();
        assert_eq!(described.status, forge_types::capability::CapabilityStatus::Active);
        assert_eq!(described.metadata["origin"], "forge");
    }

    #[tokio::test]
    async fn test_run_unknown_is_not_found() {
        let home = tempfile::tempdir().unwrap();
        let kernel = kernel(home.path(), ScriptedGenerator::always(PRINT_OK));
        assert!(matches!(
            kernel.run_capability("missing"),
            Err(ForgeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_runtime_failure_keeps_capability() {
        let home = tempfile::tempdir().unwrap();
        let kernel = kernel(home.path(), ScriptedGenerator::always(PRINT_OK));
        // Register directly: the sandbox would reject this one.
        let record = kernel
            .registry()
            .register("flaky", FAILS_AT_RUN, Default::default())
            .unwrap();

        let err = kernel
            .run_capability(&record.name)
            .unwrap()
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, ForgeError::Runtime { ref reason, .. } if reason.contains("boom")));
        assert_eq!(kernel.list_capabilities(), vec!["flaky".to_string()]);
        assert_eq!(kernel.stats("flaky").unwrap().last_success, Some(false));
        assert!(kernel.suggest_optimization("flaky").is_some());
    }

    #[tokio::test]
    async fn test_restart_restores_capabilities() {
        let home = tempfile::tempdir().unwrap();
        let before = {
            let kernel = kernel(home.path(), ScriptedGenerator::always(PRINT_OK));
            assert!(kernel.propose_capability("first").await.success);
            assert!(kernel.propose_named("second", "named_tool").await.success);
            kernel.list_capabilities()
        };
        assert_eq!(before.len(), 2);

        let kernel = kernel(home.path(), ScriptedGenerator::always(PRINT_OK));
        assert_eq!(kernel.list_capabilities(), before);
        assert!(kernel.quarantined().is_empty());
        let out = kernel
            .run_capability("named_tool")
            .unwrap()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.output, "ok\n");
    }

    #[tokio::test]
    async fn test_remove_capability() {
        let home = tempfile::tempdir().unwrap();
        let kernel = kernel(home.path(), ScriptedGenerator::always(PRINT_OK));
        let outcome = kernel.propose_capability("temporary").await;
        assert!(kernel.remove_capability(&outcome.name));
        assert!(!kernel.remove_capability(&outcome.name));
        assert!(kernel.list_capabilities().is_empty());
        assert!(kernel.run_capability(&outcome.name).is_err());
    }

    #[tokio::test]
    async fn test_run_finishing_after_remove_leaves_no_stats() {
        let home = tempfile::tempdir().unwrap();
        let kernel = kernel(home.path(), ScriptedGenerator::always(PRINT_OK));
        let outcome = kernel.propose_capability("short lived").await;
        assert!(outcome.success, "{outcome:?}");

        let handle = kernel.run_capability(&outcome.name).unwrap();
        assert!(kernel.remove_capability(&outcome.name));
        // The in-flight run still completes against the unit it started with.
        let _ = handle.await.unwrap();

        assert!(kernel.stats(&outcome.name).is_none());
        let stats_file = home
            .path()
            .join("capabilities")
            .join("stats")
            .join(format!("{}.json", outcome.name));
        assert!(!stats_file.exists());
    }

    #[tokio::test]
    async fn test_acquire_routes_by_keywords() {
        let home = tempfile::tempdir().unwrap();
        let kernel = kernel(home.path(), ScriptedGenerator::always(PRINT_OK));
        let learned = kernel.acquire("send a message").await;
        assert_eq!(learned.name, "learned_send_a_message");
        let forged = kernel.acquire("what time is it").await;
        assert_eq!(forged.name, direct_name("what time is it"));
    }

    #[tokio::test]
    async fn test_boot_quarantines_tampered_entries() {
        let home = tempfile::tempdir().unwrap();
        let name = {
            let kernel = kernel(home.path(), ScriptedGenerator::always(PRINT_OK));
            kernel.propose_capability("say ok").await.name
        };
        let path = home.path().join("capabilities").join(format!("{name}.wat"));
        std::fs::write(&path, "(module)").unwrap();

        let kernel = kernel(home.path(), ScriptedGenerator::always(PRINT_OK));
        assert!(kernel.list_capabilities().is_empty());
        assert_eq!(kernel.quarantined()[0].0, name);
    }

    #[tokio::test]
    async fn test_disabled_search_fails_learning() {
        let home = tempfile::tempdir().unwrap();
        let kernel = ForgeKernel::boot_with(
            config(home.path()),
            Arc::new(InProcessVerifier::new()),
            Arc::new(ScriptedGenerator::always(PRINT_OK)),
            Arc::new(DisabledSearch),
        )
        .unwrap();
        let outcome = kernel.learn_skill("integrate the calendar api").await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("disabled"));
    }
}
