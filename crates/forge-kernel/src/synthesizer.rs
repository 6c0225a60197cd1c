//! Capability synthesizer: request -> generate -> verify -> (repair ->)
//! register, as an explicit state machine.
//!
//! ```text
//! Requested -> [ContextGathered] -> CodeGenerated -> SandboxTesting
//!     SandboxTesting -> Passed -> Registered -> Active
//!     SandboxTesting -> Failed -> RepairAttempted -> SandboxTesting
//!     SandboxTesting -> Failed -> FailedTerminal      (after the repair)
//! ```
//!
//! The one permitted repair is tracked by [`Attempt`]: a failure on
//! [`Attempt::Repair`] has no outgoing edge except `FailedTerminal`.

use dashmap::DashMap;
use forge_registry::verify::validate_name;
use forge_registry::CapabilityRegistry;
use forge_runtime::context_search::ContextSearch;
use forge_runtime::generator::{strip_code_fences, PromptContext, TextGenerator};
use forge_runtime::loader::sha256_hex;
use forge_runtime::sandbox::CodeVerifier;
use forge_types::capability::{CapabilityMetadata, CapabilityRecord, ProposalOutcome};
use forge_types::error::ForgeError;
use std::sync::Arc;
use tracing::{info, warn};

/// Keywords that suggest a request needs outside reference material.
const LEARNING_KEYWORDS: &[&str] = &[
    "control",
    "connect",
    "integrate",
    "send",
    "post",
    "tweet",
    "message",
    "automate",
    "scrape",
    "api",
];

/// Maximum slug length in a learned capability name.
const MAX_SLUG_LEN: usize = 48;

/// Pipeline states, in the order a successful run visits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SynthesisState {
    Requested,
    ContextGathered,
    CodeGenerated,
    SandboxTesting,
    Passed,
    Failed,
    RepairAttempted,
    Registered,
    Active,
    FailedTerminal,
}

impl SynthesisState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "REQUESTED",
            Self::ContextGathered => "CONTEXT_GATHERED",
            Self::CodeGenerated => "CODE_GENERATED",
            Self::SandboxTesting => "SANDBOX_TESTING",
            Self::Passed => "PASSED",
            Self::Failed => "FAILED",
            Self::RepairAttempted => "REPAIR_ATTEMPTED",
            Self::Registered => "REGISTERED",
            Self::Active => "ACTIVE",
            Self::FailedTerminal => "FAILED_TERMINAL",
        }
    }
}

impl std::fmt::Display for SynthesisState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which verification attempt is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Initial,
    Repair,
}

/// The two entry workflows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SynthesisRequest {
    /// Generate straight from a free-form prompt.
    Forge {
        prompt: String,
        /// Explicit slot; derived from the prompt when absent.
        name: Option<String>,
    },
    /// Gather reference material first, then generate.
    Learn { task: String },
}

impl SynthesisRequest {
    pub fn forge(prompt: impl Into<String>) -> Self {
        Self::Forge {
            prompt: prompt.into(),
            name: None,
        }
    }

    pub fn learn(task: impl Into<String>) -> Self {
        Self::Learn { task: task.into() }
    }

    /// Registry slot this request maps to. Deterministic, so retries of
    /// the same request overwrite instead of duplicating.
    pub fn capability_name(&self) -> String {
        match self {
            Self::Forge {
                name: Some(name), ..
            } => name.clone(),
            Self::Forge { prompt, name: None } => direct_name(prompt),
            Self::Learn { task } => learned_name(task),
        }
    }

    fn task(&self) -> &str {
        match self {
            Self::Forge { prompt, .. } => prompt,
            Self::Learn { task } => task,
        }
    }
}

/// `tool_` + first 8 hex digits of SHA-256 over the normalized prompt.
pub fn direct_name(prompt: &str) -> String {
    let normalized = prompt
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    let digest = sha256_hex(normalized.as_bytes());
    format!("tool_{}", &digest[..8])
}

/// `learned_` + a lower-case slug of the task.
pub fn learned_name(task: &str) -> String {
    let mut slug = String::new();
    for c in task.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('_') {
            slug.push('_');
        }
    }
    slug.truncate(MAX_SLUG_LEN);
    let slug = slug.trim_end_matches('_');
    if slug.is_empty() {
        "learned_skill".to_string()
    } else {
        format!("learned_{slug}")
    }
}

/// Whether a request the agent cannot already serve is worth a
/// learn-a-skill attempt.
pub fn should_attempt_learning(request: &str) -> bool {
    let lower = request.to_lowercase();
    LEARNING_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

/// Per-run bookkeeping turned into a [`ProposalOutcome`] at the end.
struct PipelineRun {
    name: String,
    trace: Vec<SynthesisState>,
    attempted_source: Option<String>,
    repair_attempts: u32,
}

impl PipelineRun {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            trace: Vec::new(),
            attempted_source: None,
            repair_attempts: 0,
        }
    }

    fn enter(&mut self, state: SynthesisState) {
        tracing::debug!(capability = %self.name, state = %state, "Synthesis transition");
        self.trace.push(state);
    }

    fn finish(mut self, result: Result<CapabilityRecord, ForgeError>) -> ProposalOutcome {
        match result {
            Ok(record) => {
                let message = if self.repair_attempts > 0 {
                    format!("Capability '{}' is active (after one repair)", record.name)
                } else {
                    format!("Capability '{}' is active", record.name)
                };
                info!(capability = %self.name, repairs = self.repair_attempts, "Synthesis succeeded");
                ProposalOutcome {
                    success: true,
                    name: self.name,
                    message,
                    error: None,
                    attempted_source: None,
                    repair_attempts: self.repair_attempts,
                    trace: self.trace.iter().map(|s| s.to_string()).collect(),
                }
            }
            Err(err) => {
                self.enter(SynthesisState::FailedTerminal);
                // Verification failures are reported with the last diagnostic as-is.
                let error = match &err {
                    ForgeError::Verification { diagnostic, .. } => diagnostic.clone(),
                    other => other.to_string(),
                };
                warn!(capability = %self.name, error = %error, "Synthesis failed");
                ProposalOutcome {
                    success: false,
                    message: format!("Failed to create capability '{}'", self.name),
                    name: self.name,
                    error: Some(error),
                    attempted_source: self.attempted_source,
                    repair_attempts: self.repair_attempts,
                    trace: self.trace.iter().map(|s| s.to_string()).collect(),
                }
            }
        }
    }
}

/// Drives the generate/verify/repair/register pipeline.
pub struct CapabilitySynthesizer {
    registry: Arc<CapabilityRegistry>,
    verifier: Arc<dyn CodeVerifier>,
    generator: Arc<dyn TextGenerator>,
    search: Arc<dyn ContextSearch>,
    name_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl CapabilitySynthesizer {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        verifier: Arc<dyn CodeVerifier>,
        generator: Arc<dyn TextGenerator>,
        search: Arc<dyn ContextSearch>,
    ) -> Self {
        Self {
            registry,
            verifier,
            generator,
            search,
            name_locks: DashMap::new(),
        }
    }

    /// Run one request to completion. Never returns an error: every
    /// failure becomes an unsuccessful outcome.
    ///
    /// Requests for the same name run one at a time; different names run
    /// concurrently.
    pub async fn synthesize(&self, request: SynthesisRequest) -> ProposalOutcome {
        let name = request.capability_name();
        let mut run = PipelineRun::new(&name);
        run.enter(SynthesisState::Requested);

        if let Err(reason) = validate_name(&name) {
            return run.finish(Err(ForgeError::InvalidName(format!("{name}: {reason}"))));
        }

        let lock = self
            .name_locks
            .entry(name.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .value()
            .clone();
        let held = lock.lock().await;

        info!(capability = %name, "Synthesis started");
        let result = self.drive(&request, &name, &mut run).await;
        drop(held);
        drop(lock);
        // Forget the lock once no other request holds or awaits it.
        self.name_locks
            .remove_if(&name, |_, slot| Arc::strong_count(slot) == 1);
        run.finish(result)
    }

    async fn drive(
        &self,
        request: &SynthesisRequest,
        name: &str,
        run: &mut PipelineRun,
    ) -> Result<CapabilityRecord, ForgeError> {
        let context = match request {
            SynthesisRequest::Learn { task } => {
                let blob = self
                    .search
                    .query(task)
                    .await
                    .map_err(|e| ForgeError::Generation(format!("context search failed: {e}")))?;
                if blob.trim().is_empty() {
                    return Err(ForgeError::Generation("no reference material found".into()));
                }
                run.enter(SynthesisState::ContextGathered);
                PromptContext::new(task.clone()).with_reference(blob)
            }
            SynthesisRequest::Forge { prompt, .. } => PromptContext::new(prompt.clone()),
        };

        let raw = self
            .generator
            .generate(&context)
            .await
            .map_err(|e| ForgeError::Generation(e.to_string()))?;
        let mut source = usable_source(&raw)?;
        run.attempted_source = Some(source.clone());
        run.enter(SynthesisState::CodeGenerated);

        let mut attempt = Attempt::Initial;
        loop {
            run.enter(SynthesisState::SandboxTesting);
            let verdict = self.verifier.verify(&source).await;
            if verdict.passed {
                run.enter(SynthesisState::Passed);
                break;
            }
            run.enter(SynthesisState::Failed);
            match attempt {
                Attempt::Initial => {
                    run.enter(SynthesisState::RepairAttempted);
                    run.repair_attempts += 1;
                    info!(capability = %name, "Sandbox test failed, attempting repair");
                    let raw = self
                        .generator
                        .repair(&source, &verdict.diagnostic, &context)
                        .await
                        .map_err(|e| ForgeError::Generation(format!("repair failed: {e}")))?;
                    source = usable_source(&raw)?;
                    run.attempted_source = Some(source.clone());
                    attempt = Attempt::Repair;
                }
                Attempt::Repair => {
                    return Err(ForgeError::Verification {
                        diagnostic: verdict.diagnostic,
                        timed_out: verdict.timed_out,
                    });
                }
            }
        }

        let metadata = build_metadata(request, run.repair_attempts > 0);
        let registry = self.registry.clone();
        let owned_name = name.to_string();
        let owned_source = source.clone();
        let record = tokio::task::spawn_blocking(move || {
            registry.register(&owned_name, &owned_source, metadata)
        })
        .await
        .map_err(|e| ForgeError::Internal(format!("registration task failed: {e}")))?
        .map_err(ForgeError::from)?;
        run.enter(SynthesisState::Registered);

        if self.registry.loader().get(name).is_none() {
            return Err(ForgeError::Registration(format!(
                "'{name}' committed but not loaded"
            )));
        }
        run.enter(SynthesisState::Active);
        Ok(record)
    }
}

fn usable_source(raw: &str) -> Result<String, ForgeError> {
    let source = strip_code_fences(raw);
    if source.is_empty() {
        return Err(ForgeError::Generation("generator returned empty source".into()));
    }
    Ok(source)
}

fn build_metadata(request: &SynthesisRequest, repaired: bool) -> CapabilityMetadata {
    let mut metadata = CapabilityMetadata::new();
    let (key, origin, autonomous) = match request {
        SynthesisRequest::Forge { .. } => ("prompt", "forge", false),
        SynthesisRequest::Learn { .. } => ("learned_from", "learn", true),
    };
    metadata.insert(key.into(), serde_json::json!(request.task()));
    metadata.insert("origin".into(), serde_json::json!(origin));
    metadata.insert("autonomous".into(), serde_json::json!(autonomous));
    metadata.insert("repaired".into(), serde_json::json!(repaired));
    metadata.insert(
        "timestamp".into(),
        serde_json::json!(chrono::Utc::now().to_rfc3339()),
    );
    metadata
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted collaborators shared by the kernel tests.

    use async_trait::async_trait;
    use forge_runtime::context_search::ContextSearch;
    use forge_runtime::generator::{GeneratorError, PromptContext, TextGenerator};
    use forge_runtime::sandbox::CodeVerifier;
    use forge_types::verification::VerificationResult;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    pub const PRINT_OK: &str = r#"(module
  (import "forge" "print" (func $print (param i32 i32)))
  (memory (export "memory") 1)
  (data (i32.const 16) "ok\n")
  (func (export "run") (call $print (i32.const 16) (i32.const 3))))"#;

    pub const FAILS_AT_RUN: &str = r#"(module
  (import "forge" "fail" (func $fail (param i32 i32)))
  (memory (export "memory") 1)
  (data (i32.const 16) "boom")
  (func (export "run") (call $fail (i32.const 16) (i32.const 4))))"#;

    pub const NO_ENTRY: &str = r#"(module (func (export "main")))"#;

    /// Replies from a queue; repeats the last reply when it runs out.
    pub struct ScriptedGenerator {
        replies: Mutex<VecDeque<Result<String, String>>>,
        last: Mutex<Option<Result<String, String>>>,
        pub generate_calls: AtomicUsize,
        pub repair_calls: AtomicUsize,
        pub seen_diagnostics: Mutex<Vec<String>>,
        pub seen_references: Mutex<Vec<Option<String>>>,
        delay: Duration,
    }

    impl ScriptedGenerator {
        pub fn new(replies: Vec<Result<&str, &str>>) -> Self {
            Self {
                replies: Mutex::new(
                    replies
                        .into_iter()
                        .map(|r| r.map(String::from).map_err(String::from))
                        .collect(),
                ),
                last: Mutex::new(None),
                generate_calls: AtomicUsize::new(0),
                repair_calls: AtomicUsize::new(0),
                seen_diagnostics: Mutex::new(Vec::new()),
                seen_references: Mutex::new(Vec::new()),
                delay: Duration::ZERO,
            }
        }

        pub fn always(reply: &str) -> Self {
            Self::new(vec![Ok(reply)])
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        async fn next(&self, context: &PromptContext) -> Result<String, GeneratorError> {
            self.seen_references
                .lock()
                .unwrap()
                .push(context.reference.clone());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let reply = {
                let mut queue = self.replies.lock().unwrap();
                let mut last = self.last.lock().unwrap();
                match queue.pop_front() {
                    Some(r) => {
                        *last = Some(r.clone());
                        r
                    }
                    None => last.clone().unwrap_or_else(|| Err("script empty".into())),
                }
            };
            reply.map_err(GeneratorError::Request)
        }
    }

    #[async_trait]
    impl TextGenerator for ScriptedGenerator {
        async fn generate(&self, context: &PromptContext) -> Result<String, GeneratorError> {
            self.generate_calls.fetch_add(1, Ordering::SeqCst);
            self.next(context).await
        }

        async fn repair(
            &self,
            _failing_source: &str,
            diagnostic: &str,
            context: &PromptContext,
        ) -> Result<String, GeneratorError> {
            self.repair_calls.fetch_add(1, Ordering::SeqCst);
            self.seen_diagnostics
                .lock()
                .unwrap()
                .push(diagnostic.to_string());
            self.next(context).await
        }
    }

    /// Passes anything the loader would accept without spawning a process.
    pub struct InProcessVerifier {
        pub calls: AtomicUsize,
        pub in_flight: AtomicUsize,
        pub max_in_flight: AtomicUsize,
    }

    impl InProcessVerifier {
        pub fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CodeVerifier for InProcessVerifier {
        async fn verify(&self, source: &str) -> VerificationResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            let report = forge_runtime::runner::execute_source(source);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            match report.error {
                None => VerificationResult::from_exit(Some(0), report.stdout, String::new(), 1),
                Some(err) => VerificationResult::from_exit(Some(1), report.stdout, err, 1),
            }
        }
    }

    /// Fails every candidate with the same diagnostic.
    pub struct AlwaysFails {
        pub calls: AtomicUsize,
    }

    #[async_trait]
    impl CodeVerifier for AlwaysFails {
        async fn verify(&self, _source: &str) -> VerificationResult {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            VerificationResult::from_exit(Some(1), String::new(), format!("TypeError: attempt {n}"), 1)
        }
    }

    /// Returns a fixed blob, or an error.
    pub struct FixedSearch(pub Result<String, String>);

    #[async_trait]
    impl ContextSearch for FixedSearch {
        async fn query(&self, _text: &str) -> Result<String, String> {
            self.0.clone()
        }
    }
}
