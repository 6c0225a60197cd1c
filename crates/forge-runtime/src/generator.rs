//! Text generation collaborator: writes and repairs capability source.
//!
//! The synthesizer treats implementations as unreliable and slow, and calls
//! them at most twice per request (one generation, one repair).

use async_trait::async_trait;

/// Reference material is cut to this many chars for a first attempt.
pub const GENERATE_REFERENCE_CHARS: usize = 4000;

/// Reference material is cut to this many chars for a repair.
pub const REPAIR_REFERENCE_CHARS: usize = 2000;

/// Errors from a text generator.
#[derive(Debug, thiserror::Error)]
pub enum GeneratorError {
    #[error("Generator request failed: {0}")]
    Request(String),
    #[error("Generator returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("Generator returned no usable text")]
    Empty,
}

/// What the capability should do, plus optional reference material.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptContext {
    /// Free-form task or prompt.
    pub task: String,
    /// Reference material gathered by context search.
    pub reference: Option<String>,
}

impl PromptContext {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            reference: None,
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }
}

/// Writes and repairs capability source.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Produce a candidate implementation.
    async fn generate(&self, context: &PromptContext) -> Result<String, GeneratorError>;

    /// Produce a corrected implementation from a failing one and its diagnostic.
    async fn repair(
        &self,
        failing_source: &str,
        diagnostic: &str,
        context: &PromptContext,
    ) -> Result<String, GeneratorError>;
}

/// Remove a leading ```lang fence line and a trailing ``` fence.
pub fn strip_code_fences(text: &str) -> String {
    let mut body = text.trim();
    if let Some(rest) = body.strip_prefix("```") {
        // Drop the language tag, if any, up to the end of the fence line.
        body = match rest.find('\n') {
            Some(idx) => &rest[idx + 1..],
            None => rest.trim_start_matches(|c: char| c.is_ascii_alphanumeric()),
        };
    }
    let body = body.trim_end();
    let body = body.strip_suffix("```").unwrap_or(body);
    body.trim().to_string()
}

/// Cut `text` to at most `max_chars` characters on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

const ABI_NOTES: &str = "\
Write a single WebAssembly text-format (WAT) module.
Requirements:
- It MUST export a function named \"run\" that takes no parameters.
- It may import only these host functions from module \"forge\":
    (import \"forge\" \"print\" (func (param i32 i32)))          ;; write UTF-8 bytes (ptr, len)
    (import \"forge\" \"log\" (func (param i32 i32 i32)))        ;; level, ptr, len
    (import \"forge\" \"fail\" (func (param i32 i32)))           ;; raise an error (ptr, len)
    (import \"forge\" \"time_now\" (func (result i64)))          ;; unix seconds
- Any module that imports print, log or fail MUST export its memory as \"memory\".
- Print the result of the task with forge.print.

Example:
(module
  (import \"forge\" \"print\" (func $print (param i32 i32)))
  (memory (export \"memory\") 1)
  (data (i32.const 16) \"hello\\n\")
  (func (export \"run\")
    (call $print (i32.const 16) (i32.const 6))))

Respond ONLY with the module source, no explanation.";

/// Prompt for a first attempt.
pub fn generation_prompt(context: &PromptContext) -> String {
    let mut prompt = format!(
        "You are a code generator for a capability runtime. A user wants a tool.\nThe goal is: '{}'\n\n",
        context.task
    );
    if let Some(reference) = &context.reference {
        prompt.push_str("Reference material:\n");
        prompt.push_str(truncate_chars(reference, GENERATE_REFERENCE_CHARS));
        prompt.push_str("\n\n");
    }
    prompt.push_str(ABI_NOTES);
    prompt
}

/// Prompt for the single repair attempt.
pub fn repair_prompt(failing_source: &str, diagnostic: &str, context: &PromptContext) -> String {
    let mut prompt = format!(
        "You are debugging a capability module that failed its sandbox test.\nThe goal is: '{}'\n\nFailing source:\n```wat\n{}\n```\n\nError encountered:\n{}\n\n",
        context.task, failing_source, diagnostic
    );
    if let Some(reference) = &context.reference {
        prompt.push_str("Reference material:\n");
        prompt.push_str(truncate_chars(reference, REPAIR_REFERENCE_CHARS));
        prompt.push_str("\n\n");
    }
    prompt.push_str("Fix the module so it passes. ");
    prompt.push_str(ABI_NOTES);
    prompt
}
