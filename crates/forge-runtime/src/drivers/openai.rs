//! OpenAI-compatible chat completions driver for the text generator.
//!
//! Works against any `/chat/completions` endpoint, including Ollama's
//! (`http://localhost:11434/v1`). The API key, when configured, is read from
//! the named environment variable on each request and wiped after use.

use crate::generator::{
    generation_prompt, repair_prompt, strip_code_fences, GeneratorError, PromptContext,
    TextGenerator,
};
use async_trait::async_trait;
use forge_types::config::GeneratorSettings;
use std::time::Duration;
use tracing::debug;
use zeroize::Zeroizing;

/// Text generator backed by a chat completions endpoint.
pub struct OpenAiCompatGenerator {
    client: reqwest::Client,
    settings: GeneratorSettings,
}

impl OpenAiCompatGenerator {
    pub fn new(settings: GeneratorSettings) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .unwrap_or_default();
        Self { client, settings }
    }

    /// Full URL of the completions endpoint.
    pub fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.settings.base_url.trim_end_matches('/')
        )
    }

    async fn complete(&self, prompt: String) -> Result<String, GeneratorError> {
        let body = serde_json::json!({
            "model": self.settings.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": self.settings.temperature,
            "stream": false,
        });

        let mut req = self.client.post(self.endpoint()).json(&body);
        if let Some(key) = resolve_api_key(&self.settings.api_key_env) {
            req = req.header("Authorization", format!("Bearer {}", key.as_str()));
        }

        debug!(model = %self.settings.model, "Requesting completion");
        let resp = req
            .send()
            .await
            .map_err(|e| GeneratorError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(GeneratorError::Api {
                status,
                body: body.chars().take(200).collect(),
            });
        }

        let data: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| GeneratorError::Request(format!("invalid JSON: {e}")))?;
        extract_content(&data)
    }
}

#[async_trait]
impl TextGenerator for OpenAiCompatGenerator {
    async fn generate(&self, context: &PromptContext) -> Result<String, GeneratorError> {
        self.complete(generation_prompt(context)).await
    }

    async fn repair(
        &self,
        failing_source: &str,
        diagnostic: &str,
        context: &PromptContext,
    ) -> Result<String, GeneratorError> {
        self.complete(repair_prompt(failing_source, diagnostic, context))
            .await
    }
}

/// Pull `choices[0].message.content` out of a completion, fences stripped.
fn extract_content(data: &serde_json::Value) -> Result<String, GeneratorError> {
    let content = data["choices"][0]["message"]["content"]
        .as_str()
        .map(strip_code_fences)
        .unwrap_or_default();
    if content.is_empty() {
        return Err(GeneratorError::Empty);
    }
    Ok(content)
}

fn resolve_api_key(env_var: &str) -> Option<Zeroizing<String>> {
    if env_var.is_empty() {
        return None;
    }
    std::env::var(env_var)
        .ok()
        .filter(|v| !v.is_empty())
        .map(Zeroizing::new)
}
