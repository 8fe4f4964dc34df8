//! Completion backends: the seam between structured extraction and a model.
//!
//! Two implementations:
//! - [`LlmBackend`]: wraps an `edgequake_llm` provider (production)
//! - [`ScriptedBackend`]: replays queued responses (testing)

use crate::config::{PipelineConfig, DEFAULT_MODEL};
use crate::error::PipelineError;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// One request: a system instruction plus the user prompt carrying the transcript.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: usize,
}

/// The model's raw text and token usage.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub content: String,
    pub input_tokens: usize,
    pub output_tokens: usize,
}

#[derive(Debug, Clone, Error)]
pub enum CompletionError {
    #[error("provider error: {0}")]
    Provider(String),

    #[error("completion timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// Something that turns a [`CompletionRequest`] into text.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Short label for logs, e.g. `openai/gpt-4o`.
    fn name(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, CompletionError>;
}

// ── Production backend ───────────────────────────────────────────────────────

/// A backend driving any `edgequake_llm` chat provider.
pub struct LlmBackend {
    provider: Arc<dyn LLMProvider>,
    label: String,
}

impl LlmBackend {
    pub fn new(provider: Arc<dyn LLMProvider>, label: impl Into<String>) -> Self {
        Self {
            provider,
            label: label.into(),
        }
    }
}

#[async_trait]
impl CompletionBackend for LlmBackend {
    fn name(&self) -> &str {
        &self.label
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, CompletionError> {
        let messages = vec![
            ChatMessage::system(request.system.as_str()),
            ChatMessage::user(request.prompt.as_str()),
        ];
        let options = CompletionOptions {
            temperature: Some(request.temperature),
            max_tokens: Some(request.max_tokens),
            ..Default::default()
        };

        let response = self
            .provider
            .chat(&messages, Some(&options))
            .await
            .map_err(|e| CompletionError::Provider(e.to_string()))?;

        Ok(Completion {
            content: response.content,
            input_tokens: response.prompt_tokens,
            output_tokens: response.completion_tokens,
        })
    }
}

fn create_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, PipelineError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        PipelineError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the completion backend, from most-specific to least-specific.
///
/// 1. **Injected backend** (`config.backend`), used as-is.
/// 2. **Pre-built provider** (`config.provider`), wrapped in [`LlmBackend`].
/// 3. **Named provider + model** (`config.provider_name`); the factory reads
///    the matching API key from the environment.
/// 4. **Environment pair** `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`.
/// 5. **OpenAI** when `OPENAI_API_KEY` is set.
/// 6. **Full auto-detection** via `ProviderFactory::from_env`.
pub fn resolve_backend(config: &PipelineConfig) -> Result<Arc<dyn CompletionBackend>, PipelineError> {
    if let Some(ref backend) = config.backend {
        return Ok(Arc::clone(backend));
    }

    let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);

    if let Some(ref provider) = config.provider {
        return Ok(Arc::new(LlmBackend::new(
            Arc::clone(provider),
            format!("custom/{model}"),
        )));
    }

    if let Some(ref name) = config.provider_name {
        let provider = create_provider(name, model)?;
        return Ok(Arc::new(LlmBackend::new(provider, format!("{name}/{model}"))));
    }

    if let (Ok(prov), Ok(env_model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !env_model.is_empty() {
            let provider = create_provider(&prov, &env_model)?;
            return Ok(Arc::new(LlmBackend::new(
                provider,
                format!("{prov}/{env_model}"),
            )));
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            let provider = create_provider("openai", model)?;
            return Ok(Arc::new(LlmBackend::new(provider, format!("openai/{model}"))));
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| PipelineError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(Arc::new(LlmBackend::new(llm_provider, "auto")))
}

// ── Scripted backend ─────────────────────────────────────────────────────────

/// A backend that replays preconfigured responses, for tests and dry runs.
///
/// Responses registered with [`ScriptedBackend::on`] are matched when the
/// prompt contains the given marker and are consumed in order; once a
/// marker's queue is empty its last response repeats. Prompts that match no
/// marker fall back to the default queue from [`ScriptedBackend::then`].
pub struct ScriptedBackend {
    label: String,
    keyed: Mutex<Vec<(String, VecDeque<Result<String, CompletionError>>)>>,
    fallback: Mutex<VecDeque<Result<String, CompletionError>>>,
    calls: AtomicUsize,
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            label: "scripted".to_string(),
            keyed: Mutex::new(Vec::new()),
            fallback: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Queue a response for prompts containing `marker`.
    pub fn on(self, marker: impl Into<String>, response: impl Into<String>) -> Self {
        self.push_keyed(marker.into(), Ok(response.into()));
        self
    }

    /// Queue a failure for prompts containing `marker`.
    pub fn on_error(self, marker: impl Into<String>, error: CompletionError) -> Self {
        self.push_keyed(marker.into(), Err(error));
        self
    }

    /// Queue a response for prompts no marker matches.
    pub fn then(self, response: impl Into<String>) -> Self {
        if let Ok(mut q) = self.fallback.lock() {
            q.push_back(Ok(response.into()));
        }
        self
    }

    /// Number of `complete` calls made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn push_keyed(&self, marker: String, response: Result<String, CompletionError>) {
        if let Ok(mut keyed) = self.keyed.lock() {
            match keyed.iter_mut().find(|(m, _)| *m == marker) {
                Some((_, q)) => q.push_back(response),
                None => keyed.push((marker, VecDeque::from([response]))),
            }
        }
    }

    fn next_for(&self, prompt: &str) -> Option<Result<String, CompletionError>> {
        let mut keyed = self.keyed.lock().ok()?;
        if let Some((_, q)) = keyed.iter_mut().find(|(m, _)| prompt.contains(m.as_str())) {
            return if q.len() > 1 { q.pop_front() } else { q.front().cloned() };
        }
        drop(keyed);
        let mut fallback = self.fallback.lock().ok()?;
        if fallback.len() > 1 {
            fallback.pop_front()
        } else {
            fallback.front().cloned()
        }
    }
}

#[async_trait]
impl CompletionBackend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.label
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, CompletionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.next_for(&request.prompt) {
            Some(Ok(content)) => Ok(Completion {
                output_tokens: content.len() / 4,
                input_tokens: request.prompt.len() / 4,
                content,
            }),
            Some(Err(e)) => Err(e),
            None => Err(CompletionError::Unavailable(
                "no scripted response for this prompt".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(prompt: &str) -> CompletionRequest {
        CompletionRequest {
            system: "sys".into(),
            prompt: prompt.into(),
            temperature: 0.3,
            max_tokens: 100,
        }
    }

    #[tokio::test]
    async fn keyed_responses_are_consumed_in_order() {
        let backend = ScriptedBackend::new()
            .on("noether", "first")
            .on("noether", "second");

        let a = backend.complete(&request("about noether")).await.unwrap();
        let b = backend.complete(&request("about noether")).await.unwrap();
        let c = backend.complete(&request("about noether")).await.unwrap();
        assert_eq!(a.content, "first");
        assert_eq!(b.content, "second");
        assert_eq!(c.content, "second", "last response repeats");
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test]
    async fn unmatched_prompt_uses_fallback() {
        let backend = ScriptedBackend::new().on("noether", "keyed").then("default");
        let r = backend.complete(&request("about rudin")).await.unwrap();
        assert_eq!(r.content, "default");
    }

    #[tokio::test]
    async fn empty_script_is_unavailable() {
        let backend = ScriptedBackend::new();
        let err = backend.complete(&request("x")).await.unwrap_err();
        assert!(matches!(err, CompletionError::Unavailable(_)));
    }

    #[tokio::test]
    async fn scripted_errors_surface() {
        let backend = ScriptedBackend::new()
            .on_error("x", CompletionError::Provider("429 rate limited".into()));
        let err = backend.complete(&request("x")).await.unwrap_err();
        assert!(err.to_string().contains("429"));
    }

    #[test]
    fn injected_backend_wins_resolution() {
        let backend: Arc<dyn CompletionBackend> = Arc::new(ScriptedBackend::new());
        let config = PipelineConfig::builder()
            .backend(Arc::clone(&backend))
            .provider_name("definitely-not-a-provider")
            .build()
            .unwrap();
        let resolved = resolve_backend(&config).unwrap();
        assert_eq!(resolved.name(), "scripted");
    }
}
