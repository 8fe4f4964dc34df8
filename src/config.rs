//! Configuration types for the biography pipeline.
//!
//! Every knob lives in [`PipelineConfig`], built via its
//! [`PipelineConfigBuilder`]. One struct shared by all four stages makes it
//! easy to log the exact settings a run used and to diff two runs.
//!
//! Code versions are configuration too: bumping a stage's entry in
//! [`StageVersions`] is the only way to force a stage to recompute when its
//! upstream content has not changed.

use crate::completion::CompletionBackend;
use crate::error::PipelineError;
use crate::progress::ProgressCallback;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Default first page that may belong to a subject (1-indexed).
///
/// The source book carries five pages of front matter before the first
/// profile.
pub const DEFAULT_START_PAGE: usize = 6;

/// Default model when a provider is named or an OpenAI key is found.
pub const DEFAULT_MODEL: &str = "gpt-4o";

/// Configuration for a pipeline run.
///
/// Built via [`PipelineConfig::builder()`] or using
/// [`PipelineConfig::default()`].
///
/// # Example
/// ```rust
/// use pioneer_tables::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .output_dir("out")
///     .start_page(6)
///     .concurrency(4)
///     .model("gpt-4o")
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// First 1-indexed page that may belong to a subject. Default: 6.
    ///
    /// Outline entries whose pages all fall before this page are dropped;
    /// an entry straddling it is clipped to start here.
    pub start_page: usize,

    /// Root directory for every stage's persisted output. Default: `output`.
    pub output_dir: PathBuf,

    /// Cache entry directory. Default: `<output_dir>/.cache`.
    pub cache_dir: Option<PathBuf>,

    /// Code version per stage, compared for equality on cache lookup.
    pub versions: StageVersions,

    /// Number of concurrent completion calls. Default: 4.
    ///
    /// Each subject is an independent request; raise this when the provider's
    /// rate limit allows, lower it on `429` errors.
    pub concurrency: usize,

    /// LLM model identifier. If None, uses [`DEFAULT_MODEL`].
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "anthropic", "ollama").
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Pre-constructed completion backend. Takes precedence over everything
    /// else; this is how tests inject a scripted model.
    pub backend: Option<Arc<dyn CompletionBackend>>,

    /// Sampling temperature. Default: 0.3.
    ///
    /// Low but nonzero: keeps run-to-run drift small while letting a retry
    /// produce a different answer after a malformed response.
    pub temperature: f32,

    /// Maximum tokens the model may generate per subject. Default: 4096.
    pub max_tokens: usize,

    /// Completion attempts per subject before it is marked failed. Default: 3.
    pub max_attempts: u32,

    /// Initial retry delay in milliseconds (exponential backoff). Default: 500.
    pub retry_backoff_ms: u64,

    /// Per-completion-call timeout in seconds. Default: 60.
    pub api_timeout_secs: u64,

    /// Custom system prompt. If None, uses built-in default.
    pub system_prompt: Option<String>,

    /// Progress events for stages and subjects.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            start_page: DEFAULT_START_PAGE,
            output_dir: PathBuf::from("output"),
            cache_dir: None,
            versions: StageVersions::default(),
            concurrency: 4,
            model: None,
            provider_name: None,
            provider: None,
            backend: None,
            temperature: 0.3,
            max_tokens: 4096,
            max_attempts: 3,
            retry_backoff_ms: 500,
            api_timeout_secs: 60,
            system_prompt: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("start_page", &self.start_page)
            .field("output_dir", &self.output_dir)
            .field("cache_dir", &self.cache_dir)
            .field("versions", &self.versions)
            .field("concurrency", &self.concurrency)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("backend", &self.backend.as_ref().map(|b| b.name().to_string()))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_attempts", &self.max_attempts)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// Directory holding per-subject sub-documents and `segments.json`.
    pub fn split_dir(&self) -> PathBuf {
        self.output_dir.join("split")
    }

    /// Directory holding per-subject transcripts.
    pub fn text_dir(&self) -> PathBuf {
        self.output_dir.join("text")
    }

    /// Directory holding per-subject JSON records.
    pub fn records_dir(&self) -> PathBuf {
        self.output_dir.join("records")
    }

    /// Directory holding the six CSV tables.
    pub fn tables_dir(&self) -> PathBuf {
        self.output_dir.join("tables")
    }

    /// Effective cache directory.
    pub fn effective_cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| self.output_dir.join(".cache"))
    }
}

/// Builder for [`PipelineConfig`].
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl fmt::Debug for PipelineConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfigBuilder")
            .field("config", &self.config)
            .finish()
    }
}

impl PipelineConfigBuilder {
    pub fn start_page(mut self, page: usize) -> Self {
        self.config.start_page = page.max(1);
        self
    }

    pub fn output_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.config.output_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn cache_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.config.cache_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn versions(mut self, versions: StageVersions) -> Self {
        self.config.versions = versions;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn backend(mut self, backend: Arc<dyn CompletionBackend>) -> Self {
        self.config.backend = Some(backend);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.max_attempts = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        let c = &self.config;
        if c.max_attempts == 0 {
            return Err(PipelineError::InvalidConfig(
                "max_attempts must be ≥ 1".into(),
            ));
        }
        if c.api_timeout_secs == 0 {
            return Err(PipelineError::InvalidConfig(
                "api_timeout_secs must be ≥ 1".into(),
            ));
        }
        if let Some(bad) = c.versions.first_blank() {
            return Err(PipelineError::InvalidConfig(format!(
                "code version for stage '{bad}' must not be empty"
            )));
        }
        Ok(self.config)
    }
}

/// Code version string per stage.
///
/// Versions are opaque and compared for equality only. Bump one by hand when
/// a stage's logic changes in a way that should invalidate its cached output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageVersions {
    pub segment: String,
    pub extract_text: String,
    pub extract_structure: String,
    pub normalize: String,
}

impl Default for StageVersions {
    fn default() -> Self {
        Self {
            segment: "v1".into(),
            extract_text: "v1".into(),
            extract_structure: "v1".into(),
            normalize: "v1".into(),
        }
    }
}

impl StageVersions {
    fn first_blank(&self) -> Option<&'static str> {
        [
            ("segment", &self.segment),
            ("extract_text", &self.extract_text),
            ("extract_structure", &self.extract_structure),
            ("normalize", &self.normalize),
        ]
        .into_iter()
        .find(|(_, v)| v.trim().is_empty())
        .map(|(name, _)| name)
    }
}
