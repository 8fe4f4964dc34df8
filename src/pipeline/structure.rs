//! Structured extraction: one transcript in, one validated record out.
//!
//! ## Retry Strategy
//!
//! Every failure mode consumes one attempt: completion error, timeout,
//! unparseable JSON after repair, and schema violation. Every attempt sends
//! the identical request; the nonzero temperature is what makes a second
//! answer differ from the first. Backoff is exponential
//! (`retry_backoff_ms * 2^(retry - 1)`, saturating): with a 500 ms base and 3
//! attempts the waits are 500 ms then 1 s.

use crate::completion::{CompletionBackend, CompletionError, CompletionRequest};
use crate::config::PipelineConfig;
use crate::error::SubjectError;
use crate::pipeline::repair::parse_response;
use crate::pipeline::text::Transcript;
use crate::prompts::{build_prompt, DEFAULT_SYSTEM_PROMPT};
use crate::record::BiographyRecord;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, warn};

/// Knobs for one extractor, usually taken from [`PipelineConfig`].
#[derive(Debug, Clone)]
pub struct ExtractionOptions {
    pub system_prompt: String,
    pub temperature: f32,
    pub max_tokens: usize,
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
    pub call_timeout: Duration,
}

impl ExtractionOptions {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            system_prompt: config
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            max_attempts: config.max_attempts.max(1),
            retry_backoff_ms: config.retry_backoff_ms,
            call_timeout: Duration::from_secs(config.api_timeout_secs),
        }
    }
}

/// A validated record and what it cost.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub record: BiographyRecord,
    /// Attempts used, including the successful one.
    pub attempts: u32,
    /// True when the accepted response needed the JSON repair pass.
    pub repaired: bool,
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub duration_ms: u64,
}

/// Drives a [`CompletionBackend`] until it yields a valid record.
#[derive(Clone)]
pub struct StructuredExtractor {
    backend: Arc<dyn CompletionBackend>,
    options: ExtractionOptions,
}

impl StructuredExtractor {
    pub fn new(backend: Arc<dyn CompletionBackend>, options: ExtractionOptions) -> Self {
        Self { backend, options }
    }

    pub fn options(&self) -> &ExtractionOptions {
        &self.options
    }

    /// Extract one subject's record.
    ///
    /// Never panics and never aborts siblings: every failure comes back as
    /// [`SubjectError::ExtractionFailed`] once attempts are exhausted.
    pub async fn extract(&self, transcript: &Transcript) -> Result<Extraction, SubjectError> {
        let start = Instant::now();
        let subject = transcript.key.as_str();

        if transcript.is_blank() {
            return Err(SubjectError::ExtractionFailed {
                subject: subject.to_string(),
                attempts: 0,
                detail: "transcript has no text".to_string(),
            });
        }

        let request = CompletionRequest {
            system: self.options.system_prompt.clone(),
            prompt: build_prompt(&transcript.pages.join("\n\n")),
            temperature: self.options.temperature,
            max_tokens: self.options.max_tokens,
        };
        let max_attempts = self.options.max_attempts.max(1);
        let mut input_tokens = 0;
        let mut output_tokens = 0;
        let mut last_err: Option<String> = None;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let backoff = backoff_delay(self.options.retry_backoff_ms, attempt - 1);
                warn!(
                    "{}: retry {}/{} after {}ms",
                    subject,
                    attempt - 1,
                    max_attempts - 1,
                    backoff.as_millis()
                );
                sleep(backoff).await;
            }

            let completion =
                match timeout(self.options.call_timeout, self.backend.complete(&request)).await {
                    Err(_) => {
                        let e = CompletionError::Timeout {
                            ms: self.options.call_timeout.as_millis() as u64,
                        };
                        warn!("{}: attempt {} failed: {}", subject, attempt, e);
                        last_err = Some(e.to_string());
                        continue;
                    }
                    Ok(Err(e)) => {
                        warn!("{}: attempt {} failed: {}", subject, attempt, e);
                        last_err = Some(e.to_string());
                        continue;
                    }
                    Ok(Ok(c)) => c,
                };
            input_tokens += completion.input_tokens;
            output_tokens += completion.output_tokens;

            let parsed = match parse_response(&completion.content) {
                Ok(p) => p,
                Err(e) => {
                    warn!("{}: attempt {} unparseable: {}", subject, attempt, e);
                    last_err = Some(e);
                    continue;
                }
            };

            match BiographyRecord::from_value(parsed.value) {
                Ok(record) => {
                    let duration_ms = start.elapsed().as_millis() as u64;
                    debug!(
                        "{}: {} input tokens, {} output tokens, {} attempt(s), {}ms",
                        subject, input_tokens, output_tokens, attempt, duration_ms
                    );
                    return Ok(Extraction {
                        record,
                        attempts: attempt,
                        repaired: parsed.repaired,
                        input_tokens,
                        output_tokens,
                        duration_ms,
                    });
                }
                Err(e) => {
                    let msg = format!("schema violation: {e}");
                    warn!("{}: attempt {} rejected: {}", subject, attempt, msg);
                    last_err = Some(msg);
                }
            }
        }

        Err(SubjectError::ExtractionFailed {
            subject: subject.to_string(),
            attempts: max_attempts,
            detail: last_err.unwrap_or_else(|| "Unknown error".to_string()),
        })
    }
}

/// Wait before retry number `retry` (1-based): `base_ms * 2^(retry - 1)`.
pub fn backoff_delay(base_ms: u64, retry: u32) -> Duration {
    let factor = 2u64.checked_pow(retry.saturating_sub(1)).unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(factor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::{Completion, ScriptedBackend};
    use async_trait::async_trait;
    use std::sync::Mutex;

    const VALID: &str = r#"{"full_name": "Emmy Noether", "birthdate": "1882", "deathdate": "1935",
        "birthplace": "Erlangen", "parents": [], "employment": [], "degrees": [], "visits": [], "honors": []}"#;
    const MISSING_HONORS: &str = r#"{"full_name": "Emmy Noether", "parents": [], "employment": [],
        "degrees": [], "visits": []}"#;

    fn options(max_attempts: u32) -> ExtractionOptions {
        ExtractionOptions {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            temperature: 0.3,
            max_tokens: 512,
            max_attempts,
            retry_backoff_ms: 1,
            call_timeout: Duration::from_millis(200),
        }
    }

    fn transcript() -> Transcript {
        Transcript {
            key: "noether_emmy".into(),
            pages: vec!["Emmy Noether was born in Erlangen in 1882.".into()],
        }
    }

    #[tokio::test]
    async fn valid_response_is_accepted_first_time() {
        let backend = Arc::new(ScriptedBackend::new().then(VALID));
        let ex = StructuredExtractor::new(backend.clone(), options(3));
        let out = ex.extract(&transcript()).await.unwrap();
        assert_eq!(out.record.full_name, "Emmy Noether");
        assert_eq!(out.attempts, 1);
        assert!(!out.repaired);
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn fenced_trailing_comma_response_is_repaired() {
        let raw = "```json\n{\"full_name\": \"Emmy Noether\", \"parents\": [], \"employment\": [], \"degrees\": [], \"visits\": [], \"honors\": [],}\n```";
        let backend = Arc::new(ScriptedBackend::new().then(raw));
        let out = StructuredExtractor::new(backend, options(1))
            .extract(&transcript())
            .await
            .unwrap();
        assert!(out.repaired);
    }

    #[tokio::test]
    async fn missing_field_is_retried_then_accepted() {
        let backend = Arc::new(ScriptedBackend::new().then(MISSING_HONORS).then(VALID));
        let out = StructuredExtractor::new(backend.clone(), options(3))
            .extract(&transcript())
            .await
            .unwrap();
        assert_eq!(out.attempts, 2);
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn exhausted_attempts_fail_the_subject() {
        let backend = Arc::new(ScriptedBackend::new().then(MISSING_HONORS));
        let err = StructuredExtractor::new(backend.clone(), options(3))
            .extract(&transcript())
            .await
            .unwrap_err();
        match err {
            SubjectError::ExtractionFailed {
                subject,
                attempts,
                detail,
            } => {
                assert_eq!(subject, "noether_emmy");
                assert_eq!(attempts, 3);
                assert!(detail.contains("honors"), "got: {detail}");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test]
    async fn provider_errors_consume_attempts() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .on_error("Erlangen", CompletionError::Provider("503".into()))
                .on("Erlangen", VALID),
        );
        let out = StructuredExtractor::new(backend, options(2))
            .extract(&transcript())
            .await
            .unwrap();
        assert_eq!(out.attempts, 2);
    }

    struct SlowBackend;

    #[async_trait]
    impl CompletionBackend for SlowBackend {
        fn name(&self) -> &str {
            "slow"
        }

        async fn complete(&self, _request: &CompletionRequest) -> Result<Completion, CompletionError> {
            sleep(Duration::from_secs(30)).await;
            Ok(Completion::default())
        }
    }

    #[tokio::test]
    async fn slow_completion_times_out() {
        let mut opts = options(2);
        opts.call_timeout = Duration::from_millis(20);
        let err = StructuredExtractor::new(Arc::new(SlowBackend), opts)
            .extract(&transcript())
            .await
            .unwrap_err();
        assert!(
            err.to_string().contains("completion timed out after 20ms"),
            "got: {err}"
        );
    }

    #[tokio::test]
    async fn blank_transcript_is_not_sent() {
        let backend = Arc::new(ScriptedBackend::new().then(VALID));
        let blank = Transcript {
            key: "empty_subject".into(),
            pages: vec![String::new(), "  ".into()],
        };
        let err = StructuredExtractor::new(backend.clone(), options(3))
            .extract(&blank)
            .await
            .unwrap_err();
        assert_eq!(err.subject(), "empty_subject");
        assert_eq!(backend.calls(), 0);
    }

    /// Rejects everything and keeps every prompt it was sent.
    #[derive(Default)]
    struct RecordingBackend {
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CompletionBackend for RecordingBackend {
        fn name(&self) -> &str {
            "recording"
        }

        async fn complete(&self, request: &CompletionRequest) -> Result<Completion, CompletionError> {
            self.prompts.lock().unwrap().push(request.prompt.clone());
            Ok(Completion {
                content: MISSING_HONORS.to_string(),
                ..Completion::default()
            })
        }
    }

    #[tokio::test]
    async fn retries_resend_the_same_prompt() {
        let backend = Arc::new(RecordingBackend::default());
        let err = StructuredExtractor::new(backend.clone(), options(3))
            .extract(&transcript())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("honors"), "got: {err}");

        let prompts = backend.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 3);
        assert!(prompts.iter().all(|p| *p == prompts[0]));
        assert!(prompts[0].ends_with("Emmy Noether was born in Erlangen in 1882."));
    }

    #[test]
    fn backoff_doubles_and_saturates() {
        assert_eq!(backoff_delay(500, 1), Duration::from_millis(500));
        assert_eq!(backoff_delay(500, 2), Duration::from_millis(1000));
        assert_eq!(backoff_delay(500, 3), Duration::from_millis(2000));
        assert_eq!(backoff_delay(500, 60), Duration::from_millis(u64::MAX));
        assert_eq!(backoff_delay(500, u32::MAX), Duration::from_millis(u64::MAX));
    }
}
