//! Language-model port used by every graph node, and its provider-backed implementation

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use clubsdr_ai::{
    Context, Message, Model, OutputSchema, StreamOptions, providers::LlmProvider,
    stream::collect_message,
};
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Calculate delay for a given attempt (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_secs =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Check if an error message describes a transient failure
fn is_retryable_error(error: &str) -> bool {
    let lower = error.to_lowercase();
    if lower.contains("429") || lower.contains("rate limit") || lower.contains("too many requests")
    {
        return true;
    }
    if lower.contains("timeout") || lower.contains("timed out") || lower.contains("connection") {
        return true;
    }
    if ["500", "502", "503", "504"].iter().any(|code| lower.contains(code)) {
        return true;
    }
    lower.contains("overloaded")
}

/// A single model invocation
#[derive(Debug, Clone, Default)]
pub struct InferenceRequest {
    pub system_prompt: Option<String>,
    pub messages: Vec<Message>,
    /// Capabilities the model may request; empty for plain generation
    pub tools: Vec<clubsdr_ai::Tool>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl InferenceRequest {
    /// A request with a system prompt and a single user message
    pub fn prompt(system_prompt: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system_prompt: Some(system_prompt.into()),
            messages: vec![Message::user(user)],
            ..Default::default()
        }
    }

    fn context(&self) -> Context {
        Context {
            system_prompt: self.system_prompt.clone(),
            messages: self.messages.clone(),
            tools: self.tools.clone(),
        }
    }

    fn options(&self) -> StreamOptions {
        StreamOptions {
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }
}

/// Port to a chat model.
///
/// `complete` returns the assistant message (text and/or tool calls);
/// `structured` returns a JSON value the caller validates against the schema.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, request: &InferenceRequest) -> Result<Message>;

    async fn structured(
        &self,
        request: &InferenceRequest,
        schema: &OutputSchema,
    ) -> Result<serde_json::Value>;
}

/// Shared handle to a language model
pub type SharedModel = Arc<dyn LanguageModel>;

/// Language model backed by an [`LlmProvider`], with retry on transient failures
pub struct ProviderModel {
    provider: Arc<dyn LlmProvider>,
    model: Model,
    retry_config: RetryConfig,
}

impl ProviderModel {
    pub fn new(provider: Arc<dyn LlmProvider>, model: Model) -> Self {
        Self {
            provider,
            model,
            retry_config: RetryConfig::default(),
        }
    }

    /// Set retry configuration
    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = config;
        self
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    async fn complete_once(&self, request: &InferenceRequest) -> Result<Message> {
        let stream = self
            .provider
            .stream(&self.model, &request.context(), &request.options())
            .await?;
        let (message, usage) = collect_message(stream).await.map_err(Error::Capability)?;
        tracing::debug!(
            model = %self.model.id,
            input_tokens = usage.input,
            output_tokens = usage.output,
            "completion finished"
        );
        Ok(message)
    }

    /// Whether a failed attempt should be retried
    fn should_retry(&self, attempt: u32, error: &Error) -> bool {
        if attempt >= self.retry_config.max_retries {
            return false;
        }
        match error {
            Error::Ai(e) => e.is_retryable() || is_retryable_error(&e.to_string()),
            Error::Capability(msg) => is_retryable_error(msg),
            _ => false,
        }
    }

    async fn backoff(&self, attempt: u32, error: &Error) {
        let delay = self.retry_config.delay_for_attempt(attempt);
        tracing::warn!(
            "Request failed (attempt {}/{}): {}. Retrying in {:?}...",
            attempt + 1,
            self.retry_config.max_retries + 1,
            error,
            delay
        );
        tokio::time::sleep(delay).await;
    }
}

#[async_trait]
impl LanguageModel for ProviderModel {
    async fn complete(&self, request: &InferenceRequest) -> Result<Message> {
        let mut attempt = 0u32;
        loop {
            match self.complete_once(request).await {
                Ok(message) => return Ok(message),
                Err(e) if self.should_retry(attempt, &e) => {
                    self.backoff(attempt, &e).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn structured(
        &self,
        request: &InferenceRequest,
        schema: &OutputSchema,
    ) -> Result<serde_json::Value> {
        let context = request.context();
        let options = request.options();
        let mut attempt = 0u32;
        loop {
            let result = self
                .provider
                .structured(&self.model, &context, schema, &options)
                .await
                .map_err(Error::from);
            match result {
                Ok(value) => return Ok(value),
                Err(e) if self.should_retry(attempt, &e) => {
                    self.backoff(attempt, &e).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Validate a value using a pre-compiled validator.
/// Returns `Some(error_message)` if validation fails, `None` if valid.
pub(crate) fn validate_with_validator(
    value: &serde_json::Value,
    validator: &jsonschema::Validator,
) -> Option<String> {
    let errors: Vec<String> = validator
        .iter_errors(value)
        .map(|e| {
            let path = e.instance_path.to_string();
            if path.is_empty() {
                e.to_string()
            } else {
                format!("{}: {}", path, e)
            }
        })
        .collect();

    if errors.is_empty() {
        None
    } else {
        Some(errors.join("\n"))
    }
}

/// Request structured output, validate it against the schema and decode it.
///
/// Non-conforming output is reported as [`Error::Malformed`].
pub async fn request_structured<T: DeserializeOwned>(
    model: &dyn LanguageModel,
    request: &InferenceRequest,
    schema: &OutputSchema,
) -> Result<T> {
    let value = model.structured(request, schema).await?;
    let validator = jsonschema::validator_for(&schema.schema)
        .map_err(|e| Error::Other(format!("invalid output schema '{}': {}", schema.name, e)))?;
    if let Some(errors) = validate_with_validator(&value, &validator) {
        return Err(Error::Malformed(errors));
    }
    serde_json::from_value(value).map_err(|e| Error::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clubsdr_ai::stream::{MessageEvent, MessageEventStream};
    use clubsdr_ai::{Provider, StopReason, Usage};
    use parking_lot::Mutex;
    use serde::Deserialize;
    use std::collections::VecDeque;

    /// Provider replaying queued outcomes
    struct QueueProvider {
        completions: Mutex<VecDeque<clubsdr_ai::Result<String>>>,
        structured: Mutex<VecDeque<clubsdr_ai::Result<serde_json::Value>>>,
    }

    impl QueueProvider {
        fn new() -> Self {
            Self {
                completions: Mutex::new(VecDeque::new()),
                structured: Mutex::new(VecDeque::new()),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for QueueProvider {
        async fn stream(
            &self,
            _model: &Model,
            _context: &Context,
            _options: &StreamOptions,
        ) -> clubsdr_ai::Result<MessageEventStream> {
            let text = self
                .completions
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(clubsdr_ai::Error::Aborted))?;
            let message = Message::assistant_text(text);
            let events = vec![MessageEvent::Done {
                message,
                stop_reason: StopReason::Stop,
                usage: Usage::default(),
            }];
            Ok(Box::pin(futures::stream::iter(events)))
        }

        async fn structured(
            &self,
            _model: &Model,
            _context: &Context,
            _schema: &OutputSchema,
            _options: &StreamOptions,
        ) -> clubsdr_ai::Result<serde_json::Value> {
            self.structured
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(clubsdr_ai::Error::Aborted))
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_retries: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            backoff_multiplier: 1.0,
        }
    }

    fn model_with(provider: QueueProvider) -> ProviderModel {
        ProviderModel::new(Arc::new(provider), Model::chat(Provider::OpenAI, "gpt-4o"))
            .with_retry_config(fast_retry())
    }

    #[derive(Debug, Deserialize)]
    struct Verdict {
        relevant: bool,
    }

    fn verdict_schema() -> OutputSchema {
        OutputSchema::new(
            "grade",
            serde_json::json!({
                "type": "object",
                "properties": { "relevant": { "type": "boolean" } },
                "required": ["relevant"],
                "additionalProperties": false
            }),
        )
    }

    #[test]
    fn test_delay_for_attempt_is_capped() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(30));
    }

    #[test]
    fn test_is_retryable_error_strings() {
        assert!(is_retryable_error("HTTP 429 Too Many Requests"));
        assert!(is_retryable_error("connection reset by peer"));
        assert!(is_retryable_error("upstream returned 503"));
        assert!(is_retryable_error("Model is overloaded"));
        assert!(!is_retryable_error("Invalid or missing API key"));
    }

    #[tokio::test]
    async fn test_complete_retries_transient_failures() {
        let provider = QueueProvider::new();
        provider
            .completions
            .lock()
            .push_back(Err(clubsdr_ai::Error::RateLimited { retry_after: None }));
        provider.completions.lock().push_back(Ok("Olá!".into()));
        let model = model_with(provider);

        let message = model
            .complete(&InferenceRequest::prompt("sys", "oi"))
            .await
            .unwrap();
        assert_eq!(message.text(), "Olá!");
    }

    #[tokio::test]
    async fn test_complete_does_not_retry_auth_errors() {
        let provider = QueueProvider::new();
        provider
            .completions
            .lock()
            .push_back(Err(clubsdr_ai::Error::InvalidApiKey));
        provider.completions.lock().push_back(Ok("never".into()));
        let model = model_with(provider);

        let err = model
            .complete(&InferenceRequest::prompt("sys", "oi"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Ai(clubsdr_ai::Error::InvalidApiKey)));
    }

    #[tokio::test]
    async fn test_request_structured_decodes_conforming_output() {
        let provider = QueueProvider::new();
        provider
            .structured
            .lock()
            .push_back(Ok(serde_json::json!({"relevant": true})));
        let model = model_with(provider);

        let verdict: Verdict = request_structured(
            &model,
            &InferenceRequest::prompt("grade", "q"),
            &verdict_schema(),
        )
        .await
        .unwrap();
        assert!(verdict.relevant);
    }

    #[tokio::test]
    async fn test_request_structured_rejects_nonconforming_output() {
        let provider = QueueProvider::new();
        provider
            .structured
            .lock()
            .push_back(Ok(serde_json::json!({"relevant": "yes"})));
        let model = model_with(provider);

        let err = request_structured::<Verdict>(
            &model,
            &InferenceRequest::prompt("grade", "q"),
            &verdict_schema(),
        )
        .await
        .unwrap_err();
        assert!(err.is_malformed());
    }
}
