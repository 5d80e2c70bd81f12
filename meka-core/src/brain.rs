//! Brain module: the LLM interface shared by every pipeline stage.
//!
//! Wraps a completion provider behind the `LlmProvider` trait and adds retry,
//! generation settings and token accounting. Stages only ever see
//! `Brain::complete(prompt) -> text`.

use crate::config::{LlmConfig, RetryConfig};
use crate::error::LlmError;
use crate::providers::with_retry;
use crate::types::{CompletionRequest, CompletionResponse, Message, TokenUsage};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

/// Trait for completion providers.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Perform a full completion and return the response.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;

    /// Return the model name.
    fn model_name(&self) -> &str;
}

/// Prompt-in, text-out facade over an `LlmProvider`.
pub struct Brain {
    provider: Arc<dyn LlmProvider>,
    temperature: f32,
    max_tokens: Option<usize>,
    retry: RetryConfig,
    input_tokens: AtomicUsize,
    output_tokens: AtomicUsize,
    calls: AtomicUsize,
}

impl Brain {
    pub fn new(provider: Arc<dyn LlmProvider>, config: &LlmConfig) -> Self {
        Self {
            provider,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            retry: config.retry.clone(),
            input_tokens: AtomicUsize::new(0),
            output_tokens: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    /// Send a single-prompt completion and return the literal response text.
    pub async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        let start = Instant::now();
        let response = with_retry(&self.retry, || {
            let request = CompletionRequest {
                messages: vec![Message::user(prompt)],
                temperature: self.temperature,
                max_tokens: self.max_tokens,
                model: None,
            };
            self.provider.complete(request)
        })
        .await?;

        self.calls.fetch_add(1, Ordering::Relaxed);
        self.input_tokens
            .fetch_add(response.usage.input_tokens, Ordering::Relaxed);
        self.output_tokens
            .fetch_add(response.usage.output_tokens, Ordering::Relaxed);

        tracing::debug!(
            model = %response.model,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Completion finished"
        );
        Ok(response.text)
    }

    /// Cumulative token usage across all completions made through this brain.
    pub fn total_usage(&self) -> TokenUsage {
        TokenUsage {
            input_tokens: self.input_tokens.load(Ordering::Relaxed),
            output_tokens: self.output_tokens.load(Ordering::Relaxed),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }
}

type MockHandler = Box<dyn Fn(&str) -> Result<String, LlmError> + Send + Sync>;

/// A mock LLM provider for testing.
///
/// Answers from a handler closure when one is set, otherwise from a queue of
/// canned responses. Every prompt it receives is recorded.
pub struct MockLlmProvider {
    model: String,
    responses: Mutex<Vec<Result<CompletionResponse, LlmError>>>,
    handler: Option<MockHandler>,
    prompts: Mutex<Vec<String>>,
}

impl MockLlmProvider {
    pub fn new() -> Self {
        Self {
            model: "mock-model".to_string(),
            responses: Mutex::new(Vec::new()),
            handler: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Create a MockLlmProvider that always returns the given text.
    pub fn with_response(text: &str) -> Self {
        let text = text.to_string();
        Self::with_handler(move |_| Ok(text.clone()))
    }

    /// Create a MockLlmProvider that computes each response from the prompt.
    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&str) -> Result<String, LlmError> + Send + Sync + 'static,
    {
        Self {
            handler: Some(Box::new(handler)),
            ..Self::new()
        }
    }

    /// Queue a response to be returned by the next `complete` call.
    pub fn queue_response(&self, response: CompletionResponse) {
        self.lock_responses().push(Ok(response));
    }

    /// Queue an error to be returned by the next `complete` call.
    pub fn queue_error(&self, error: LlmError) {
        self.lock_responses().push(Err(error));
    }

    /// Create a simple text response for testing.
    pub fn text_response(text: &str) -> CompletionResponse {
        CompletionResponse {
            text: text.to_string(),
            usage: TokenUsage {
                input_tokens: 100,
                output_tokens: 50,
            },
            model: "mock-model".to_string(),
            finish_reason: Some("stop".to_string()),
        }
    }

    /// Prompts received so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn lock_responses(
        &self,
    ) -> std::sync::MutexGuard<'_, Vec<Result<CompletionResponse, LlmError>>> {
        self.responses.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MockLlmProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmProvider for MockLlmProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let prompt = request
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(prompt.clone());

        if let Some(handler) = &self.handler {
            return handler(&prompt).map(|text| Self::text_response(&text));
        }

        let mut responses = self.lock_responses();
        if responses.is_empty() {
            Ok(MockLlmProvider::text_response(
                "I'm a mock LLM. No queued responses available.",
            ))
        } else {
            responses.remove(0)
        }
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
