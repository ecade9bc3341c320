//! Language-model calls: one system prompt, one input, one text response.
//!
//! [`CompletionClient`] is the seam between the field extractor's state
//! machine and the provider stack. [`LlmCompletionClient`] drives any
//! `edgequake-llm` provider; [`MockCompletionClient`] replays a script for
//! offline tests.
//!
//! ## Retry Strategy
//!
//! Only transport failures are retried here: provider errors (HTTP 429 /
//! 503) and calls exceeding `api_timeout_secs`. Exponential backoff
//! (`retry_backoff_ms * 2^attempt`) spaces the attempts. A response that
//! arrived but is not valid JSON is *not* a transport failure; the repair
//! step in [`crate::pipeline::fields`] deals with that.

use crate::config::ReceiptConfig;
use crate::error::ExtractionError;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use thiserror::Error;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, warn};

/// What the model is asked to read.
#[derive(Debug, Clone)]
pub enum CompletionInput {
    /// Sent as the user message text.
    Text(String),
    /// Sent as a single image attachment with empty user text.
    Image(ImageData),
}

/// A model response with its token accounting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub content: String,
    pub input_tokens: usize,
    pub output_tokens: usize,
}

/// Why a call produced no response, after transport retries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("model call timed out after {secs}s")]
    Timeout { secs: u64 },
    #[error("{detail}")]
    Upstream { detail: String },
}

impl From<CallError> for ExtractionError {
    fn from(e: CallError) -> Self {
        match e {
            CallError::Timeout { secs } => ExtractionError::Timeout { secs },
            CallError::Upstream { detail } => ExtractionError::UpstreamUnavailable { detail },
        }
    }
}

/// `complete(prompt, input) -> raw text`.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(
        &self,
        system_prompt: &str,
        input: CompletionInput,
    ) -> Result<Completion, CallError>;
}

// ── edgequake-llm adapter ────────────────────────────────────────────────

/// Completion client over an `edgequake-llm` provider, with a per-call
/// timeout and transport retries.
pub struct LlmCompletionClient {
    provider: Arc<dyn LLMProvider>,
    options: CompletionOptions,
    max_retries: u32,
    retry_backoff_ms: u64,
    timeout_secs: u64,
}

impl LlmCompletionClient {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &ReceiptConfig) -> Self {
        Self {
            provider,
            options: build_options(config),
            max_retries: config.max_retries,
            retry_backoff_ms: config.retry_backoff_ms,
            timeout_secs: config.api_timeout_secs,
        }
    }
}

/// Build `CompletionOptions` from the receipt config.
fn build_options(config: &ReceiptConfig) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(config.temperature),
        max_tokens: Some(config.max_tokens),
        ..Default::default()
    }
}

/// Build the two-message request: system prompt, then the input.
fn build_messages(system_prompt: &str, input: CompletionInput) -> Vec<ChatMessage> {
    let user = match input {
        CompletionInput::Text(text) => ChatMessage::user(text),
        CompletionInput::Image(image) => ChatMessage::user_with_images("", vec![image]),
    };
    vec![ChatMessage::system(system_prompt), user]
}

#[async_trait]
impl CompletionClient for LlmCompletionClient {
    async fn complete(
        &self,
        system_prompt: &str,
        input: CompletionInput,
    ) -> Result<Completion, CallError> {
        let start = Instant::now();
        let messages = build_messages(system_prompt, input);
        let limit = Duration::from_secs(self.timeout_secs);

        let mut last_err = CallError::Upstream {
            detail: "Unknown error".to_string(),
        };

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = self.retry_backoff_ms * 2u64.pow(attempt - 1);
                warn!(
                    "Model call: retry {}/{} after {}ms",
                    attempt, self.max_retries, backoff
                );
                sleep(Duration::from_millis(backoff)).await;
            }

            match timeout(limit, self.provider.chat(&messages, Some(&self.options))).await {
                Ok(Ok(response)) => {
                    debug!(
                        "Model call: {} input tokens, {} output tokens, {:?}",
                        response.prompt_tokens,
                        response.completion_tokens,
                        start.elapsed()
                    );
                    return Ok(Completion {
                        content: response.content,
                        input_tokens: response.prompt_tokens,
                        output_tokens: response.completion_tokens,
                    });
                }
                Ok(Err(e)) => {
                    warn!("Model call: attempt {} failed: {}", attempt + 1, e);
                    last_err = CallError::Upstream {
                        detail: e.to_string(),
                    };
                }
                Err(_) => {
                    warn!(
                        "Model call: attempt {} timed out after {}s",
                        attempt + 1,
                        self.timeout_secs
                    );
                    last_err = CallError::Timeout {
                        secs: self.timeout_secs,
                    };
                }
            }
        }

        Err(last_err)
    }
}

// ── Scripted mock ────────────────────────────────────────────────────────

/// A recorded request made to [`MockCompletionClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub system_prompt: String,
    /// The text input, or `None` for image inputs.
    pub text: Option<String>,
}

/// Replays scripted responses in order and records every request.
///
/// Once the script is exhausted every call fails with
/// [`CallError::Upstream`].
#[derive(Debug, Default)]
pub struct MockCompletionClient {
    script: Mutex<VecDeque<Result<String, CallError>>>,
    calls: Mutex<Vec<RecordedCall>>,
    count: AtomicUsize,
}

impl MockCompletionClient {
    pub fn new<I>(responses: I) -> Self
    where
        I: IntoIterator<Item = Result<String, CallError>>,
    {
        Self {
            script: Mutex::new(responses.into_iter().collect()),
            ..Self::default()
        }
    }

    /// A client that answers every listed string successfully.
    pub fn replying<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(responses.into_iter().map(|s| Ok(s.into())))
    }

    /// Number of calls received so far.
    pub fn call_count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Requests received so far, in order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl CompletionClient for MockCompletionClient {
    async fn complete(
        &self,
        system_prompt: &str,
        input: CompletionInput,
    ) -> Result<Completion, CallError> {
        self.count.fetch_add(1, Ordering::SeqCst);
        let text = match input {
            CompletionInput::Text(t) => Some(t),
            CompletionInput::Image(_) => None,
        };
        let input_tokens = system_prompt.len() / 4 + text.as_ref().map_or(0, |t| t.len() / 4);
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RecordedCall {
                system_prompt: system_prompt.to_string(),
                text,
            });

        let next = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match next {
            Some(Ok(content)) => Ok(Completion {
                output_tokens: content.len() / 4,
                content,
                input_tokens,
            }),
            Some(Err(e)) => Err(e),
            None => Err(CallError::Upstream {
                detail: "mock script exhausted".to_string(),
            }),
        }
    }
}
