//! Field extraction: model response → [`Receipt`], with one repair attempt.
//!
//! ```text
//! START ──▶ ATTEMPT_1 ──ok──▶ SUCCESS
//!               │
//!          unparsable
//!               ▼
//!        ATTEMPT_2_REPAIR ──ok──▶ SUCCESS
//!               │
//!          unparsable
//!               ▼
//!            FAILED (ParseFailed, carries both raw responses)
//! ```
//!
//! The repair attempt sends the *first* response back with
//! [`REPAIR_PROMPT`]; there is no third attempt. Text shorter than
//! `min_text_chars` never reaches the model. Transport retries happen below
//! this level in [`crate::pipeline::llm`]; if they are exhausted on the first
//! attempt the outcome is `UpstreamUnavailable` or `Timeout`.

use crate::error::ExtractionError;
use crate::output::Receipt;
use crate::pipeline::llm::{CompletionClient, CompletionInput};
use crate::prompts::{text_user_message, REPAIR_PROMPT};
use edgequake_llm::ImageData;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

static FENCED_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json|JSON)?\s*(.*?)\s*```").expect("valid regex"));

/// Result of one run of the state machine.
#[derive(Debug, Clone)]
pub struct FieldOutcome {
    pub result: Result<Receipt, ExtractionError>,
    /// Model calls made (0 when the input was empty).
    pub attempts: u8,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl FieldOutcome {
    fn empty(chars: usize) -> Self {
        Self {
            result: Err(ExtractionError::EmptyInput { chars }),
            attempts: 0,
            input_tokens: 0,
            output_tokens: 0,
        }
    }
}

/// Drives a [`CompletionClient`] through the two-attempt extraction.
#[derive(Clone)]
pub struct FieldExtractor {
    client: Arc<dyn CompletionClient>,
    min_text_chars: usize,
}

impl FieldExtractor {
    pub fn new(client: Arc<dyn CompletionClient>, min_text_chars: usize) -> Self {
        Self {
            client,
            min_text_chars,
        }
    }

    /// Extract fields from recognised receipt text.
    pub async fn extract_from_text(&self, system_prompt: &str, text: &str) -> FieldOutcome {
        let chars = text.trim().chars().count();
        if chars < self.min_text_chars {
            debug!(chars, "OCR text too short; skipping model");
            return FieldOutcome::empty(chars);
        }
        self.run(system_prompt, CompletionInput::Text(text_user_message(text)))
            .await
    }

    /// Extract fields directly from a receipt image.
    pub async fn extract_from_image(&self, system_prompt: &str, image: ImageData) -> FieldOutcome {
        self.run(system_prompt, CompletionInput::Image(image)).await
    }

    async fn run(&self, system_prompt: &str, input: CompletionInput) -> FieldOutcome {
        let mut outcome = FieldOutcome {
            result: Err(ExtractionError::UpstreamUnavailable {
                detail: String::new(),
            }),
            attempts: 1,
            input_tokens: 0,
            output_tokens: 0,
        };

        // ── Attempt 1 ────────────────────────────────────────────────────
        let first = match self.client.complete(system_prompt, input).await {
            Ok(c) => c,
            Err(e) => {
                outcome.result = Err(e.into());
                return outcome;
            }
        };
        outcome.input_tokens += first.input_tokens as u64;
        outcome.output_tokens += first.output_tokens as u64;

        if let Some(receipt) = parse_receipt(&first.content) {
            outcome.result = Ok(receipt);
            return outcome;
        }

        // ── Attempt 2: repair ────────────────────────────────────────────
        warn!(
            response_len = first.content.len(),
            "Model output is not valid JSON; attempting repair"
        );
        outcome.attempts = 2;
        let repair = match self
            .client
            .complete(REPAIR_PROMPT, CompletionInput::Text(first.content.clone()))
            .await
        {
            Ok(c) => c,
            Err(e) => {
                warn!("Repair call failed: {}", e);
                outcome.result = Err(ExtractionError::ParseFailed {
                    attempts: 2,
                    raw_response: first.content,
                    repair_response: None,
                });
                return outcome;
            }
        };
        outcome.input_tokens += repair.input_tokens as u64;
        outcome.output_tokens += repair.output_tokens as u64;

        outcome.result = match parse_receipt(&repair.content) {
            Some(receipt) => {
                debug!("Repair succeeded");
                Ok(receipt)
            }
            None => Err(ExtractionError::ParseFailed {
                attempts: 2,
                raw_response: first.content,
                repair_response: Some(repair.content),
            }),
        };
        outcome
    }
}

/// Locate, parse and normalise the receipt in a model response.
pub fn parse_receipt(content: &str) -> Option<Receipt> {
    locate_json(content).as_ref().and_then(Receipt::from_value)
}

/// Find the JSON object in a model response.
///
/// Candidates, in order: the `{…}` span inside the first fenced code block,
/// then the span from the first `{` to the last `}` of the whole response.
/// The first candidate that parses as a JSON object wins.
pub fn locate_json(content: &str) -> Option<Value> {
    let fenced = FENCED_BLOCK
        .captures(content)
        .and_then(|c| c.get(1))
        .and_then(|m| brace_span(m.as_str()));
    let whole = brace_span(content);

    fenced
        .into_iter()
        .chain(whole)
        .find_map(|candidate| match serde_json::from_str::<Value>(candidate) {
            Ok(v @ Value::Object(_)) => Some(v),
            _ => None,
        })
}

fn brace_span(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let end = s.rfind('}')?;
    (start < end).then(|| &s[start..=end])
}
