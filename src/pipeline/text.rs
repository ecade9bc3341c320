//! Text extraction: recognise lines on the receipt, drop noise, join.
//!
//! Recognisers on busy backgrounds hallucinate short fragments and runs of
//! CJK ideographs on wood grain and fabric. [`is_valid_line`] rejects those
//! before the text reaches the language model. A failing recogniser never
//! fails the request: [`extract_text`] logs the error and yields an empty
//! string, which the field extractor then reports as empty input.

use crate::pipeline::encode::encode_receipt;
use crate::pipeline::llm::{CompletionClient, CompletionInput};
use crate::prompts::TRANSCRIBE_PROMPT;
use async_trait::async_trait;
use image::RgbImage;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// One recognised line, in reading order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognizedLine {
    pub text: String,
    /// `[x, y, width, height]` when the recogniser reports positions.
    pub bbox: Option<[u32; 4]>,
}

impl RecognizedLine {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            bbox: None,
        }
    }
}

/// A recogniser failure. Logged and suppressed by [`extract_text`].
#[derive(Debug, Clone, Error)]
#[error("line recognition failed: {0}")]
pub struct RecognitionError(pub String);

/// Reads text lines off a receipt image, top to bottom.
#[async_trait]
pub trait LineRecognizer: Send + Sync {
    async fn recognize(&self, image: &RgbImage) -> Result<Vec<RecognizedLine>, RecognitionError>;
}

static CJK_IDEOGRAPH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\u{4e00}-\u{9fff}]").expect("valid regex"));

/// Whether a recognised line is worth keeping: non-blank, at least
/// `min_chars` characters after trimming, and free of CJK ideographs.
pub fn is_valid_line(line: &str, min_chars: usize) -> bool {
    let trimmed = line.trim();
    !trimmed.is_empty() && trimmed.chars().count() >= min_chars && !CJK_IDEOGRAPH.is_match(trimmed)
}

/// Filter `lines` and join the survivors with newlines, preserving order
/// and leading indentation.
pub fn join_valid_lines(lines: &[RecognizedLine], min_chars: usize) -> String {
    lines
        .iter()
        .filter(|l| is_valid_line(&l.text, min_chars))
        .map(|l| l.text.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Run `recognizer` and return the filtered text. Recogniser errors become
/// an empty string.
pub async fn extract_text(
    recognizer: &dyn LineRecognizer,
    image: &RgbImage,
    min_line_chars: usize,
) -> String {
    match recognizer.recognize(image).await {
        Ok(lines) => {
            let text = join_valid_lines(&lines, min_line_chars);
            debug!(
                recognised = lines.len(),
                kept = text.lines().count(),
                "Recognised receipt lines"
            );
            text
        }
        Err(e) => {
            warn!("{}; continuing with empty text", e);
            String::new()
        }
    }
}

// ── Vision-model recogniser ──────────────────────────────────────────────

/// Asks a vision model to transcribe the receipt line by line.
pub struct VisionLineRecognizer {
    client: Arc<dyn CompletionClient>,
    max_image_pixels: u32,
}

impl VisionLineRecognizer {
    pub fn new(client: Arc<dyn CompletionClient>, max_image_pixels: u32) -> Self {
        Self {
            client,
            max_image_pixels,
        }
    }
}

#[async_trait]
impl LineRecognizer for VisionLineRecognizer {
    async fn recognize(&self, image: &RgbImage) -> Result<Vec<RecognizedLine>, RecognitionError> {
        let data = encode_receipt(image, self.max_image_pixels)
            .map_err(|e| RecognitionError(format!("image encoding failed: {e}")))?;
        let completion = self
            .client
            .complete(TRANSCRIBE_PROMPT, CompletionInput::Image(data))
            .await
            .map_err(|e| RecognitionError(e.to_string()))?;
        Ok(completion
            .content
            .lines()
            .filter(|l| !l.trim_start().starts_with("```"))
            .map(RecognizedLine::new)
            .collect())
    }
}

// ── Mock ─────────────────────────────────────────────────────────────────

/// Returns fixed lines (or a fixed failure) for every image.
#[derive(Debug, Clone)]
pub struct MockLineRecognizer {
    result: Result<Vec<RecognizedLine>, RecognitionError>,
}

impl MockLineRecognizer {
    pub fn new<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            result: Ok(lines.into_iter().map(RecognizedLine::new).collect()),
        }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            result: Err(RecognitionError(message.into())),
        }
    }
}

#[async_trait]
impl LineRecognizer for MockLineRecognizer {
    async fn recognize(&self, _image: &RgbImage) -> Result<Vec<RecognizedLine>, RecognitionError> {
        self.result.clone()
    }
}
