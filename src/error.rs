//! Error types for the receipt2json library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`ReceiptError`]: **Fatal**: the request cannot proceed at all
//!   (undecodable upload, unreachable mask service, provider not configured).
//!   Returned as `Err(ReceiptError)` from the top-level `process*` functions.
//!
//! * [`ExtractionError`]: **Non-fatal**: the image was decoded and cropped,
//!   but field extraction did not produce a receipt (empty OCR text, model
//!   output that stayed unparsable after the repair attempt, model timeout).
//!   Stored inside [`crate::output::ReceiptOutput`] together with the raw
//!   model output so callers can diagnose what the model actually said.
//!
//! A detection miss (no foreground region in the mask) is neither: the
//! geometry stage passes the original photograph through and records the
//! decision in [`crate::output::GeometrySummary`].

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the receipt2json library.
#[derive(Debug, Error)]
pub enum ReceiptError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Image file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The input string is not a valid file path or URL.
    #[error("Invalid input '{input}': not a file path or a valid HTTP/HTTPS URL")]
    InvalidInput { input: String },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --download-timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    /// The uploaded bytes are not a decodable image.
    #[error("Cannot decode image '{source_name}': {detail}")]
    DecodeFailed { source_name: String, detail: String },

    // ── Upstream errors ───────────────────────────────────────────────────
    /// The mask provider could not be reached or returned garbage.
    #[error("Mask provider unavailable: {detail}")]
    MaskUnavailable { detail: String },

    /// The mask provider did not answer in time.
    #[error("Mask provider timed out after {secs}s")]
    MaskTimeout { secs: u64 },

    /// The configured LLM provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Batch errors ──────────────────────────────────────────────────────
    /// A batch upload, or one entry of it, could not be read as a zip archive.
    #[error("Invalid zip archive: {detail}")]
    InvalidArchive { detail: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write an output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReceiptError {
    /// Whether the failure was caused by what the caller sent (as opposed to
    /// an upstream service or this process).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ReceiptError::FileNotFound { .. }
                | ReceiptError::PermissionDenied { .. }
                | ReceiptError::InvalidInput { .. }
                | ReceiptError::DecodeFailed { .. }
                | ReceiptError::InvalidArchive { .. }
        )
    }

    /// Whether the failure came from an external service.
    pub fn is_upstream_error(&self) -> bool {
        matches!(
            self,
            ReceiptError::MaskUnavailable { .. }
                | ReceiptError::MaskTimeout { .. }
                | ReceiptError::DownloadFailed { .. }
                | ReceiptError::DownloadTimeout { .. }
        )
    }
}

/// A non-fatal field-extraction failure.
///
/// Stored on [`crate::output::ReceiptOutput::error`]; the request itself
/// succeeded in the sense that a cropped image was produced.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractionError {
    /// OCR produced (almost) nothing; the model was never called.
    #[error("OCR text is empty or too short ({chars} chars)")]
    EmptyInput { chars: usize },

    /// Neither the first response nor the repaired one contained valid JSON.
    #[error("Model output could not be parsed as JSON after {attempts} attempts")]
    ParseFailed {
        attempts: u8,
        raw_response: String,
        repair_response: Option<String>,
    },

    /// The language-model service failed after transport retries.
    #[error("Model service unavailable: {detail}")]
    UpstreamUnavailable { detail: String },

    /// The language-model call exceeded its timeout after transport retries.
    #[error("Model call timed out after {secs}s")]
    Timeout { secs: u64 },
}

impl ExtractionError {
    /// Upstream failures are reported differently from "the model answered
    /// but we could not use it".
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            ExtractionError::UpstreamUnavailable { .. } | ExtractionError::Timeout { .. }
        )
    }

    /// The raw model output associated with this error, if any.
    pub fn raw_response(&self) -> Option<&str> {
        match self {
            ExtractionError::ParseFailed { raw_response, .. } => Some(raw_response),
            _ => None,
        }
    }
}
