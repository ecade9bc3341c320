//! # receipt2json
//!
//! Turn a photograph of a paper receipt into structured JSON.
//!
//! ## Why this crate?
//!
//! Receipts are photographed on desks, car seats and kitchen counters. Fed
//! straight to a model, the background competes with the paper: wood grain
//! becomes "text", the receipt sits at an angle, the total is a few pixels
//! tall. This crate first isolates the receipt using a foreground mask
//! (contour, polygon simplification, four-point perspective rectification),
//! turns it upright, and only then asks a language model for the fields.
//!
//! ## Pipeline Overview
//!
//! ```text
//! photo
//!  │
//!  ├─ 1. Input     local file, URL, or uploaded bytes
//!  ├─ 2. Mask      foreground mask (HTTP service or local Otsu threshold)
//!  ├─ 3. Geometry  largest contour → quadrilateral warp or padded crop → portrait
//!  ├─ 4a. Vision   cropped image → vision model
//!  ├─ 4b. OCR      cropped image → line recogniser → noise filter → text model
//!  ├─ 5. Fields    locate JSON; one repair attempt if unparsable
//!  └─ 6. Output    normalised receipt + geometry summary + stats
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use receipt2json::{process, ReceiptConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY
//!     let config = ReceiptConfig::default();
//!     let output = process("receipt.jpg", &config).await?;
//!     println!("{}", serde_json::to_string_pretty(&output.to_json())?);
//!     eprintln!("geometry: {:?}, {} model calls",
//!         output.geometry.method,
//!         output.stats.attempts);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature  | Default | Description |
//! |----------|---------|-------------|
//! | `server` | on (via `cli`) | axum router with single-image and zip batch endpoints |
//! | `cli`    | on      | Enables the `receipt2json` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Library-only use:
//! ```toml
//! receipt2json = { version = "0.1", default-features = false }
//! ```
//!
//! ## Testing without a model
//!
//! Every external capability sits behind a trait with an in-crate test
//! double: [`MockCompletionClient`], [`MockLineRecognizer`] and
//! [`StaticMaskProvider`].

// ── Modules ──────────────────────────────────────────────────────────────

pub mod batch;
pub mod config;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod process;
pub mod progress;
pub mod prompts;
#[cfg(feature = "server")]
pub mod server;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use batch::{process_batch, process_stream, process_zip, BatchItem, ReceiptStream};
pub use config::{
    GeometryConfig, PipelineMode, ReceiptConfig, ReceiptConfigBuilder, RotationDirection,
    ShapePolicy,
};
pub use error::{ExtractionError, ReceiptError};
pub use output::{GeometrySummary, LineItem, ProcessingStats, Receipt, ReceiptOutput};
pub use pipeline::geometry::{extract, ExtractedImage, ExtractionMethod};
pub use pipeline::llm::{CompletionClient, LlmCompletionClient, MockCompletionClient};
pub use pipeline::mask::{HttpMaskProvider, LuminanceMaskProvider, MaskProvider, StaticMaskProvider};
pub use pipeline::text::{LineRecognizer, MockLineRecognizer, VisionLineRecognizer};
pub use process::{process, process_sync, process_to_file, ReceiptPipeline};
pub use progress::{NoopProgressCallback, ProgressCallback, ReceiptProgressCallback};
