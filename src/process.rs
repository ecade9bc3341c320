//! Pipeline orchestration: bytes in, [`ReceiptOutput`] out.
//!
//! [`ReceiptPipeline`] owns every collaborator (mask provider, completion
//! clients, line recogniser) as an `Arc<dyn …>` built once, so one pipeline
//! can be shared by every request of a server or batch. The free functions
//! [`process`], [`process_sync`] and [`process_to_file`] build a pipeline
//! for a single call.
//!
//! ```text
//! bytes ─▶ decode ─▶ mask ─▶ geometry ─┬─▶ encode ─▶ fields        (vision)
//!                                      └─▶ text ───▶ fields        (ocr)
//! ```
//!
//! Decoding and geometry are CPU-bound and run in `spawn_blocking`.

use crate::config::{PipelineMode, ReceiptConfig};
use crate::error::ReceiptError;
use crate::output::{GeometrySummary, ProcessingStats, ReceiptOutput};
use crate::pipeline::encode::{decode_upright, encode_receipt};
use crate::pipeline::fields::FieldExtractor;
use crate::pipeline::geometry::{self, ExtractedImage};
use crate::pipeline::input;
use crate::pipeline::llm::{CompletionClient, LlmCompletionClient};
use crate::pipeline::mask::{decode_mask, HttpMaskProvider, LuminanceMaskProvider, MaskProvider};
use crate::pipeline::text::{extract_text, LineRecognizer, VisionLineRecognizer};
use crate::prompts::{TEXT_PROMPT, VISION_PROMPT};
use edgequake_llm::{LLMProvider, ProviderFactory};
use image::RgbImage;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

const DEFAULT_MODEL: &str = "gpt-4.1-nano";

/// The receipt pipeline with its collaborators resolved.
pub struct ReceiptPipeline {
    config: ReceiptConfig,
    mask: Arc<dyn MaskProvider>,
    vision: Option<FieldExtractor>,
    text: Option<FieldExtractor>,
    recognizer: Option<Arc<dyn LineRecognizer>>,
}

impl ReceiptPipeline {
    /// A pipeline that can only crop; add a model with
    /// [`ReceiptPipeline::with_completion`].
    pub fn new(config: ReceiptConfig, mask: Arc<dyn MaskProvider>) -> Self {
        let recognizer = config.recognizer.clone();
        Self {
            config,
            mask,
            vision: None,
            text: None,
            recognizer,
        }
    }

    /// Use `client` for vision extraction, for text extraction (unless
    /// [`ReceiptPipeline::with_text_completion`] overrides it) and, when no
    /// recogniser is configured, for line recognition.
    pub fn with_completion(mut self, client: Arc<dyn CompletionClient>) -> Self {
        let extractor = FieldExtractor::new(Arc::clone(&client), self.config.min_text_chars);
        if self.text.is_none() {
            self.text = Some(extractor.clone());
        }
        self.vision = Some(extractor);
        if self.recognizer.is_none() {
            self.recognizer = Some(Arc::new(VisionLineRecognizer::new(
                client,
                self.config.max_image_pixels,
            )));
        }
        self
    }

    /// Use a separate client for parsing OCR text.
    pub fn with_text_completion(mut self, client: Arc<dyn CompletionClient>) -> Self {
        self.text = Some(FieldExtractor::new(client, self.config.min_text_chars));
        self
    }

    pub fn with_recognizer(mut self, recognizer: Arc<dyn LineRecognizer>) -> Self {
        self.recognizer = Some(recognizer);
        self
    }

    /// Resolve every collaborator from `config`.
    ///
    /// # Errors
    /// [`ReceiptError::ProviderNotConfigured`] when no language model can be
    /// resolved; use [`ReceiptPipeline::for_cropping`] when none is needed.
    pub fn from_config(config: ReceiptConfig) -> Result<Self, ReceiptError> {
        let provider = resolve_provider(&config)?;
        let text_provider = resolve_text_provider(&config)?;
        let mask = resolve_mask_provider(&config)?;

        let client: Arc<dyn CompletionClient> = Arc::new(LlmCompletionClient::new(provider, &config));
        let text_client: Option<Arc<dyn CompletionClient>> = text_provider
            .map(|p| Arc::new(LlmCompletionClient::new(p, &config)) as Arc<dyn CompletionClient>);

        let mut pipeline = Self::new(config, mask).with_completion(client);
        if let Some(tc) = text_client {
            pipeline = pipeline.with_text_completion(tc);
        }
        Ok(pipeline)
    }

    /// A pipeline with a mask provider but no language model.
    pub fn for_cropping(config: ReceiptConfig) -> Result<Self, ReceiptError> {
        let mask = resolve_mask_provider(&config)?;
        Ok(Self::new(config, mask))
    }

    pub fn config(&self) -> &ReceiptConfig {
        &self.config
    }

    /// Decode `bytes`, obtain a mask and isolate the receipt.
    ///
    /// # Errors
    /// [`ReceiptError::DecodeFailed`] for bytes that are not an image; mask
    /// provider errors. A missing or tiny mask region is not an error.
    pub async fn crop_bytes(&self, name: &str, bytes: &[u8]) -> Result<ExtractedImage, ReceiptError> {
        let raw = decode_image(name, bytes.to_vec()).await?;

        let mask_start = Instant::now();
        let mask_bytes = self.mask.mask(bytes).await?;
        debug!(
            provider = self.mask.name(),
            elapsed_ms = mask_start.elapsed().as_millis() as u64,
            "Mask obtained"
        );

        let geometry_config = self.config.geometry.clone();
        tokio::task::spawn_blocking(move || {
            let mask = decode_mask(&mask_bytes)?;
            Ok(geometry::extract(&raw, &mask, &geometry_config))
        })
        .await
        .map_err(|e| ReceiptError::Internal(format!("Geometry task failed: {e}")))?
    }

    /// [`ReceiptPipeline::crop_bytes`] for a path or URL. Returns the input's
    /// display name with the image.
    pub async fn crop_input(&self, input_str: &str) -> Result<(String, ExtractedImage), ReceiptError> {
        let resolved = input::resolve_input(input_str, self.config.download_timeout_secs).await?;
        let extracted = self.crop_bytes(&resolved.name, &resolved.bytes).await?;
        Ok((resolved.name, extracted))
    }

    /// Run the full pipeline on one encoded image.
    ///
    /// Returns `Ok` whenever a receipt image was produced, even if field
    /// extraction failed (see [`ReceiptOutput::error`]).
    pub async fn process_bytes(
        &self,
        name: &str,
        bytes: &[u8],
        mode: PipelineMode,
    ) -> Result<ReceiptOutput, ReceiptError> {
        let total_start = Instant::now();
        info!(source = name, mode = %mode, "Processing receipt");

        let extractor = match mode {
            PipelineMode::Vision => self.vision.as_ref(),
            PipelineMode::Ocr => self.text.as_ref(),
        }
        .ok_or_else(|| ReceiptError::ProviderNotConfigured {
            provider: "none".to_string(),
            hint: "This pipeline was built without a language model.".to_string(),
        })?;

        // ── Geometry ─────────────────────────────────────────────────────
        let geometry_start = Instant::now();
        let extracted = self.crop_bytes(name, bytes).await?;
        let geometry_ms = geometry_start.elapsed().as_millis() as u64;
        let summary = GeometrySummary::from(&extracted);

        // ── Extraction ───────────────────────────────────────────────────
        let mut ocr_ms = 0;
        let mut ocr_text = None;
        let extraction_start;
        let outcome = match mode {
            PipelineMode::Vision => {
                let image = extracted.image;
                let max_pixels = self.config.max_image_pixels;
                let data = tokio::task::spawn_blocking(move || encode_receipt(&image, max_pixels))
                    .await
                    .map_err(|e| ReceiptError::Internal(format!("Encode task failed: {e}")))?
                    .map_err(|e| ReceiptError::Internal(format!("Image encoding failed: {e}")))?;
                extraction_start = Instant::now();
                let prompt = self.config.vision_prompt.as_deref().unwrap_or(VISION_PROMPT);
                extractor.extract_from_image(prompt, data).await
            }
            PipelineMode::Ocr => {
                let recognizer = self.recognizer.as_ref().ok_or_else(|| {
                    ReceiptError::ProviderNotConfigured {
                        provider: "recognizer".to_string(),
                        hint: "OCR mode needs a line recognizer.".to_string(),
                    }
                })?;
                let ocr_start = Instant::now();
                let text = extract_text(
                    recognizer.as_ref(),
                    &extracted.image,
                    self.config.min_line_chars,
                )
                .await;
                ocr_ms = ocr_start.elapsed().as_millis() as u64;
                extraction_start = Instant::now();
                let prompt = self.config.text_prompt.as_deref().unwrap_or(TEXT_PROMPT);
                let outcome = extractor.extract_from_text(prompt, &text).await;
                ocr_text = Some(text);
                outcome
            }
        };
        let extraction_ms = extraction_start.elapsed().as_millis() as u64;

        let (receipt, error) = match outcome.result {
            Ok(r) => (Some(r), None),
            Err(e) => {
                warn!(source = name, "Field extraction failed: {}", e);
                (None, Some(e))
            }
        };

        let stats = ProcessingStats {
            attempts: outcome.attempts,
            input_tokens: outcome.input_tokens,
            output_tokens: outcome.output_tokens,
            geometry_ms,
            ocr_ms,
            extraction_ms,
            total_ms: total_start.elapsed().as_millis() as u64,
        };
        info!(
            source = name,
            ok = receipt.is_some(),
            attempts = stats.attempts,
            total_ms = stats.total_ms,
            "Receipt processed"
        );

        Ok(ReceiptOutput {
            source: name.to_string(),
            mode,
            receipt,
            error,
            ocr_text,
            geometry: summary,
            stats,
        })
    }

    /// Run the full pipeline on a path or URL in the configured mode.
    pub async fn process_input(&self, input_str: &str) -> Result<ReceiptOutput, ReceiptError> {
        let resolved = input::resolve_input(input_str, self.config.download_timeout_secs).await?;
        self.process_bytes(&resolved.name, &resolved.bytes, self.config.mode)
            .await
    }
}

/// Decode an uploaded image on the blocking pool, honouring EXIF orientation.
pub async fn decode_image(name: &str, bytes: Vec<u8>) -> Result<RgbImage, ReceiptError> {
    let source_name = name.to_string();
    tokio::task::spawn_blocking(move || {
        decode_upright(&bytes)
            .map(|img| img.to_rgb8())
            .map_err(|e| ReceiptError::DecodeFailed {
                source_name,
                detail: e.to_string(),
            })
    })
    .await
    .map_err(|e| ReceiptError::Internal(format!("Decode task failed: {e}")))?
}

// ── One-shot entry points ────────────────────────────────────────────────

/// Extract a receipt from an image file or URL.
///
/// # Example
/// ```rust,no_run
/// use receipt2json::{process, ReceiptConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let output = process("receipt.jpg", &ReceiptConfig::default()).await?;
/// println!("{}", serde_json::to_string_pretty(&output.to_json())?);
/// # Ok(())
/// # }
/// ```
///
/// # Errors
/// Fatal errors only (unreadable input, undecodable image, mask service
/// down, no provider). Extraction failures are reported in the output.
pub async fn process(
    input_str: impl AsRef<str>,
    config: &ReceiptConfig,
) -> Result<ReceiptOutput, ReceiptError> {
    let pipeline = ReceiptPipeline::from_config(config.clone())?;
    pipeline.process_input(input_str.as_ref()).await
}

/// Synchronous wrapper around [`process`].
///
/// Creates a temporary tokio runtime internally.
pub fn process_sync(
    input_str: impl AsRef<str>,
    config: &ReceiptConfig,
) -> Result<ReceiptOutput, ReceiptError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| ReceiptError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(process(input_str, config))
}

/// Process an image and write the JSON body to a file.
///
/// Uses atomic write (temp file + rename) to prevent partial files.
pub async fn process_to_file(
    input_str: impl AsRef<str>,
    output_path: impl AsRef<Path>,
    config: &ReceiptConfig,
) -> Result<ReceiptOutput, ReceiptError> {
    let output = process(input_str, config).await?;
    let body = serde_json::to_string_pretty(&output.to_json())
        .map_err(|e| ReceiptError::Internal(format!("JSON serialisation failed: {e}")))?;
    write_atomic(output_path.as_ref(), body.as_bytes()).await?;
    Ok(output)
}

/// Write `contents` to `path` via a sibling temp file and a rename.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), ReceiptError> {
    let write_err = |e: std::io::Error| ReceiptError::OutputWriteFailed {
        path: path.to_path_buf(),
        source: e,
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
        }
    }
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = std::path::PathBuf::from(tmp_name);
    tokio::fs::write(&tmp_path, contents).await.map_err(write_err)?;
    tokio::fs::rename(&tmp_path, path).await.map_err(write_err)?;
    Ok(())
}

// ── Collaborator resolution ──────────────────────────────────────────────

fn create_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, ReceiptError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        ReceiptError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the LLM provider, from most-specific to least-specific:
///
/// 1. **Pre-built provider** (`config.provider`).
/// 2. **Named provider + model** (`config.provider_name`); the factory reads
///    the matching API key from the environment.
/// 3. **Environment pair** (`EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`),
///    checked before auto-detection so the model choice is honoured even
///    when several API keys are present.
/// 4. **OpenAI** when `OPENAI_API_KEY` is set.
/// 5. **Full auto-detection** (`ProviderFactory::from_env`).
fn resolve_provider(config: &ReceiptConfig) -> Result<Arc<dyn LLMProvider>, ReceiptError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
        return create_provider(name, model);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_provider(&prov, &model);
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
            return create_provider("openai", model);
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| ReceiptError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}

/// A second provider for text parsing, when `text_model` is set.
fn resolve_text_provider(config: &ReceiptConfig) -> Result<Option<Arc<dyn LLMProvider>>, ReceiptError> {
    let Some(ref text_model) = config.text_model else {
        return Ok(None);
    };
    match config.provider_name {
        Some(ref name) => create_provider(name, text_model).map(Some),
        None => {
            warn!(
                "text_model '{}' ignored: it needs provider_name alongside a pre-built provider",
                text_model
            );
            Ok(None)
        }
    }
}

fn resolve_mask_provider(config: &ReceiptConfig) -> Result<Arc<dyn MaskProvider>, ReceiptError> {
    if let Some(ref provider) = config.mask_provider {
        return Ok(Arc::clone(provider));
    }
    if let Some(ref url) = config.mask_service_url {
        info!("Using mask service at {}", url);
        return Ok(Arc::new(HttpMaskProvider::new(url.clone(), config.mask_timeout_secs)?));
    }
    debug!("No mask service configured; using local luminance mask");
    Ok(Arc::new(LuminanceMaskProvider))
}
