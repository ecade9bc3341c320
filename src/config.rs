//! Configuration types for receipt extraction.
//!
//! All pipeline behaviour is controlled through [`ReceiptConfig`], built via
//! its [`ReceiptConfigBuilder`]. Geometry knobs are grouped in
//! [`GeometryConfig`] because the geometry stage is a pure function of
//! `(image, mask, GeometryConfig)` and is also usable on its own.

use crate::error::ReceiptError;
use crate::pipeline::mask::MaskProvider;
use crate::pipeline::text::LineRecognizer;
use crate::progress::ProgressCallback;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Configuration for receipt processing.
///
/// Built via [`ReceiptConfig::builder()`] or using [`ReceiptConfig::default()`].
///
/// # Example
/// ```rust
/// use receipt2json::{PipelineMode, ReceiptConfig, ShapePolicy};
///
/// let config = ReceiptConfig::builder()
///     .mode(PipelineMode::Ocr)
///     .shape_policy(ShapePolicy::RectifyPerspective)
///     .min_contour_area(5_000.0)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct ReceiptConfig {
    /// Which extraction path runs after the crop. Default: [`PipelineMode::Vision`].
    pub mode: PipelineMode,

    /// Receipt isolation parameters.
    pub geometry: GeometryConfig,

    /// LLM model identifier used for vision calls (and text calls unless
    /// `text_model` is set). If None, uses the provider default.
    pub model: Option<String>,

    /// Separate model for parsing OCR text, e.g. a small instruct model while
    /// `model` is a vision model. Requires `provider_name`.
    pub text_model: Option<String>,

    /// LLM provider name (e.g. "openai", "anthropic", "ollama").
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature. Default: 0.1.
    pub temperature: f32,

    /// Maximum tokens the model may generate per call. Default: 2048.
    ///
    /// A long grocery receipt with 60 items serialises to roughly 1 500 tokens.
    pub max_tokens: usize,

    /// Transport-level retries of a single model call (errors and timeouts).
    /// Default: 1. Unparsable output is handled by the repair step, not here.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds (exponential backoff). Default: 500.
    pub retry_backoff_ms: u64,

    /// Per-model-call timeout in seconds. Default: 120.
    pub api_timeout_secs: u64,

    /// URL of a background-removal service returning a mask image.
    /// When None (and no `mask_provider`), a local luminance mask is used.
    pub mask_service_url: Option<String>,

    /// Mask service timeout in seconds. Default: 60.
    pub mask_timeout_secs: u64,

    /// Pre-constructed mask provider. Takes precedence over `mask_service_url`.
    pub mask_provider: Option<Arc<dyn MaskProvider>>,

    /// Pre-constructed line recogniser for [`PipelineMode::Ocr`].
    pub recognizer: Option<Arc<dyn LineRecognizer>>,

    /// OCR text shorter than this (after trimming) skips the model. Default: 5.
    pub min_text_chars: usize,

    /// Recognised lines shorter than this (after trimming) are dropped. Default: 2.
    pub min_line_chars: usize,

    /// Longest edge, in pixels, of any image sent to a model. Default: 2000.
    pub max_image_pixels: u32,

    /// Custom system prompt for vision extraction.
    pub vision_prompt: Option<String>,

    /// Custom system prompt for text extraction.
    pub text_prompt: Option<String>,

    /// Files processed in parallel by batch operations. Default: 4.
    pub concurrency: usize,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Batch progress events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ReceiptConfig {
    fn default() -> Self {
        Self {
            mode: PipelineMode::default(),
            geometry: GeometryConfig::default(),
            model: None,
            text_model: None,
            provider_name: None,
            provider: None,
            temperature: 0.1,
            max_tokens: 2048,
            max_retries: 1,
            retry_backoff_ms: 500,
            api_timeout_secs: 120,
            mask_service_url: None,
            mask_timeout_secs: 60,
            mask_provider: None,
            recognizer: None,
            min_text_chars: 5,
            min_line_chars: 2,
            max_image_pixels: 2000,
            vision_prompt: None,
            text_prompt: None,
            concurrency: 4,
            download_timeout_secs: 120,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ReceiptConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceiptConfig")
            .field("mode", &self.mode)
            .field("geometry", &self.geometry)
            .field("model", &self.model)
            .field("text_model", &self.text_model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_retries", &self.max_retries)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("mask_service_url", &self.mask_service_url)
            .field("mask_provider", &self.mask_provider.as_ref().map(|_| "<dyn MaskProvider>"))
            .field("recognizer", &self.recognizer.as_ref().map(|_| "<dyn LineRecognizer>"))
            .field("min_text_chars", &self.min_text_chars)
            .field("min_line_chars", &self.min_line_chars)
            .field("max_image_pixels", &self.max_image_pixels)
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

impl ReceiptConfig {
    /// Create a new builder for `ReceiptConfig`.
    pub fn builder() -> ReceiptConfigBuilder {
        ReceiptConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`ReceiptConfig`].
#[derive(Debug)]
pub struct ReceiptConfigBuilder {
    config: ReceiptConfig,
}

impl ReceiptConfigBuilder {
    pub fn mode(mut self, mode: PipelineMode) -> Self {
        self.config.mode = mode;
        self
    }

    pub fn geometry(mut self, geometry: GeometryConfig) -> Self {
        self.config.geometry = geometry;
        self
    }

    pub fn mask_threshold(mut self, t: u8) -> Self {
        self.config.geometry.mask_threshold = t;
        self
    }

    pub fn min_contour_area(mut self, area: f64) -> Self {
        self.config.geometry.min_contour_area = area;
        self
    }

    pub fn approx_epsilon_ratio(mut self, ratio: f64) -> Self {
        self.config.geometry.approx_epsilon_ratio = ratio;
        self
    }

    pub fn shape_policy(mut self, policy: ShapePolicy) -> Self {
        self.config.geometry.shape_policy = policy;
        self
    }

    pub fn crop_padding(mut self, px: u32) -> Self {
        self.config.geometry.crop_padding = px;
        self
    }

    pub fn rotation(mut self, direction: RotationDirection) -> Self {
        self.config.geometry.rotation = direction;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn text_model(mut self, model: impl Into<String>) -> Self {
        self.config.text_model = Some(model.into());
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

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs.max(1);
        self
    }

    pub fn mask_service_url(mut self, url: impl Into<String>) -> Self {
        self.config.mask_service_url = Some(url.into());
        self
    }

    pub fn mask_timeout_secs(mut self, secs: u64) -> Self {
        self.config.mask_timeout_secs = secs.max(1);
        self
    }

    pub fn mask_provider(mut self, provider: Arc<dyn MaskProvider>) -> Self {
        self.config.mask_provider = Some(provider);
        self
    }

    pub fn recognizer(mut self, recognizer: Arc<dyn LineRecognizer>) -> Self {
        self.config.recognizer = Some(recognizer);
        self
    }

    pub fn min_text_chars(mut self, n: usize) -> Self {
        self.config.min_text_chars = n;
        self
    }

    pub fn min_line_chars(mut self, n: usize) -> Self {
        self.config.min_line_chars = n;
        self
    }

    pub fn max_image_pixels(mut self, px: u32) -> Self {
        self.config.max_image_pixels = px.max(100);
        self
    }

    pub fn vision_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.vision_prompt = Some(prompt.into());
        self
    }

    pub fn text_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.text_prompt = Some(prompt.into());
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ReceiptConfig, ReceiptError> {
        self.config.geometry.validate()?;
        let c = &self.config;
        if c.concurrency == 0 {
            return Err(ReceiptError::InvalidConfig(
                "Concurrency must be ≥ 1".into(),
            ));
        }
        if c.text_model.is_some() && c.provider_name.is_none() && c.provider.is_none() {
            return Err(ReceiptError::InvalidConfig(
                "text_model requires provider_name".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Geometry ─────────────────────────────────────────────────────────────

/// Parameters of the receipt isolation stage.
///
/// The contour-area threshold and polygon tolerance were tuned on phone
/// photos around 3000 × 4000 px; scale `min_contour_area` down for small
/// inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeometryConfig {
    /// Mask pixels strictly above this value are foreground. Default: 0
    /// (any nonzero pixel).
    pub mask_threshold: u8,

    /// Dominant regions enclosing less than this many square pixels are
    /// treated as noise and the photo is passed through. Default: 2000.
    pub min_contour_area: f64,

    /// Polygon simplification tolerance as a fraction of the contour's
    /// perimeter. Default: 0.02.
    pub approx_epsilon_ratio: f64,

    /// What to do when the region does not simplify to four corners.
    pub shape_policy: ShapePolicy,

    /// Padding around the bounding box for [`ShapePolicy::CropBoundingBox`].
    /// Default: 10.
    pub crop_padding: u32,

    /// Direction of the quarter turn applied to landscape results.
    pub rotation: RotationDirection,
}

impl Default for GeometryConfig {
    fn default() -> Self {
        Self {
            mask_threshold: 0,
            min_contour_area: 2000.0,
            approx_epsilon_ratio: 0.02,
            shape_policy: ShapePolicy::default(),
            crop_padding: 10,
            rotation: RotationDirection::default(),
        }
    }
}

impl GeometryConfig {
    pub fn validate(&self) -> Result<(), ReceiptError> {
        if !(self.approx_epsilon_ratio > 0.0 && self.approx_epsilon_ratio <= 1.0) {
            return Err(ReceiptError::InvalidConfig(format!(
                "approx_epsilon_ratio must be in (0, 1], got {}",
                self.approx_epsilon_ratio
            )));
        }
        if !(self.min_contour_area >= 0.0) {
            return Err(ReceiptError::InvalidConfig(format!(
                "min_contour_area must be ≥ 0, got {}",
                self.min_contour_area
            )));
        }
        Ok(())
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Strategy for regions that do not simplify to exactly four corners
/// (curled, folded or partially occluded receipts).
///
/// Four-corner regions are always perspective-rectified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapePolicy {
    /// Warp the minimum-area rotated rectangle around the region to an
    /// upright rectangle.
    RectifyPerspective,
    /// Crop the padded axis-aligned bounding box without warping. (default)
    ///
    /// Warping a non-planar receipt through a rectangle stretches the curled
    /// part; a plain crop keeps the text undistorted.
    #[default]
    CropBoundingBox,
}

impl FromStr for ShapePolicy {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "rectify" | "rectify_perspective" => Ok(ShapePolicy::RectifyPerspective),
            "crop" | "crop_bounding_box" => Ok(ShapePolicy::CropBoundingBox),
            other => Err(format!("Unknown shape policy: '{other}'")),
        }
    }
}

/// Quarter-turn direction used to make landscape results portrait.
///
/// Clockwise matches phones held in the right hand with the receipt's top
/// pointing left; some capture rigs need the opposite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationDirection {
    #[default]
    Clockwise,
    CounterClockwise,
}

impl FromStr for RotationDirection {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "cw" | "clockwise" => Ok(RotationDirection::Clockwise),
            "ccw" | "counter_clockwise" | "counterclockwise" => {
                Ok(RotationDirection::CounterClockwise)
            }
            other => Err(format!("Unknown rotation direction: '{other}'")),
        }
    }
}

/// Which extraction path runs on the cropped receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineMode {
    /// Cropped image goes straight to a vision model. (default)
    #[default]
    Vision,
    /// Cropped image → line recogniser → text model.
    Ocr,
}

impl PipelineMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineMode::Vision => "vision",
            PipelineMode::Ocr => "ocr",
        }
    }
}

impl fmt::Display for PipelineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "vision" => Ok(PipelineMode::Vision),
            "ocr" | "text" => Ok(PipelineMode::Ocr),
            other => Err(format!("Unknown pipeline mode: '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = ReceiptConfig::default();
        assert_eq!(c.mode, PipelineMode::Vision);
        assert_eq!(c.geometry.min_contour_area, 2000.0);
        assert_eq!(c.geometry.approx_epsilon_ratio, 0.02);
        assert_eq!(c.geometry.shape_policy, ShapePolicy::CropBoundingBox);
        assert_eq!(c.geometry.crop_padding, 10);
        assert_eq!(c.geometry.rotation, RotationDirection::Clockwise);
        assert_eq!(c.min_text_chars, 5);
        assert_eq!(c.min_line_chars, 2);
    }

    #[test]
    fn builder_rejects_bad_epsilon() {
        let err = ReceiptConfig::builder()
            .approx_epsilon_ratio(0.0)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("approx_epsilon_ratio"));
    }

    #[test]
    fn builder_rejects_text_model_without_provider() {
        assert!(ReceiptConfig::builder().text_model("qwen2.5:7b").build().is_err());
        assert!(ReceiptConfig::builder()
            .provider_name("ollama")
            .text_model("qwen2.5:7b")
            .build()
            .is_ok());
    }

    #[test]
    fn builder_clamps() {
        let c = ReceiptConfig::builder()
            .temperature(5.0)
            .concurrency(0)
            .max_image_pixels(10)
            .build()
            .unwrap();
        assert_eq!(c.temperature, 2.0);
        assert_eq!(c.concurrency, 1);
        assert_eq!(c.max_image_pixels, 100);
    }

    #[test]
    fn enums_parse_from_cli_strings() {
        assert_eq!("ocr".parse::<PipelineMode>().unwrap(), PipelineMode::Ocr);
        assert_eq!("text".parse::<PipelineMode>().unwrap(), PipelineMode::Ocr);
        assert_eq!(
            "rectify".parse::<ShapePolicy>().unwrap(),
            ShapePolicy::RectifyPerspective
        );
        assert_eq!(
            "counter-clockwise".parse::<RotationDirection>().unwrap(),
            RotationDirection::CounterClockwise
        );
        assert!("sideways".parse::<RotationDirection>().is_err());
    }
}
