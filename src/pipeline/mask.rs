//! Mask Provider boundary: encoded photo bytes in, encoded grayscale mask out.
//!
//! The geometry stage only assumes "nonzero where foreground", so any
//! background-removal model can sit behind [`MaskProvider`]:
//!
//! * [`HttpMaskProvider`] posts the photo to a segmentation service
//!   (multipart field `file`) and takes the response body as the mask.
//! * [`LuminanceMaskProvider`] needs no network: an Otsu threshold on
//!   luminance, which separates white receipt paper from a darker table well
//!   enough for clean captures.
//! * [`StaticMaskProvider`] returns a fixed mask (tests, pre-computed masks).
//!
//! Providers are built once and shared across requests as
//! `Arc<dyn MaskProvider>`; none hold mutable state.

use crate::error::ReceiptError;
use crate::pipeline::encode::{decode_upright, png_bytes};
use async_trait::async_trait;
use image::{ColorType, DynamicImage, GrayImage, Luma};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Produces a foreground mask for a photograph.
#[async_trait]
pub trait MaskProvider: Send + Sync {
    /// Return an encoded grayscale (or RGBA cut-out) image of the same scene.
    async fn mask(&self, image_bytes: &[u8]) -> Result<Vec<u8>, ReceiptError>;

    /// Short name for logs.
    fn name(&self) -> &str {
        "mask"
    }
}

// ── HTTP ─────────────────────────────────────────────────────────────────

/// Client for a background-removal service.
pub struct HttpMaskProvider {
    url: String,
    timeout_secs: u64,
    client: reqwest::Client,
}

impl HttpMaskProvider {
    pub fn new(url: impl Into<String>, timeout_secs: u64) -> Result<Self, ReceiptError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ReceiptError::Internal(format!("Failed to build mask client: {e}")))?;
        Ok(Self {
            url: url.into(),
            timeout_secs,
            client,
        })
    }
}

#[async_trait]
impl MaskProvider for HttpMaskProvider {
    async fn mask(&self, image_bytes: &[u8]) -> Result<Vec<u8>, ReceiptError> {
        let start = Instant::now();
        let part = reqwest::multipart::Part::bytes(image_bytes.to_vec()).file_name("image");
        let form = reqwest::multipart::Form::new().part("file", part);

        let map_err = |e: reqwest::Error| {
            if e.is_timeout() {
                ReceiptError::MaskTimeout {
                    secs: self.timeout_secs,
                }
            } else {
                ReceiptError::MaskUnavailable {
                    detail: e.to_string(),
                }
            }
        };

        let response = self
            .client
            .post(&self.url)
            .multipart(form)
            .send()
            .await
            .map_err(map_err)?;

        if !response.status().is_success() {
            return Err(ReceiptError::MaskUnavailable {
                detail: format!("{} returned HTTP {}", self.url, response.status()),
            });
        }

        let bytes = response.bytes().await.map_err(map_err)?;
        info!(
            provider = "http",
            bytes = bytes.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Mask received"
        );
        Ok(bytes.to_vec())
    }

    fn name(&self) -> &str {
        "http"
    }
}

// ── Local luminance ──────────────────────────────────────────────────────

/// Otsu-thresholded luminance: pixels brighter than the global Otsu level
/// are foreground.
#[derive(Debug, Default, Clone, Copy)]
pub struct LuminanceMaskProvider;

impl LuminanceMaskProvider {
    /// Compute the mask for a decoded image.
    pub fn mask_image(image: &DynamicImage) -> GrayImage {
        let gray = image.to_luma8();
        let level = imageproc::contrast::otsu_level(&gray);
        debug!(level, "Otsu level");
        GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
            if gray.get_pixel(x, y)[0] > level {
                Luma([255])
            } else {
                Luma([0])
            }
        })
    }
}

#[async_trait]
impl MaskProvider for LuminanceMaskProvider {
    async fn mask(&self, image_bytes: &[u8]) -> Result<Vec<u8>, ReceiptError> {
        let bytes = image_bytes.to_vec();
        tokio::task::spawn_blocking(move || {
            let image = decode_upright(&bytes).map_err(|e| ReceiptError::DecodeFailed {
                source_name: "mask input".to_string(),
                detail: e.to_string(),
            })?;
            let mask = Self::mask_image(&image);
            png_bytes(&DynamicImage::ImageLuma8(mask))
                .map_err(|e| ReceiptError::Internal(format!("Mask encoding failed: {e}")))
        })
        .await
        .map_err(|e| ReceiptError::Internal(format!("Mask task failed: {e}")))?
    }

    fn name(&self) -> &str {
        "luminance"
    }
}

// ── Static ───────────────────────────────────────────────────────────────

/// Always returns the same encoded mask.
#[derive(Debug, Clone)]
pub struct StaticMaskProvider {
    encoded: Vec<u8>,
}

impl StaticMaskProvider {
    /// Wrap already-encoded mask bytes.
    pub fn new(encoded: Vec<u8>) -> Self {
        Self { encoded }
    }

    /// Encode `mask` as PNG once and serve it for every request.
    pub fn from_image(mask: &GrayImage) -> Result<Self, ReceiptError> {
        let encoded = png_bytes(&DynamicImage::ImageLuma8(mask.clone()))
            .map_err(|e| ReceiptError::Internal(format!("Mask encoding failed: {e}")))?;
        Ok(Self { encoded })
    }
}

#[async_trait]
impl MaskProvider for StaticMaskProvider {
    async fn mask(&self, _image_bytes: &[u8]) -> Result<Vec<u8>, ReceiptError> {
        Ok(self.encoded.clone())
    }

    fn name(&self) -> &str {
        "static"
    }
}

// ── Decoding ─────────────────────────────────────────────────────────────

/// Decode mask bytes into a single-channel raster.
///
/// Images with an alpha channel (cut-outs from background-removal services)
/// use alpha as the mask; others use luminance. Scaling to the photograph
/// is left to [`extract`](crate::pipeline::geometry::extract).
pub fn decode_mask(bytes: &[u8]) -> Result<GrayImage, ReceiptError> {
    let decoded = image::load_from_memory(bytes).map_err(|e| ReceiptError::MaskUnavailable {
        detail: format!("mask is not a decodable image: {e}"),
    })?;
    debug!(width = decoded.width(), height = decoded.height(), "Mask decoded");

    if has_alpha(decoded.color()) {
        let rgba = decoded.to_rgba8();
        Ok(GrayImage::from_fn(rgba.width(), rgba.height(), |x, y| {
            Luma([rgba.get_pixel(x, y)[3]])
        }))
    } else {
        Ok(decoded.to_luma8())
    }
}

fn has_alpha(color: ColorType) -> bool {
    matches!(
        color,
        ColorType::La8 | ColorType::La16 | ColorType::Rgba8 | ColorType::Rgba16 | ColorType::Rgba32F
    )
}
