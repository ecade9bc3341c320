//! HTTP surface over a shared [`ReceiptPipeline`].
//!
//! | Route | Body | Response |
//! |-------|------|----------|
//! | `GET /` | | health + endpoint list |
//! | `POST /ocr/vision` | multipart `file` | receipt JSON |
//! | `POST /ocr/text` | multipart `file` | receipt JSON |
//! | `POST /ocr/batch/{mode}` | multipart `file` (zip) | zip of results |
//!
//! Status codes: 200 on success, 422 when the model answer could not be
//! used (body carries the raw response), 400 for bad uploads, 502 when the
//! mask or model service failed, 503 when no model is configured.

use crate::batch::process_zip;
use crate::config::PipelineMode;
use crate::error::{ExtractionError, ReceiptError};
use crate::output::ReceiptOutput;
use crate::process::ReceiptPipeline;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

/// Largest accepted upload (a zip of phone photos).
pub const MAX_UPLOAD_BYTES: usize = 200 * 1024 * 1024;

/// An error response: a status and a JSON body.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: Value,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: json!({ "error": message.into() }),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<ReceiptError> for ApiError {
    fn from(e: ReceiptError) -> Self {
        let status = status_for_error(&e);
        if status.is_server_error() {
            warn!("Request failed ({}): {}", status, e);
        }
        Self {
            status,
            body: json!({ "error": e.to_string() }),
        }
    }
}

/// Status code for a fatal pipeline error.
pub fn status_for_error(e: &ReceiptError) -> StatusCode {
    match e {
        _ if e.is_client_error() => StatusCode::BAD_REQUEST,
        _ if e.is_upstream_error() => StatusCode::BAD_GATEWAY,
        ReceiptError::ProviderNotConfigured { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Status code for a completed pipeline run.
pub fn status_for_output(output: &ReceiptOutput) -> StatusCode {
    match output.error {
        None => StatusCode::OK,
        Some(ExtractionError::EmptyInput { .. }) | Some(ExtractionError::ParseFailed { .. }) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        Some(_) => StatusCode::BAD_GATEWAY,
    }
}

/// Build the router. The pipeline is shared read-only by every request.
pub fn router(pipeline: Arc<ReceiptPipeline>) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/ocr/vision", post(ocr_vision))
        .route("/ocr/text", post(ocr_text))
        .route("/ocr/batch/{mode}", post(ocr_batch))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(pipeline)
}

/// Bind `addr` and serve until the process is stopped.
pub async fn serve(addr: &str, pipeline: Arc<ReceiptPipeline>) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Serving on http://{}", listener.local_addr()?);
    axum::serve(listener, router(pipeline)).await
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": ["/ocr/vision", "/ocr/text", "/ocr/batch/{mode}"],
    }))
}

async fn ocr_vision(
    State(pipeline): State<Arc<ReceiptPipeline>>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    process_upload(&pipeline, multipart, PipelineMode::Vision).await
}

async fn ocr_text(
    State(pipeline): State<Arc<ReceiptPipeline>>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    process_upload(&pipeline, multipart, PipelineMode::Ocr).await
}

async fn process_upload(
    pipeline: &ReceiptPipeline,
    multipart: Multipart,
    mode: PipelineMode,
) -> Result<Response, ApiError> {
    let (name, bytes) = read_file_field(multipart).await?;
    let output = pipeline.process_bytes(&name, &bytes, mode).await?;
    Ok((status_for_output(&output), Json(output.to_json())).into_response())
}

async fn ocr_batch(
    State(pipeline): State<Arc<ReceiptPipeline>>,
    Path(mode): Path<String>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let mode: PipelineMode = mode
        .parse()
        .map_err(|e: String| ApiError::bad_request(e))?;
    let (name, bytes) = read_file_field(multipart).await?;
    info!(archive = %name, mode = %mode, "Batch upload");
    let archive = process_zip(&pipeline, bytes, mode).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/zip"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"results.zip\"",
            ),
        ],
        archive,
    )
        .into_response())
}

/// The first multipart field named `file`, with its file name.
async fn read_file_field(mut multipart: Multipart) -> Result<(String, Vec<u8>), ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Malformed multipart body: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let name = field.file_name().unwrap_or("upload").to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(format!("Failed to read upload: {e}")))?;
        return Ok((name, bytes.to_vec()));
    }
    Err(ApiError::bad_request("Missing multipart field 'file'"))
}
