//! CLI binary for receipt2json.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `ReceiptConfig` and prints or writes results.

use anyhow::{Context, Result};
use clap::Parser;
use futures::StreamExt;
use receipt2json::pipeline::encode::png_bytes;
use receipt2json::process::write_atomic;
use receipt2json::{
    process_stream, process_zip, server, BatchItem, PipelineMode, ProgressCallback, ReceiptConfig,
    ReceiptPipeline, ReceiptProgressCallback, RotationDirection, ShapePolicy,
};
use image::DynamicImage;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: a live bar plus one log line per receipt.
/// Files complete out of order when several run concurrently.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<usize, Instant>>,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(TICKS),
        );
        bar.set_prefix("Preparing");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
        })
    }

    fn elapsed_secs(&self, index: usize) -> f64 {
        self.start_times
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&index)
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl ReceiptProgressCallback for CliProgressCallback {
    fn on_batch_start(&self, total: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} receipts  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);
        self.bar.set_length(total as u64);
        self.bar.set_style(style);
        self.bar.set_prefix("Extracting");
        self.bar.reset_eta();
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Processing {total} receipts…"))
        ));
    }

    fn on_file_start(&self, index: usize, _total: usize, name: &str) {
        self.start_times
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(index, Instant::now());
        self.bar.set_message(name.to_string());
    }

    fn on_file_complete(&self, index: usize, total: usize, name: &str, ok: bool) {
        let secs = self.elapsed_secs(index);
        let mark = if ok { green("✓") } else { cyan("⚠") };
        self.bar.println(format!(
            "  {} {:>3}/{:<3}  {}  {}",
            mark,
            index,
            total,
            name,
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_file_error(&self, index: usize, total: usize, name: &str, error: &str) {
        let secs = self.elapsed_secs(index);
        let first_line = error.lines().next().unwrap_or(error);
        let msg: String = if first_line.chars().count() > 80 {
            format!("{}\u{2026}", first_line.chars().take(79).collect::<String>())
        } else {
            first_line.to_string()
        };
        self.bar.println(format!(
            "  {} {:>3}/{:<3}  {}  {}  {}",
            red("✗"),
            index,
            total,
            name,
            red(&msg),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_batch_complete(&self, total: usize, success_count: usize) {
        let failed = total.saturating_sub(success_count);
        self.bar.finish_and_clear();
        if failed == 0 {
            eprintln!(
                "{} {} receipts extracted",
                green("✔"),
                bold(&success_count.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} receipts extracted  ({} failed)",
                if failed == total { red("✘") } else { cyan("⚠") },
                bold(&success_count.to_string()),
                total,
                red(&failed.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # One receipt, JSON to stdout
  receipt2json receipt.jpg

  # OCR path (line recogniser + text model) into a file
  receipt2json --mode ocr receipt.jpg -o receipt.json

  # A folder of photos into a folder of JSON files
  receipt2json photos/*.jpg -o out/

  # Zip in, zip out
  receipt2json --zip batch.zip -o results.zip

  # Only crop and deskew; writes <name>.crop.png, no API key needed
  receipt2json --crop-only --shape rectify receipt.jpg -o crops/

  # HTTP service
  receipt2json --serve 0.0.0.0:8080

GEOMETRY:
  The receipt is isolated from a foreground mask. Set --mask-url to use a
  background-removal service (multipart POST of the photo, mask image back);
  otherwise a local brightness threshold is used, which works for light
  paper on darker surfaces.

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  RECEIPT2JSON_MASK_URL   Mask service endpoint

SETUP:
  1. Set API key:     export OPENAI_API_KEY=sk-...
  2. Extract:         receipt2json receipt.jpg
"#;

/// Extract structured JSON from receipt photos.
#[derive(Parser, Debug)]
#[command(
    name = "receipt2json",
    version,
    about = "Extract structured JSON from receipt photos",
    long_about = "Isolate the receipt in a photograph (mask, contour, perspective warp), turn it \
upright, then extract store, date, totals, taxes and items with a vision model or with a line \
recogniser plus a text model. Supports OpenAI, Anthropic, Google Gemini, Azure OpenAI and any \
OpenAI-compatible endpoint (Ollama, vLLM, LiteLLM, etc.).",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Receipt image paths or HTTP/HTTPS URLs (one zip archive with --zip).
    inputs: Vec<String>,

    /// Output file, or directory when several inputs are given.
    #[arg(short, long, env = "RECEIPT2JSON_OUTPUT")]
    output: Option<PathBuf>,

    /// Extraction path: vision or ocr.
    #[arg(short, long, env = "RECEIPT2JSON_MODE", default_value = "vision")]
    mode: PipelineMode,

    /// Treat the single input as a zip of images and write a zip of results.
    #[arg(long)]
    zip: bool,

    /// Only isolate the receipt and write PNG crops; no model is called.
    #[arg(long)]
    crop_only: bool,

    /// Serve the HTTP API on this address instead of processing inputs.
    #[arg(long, value_name = "ADDR", env = "RECEIPT2JSON_SERVE")]
    serve: Option<String>,

    // ── Geometry ─────────────────────────────────────────────────────────
    /// Background-removal service URL (multipart `file` in, mask image out).
    #[arg(long, env = "RECEIPT2JSON_MASK_URL")]
    mask_url: Option<String>,

    /// Mask service timeout in seconds.
    #[arg(long, env = "RECEIPT2JSON_MASK_TIMEOUT", default_value_t = 60)]
    mask_timeout: u64,

    /// Mask pixels above this value are foreground.
    #[arg(long, env = "RECEIPT2JSON_MASK_THRESHOLD", default_value_t = 0)]
    mask_threshold: u8,

    /// Contours smaller than this (px²) are treated as noise.
    #[arg(long, env = "RECEIPT2JSON_MIN_CONTOUR_AREA", default_value_t = 2000.0)]
    min_contour_area: f64,

    /// Polygon simplification tolerance as a fraction of the perimeter.
    #[arg(long, env = "RECEIPT2JSON_EPSILON", default_value_t = 0.02)]
    epsilon: f64,

    /// Non-quadrilateral contours: crop (padded bounding box) or rectify
    /// (minimum-area rectangle + warp).
    #[arg(long, env = "RECEIPT2JSON_SHAPE", default_value = "crop")]
    shape: ShapePolicy,

    /// Bounding-box crop padding in pixels.
    #[arg(long, env = "RECEIPT2JSON_PADDING", default_value_t = 10)]
    padding: u32,

    /// Quarter-turn direction for landscape crops: cw or ccw.
    #[arg(long, env = "RECEIPT2JSON_ROTATION", default_value = "cw")]
    rotation: RotationDirection,

    // ── Model ────────────────────────────────────────────────────────────
    /// LLM model ID (e.g. gpt-4.1-nano, gpt-4.1, claude-sonnet-4-20250514).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// Separate model for parsing OCR text (requires --provider).
    #[arg(long, env = "RECEIPT2JSON_TEXT_MODEL")]
    text_model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Path to a text file replacing the built-in vision prompt.
    #[arg(long, env = "RECEIPT2JSON_VISION_PROMPT")]
    vision_prompt: Option<PathBuf>,

    /// Path to a text file replacing the built-in text prompt.
    #[arg(long, env = "RECEIPT2JSON_TEXT_PROMPT")]
    text_prompt: Option<PathBuf>,

    /// Max LLM output tokens per call.
    #[arg(long, env = "RECEIPT2JSON_MAX_TOKENS", default_value_t = 2048)]
    max_tokens: usize,

    /// LLM temperature (0.0–2.0).
    #[arg(long, env = "RECEIPT2JSON_TEMPERATURE", default_value_t = 0.1)]
    temperature: f32,

    /// Transport retries per model call.
    #[arg(long, env = "RECEIPT2JSON_MAX_RETRIES", default_value_t = 1)]
    max_retries: u32,

    /// Per-call LLM timeout in seconds.
    #[arg(long, env = "RECEIPT2JSON_API_TIMEOUT", default_value_t = 120)]
    api_timeout: u64,

    /// Longest edge (px) of images sent to a model.
    #[arg(long, env = "RECEIPT2JSON_MAX_IMAGE_PIXELS", default_value_t = 2000)]
    max_image_pixels: u32,

    // ── Runtime ──────────────────────────────────────────────────────────
    /// Receipts processed concurrently.
    #[arg(short, long, env = "RECEIPT2JSON_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "RECEIPT2JSON_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Disable progress bar.
    #[arg(long, env = "RECEIPT2JSON_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "RECEIPT2JSON_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "RECEIPT2JSON_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs for multi-file runs.
    let show_progress =
        !cli.quiet && !cli.no_progress && cli.serve.is_none() && (cli.inputs.len() > 1 || cli.zip);
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn ReceiptProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress_cb).await?;

    // ── Service mode ─────────────────────────────────────────────────────
    if let Some(ref addr) = cli.serve {
        let pipeline = ReceiptPipeline::from_config(config).context("Failed to set up pipeline")?;
        server::serve(addr, Arc::new(pipeline))
            .await
            .with_context(|| format!("Server on {addr} failed"))?;
        return Ok(());
    }

    if cli.inputs.is_empty() {
        anyhow::bail!("No input given (pass image paths or URLs, or --serve ADDR)");
    }

    if cli.crop_only {
        return run_crop_only(&cli, config).await;
    }

    let pipeline = Arc::new(ReceiptPipeline::from_config(config).context("Failed to set up pipeline")?);

    if cli.zip {
        return run_zip(&cli, &pipeline).await;
    }

    // ── Single receipt ───────────────────────────────────────────────────
    if cli.inputs.len() == 1 && !cli.output.as_deref().is_some_and(is_directory_target) {
        let output = pipeline
            .process_input(&cli.inputs[0])
            .await
            .context("Extraction failed")?;
        let body = serde_json::to_string_pretty(&output.to_json())
            .context("Failed to serialise output")?;
        match cli.output {
            Some(ref path) => {
                write_atomic(path, body.as_bytes())
                    .await
                    .context("Failed to write output")?;
                if !cli.quiet {
                    eprintln!(
                        "{}  {}  {}ms  →  {}",
                        if output.is_success() { green("✔") } else { cyan("⚠") },
                        dim(&format!("{:?}", output.geometry.method)),
                        output.stats.total_ms,
                        bold(&path.display().to_string()),
                    );
                }
            }
            None => println!("{body}"),
        }
        if !cli.quiet {
            eprintln!(
                "   {} tokens in  /  {} tokens out  /  {} model call(s)",
                dim(&output.stats.input_tokens.to_string()),
                dim(&output.stats.output_tokens.to_string()),
                output.stats.attempts,
            );
        }
        if let Some(ref e) = output.error {
            anyhow::bail!("{e}");
        }
        return Ok(());
    }

    // ── Many receipts ────────────────────────────────────────────────────
    let mut items: Vec<BatchItem> = process_stream(Arc::clone(&pipeline), cli.inputs.clone())
        .collect()
        .await;
    items.sort_by_key(|i| i.index);
    let successes = items.iter().filter(|i| i.is_success()).count();
    if let Some(ref cb) = pipeline.config().progress_callback {
        cb.on_batch_complete(items.len(), successes);
    }

    match cli.output {
        Some(ref dir) => {
            for item in &items {
                let (path, body) = match item.result {
                    Ok(ref output) => (
                        dir.join(format!("{}.json", file_stem(&item.name))),
                        serde_json::to_string_pretty(&output.to_json())
                            .context("Failed to serialise output")?,
                    ),
                    Err(ref e) => (
                        dir.join(format!("{}.error.txt", file_stem(&item.name))),
                        e.to_string(),
                    ),
                };
                write_atomic(&path, body.as_bytes())
                    .await
                    .with_context(|| format!("Failed to write {}", path.display()))?;
            }
        }
        None => {
            let all: Vec<serde_json::Value> = items
                .iter()
                .map(|item| match item.result {
                    Ok(ref output) => serde_json::json!({
                        "source": item.name,
                        "result": output.to_json(),
                    }),
                    Err(ref e) => serde_json::json!({
                        "source": item.name,
                        "error": e.to_string(),
                    }),
                })
                .collect();
            println!(
                "{}",
                serde_json::to_string_pretty(&all).context("Failed to serialise output")?
            );
        }
    }

    if !show_progress && !cli.quiet {
        eprintln!("Extracted {}/{} receipts", successes, items.len());
    }
    if successes < items.len() {
        anyhow::bail!("{} of {} receipts failed", items.len() - successes, items.len());
    }
    Ok(())
}

async fn run_zip(cli: &Cli, pipeline: &ReceiptPipeline) -> Result<()> {
    let [input] = cli.inputs.as_slice() else {
        anyhow::bail!("--zip takes exactly one archive");
    };
    let bytes = tokio::fs::read(input)
        .await
        .with_context(|| format!("Failed to read {input}"))?;
    let archive = process_zip(pipeline, bytes, cli.mode)
        .await
        .context("Batch failed")?;
    let out = cli
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from(format!("{}.results.zip", file_stem(input))));
    write_atomic(&out, &archive)
        .await
        .context("Failed to write results archive")?;
    if !cli.quiet {
        eprintln!("{}  →  {}", green("✔"), bold(&out.display().to_string()));
    }
    Ok(())
}

async fn run_crop_only(cli: &Cli, config: ReceiptConfig) -> Result<()> {
    let pipeline = ReceiptPipeline::for_cropping(config).context("Failed to set up pipeline")?;
    let dir = cli.output.clone().unwrap_or_else(|| PathBuf::from("."));
    for input in &cli.inputs {
        let (name, extracted) = pipeline
            .crop_input(input)
            .await
            .with_context(|| format!("Failed to crop {input}"))?;
        let method = extracted.method;
        let png = tokio::task::spawn_blocking(move || {
            png_bytes(&DynamicImage::ImageRgb8(extracted.image))
        })
        .await
        .context("Encode task failed")?
        .context("PNG encoding failed")?;
        let path = dir.join(format!("{}.crop.png", file_stem(&name)));
        write_atomic(&path, &png)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        if !cli.quiet {
            eprintln!(
                "  {} {}  {}  →  {}",
                green("✓"),
                name,
                dim(&format!("{method:?}")),
                path.display()
            );
        }
    }
    Ok(())
}

/// Map CLI args to `ReceiptConfig`.
async fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<ReceiptConfig> {
    let mut builder = ReceiptConfig::builder()
        .mode(cli.mode)
        .mask_threshold(cli.mask_threshold)
        .min_contour_area(cli.min_contour_area)
        .approx_epsilon_ratio(cli.epsilon)
        .shape_policy(cli.shape)
        .crop_padding(cli.padding)
        .rotation(cli.rotation)
        .mask_timeout_secs(cli.mask_timeout)
        .temperature(cli.temperature)
        .max_tokens(cli.max_tokens)
        .max_retries(cli.max_retries)
        .api_timeout_secs(cli.api_timeout)
        .max_image_pixels(cli.max_image_pixels)
        .concurrency(cli.concurrency)
        .download_timeout_secs(cli.download_timeout);

    if let Some(ref url) = cli.mask_url {
        builder = builder.mask_service_url(url.clone());
    }
    if let Some(ref model) = cli.model {
        builder = builder.model(model.clone());
    }
    if let Some(ref model) = cli.text_model {
        builder = builder.text_model(model.clone());
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider.clone());
    }
    if let Some(ref path) = cli.vision_prompt {
        builder = builder.vision_prompt(read_prompt(path).await?);
    }
    if let Some(ref path) = cli.text_prompt {
        builder = builder.text_prompt(read_prompt(path).await?);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

async fn read_prompt(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read prompt from {}", path.display()))
}

/// An existing directory, or a path written with a trailing separator.
fn is_directory_target(path: &Path) -> bool {
    path.is_dir() || path.as_os_str().to_string_lossy().ends_with(std::path::MAIN_SEPARATOR)
}

fn file_stem(name: &str) -> String {
    Path::new(name)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "receipt".to_string())
}
