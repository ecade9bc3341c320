//! Offline integration tests: the whole pipeline on synthetic photographs,
//! with scripted model responses and fixed masks. No network, no API key.
//!
//! Run with:
//!   cargo test --test pipeline

use image::{DynamicImage, GrayImage, Luma, Rgb, RgbImage};
use receipt2json::pipeline::encode::png_bytes;
use receipt2json::prompts::{REPAIR_PROMPT, TEXT_PROMPT};
use receipt2json::{
    process_batch, process_zip, ExtractionError, ExtractionMethod, MaskProvider,
    MockCompletionClient, MockLineRecognizer, PipelineMode, ReceiptConfig, ReceiptPipeline,
    ReceiptProgressCallback, StaticMaskProvider,
};
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// ── Test helpers ─────────────────────────────────────────────────────────────

/// A dark "table" photograph with a light rectangle of paper on it.
fn photo(w: u32, h: u32, paper: (u32, u32, u32, u32)) -> Vec<u8> {
    let (x0, y0, x1, y1) = paper;
    let img = RgbImage::from_fn(w, h, |x, y| {
        if (x0..=x1).contains(&x) && (y0..=y1).contains(&y) {
            Rgb([240, 238, 230])
        } else {
            Rgb([70, 50, 30])
        }
    });
    png_bytes(&DynamicImage::ImageRgb8(img)).unwrap()
}

/// A fixed mask marking `paper` as foreground.
fn mask(w: u32, h: u32, paper: (u32, u32, u32, u32)) -> Arc<dyn MaskProvider> {
    let (x0, y0, x1, y1) = paper;
    let m = GrayImage::from_fn(w, h, |x, y| {
        if (x0..=x1).contains(&x) && (y0..=y1).contains(&y) {
            Luma([255])
        } else {
            Luma([0])
        }
    });
    Arc::new(StaticMaskProvider::from_image(&m).unwrap())
}

const GOOD_JSON: &str = r#"```json
{
  "store_name": "Dépanneur Central",
  "date": "2024-03-02",
  "time": "14:07",
  "total_amount": "$23.00",
  "subtotal": 20.00,
  "taxes": {"tps": 1.00, "tvq": 2.00},
  "items": [{"desc": "Coffee", "qty": 2, "price": 20.00}]
}
```"#;

fn read_archive(bytes: Vec<u8>) -> Vec<(String, String)> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
    (0..archive.len())
        .map(|i| {
            let mut f = archive.by_index(i).unwrap();
            let mut s = String::new();
            f.read_to_string(&mut s).unwrap();
            (f.name().to_string(), s)
        })
        .collect()
}

// ── Vision mode ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn vision_mode_normalises_model_output() {
    let paper = (20, 20, 120, 220);
    let client = Arc::new(MockCompletionClient::replying([GOOD_JSON]));
    let pipeline = ReceiptPipeline::new(ReceiptConfig::default(), mask(160, 260, paper))
        .with_completion(client.clone());

    let out = pipeline
        .process_bytes("receipt.png", &photo(160, 260, paper), PipelineMode::Vision)
        .await
        .unwrap();

    assert!(out.is_success());
    let body = out.to_json();
    assert_eq!(body["store_name"], "Dépanneur Central");
    assert_eq!(body["total_amount"], 23.0);
    assert_eq!(body["tax_tps_amount"], 1.0);
    assert_eq!(body["tax_tvq_amount"], 2.0);
    assert_eq!(body["items"][0]["desc"], "Coffee");
    assert_eq!(out.geometry.method, ExtractionMethod::Quadrilateral);
    assert_eq!((out.geometry.width, out.geometry.height), (100, 200));
    assert!(!out.geometry.rotated);
    assert_eq!(client.call_count(), 1);
}

#[tokio::test]
async fn landscape_receipt_is_turned_upright() {
    let paper = (20, 20, 220, 120);
    let client = Arc::new(MockCompletionClient::replying([GOOD_JSON]));
    let pipeline = ReceiptPipeline::new(ReceiptConfig::default(), mask(300, 200, paper))
        .with_completion(client);

    let out = pipeline
        .process_bytes("wide.png", &photo(300, 200, paper), PipelineMode::Vision)
        .await
        .unwrap();

    assert!(out.geometry.rotated);
    assert_eq!((out.geometry.width, out.geometry.height), (100, 200));
}

#[tokio::test]
async fn repair_attempt_rescues_broken_json() {
    let paper = (20, 20, 120, 220);
    let client = Arc::new(MockCompletionClient::replying([
        "Sure! {\"store_name\": \"A\", \"total_amount\": 3 + 4,}",
        "{\"store_name\": \"A\", \"total_amount\": 7}",
    ]));
    let pipeline = ReceiptPipeline::new(ReceiptConfig::default(), mask(160, 260, paper))
        .with_completion(client.clone());

    let out = pipeline
        .process_bytes("r.png", &photo(160, 260, paper), PipelineMode::Vision)
        .await
        .unwrap();

    assert_eq!(out.stats.attempts, 2);
    assert_eq!(out.receipt.unwrap().total_amount, Some(7.0));
    assert_eq!(client.calls()[1].system_prompt, REPAIR_PROMPT);
}

#[tokio::test]
async fn persistent_garbage_reports_both_responses() {
    let paper = (20, 20, 120, 220);
    let client = Arc::new(MockCompletionClient::replying(["no json here", "none here either"]));
    let pipeline = ReceiptPipeline::new(ReceiptConfig::default(), mask(160, 260, paper))
        .with_completion(client.clone());

    let out = pipeline
        .process_bytes("r.png", &photo(160, 260, paper), PipelineMode::Vision)
        .await
        .unwrap();

    assert!(!out.is_success());
    let body = out.to_json();
    assert_eq!(body["kind"], "parse_failed");
    assert_eq!(body["raw_response"], "no json here");
    assert_eq!(body["repair_response"], "none here either");
    assert_eq!(client.call_count(), 2);
}

// ── OCR mode ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn ocr_mode_filters_noise_before_the_text_model() {
    let paper = (20, 20, 120, 220);
    let vision = Arc::new(MockCompletionClient::default());
    let text = Arc::new(MockCompletionClient::replying([GOOD_JSON]));
    let recognizer = MockLineRecognizer::new([
        "DEPANNEUR CENTRAL",
        "x",
        "木纹",
        "COFFEE 2 @ 10.00",
        "   ",
        "TOTAL 23.00",
    ]);
    let pipeline = ReceiptPipeline::new(ReceiptConfig::default(), mask(160, 260, paper))
        .with_completion(vision.clone())
        .with_text_completion(text.clone())
        .with_recognizer(Arc::new(recognizer));

    let out = pipeline
        .process_bytes("r.png", &photo(160, 260, paper), PipelineMode::Ocr)
        .await
        .unwrap();

    assert!(out.is_success());
    assert_eq!(
        out.ocr_text.as_deref(),
        Some("DEPANNEUR CENTRAL\nCOFFEE 2 @ 10.00\nTOTAL 23.00")
    );
    assert_eq!(vision.call_count(), 0);
    let calls = text.calls();
    assert_eq!(calls[0].system_prompt, TEXT_PROMPT);
    assert_eq!(
        calls[0].text.as_deref(),
        Some("RAW TEXT:\nDEPANNEUR CENTRAL\nCOFFEE 2 @ 10.00\nTOTAL 23.00")
    );
}

#[tokio::test]
async fn failed_recogniser_means_empty_input_not_a_crash() {
    let paper = (20, 20, 120, 220);
    let client = Arc::new(MockCompletionClient::replying([GOOD_JSON]));
    let pipeline = ReceiptPipeline::new(ReceiptConfig::default(), mask(160, 260, paper))
        .with_completion(client.clone())
        .with_recognizer(Arc::new(MockLineRecognizer::failing("engine crashed")));

    let out = pipeline
        .process_bytes("r.png", &photo(160, 260, paper), PipelineMode::Ocr)
        .await
        .unwrap();

    assert_eq!(out.error, Some(ExtractionError::EmptyInput { chars: 0 }));
    assert_eq!(out.stats.attempts, 0);
    assert_eq!(client.call_count(), 0);
}

// ── Geometry without a model ─────────────────────────────────────────────────

#[tokio::test]
async fn blank_mask_passes_the_photo_through() {
    let pipeline = ReceiptPipeline::new(ReceiptConfig::default(), mask(90, 60, (0, 0, 0, 0)));
    let extracted = pipeline
        .crop_bytes("r.png", &photo(90, 60, (10, 10, 20, 20)))
        .await
        .unwrap();
    assert!(!extracted.method.detected());
    assert!(!extracted.rotated);
    assert_eq!(extracted.image.dimensions(), (90, 60));
}

#[tokio::test]
async fn small_mask_is_scaled_to_the_photo() {
    let paper = (20, 20, 120, 220);
    // Quarter-resolution mask of the same region.
    let pipeline = ReceiptPipeline::new(ReceiptConfig::default(), mask(40, 65, (5, 5, 30, 55)));
    let extracted = pipeline
        .crop_bytes("r.png", &photo(160, 260, paper))
        .await
        .unwrap();
    assert!(extracted.method.detected());
    assert!(extracted.image.height() > extracted.image.width());
}

// ── Batch ────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Counter {
    started: AtomicUsize,
    completed: AtomicUsize,
    errors: AtomicUsize,
    finished: AtomicUsize,
}

impl ReceiptProgressCallback for Counter {
    fn on_file_start(&self, _index: usize, _total: usize, _name: &str) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }
    fn on_file_complete(&self, _index: usize, _total: usize, _name: &str, _ok: bool) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }
    fn on_file_error(&self, _index: usize, _total: usize, _name: &str, _error: &str) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }
    fn on_batch_complete(&self, _total: usize, success_count: usize) {
        self.finished.store(success_count + 100, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn batch_reports_progress_and_survives_bad_files() {
    let paper = (20, 20, 120, 220);
    let counter = Arc::new(Counter::default());
    let config = ReceiptConfig::builder()
        .concurrency(2)
        .progress_callback(counter.clone())
        .build()
        .unwrap();
    let client = Arc::new(MockCompletionClient::replying([GOOD_JSON, GOOD_JSON]));
    let pipeline = ReceiptPipeline::new(config, mask(160, 260, paper)).with_completion(client);

    let items = process_batch(
        &pipeline,
        vec![
            ("a.png".into(), photo(160, 260, paper)),
            ("broken.jpg".into(), b"\xff\xd8 truncated".to_vec()),
            ("c.png".into(), photo(160, 260, paper)),
        ],
        PipelineMode::Vision,
    )
    .await;

    let names: Vec<_> = items.iter().map(|i| i.name.as_str()).collect();
    assert_eq!(names, ["a.png", "broken.jpg", "c.png"]);
    assert!(items[0].is_success());
    assert!(items[1].result.is_err());
    assert!(items[2].is_success());
    assert_eq!(counter.started.load(Ordering::SeqCst), 3);
    assert_eq!(counter.completed.load(Ordering::SeqCst), 2);
    assert_eq!(counter.errors.load(Ordering::SeqCst), 1);
    assert_eq!(counter.finished.load(Ordering::SeqCst), 102);
}

#[tokio::test]
async fn zip_in_zip_out() {
    let paper = (20, 20, 120, 220);
    let mut input = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    for (name, bytes) in [
        ("photos/monday.png", photo(160, 260, paper)),
        ("photos/notes.txt", b"not a receipt".to_vec()),
        ("photos/tuesday.jpg", b"corrupt".to_vec()),
    ] {
        input.start_file(name, options).unwrap();
        std::io::Write::write_all(&mut input, &bytes).unwrap();
    }
    let input = input.finish().unwrap().into_inner();

    let client = Arc::new(MockCompletionClient::replying([GOOD_JSON]));
    let pipeline = ReceiptPipeline::new(ReceiptConfig::default(), mask(160, 260, paper))
        .with_completion(client);
    let output = process_zip(&pipeline, input, PipelineMode::Vision).await.unwrap();

    let files = read_archive(output);
    assert_eq!(files.len(), 2);
    assert_eq!(files[0].0, "monday.json");
    let body: serde_json::Value = serde_json::from_str(&files[0].1).unwrap();
    assert_eq!(body["store_name"], "Dépanneur Central");
    assert_eq!(files[1].0, "tuesday.error.txt");
}
