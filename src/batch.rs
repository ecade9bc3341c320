//! Batch processing: many receipts, bounded concurrency, no early abort.
//!
//! Every file is processed independently. A file that fails (undecodable,
//! mask service error) yields an error record and the batch carries on.
//!
//! * [`process_stream`] yields results as they complete (completion order).
//! * [`process_batch`] waits for all of them and returns them in input order.
//! * [`process_zip`] is the archive form: a zip of images in, a zip of
//!   `<stem>.json` (or `<stem>.error.txt`) out.

use crate::config::PipelineMode;
use crate::error::ReceiptError;
use crate::output::ReceiptOutput;
use crate::pipeline::input;
use crate::process::ReceiptPipeline;
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::io::{Cursor, Read, Write};
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use tokio_stream::Stream;
use tracing::{info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Archive entries larger than this are skipped.
const MAX_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "webp"];

/// Outcome for one file of a batch.
#[derive(Debug)]
pub struct BatchItem {
    /// 1-indexed position in the batch.
    pub index: usize,
    pub name: String,
    pub result: Result<ReceiptOutput, ReceiptError>,
}

impl BatchItem {
    /// Whether the file produced a parsed receipt.
    pub fn is_success(&self) -> bool {
        matches!(self.result, Ok(ref o) if o.is_success())
    }
}

/// A boxed stream of batch items.
pub type ReceiptStream = Pin<Box<dyn Stream<Item = BatchItem> + Send>>;

/// Whether a file name has an image extension the decoder handles.
pub fn is_image_name(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Process paths or URLs, streaming results as they complete.
///
/// Fires `on_batch_start` and per-file progress events; `on_batch_complete`
/// is left to the consumer, which is the only one that knows when the stream
/// ends.
pub fn process_stream(pipeline: Arc<ReceiptPipeline>, inputs: Vec<String>) -> ReceiptStream {
    let total = inputs.len();
    let concurrency = pipeline.config().concurrency;
    if let Some(ref cb) = pipeline.config().progress_callback {
        cb.on_batch_start(total);
    }

    let s = stream::iter(inputs.into_iter().enumerate().map(move |(i, input_str)| {
        let pipeline = Arc::clone(&pipeline);
        async move {
            let index = i + 1;
            let name = if input::is_url(&input_str) {
                input::filename_from_url(&input_str)
            } else {
                Path::new(&input_str)
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| input_str.clone())
            };
            notify_start(&pipeline, index, total, &name);
            let result = pipeline.process_input(&input_str).await;
            notify_done(&pipeline, index, total, &name, &result);
            BatchItem {
                index,
                name,
                result,
            }
        }
    }))
    .buffer_unordered(concurrency);

    Box::pin(s)
}

/// Process in-memory images and return results in input order.
pub async fn process_batch(
    pipeline: &ReceiptPipeline,
    files: Vec<(String, Vec<u8>)>,
    mode: PipelineMode,
) -> Vec<BatchItem> {
    let entries = files.into_iter().map(|(name, bytes)| (name, Ok(bytes))).collect();
    process_entries(pipeline, entries, mode).await
}

/// [`process_batch`] over entries that may already have failed to load.
/// A failed entry is reported through the progress callback like any other
/// per-file error.
async fn process_entries(
    pipeline: &ReceiptPipeline,
    entries: Vec<ZipEntry>,
    mode: PipelineMode,
) -> Vec<BatchItem> {
    let total = entries.len();
    if let Some(ref cb) = pipeline.config().progress_callback {
        cb.on_batch_start(total);
    }

    let mut items: Vec<BatchItem> = stream::iter(entries.into_iter().enumerate().map(
        |(i, (name, loaded))| async move {
            let index = i + 1;
            notify_start(pipeline, index, total, &name);
            let result = match loaded {
                Ok(bytes) => pipeline.process_bytes(&name, &bytes, mode).await,
                Err(e) => Err(e),
            };
            notify_done(pipeline, index, total, &name, &result);
            BatchItem {
                index,
                name,
                result,
            }
        },
    ))
    .buffer_unordered(pipeline.config().concurrency)
    .collect()
    .await;
    items.sort_by_key(|item| item.index);

    let successes = items.iter().filter(|i| i.is_success()).count();
    info!("Batch complete: {}/{} receipts extracted", successes, total);
    if let Some(ref cb) = pipeline.config().progress_callback {
        cb.on_batch_complete(total, successes);
    }
    items
}

fn notify_start(pipeline: &ReceiptPipeline, index: usize, total: usize, name: &str) {
    if let Some(ref cb) = pipeline.config().progress_callback {
        cb.on_file_start(index, total, name);
    }
}

fn notify_done(
    pipeline: &ReceiptPipeline,
    index: usize,
    total: usize,
    name: &str,
    result: &Result<ReceiptOutput, ReceiptError>,
) {
    if let Some(ref cb) = pipeline.config().progress_callback {
        match result {
            Ok(output) => cb.on_file_complete(index, total, name, output.is_success()),
            Err(e) => cb.on_file_error(index, total, name, &e.to_string()),
        }
    }
}

// ── Zip archives ─────────────────────────────────────────────────────────

/// One archive entry: its name and contents, or why it could not be read.
pub type ZipEntry = (String, Result<Vec<u8>, ReceiptError>);

/// Read every image entry of a zip archive.
///
/// Directories, non-image files, macOS resource forks and oversized
/// entries are skipped. An entry that fails to read (bad checksum, broken
/// deflate stream) is returned as an error in its slot.
///
/// # Errors
/// [`ReceiptError::InvalidArchive`] only when the central directory cannot
/// be read.
pub fn read_zip_images(bytes: &[u8]) -> Result<Vec<ZipEntry>, ReceiptError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(|e| ReceiptError::InvalidArchive {
        detail: e.to_string(),
    })?;

    let mut files = Vec::new();
    for i in 0..archive.len() {
        let Some(name) = archive.name_for_index(i).map(str::to_string) else {
            continue;
        };
        let base = Path::new(&name)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if name.ends_with('/')
            || name.starts_with("__MACOSX/")
            || base.starts_with('.')
            || !is_image_name(&base)
        {
            continue;
        }
        let entry_error = |detail: String| ReceiptError::InvalidArchive {
            detail: format!("{name}: {detail}"),
        };
        let contents = match archive.by_index(i) {
            Ok(mut entry) => {
                if entry.size() > MAX_ENTRY_BYTES {
                    warn!("Skipping large archive entry: {} ({} bytes)", name, entry.size());
                    continue;
                }
                let mut contents = Vec::with_capacity(entry.size() as usize);
                entry
                    .read_to_end(&mut contents)
                    .map(|_| contents)
                    .map_err(|e| entry_error(e.to_string()))
            }
            Err(e) => Err(entry_error(e.to_string())),
        };
        if let Err(ref e) = contents {
            warn!("Unreadable archive entry: {}", e);
        }
        files.push((name, contents));
    }
    Ok(files)
}

/// Write named files into a new deflated zip archive.
pub fn write_zip(entries: &[(String, Vec<u8>)]) -> Result<Vec<u8>, ReceiptError> {
    let internal = |e: zip::result::ZipError| ReceiptError::Internal(format!("zip write: {e}"));
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for (name, contents) in entries {
        zip.start_file(name.as_str(), options).map_err(internal)?;
        zip.write_all(contents)
            .map_err(|e| ReceiptError::Internal(format!("zip write: {e}")))?;
    }
    let cursor = zip.finish().map_err(internal)?;
    Ok(cursor.into_inner())
}

/// Output entry name for one batch item: the input's file stem, made unique.
fn output_name(item: &BatchItem, used: &mut HashSet<String>) -> String {
    let stem = Path::new(&item.name)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| format!("receipt-{}", item.index));
    let stem = if used.insert(stem.clone()) {
        stem
    } else {
        let unique = format!("{}-{}", stem, item.index);
        used.insert(unique.clone());
        unique
    };
    match item.result {
        Ok(_) => format!("{stem}.json"),
        Err(_) => format!("{stem}.error.txt"),
    }
}

/// Process every image in a zip archive and return a zip of results.
///
/// Each image yields `<stem>.json` (the receipt, or the extraction error
/// body) or, when the image could not be processed at all,
/// `<stem>.error.txt` with the error message.
///
/// # Errors
/// [`ReceiptError::InvalidArchive`] when `zip_bytes` is not a zip archive.
/// Unreadable entries become `<stem>.error.txt` like any other failed file.
pub async fn process_zip(
    pipeline: &ReceiptPipeline,
    zip_bytes: Vec<u8>,
    mode: PipelineMode,
) -> Result<Vec<u8>, ReceiptError> {
    let files = tokio::task::spawn_blocking(move || read_zip_images(&zip_bytes))
        .await
        .map_err(|e| ReceiptError::Internal(format!("Zip task failed: {e}")))??;
    info!("Zip batch: {} images", files.len());

    let items = process_entries(pipeline, files, mode).await;

    let mut used = HashSet::new();
    let mut entries = Vec::with_capacity(items.len());
    for item in &items {
        let name = output_name(item, &mut used);
        let contents = match item.result {
            Ok(ref output) => serde_json::to_vec_pretty(&output.to_json())
                .map_err(|e| ReceiptError::Internal(format!("JSON serialisation failed: {e}")))?,
            Err(ref e) => e.to_string().into_bytes(),
        };
        entries.push((name, contents));
    }

    tokio::task::spawn_blocking(move || write_zip(&entries))
        .await
        .map_err(|e| ReceiptError::Internal(format!("Zip task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReceiptConfig;
    use crate::pipeline::encode::png_bytes;
    use crate::pipeline::llm::MockCompletionClient;
    use crate::pipeline::mask::StaticMaskProvider;
    use image::{DynamicImage, GrayImage, RgbImage};

    fn pipeline(responses: &[&str]) -> ReceiptPipeline {
        let mask = StaticMaskProvider::from_image(&GrayImage::new(8, 8)).unwrap();
        ReceiptPipeline::new(ReceiptConfig::default(), Arc::new(mask))
            .with_completion(Arc::new(MockCompletionClient::replying(responses.iter().copied())))
    }

    fn png() -> Vec<u8> {
        png_bytes(&DynamicImage::ImageRgb8(RgbImage::new(8, 8))).unwrap()
    }

    #[test]
    fn image_names_are_recognised() {
        assert!(is_image_name("a.JPG"));
        assert!(is_image_name("dir/b.webp"));
        assert!(!is_image_name("notes.txt"));
        assert!(!is_image_name("noext"));
    }

    #[test]
    fn zip_reader_skips_non_images() {
        let archive = write_zip(&[
            ("r1.jpg".into(), b"x".to_vec()),
            ("readme.txt".into(), b"y".to_vec()),
            ("__MACOSX/._r1.jpg".into(), b"z".to_vec()),
            ("sub/r2.png".into(), b"w".to_vec()),
        ])
        .unwrap();
        let files = read_zip_images(&archive).unwrap();
        let names: Vec<_> = files.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["r1.jpg", "sub/r2.png"]);
        assert_eq!(files[0].1.as_deref().unwrap(), b"x");
    }

    #[test]
    fn garbage_is_an_invalid_archive() {
        let err = read_zip_images(b"not a zip").unwrap_err();
        assert!(matches!(err, ReceiptError::InvalidArchive { .. }));
        assert!(err.is_client_error());
    }

    #[tokio::test]
    async fn one_bad_file_does_not_abort_the_batch() {
        let archive = write_zip(&[
            ("good.png".into(), png()),
            ("bad.jpg".into(), b"corrupt".to_vec()),
        ])
        .unwrap();
        let p = pipeline(&["{\"store_name\": \"A\"}"]);
        let out = process_zip(&p, archive, PipelineMode::Vision).await.unwrap();

        let files = {
            let mut archive = ZipArchive::new(Cursor::new(out)).unwrap();
            let mut v = Vec::new();
            for i in 0..archive.len() {
                let mut f = archive.by_index(i).unwrap();
                let mut s = String::new();
                f.read_to_string(&mut s).unwrap();
                v.push((f.name().to_string(), s));
            }
            v
        };
        assert_eq!(files[0].0, "good.json");
        assert!(files[0].1.contains("\"store_name\": \"A\""));
        assert_eq!(files[1].0, "bad.error.txt");
        assert!(files[1].1.contains("Cannot decode image"));
    }

    /// A stored (uncompressed) archive with one data byte of `bad.png` flipped.
    fn archive_with_corrupt_entry() -> Vec<u8> {
        let payload = b"payload-of-the-corrupted-entry".to_vec();
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        zip.start_file("good.png", options).unwrap();
        zip.write_all(&png()).unwrap();
        zip.start_file("bad.png", options).unwrap();
        zip.write_all(&payload).unwrap();
        let mut bytes = zip.finish().unwrap().into_inner();

        let at = bytes
            .windows(payload.len())
            .position(|w| w == payload.as_slice())
            .unwrap();
        bytes[at] ^= 0xFF;
        bytes
    }

    #[test]
    fn corrupt_entry_is_reported_in_its_slot() {
        let files = read_zip_images(&archive_with_corrupt_entry()).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].0, "good.png");
        assert!(files[0].1.is_ok());
        assert_eq!(files[1].0, "bad.png");
        assert!(matches!(files[1].1, Err(ReceiptError::InvalidArchive { .. })));
    }

    #[tokio::test]
    async fn corrupt_entry_does_not_abort_the_zip_batch() {
        let p = pipeline(&["{\"store_name\": \"A\"}"]);
        let out = process_zip(&p, archive_with_corrupt_entry(), PipelineMode::Vision)
            .await
            .unwrap();

        let mut archive = ZipArchive::new(Cursor::new(out)).unwrap();
        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        assert_eq!(names, ["good.json", "bad.error.txt"]);
        let mut text = String::new();
        archive
            .by_name("bad.error.txt")
            .unwrap()
            .read_to_string(&mut text)
            .unwrap();
        assert!(text.contains("bad.png"));
    }

    #[tokio::test]
    async fn batch_results_keep_input_order() {
        let p = pipeline(&["{\"store_name\": \"A\"}", "{\"store_name\": \"B\"}"]);
        let items = process_batch(
            &p,
            vec![("a.png".into(), png()), ("b.png".into(), png())],
            PipelineMode::Vision,
        )
        .await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].name, "a.png");
        assert_eq!(items[1].index, 2);
        assert!(items.iter().all(|i| i.is_success()));
    }

    #[test]
    fn duplicate_stems_are_made_unique() {
        let mut used = HashSet::new();
        let item = |index: usize, name: &str| BatchItem {
            index,
            name: name.into(),
            result: Err(ReceiptError::Internal("x".into())),
        };
        assert_eq!(output_name(&item(1, "a/r.jpg"), &mut used), "r.error.txt");
        assert_eq!(output_name(&item(2, "b/r.png"), &mut used), "r-2.error.txt");
    }

    #[tokio::test]
    async fn stream_yields_every_input() {
        let p = Arc::new(pipeline(&[]));
        let items: Vec<BatchItem> = process_stream(p, vec!["/nope/a.jpg".into(), "/nope/b.jpg".into()])
            .collect()
            .await;
        assert_eq!(items.len(), 2);
        assert!(items
            .iter()
            .all(|i| matches!(i.result, Err(ReceiptError::FileNotFound { .. }))));
    }
}
