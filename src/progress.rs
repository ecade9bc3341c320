//! Progress-callback trait for per-file batch events.
//!
//! Inject an [`Arc<dyn ReceiptProgressCallback>`] via
//! [`crate::config::ReceiptConfigBuilder::progress_callback`] to receive
//! events as [`crate::batch`] works through a directory or zip archive.
//! Single-image calls do not emit events.
//!
//! # Example
//!
//! ```rust
//! use receipt2json::{ReceiptConfig, ReceiptProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     completed: Arc<AtomicUsize>,
//! }
//!
//! impl ReceiptProgressCallback for CountingCallback {
//!     fn on_file_complete(&self, index: usize, total: usize, name: &str, ok: bool) {
//!         self.completed.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("{}/{} {} ok={}", index, total, name, ok);
//!     }
//! }
//!
//! let counter = Arc::new(CountingCallback {
//!     completed: Arc::new(AtomicUsize::new(0)),
//! });
//!
//! let config = ReceiptConfig::builder()
//!     .progress_callback(counter as Arc<dyn ReceiptProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by batch operations as they process each receipt.
///
/// Files are processed concurrently, so `on_file_*` may be called from
/// several tasks at once and out of index order. All methods default to
/// no-ops.
pub trait ReceiptProgressCallback: Send + Sync {
    /// Called once before any file is processed.
    fn on_batch_start(&self, total: usize) {
        let _ = total;
    }

    /// Called when work on a file begins.
    ///
    /// # Arguments
    /// * `index`: 1-indexed position in the batch
    /// * `total`: batch size
    /// * `name` : file name inside the directory or archive
    fn on_file_start(&self, index: usize, total: usize, name: &str) {
        let _ = (index, total, name);
    }

    /// Called when a file produced an output record.
    ///
    /// `ok` is false when the record carries an extraction error (the image
    /// itself was processed).
    fn on_file_complete(&self, index: usize, total: usize, name: &str, ok: bool) {
        let _ = (index, total, name, ok);
    }

    /// Called when a file could not be processed at all (decode failure,
    /// mask service down).
    fn on_file_error(&self, index: usize, total: usize, name: &str, error: &str) {
        let _ = (index, total, name, error);
    }

    /// Called once after every file has been attempted.
    ///
    /// # Arguments
    /// * `total`        : batch size
    /// * `success_count`: files whose record holds a parsed receipt
    fn on_batch_complete(&self, total: usize, success_count: usize) {
        let _ = (total, success_count);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl ReceiptProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ReceiptConfig`].
pub type ProgressCallback = Arc<dyn ReceiptProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct TrackingCallback {
        starts: AtomicUsize,
        completes: AtomicUsize,
        failed_extractions: AtomicUsize,
        errors: AtomicUsize,
        batch_total: AtomicUsize,
        success_total: AtomicUsize,
    }

    impl ReceiptProgressCallback for TrackingCallback {
        fn on_batch_start(&self, total: usize) {
            self.batch_total.store(total, Ordering::SeqCst);
        }

        fn on_file_start(&self, _index: usize, _total: usize, _name: &str) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_file_complete(&self, _index: usize, _total: usize, _name: &str, ok: bool) {
            self.completes.fetch_add(1, Ordering::SeqCst);
            if !ok {
                self.failed_extractions.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn on_file_error(&self, _index: usize, _total: usize, _name: &str, _error: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }

        fn on_batch_complete(&self, _total: usize, success_count: usize) {
            self.success_total.store(success_count, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_batch_start(2);
        cb.on_file_start(1, 2, "a.jpg");
        cb.on_file_complete(1, 2, "a.jpg", true);
        cb.on_file_error(2, 2, "b.jpg", "decode failed");
        cb.on_batch_complete(2, 1);
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = TrackingCallback::default();

        tracker.on_batch_start(3);
        assert_eq!(tracker.batch_total.load(Ordering::SeqCst), 3);

        tracker.on_file_start(1, 3, "a.jpg");
        tracker.on_file_complete(1, 3, "a.jpg", true);
        tracker.on_file_start(2, 3, "b.png");
        tracker.on_file_complete(2, 3, "b.png", false);
        tracker.on_file_start(3, 3, "c.heic");
        tracker.on_file_error(3, 3, "c.heic", "unsupported format");

        assert_eq!(tracker.starts.load(Ordering::SeqCst), 3);
        assert_eq!(tracker.completes.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.failed_extractions.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.errors.load(Ordering::SeqCst), 1);

        tracker.on_batch_complete(3, 1);
        assert_eq!(tracker.success_total.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn arc_dyn_callback_works() {
        let cb: ProgressCallback = Arc::new(NoopProgressCallback);
        cb.on_batch_start(10);
        cb.on_file_start(1, 10, "x.jpg");
        cb.on_file_complete(1, 10, "x.jpg", true);
    }
}
