//! Progress-callback trait for ingestion events.
//!
//! Attach an [`Arc<dyn IngestionProgressCallback>`] with
//! [`crate::flow::IngestionFlow::with_progress`] to observe stage
//! transitions and per-page transcription as they happen. The CLI uses it to
//! drive a progress bar; a service could forward events to a queue.
//!
//! # Example
//!
//! ```rust
//! use deck_ingest::{IngestionProgressCallback, Stage};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! #[derive(Default)]
//! struct DegradedCounter(AtomicUsize);
//!
//! impl IngestionProgressCallback for DegradedCounter {
//!     fn on_page_complete(&self, _page: usize, _total: usize, _len: usize, degraded: bool) {
//!         if degraded {
//!             self.0.fetch_add(1, Ordering::SeqCst);
//!         }
//!     }
//! }
//!
//! let counter = DegradedCounter::default();
//! counter.on_stage("acme", Stage::Fetching);
//! counter.on_page_complete(1, 3, 120, true);
//! assert_eq!(counter.0.load(Ordering::SeqCst), 1);
//! ```

use crate::flow::Stage;
use crate::output::IngestionOutcome;
use std::sync::Arc;

/// Receives ingestion events. Every method defaults to a no-op.
///
/// Page events arrive concurrently from the transcription workers and in
/// completion order, not page order; implementations must synchronise any
/// shared state themselves.
pub trait IngestionProgressCallback: Send + Sync {
    /// The flow entered `stage` for `company_id`.
    fn on_stage(&self, company_id: &str, stage: Stage) {
        let _ = (company_id, stage);
    }

    /// Rasterisation finished; `total_pages` will be transcribed.
    fn on_transcription_start(&self, total_pages: usize) {
        let _ = total_pages;
    }

    /// A worker picked up page `page` (1-based).
    fn on_page_start(&self, page: usize, total_pages: usize) {
        let _ = (page, total_pages);
    }

    /// Page `page` has its final text. `degraded` means no attempt passed
    /// verification and the longest attempt was used.
    fn on_page_complete(&self, page: usize, total_pages: usize, text_len: usize, degraded: bool) {
        let _ = (page, total_pages, text_len, degraded);
    }

    /// The run finished, successfully or not.
    fn on_ingestion_complete(&self, outcome: &IngestionOutcome) {
        let _ = outcome;
    }
}

/// Used when no callback is attached.
pub struct NoopProgressCallback;

impl IngestionProgressCallback for NoopProgressCallback {}

pub type ProgressCallback = Arc<dyn IngestionProgressCallback>;
