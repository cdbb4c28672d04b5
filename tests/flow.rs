//! Integration tests for the ingestion flow.
//!
//! Everything runs in-process: stored-object sources in an in-memory
//! storage backend, an in-memory record store, a fake rasteriser that
//! encodes the page number into the image bytes, and scripted models that
//! read it back.

use async_trait::async_trait;
use deck_ingest::{
    IngestError, IngestionConfig, IngestionFlow, IngestionOutcome, IngestionProgressCallback,
    IngestionRequest, IngestionStatus, InMemoryObjectStorage, InMemoryRecordStore, ImageFormat,
    ModelClient, ModelError, ModelRequest, ObjectStorage, PdfSource, ProcessingStatus, RasterPage,
    Rasterizer, RecordStore, ResolutionTier, SourceError, Stage,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const PDF_V1: &[u8] = b"%PDF-1.7\n% first upload\n%%EOF\n";
const PDF_V2: &[u8] = b"%PDF-1.7\n% second upload, different bytes\n%%EOF\n";
const REFUSAL: &str = "I'm sorry, but I can't read the content of this image.";

// ── Fakes ────────────────────────────────────────────────────────────────────

/// Emits `pages` raster pages whose first image byte is the page number.
struct FakeRasterizer {
    pages: usize,
}

#[async_trait]
impl Rasterizer for FakeRasterizer {
    async fn rasterize(&self, pdf: Vec<u8>) -> Result<Vec<RasterPage>, IngestError> {
        assert!(pdf.starts_with(b"%PDF-"));
        Ok((1..=self.pages)
            .map(|n| RasterPage {
                page_number: n,
                image_bytes: vec![n as u8, 0, 0, 0],
                format: ImageFormat::Png,
                resolution_tier: ResolutionTier::Medium,
            })
            .collect())
    }
}

struct BrokenRasterizer;

#[async_trait]
impl Rasterizer for BrokenRasterizer {
    async fn rasterize(&self, _pdf: Vec<u8>) -> Result<Vec<RasterPage>, IngestError> {
        Err(IngestError::CorruptDocument {
            detail: "xref table not found".into(),
        })
    }
}

/// Vision model: refuses page `p` the first `refusals[p]` times it sees it,
/// otherwise transcribes. Pages with `usize::MAX` refusals never succeed.
struct VisionModel {
    refusals: Mutex<HashMap<u8, usize>>,
    calls_per_page: Mutex<HashMap<u8, usize>>,
    latency: Duration,
}

impl VisionModel {
    fn new(refusals: &[(u8, usize)]) -> Arc<Self> {
        Self::slow(refusals, Duration::ZERO)
    }

    fn slow(refusals: &[(u8, usize)], latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            refusals: Mutex::new(refusals.iter().copied().collect()),
            calls_per_page: Mutex::new(HashMap::new()),
            latency,
        })
    }

    fn calls_for(&self, page: u8) -> usize {
        self.calls_per_page.lock().unwrap().get(&page).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ModelClient for VisionModel {
    async fn complete(&self, request: ModelRequest) -> Result<String, ModelError> {
        let page = request.image_png.as_ref().map(|b| b[0]).unwrap_or(0);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let call = {
            let mut calls = self.calls_per_page.lock().unwrap();
            let c = calls.entry(page).or_insert(0);
            *c += 1;
            *c
        };
        let refuse = {
            let mut refusals = self.refusals.lock().unwrap();
            match refusals.get_mut(&page) {
                Some(n) if *n == usize::MAX => true,
                Some(n) if *n > 0 => {
                    *n -= 1;
                    true
                }
                _ => false,
            }
        };
        if refuse {
            Ok(format!("{REFUSAL} (call {call})"))
        } else {
            Ok(format!("Slide {page}\n- transcribed on call {call}"))
        }
    }

    fn name(&self) -> &str {
        "fake-vision"
    }
}

/// Text model: flags anything that reads like a refusal.
struct RefusalChecker;

#[async_trait]
impl ModelClient for RefusalChecker {
    async fn complete(&self, request: ModelRequest) -> Result<String, ModelError> {
        if request.text.contains("I'm sorry") {
            Ok("The model said it could not read the image.".into())
        } else {
            Ok("NO_ISSUES".into())
        }
    }

    fn name(&self) -> &str {
        "fake-checker"
    }
}

#[derive(Default)]
struct Events {
    stages: Mutex<Vec<Stage>>,
    pages_done: AtomicUsize,
    outcome: Mutex<Option<IngestionOutcome>>,
}

impl IngestionProgressCallback for Events {
    fn on_stage(&self, _company_id: &str, stage: Stage) {
        self.stages.lock().unwrap().push(stage);
    }

    fn on_page_complete(&self, _page: usize, _total: usize, _len: usize, _degraded: bool) {
        self.pages_done.fetch_add(1, Ordering::SeqCst);
    }

    fn on_ingestion_complete(&self, outcome: &IngestionOutcome) {
        *self.outcome.lock().unwrap() = Some(outcome.clone());
    }
}

// ── Harness ──────────────────────────────────────────────────────────────────

struct Harness {
    storage: Arc<InMemoryObjectStorage>,
    records: Arc<InMemoryRecordStore>,
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

impl Harness {
    async fn new() -> Self {
        init_logging();
        let storage = Arc::new(InMemoryObjectStorage::new());
        storage
            .put("uploads/acme.pdf", PDF_V1, "application/pdf")
            .await
            .unwrap();
        Self {
            storage,
            records: Arc::new(InMemoryRecordStore::new()),
        }
    }

    fn config(&self, vision: Arc<VisionModel>) -> IngestionConfig {
        IngestionConfig::builder()
            .extraction_client(vision)
            .verification_client(Arc::new(RefusalChecker))
            .concurrency(3)
            .retry_pause_ms(0)
            .build()
            .unwrap()
    }

    fn flow(&self, config: IngestionConfig, rasterizer: Arc<dyn Rasterizer>) -> IngestionFlow {
        IngestionFlow::new(config, self.storage.clone(), self.records.clone())
            .unwrap()
            .with_rasterizer(rasterizer)
    }
}

fn acme() -> IngestionRequest {
    IngestionRequest::new("acme", vec![PdfSource::stored("uploads", "acme.pdf")])
        .with_company_name("Acme Robotics")
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn three_page_deck_with_refusals_on_page_two() {
    let h = Harness::new().await;
    let vision = VisionModel::new(&[(2, 2)]);
    let flow = h.flow(h.config(vision.clone()), Arc::new(FakeRasterizer { pages: 3 }));

    let report = flow.run(&acme()).await.expect("ingestion should succeed");

    let doc = &report.transcript;
    let numbers: Vec<usize> = doc.pages().iter().map(|p| p.page_number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    assert_eq!(doc.pages()[1].attempts, 3);
    assert_eq!(doc.pages()[1].text, "Slide 2\n- transcribed on call 3");
    assert_eq!(doc.degraded_page_count(), 0);
    assert_eq!(vision.calls_for(2), 3);

    let text = doc.text();
    let p1 = text.find("[Page 1 of source document]").unwrap();
    let p2 = text.find("[Page 2 of source document]").unwrap();
    let p3 = text.find("[Page 3 of source document]").unwrap();
    assert!(p1 < p2 && p2 < p3, "markers out of order:\n{text}");
    assert!(!text.contains("I'm sorry"));

    let outcome = &report.outcome;
    assert_eq!(outcome.status, IngestionStatus::Success);
    assert_eq!(outcome.page_count, 3);
    assert_eq!(outcome.extracted_text_length, Some(text.chars().count()));

    let record = h.records.get("acme").await.unwrap().unwrap();
    assert_eq!(record.status, ProcessingStatus::Success);
    assert_eq!(record.company_name.as_deref(), Some("Acme Robotics"));
    assert_eq!(record.pdf_location.as_deref(), Some("memory://pitch-decks/acme.pdf"));
    assert_eq!(record.transcript_location.as_deref(), Some("memory://transcripts/acme.md"));
    assert_eq!(record.extracted_text_length, Some(text.chars().count()));
    assert_eq!(record.degraded_page_count, Some(0));
    assert_eq!(record.last_error, None);

    let stored = h.storage.get("transcripts/acme.md").await.unwrap();
    assert_eq!(String::from_utf8(stored).unwrap(), text);
    assert_eq!(h.storage.get("pitch-decks/acme.pdf").await.unwrap(), PDF_V1);
}

#[tokio::test]
async fn rasterisation_failure_is_recorded_then_cleared() {
    let h = Harness::new().await;

    let broken = h.flow(h.config(VisionModel::new(&[])), Arc::new(BrokenRasterizer));
    let err = broken.run(&acme()).await.unwrap_err();
    assert!(matches!(err, IngestError::CorruptDocument { .. }), "{err:?}");

    let record = h.records.get("acme").await.unwrap().unwrap();
    assert_eq!(record.status, ProcessingStatus::Failed);
    let last_error = record.last_error.clone().unwrap_or_default();
    assert!(!last_error.is_empty());
    assert!(last_error.starts_with("rasterizing:"), "{last_error}");
    assert_eq!(record.extracted_text_length, None);
    // The canonical copy was stored before rendering failed.
    assert_eq!(record.pdf_location.as_deref(), Some("memory://pitch-decks/acme.pdf"));

    let working = h.flow(h.config(VisionModel::new(&[])), Arc::new(FakeRasterizer { pages: 2 }));
    working.run(&acme()).await.unwrap();

    let record = h.records.get("acme").await.unwrap().unwrap();
    assert_eq!(record.status, ProcessingStatus::Success);
    assert_eq!(record.last_error, None);
    assert!(record.extracted_text_length.is_some());
}

#[tokio::test]
async fn failure_after_success_drops_previous_results() {
    let h = Harness::new().await;

    let working = h.flow(h.config(VisionModel::new(&[])), Arc::new(FakeRasterizer { pages: 2 }));
    working.run(&acme()).await.unwrap();
    let before = h.records.get("acme").await.unwrap().unwrap();
    assert!(before.extracted_text_length.is_some());
    assert!(before.transcript_location.is_some());

    let events = Arc::new(Events::default());
    let broken = h
        .flow(h.config(VisionModel::new(&[])), Arc::new(BrokenRasterizer))
        .with_progress(events.clone());
    broken.run(&acme()).await.unwrap_err();

    let record = h.records.get("acme").await.unwrap().unwrap();
    assert_eq!(record.status, ProcessingStatus::Failed);
    assert!(record.last_error.unwrap().starts_with("rasterizing:"));
    assert_eq!(record.extracted_text_length, None);
    assert_eq!(record.transcript_location, None);
    assert_eq!(record.degraded_page_count, None);
    assert_eq!(record.pdf_location, before.pdf_location);

    // The canonical copy was stored before rendering failed.
    let outcome = events.outcome.lock().unwrap().clone().unwrap();
    assert_eq!(outcome.status, IngestionStatus::Failed);
    assert_eq!(
        outcome.canonical_pdf_location.as_deref(),
        Some("memory://pitch-decks/acme.pdf")
    );
    assert_eq!(outcome.extracted_text_length, None);
}

#[tokio::test]
async fn fetch_failure_outcome_has_no_pdf_location() {
    let h = Harness::new().await;
    let events = Arc::new(Events::default());
    let flow = h
        .flow(h.config(VisionModel::new(&[])), Arc::new(FakeRasterizer { pages: 1 }))
        .with_progress(events.clone());

    let request = IngestionRequest::new("acme", vec![PdfSource::stored("uploads", "missing.pdf")]);
    flow.run(&request).await.unwrap_err();

    let outcome = events.outcome.lock().unwrap().clone().unwrap();
    assert_eq!(outcome.status, IngestionStatus::Failed);
    assert_eq!(outcome.canonical_pdf_location, None);
}

#[tokio::test]
async fn resubmission_overwrites_canonical_pdf() {
    let h = Harness::new().await;
    let flow = h.flow(h.config(VisionModel::new(&[])), Arc::new(FakeRasterizer { pages: 1 }));

    flow.run(&acme()).await.unwrap();
    let first = h.records.get("acme").await.unwrap().unwrap();

    h.storage
        .put("uploads/acme.pdf", PDF_V2, "application/pdf")
        .await
        .unwrap();
    flow.run(&acme()).await.unwrap();
    let second = h.records.get("acme").await.unwrap().unwrap();

    assert_eq!(first.pdf_location, second.pdf_location);
    assert_eq!(h.storage.get("pitch-decks/acme.pdf").await.unwrap(), PDF_V2);
    // upload + canonical PDF + transcript
    assert_eq!(h.storage.len().await, 3);
}

#[tokio::test]
async fn first_working_source_wins() {
    let h = Harness::new().await;
    let flow = h.flow(h.config(VisionModel::new(&[])), Arc::new(FakeRasterizer { pages: 1 }));

    let request = IngestionRequest::new(
        "acme",
        vec![
            PdfSource::stored("uploads", "missing.pdf"),
            PdfSource::stored("uploads", "acme.pdf"),
        ],
    );
    let report = flow.run(&request).await.unwrap();
    assert_eq!(report.outcome.status, IngestionStatus::Success);
}

#[tokio::test]
async fn exhausted_sources_fail_at_fetching() {
    let h = Harness::new().await;
    let flow = h.flow(h.config(VisionModel::new(&[])), Arc::new(FakeRasterizer { pages: 1 }));

    let request = IngestionRequest::new(
        "acme",
        vec![
            PdfSource::stored("uploads", "missing.pdf"),
            PdfSource::url("not a link"),
        ],
    );
    match flow.run(&request).await {
        Err(IngestError::SourceUnavailable { attempts }) => {
            assert_eq!(attempts.len(), 2);
            assert!(matches!(attempts[0], SourceError::ObjectMissing { .. }));
            assert!(matches!(attempts[1], SourceError::InvalidLink { .. }));
        }
        other => panic!("unexpected {other:?}"),
    }

    let record = h.records.get("acme").await.unwrap().unwrap();
    assert_eq!(record.status, ProcessingStatus::Failed);
    assert!(record.last_error.unwrap().starts_with("fetching:"));
    assert_eq!(record.pdf_location, None);
}

#[tokio::test]
async fn persistent_refusal_degrades_without_failing() {
    let h = Harness::new().await;
    let vision = VisionModel::new(&[(1, usize::MAX)]);
    let config = IngestionConfig::builder()
        .extraction_client(vision.clone())
        .verification_client(Arc::new(RefusalChecker))
        .retry_pause_ms(0)
        .max_attempts(3)
        .build()
        .unwrap();
    let flow = h.flow(config, Arc::new(FakeRasterizer { pages: 2 }));

    let report = flow.run(&acme()).await.unwrap();
    assert_eq!(report.outcome.degraded_page_count, 1);
    assert_eq!(vision.calls_for(1), 3);

    let page1 = &report.transcript.pages()[0];
    assert!(page1.degraded);
    assert!(page1.text.starts_with(REFUSAL));

    let record = h.records.get("acme").await.unwrap().unwrap();
    assert_eq!(record.status, ProcessingStatus::Success);
    assert_eq!(record.degraded_page_count, Some(1));
}

#[tokio::test]
async fn deadline_cancels_run_and_records_failure() {
    let h = Harness::new().await;
    let vision = VisionModel::slow(&[], Duration::from_secs(30));
    let config = IngestionConfig::builder()
        .extraction_client(vision)
        .verification_client(Arc::new(RefusalChecker))
        .ingest_timeout_secs(1)
        .build()
        .unwrap();
    let flow = h.flow(config, Arc::new(FakeRasterizer { pages: 2 }));

    let err = flow.run(&acme()).await.unwrap_err();
    assert!(matches!(err, IngestError::TimedOut { secs: 1 }), "{err:?}");

    let record = h.records.get("acme").await.unwrap().unwrap();
    assert_eq!(record.status, ProcessingStatus::Failed);
    assert!(record.last_error.unwrap().starts_with("transcribing:"));
    assert!(h.storage.get("transcripts/acme.md").await.is_err());
}

#[tokio::test]
async fn progress_reports_stages_in_order() {
    let h = Harness::new().await;
    let events = Arc::new(Events::default());
    let flow = h
        .flow(h.config(VisionModel::new(&[])), Arc::new(FakeRasterizer { pages: 3 }))
        .with_progress(events.clone());

    flow.run(&acme()).await.unwrap();

    assert_eq!(
        *events.stages.lock().unwrap(),
        vec![
            Stage::Received,
            Stage::Fetching,
            Stage::Storing,
            Stage::Rasterizing,
            Stage::Transcribing
        ]
    );
    assert_eq!(events.pages_done.load(Ordering::SeqCst), 3);
    let outcome = events.outcome.lock().unwrap().clone().unwrap();
    assert_eq!(outcome.status, IngestionStatus::Success);
}

#[tokio::test]
async fn invalid_company_id_touches_nothing() {
    let h = Harness::new().await;
    let flow = h.flow(h.config(VisionModel::new(&[])), Arc::new(FakeRasterizer { pages: 1 }));

    let request = IngestionRequest::new("../acme", vec![PdfSource::stored("uploads", "acme.pdf")]);
    let err = flow.run(&request).await.unwrap_err();
    assert!(matches!(err, IngestError::InvalidInput(_)), "{err:?}");
    assert!(h.records.get("../acme").await.unwrap().is_none());
    assert_eq!(h.storage.len().await, 1);
}
