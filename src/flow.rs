//! Per-company ingestion flow.
//!
//! ```text
//! received ─▶ fetching ─▶ storing ─▶ rasterizing ─▶ transcribing ─▶ success
//!     └────────────┴───────────┴────────────┴──────────────┴────────▶ failed(stage, reason)
//! ```
//!
//! The company record is written on entry (`processing`), when the canonical
//! PDF lands in storage, and once more on exit: `success` with the
//! transcript location and length and a cleared `lastError`, or `failed`
//! with `lastError` set to the stage and reason and the previous run's
//! transcript location, length and degraded count cleared. A run never
//! leaves the record in `processing` without an error annotation unless the
//! record store itself is unreachable.

use crate::config::IngestionConfig;
use crate::error::IngestError;
use crate::model::resolve_pools;
use crate::output::{DocumentTranscript, IngestionOutcome, IngestionStatus, PdfSource};
use crate::pipeline::assemble::DocumentTranscriber;
use crate::pipeline::fetch::SourceFetcher;
use crate::pipeline::render::{PdfiumRasterizer, Rasterizer};
use crate::pipeline::transcribe::{PageTranscriber, TranscribeSettings};
use crate::progress::ProgressCallback;
use crate::records::{ErrorAnnotation, ProcessingStatus, RecordStore, RecordUpdate};
use crate::storage::ObjectStorage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{error, info, instrument, warn};

/// Longest accepted company id.
pub const MAX_COMPANY_ID_LEN: usize = 128;

/// Flow states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Received,
    Fetching,
    Storing,
    Rasterizing,
    Transcribing,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Received => "received",
            Stage::Fetching => "fetching",
            Stage::Storing => "storing",
            Stage::Rasterizing => "rasterizing",
            Stage::Transcribing => "transcribing",
        })
    }
}

/// One ingestion job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionRequest {
    pub company_id: String,
    #[serde(default)]
    pub company_name: Option<String>,
    /// Tried in order; the first one that yields a PDF wins.
    pub sources: Vec<PdfSource>,
}

impl IngestionRequest {
    pub fn new(company_id: impl Into<String>, sources: Vec<PdfSource>) -> Self {
        Self {
            company_id: company_id.into(),
            company_name: None,
            sources,
        }
    }

    pub fn with_company_name(mut self, name: impl Into<String>) -> Self {
        self.company_name = Some(name.into());
        self
    }

    /// Company ids become storage paths and record keys, so only
    /// `[A-Za-z0-9_-]` is accepted.
    pub fn validate(&self) -> Result<(), IngestError> {
        let id = &self.company_id;
        if id.is_empty() || id.len() > MAX_COMPANY_ID_LEN {
            return Err(IngestError::InvalidInput(format!(
                "company id must be 1..={MAX_COMPANY_ID_LEN} characters"
            )));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(IngestError::InvalidInput(format!(
                "company id '{id}' may only contain letters, digits, '-' and '_'"
            )));
        }
        if self.sources.is_empty() {
            return Err(IngestError::InvalidInput(format!(
                "no PDF sources given for '{id}'"
            )));
        }
        Ok(())
    }
}

/// Result of a successful run.
#[derive(Debug, Clone)]
pub struct IngestionReport {
    pub outcome: IngestionOutcome,
    pub transcript: DocumentTranscript,
}

/// How far a run got: the last entered stage and, once stored, the
/// canonical PDF location.
#[derive(Debug, Clone)]
struct RunState {
    stage: Stage,
    pdf_location: Option<String>,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            stage: Stage::Received,
            pdf_location: None,
        }
    }
}

struct Completed {
    pdf_location: String,
    transcript_location: String,
    transcript: DocumentTranscript,
}

/// Runs ingestion jobs against a storage backend and a record store.
pub struct IngestionFlow {
    config: IngestionConfig,
    storage: Arc<dyn ObjectStorage>,
    records: Arc<dyn RecordStore>,
    fetcher: SourceFetcher,
    rasterizer: Arc<dyn Rasterizer>,
    transcriber: PageTranscriber,
    progress: Option<ProgressCallback>,
}

impl IngestionFlow {
    /// Resolve model clients and build every stage from `config`.
    pub fn new(
        config: IngestionConfig,
        storage: Arc<dyn ObjectStorage>,
        records: Arc<dyn RecordStore>,
    ) -> Result<Self, IngestError> {
        let (extraction, verification) = resolve_pools(&config)?;
        let transcriber =
            PageTranscriber::new(extraction, verification, TranscribeSettings::from_config(&config));
        let fetcher = SourceFetcher::new(&config, Arc::clone(&storage))?;
        let rasterizer = Arc::new(PdfiumRasterizer::new(config.pdfium_lib_path.clone()));

        info!(
            storage = storage.backend_name(),
            concurrency = config.concurrency,
            max_attempts = config.max_attempts,
            "ingestion flow ready"
        );
        Ok(Self {
            config,
            storage,
            records,
            fetcher,
            rasterizer,
            transcriber,
            progress: None,
        })
    }

    /// Replace the pdfium rasteriser.
    pub fn with_rasterizer(mut self, rasterizer: Arc<dyn Rasterizer>) -> Self {
        self.rasterizer = rasterizer;
        self
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn config(&self) -> &IngestionConfig {
        &self.config
    }

    /// Object path of the canonical PDF for `company_id`.
    pub fn pdf_path(&self, company_id: &str) -> String {
        format!("{}/{company_id}.pdf", self.config.pdf_prefix.trim_matches('/'))
    }

    /// Object path of the assembled transcript for `company_id`.
    pub fn transcript_path(&self, company_id: &str) -> String {
        format!("{}/{company_id}.md", self.config.transcript_prefix.trim_matches('/'))
    }

    /// Ingest one company's deck.
    ///
    /// Errors are returned after the failure has been written to the
    /// company record. Dropping the future cancels in-flight downloads and
    /// page transcriptions; nothing partial is persisted.
    #[instrument(skip(self, request), fields(company_id = %request.company_id))]
    pub async fn run(&self, request: &IngestionRequest) -> Result<IngestionReport, IngestError> {
        request.validate()?;
        let id = request.company_id.as_str();
        let name = request.company_name.as_deref();
        let started = Instant::now();

        info!(
            company_id = id,
            company_name = name.unwrap_or(""),
            sources = request.sources.len(),
            "ingestion received"
        );
        let state = Mutex::new(RunState::default());
        self.enter(id, &state, Stage::Received);
        self.records
            .upsert(
                id,
                RecordUpdate::status(ProcessingStatus::Processing).company_name(name),
            )
            .await?;

        let result = match self.config.ingest_timeout_secs {
            Some(secs) => {
                match tokio::time::timeout(Duration::from_secs(secs), self.execute(request, &state))
                    .await
                {
                    Ok(r) => r,
                    Err(_) => Err(IngestError::TimedOut { secs }),
                }
            }
            None => self.execute(request, &state).await,
        };
        let reached = snapshot(&state);

        match result {
            Ok(done) => self.finish_success(request, done, started).await,
            Err(err) => Err(self.finish_failure(request, reached, err).await),
        }
    }

    async fn execute(
        &self,
        request: &IngestionRequest,
        state: &Mutex<RunState>,
    ) -> Result<Completed, IngestError> {
        let id = request.company_id.as_str();

        self.enter(id, state, Stage::Fetching);
        let fetched = self.fetcher.fetch_first(&request.sources).await?;
        info!(
            company_id = id,
            source = %fetched.source,
            priority = fetched.source_index,
            bytes = fetched.bytes.len(),
            "deck fetched"
        );

        self.enter(id, state, Stage::Storing);
        let stored = self
            .storage
            .put(&self.pdf_path(id), &fetched.bytes, "application/pdf")
            .await?;
        self.records
            .upsert(
                id,
                RecordUpdate {
                    pdf_location: Some(stored.location.clone()),
                    ..Default::default()
                },
            )
            .await?;
        if let Ok(mut s) = state.lock() {
            s.pdf_location = Some(stored.location.clone());
        }

        self.enter(id, state, Stage::Rasterizing);
        let pages = self.rasterizer.rasterize(fetched.bytes).await?;

        self.enter(id, state, Stage::Transcribing);
        let transcript = DocumentTranscriber::new(self.transcriber.clone(), self.config.concurrency)
            .with_progress(self.progress.clone())
            .transcribe_all(pages)
            .await;
        let text = transcript.text();
        let saved = self
            .storage
            .put(
                &self.transcript_path(id),
                text.as_bytes(),
                "text/markdown; charset=utf-8",
            )
            .await?;

        Ok(Completed {
            pdf_location: stored.location,
            transcript_location: saved.location,
            transcript,
        })
    }

    async fn finish_success(
        &self,
        request: &IngestionRequest,
        done: Completed,
        started: Instant,
    ) -> Result<IngestionReport, IngestError> {
        let id = request.company_id.as_str();
        let text_len = done.transcript.text().chars().count();
        let degraded = done.transcript.degraded_page_count();

        self.records
            .upsert(
                id,
                RecordUpdate {
                    status: Some(ProcessingStatus::Success),
                    pdf_location: Some(done.pdf_location.clone()),
                    transcript_location: Some(done.transcript_location.clone()),
                    extracted_text_length: Some(text_len),
                    degraded_page_count: Some(degraded),
                    last_error: Some(ErrorAnnotation::Clear),
                    ..Default::default()
                },
            )
            .await?;

        let outcome = IngestionOutcome {
            company_id: id.to_string(),
            status: IngestionStatus::Success,
            canonical_pdf_location: Some(done.pdf_location),
            transcript_location: Some(done.transcript_location),
            extracted_text_length: Some(text_len),
            page_count: done.transcript.page_count(),
            degraded_page_count: degraded,
            error_message: None,
        };
        if degraded > 0 {
            warn!(company_id = id, degraded, "some pages fell back to their longest attempt");
        }
        info!(
            company_id = id,
            pages = outcome.page_count,
            chars = text_len,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "ingestion succeeded"
        );
        if let Some(cb) = &self.progress {
            cb.on_ingestion_complete(&outcome);
        }
        Ok(IngestionReport {
            outcome,
            transcript: done.transcript,
        })
    }

    /// Record the failure and hand the error back.
    async fn finish_failure(
        &self,
        request: &IngestionRequest,
        reached: RunState,
        err: IngestError,
    ) -> IngestError {
        let id = request.company_id.as_str();
        let stage = reached.stage;
        let message = format!("{stage}: {err}");
        error!(
            company_id = id,
            company_name = request.company_name.as_deref().unwrap_or(""),
            stage = %stage,
            error = %err,
            "ingestion failed"
        );

        let update = RecordUpdate {
            status: Some(ProcessingStatus::Failed),
            last_error: Some(ErrorAnnotation::Set(message.clone())),
            ..Default::default()
        }
        .clearing_results();
        if let Err(record_err) = self.records.upsert(id, update).await {
            error!(company_id = id, error = %record_err, "could not record ingestion failure");
        }

        let outcome = IngestionOutcome {
            company_id: id.to_string(),
            status: IngestionStatus::Failed,
            canonical_pdf_location: reached.pdf_location,
            transcript_location: None,
            extracted_text_length: None,
            page_count: 0,
            degraded_page_count: 0,
            error_message: Some(message),
        };
        if let Some(cb) = &self.progress {
            cb.on_ingestion_complete(&outcome);
        }
        err
    }

    fn enter(&self, company_id: &str, cell: &Mutex<RunState>, stage: Stage) {
        if let Ok(mut state) = cell.lock() {
            state.stage = stage;
        }
        info!(company_id, stage = %stage, "stage");
        if let Some(cb) = &self.progress {
            cb.on_stage(company_id, stage);
        }
    }
}

fn snapshot(cell: &Mutex<RunState>) -> RunState {
    cell.lock().map(|s| s.clone()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: &str) -> IngestionRequest {
        IngestionRequest::new(id, vec![PdfSource::direct("https://x.test/deck.pdf")])
    }

    #[test]
    fn company_id_validation() {
        assert!(request("acme-robotics_2024").validate().is_ok());
        let too_long = "x".repeat(MAX_COMPANY_ID_LEN + 1);
        for bad in ["", "acme/../etc", "acme corp", "ä", too_long.as_str()] {
            assert!(
                matches!(request(bad).validate(), Err(IngestError::InvalidInput(_))),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn empty_source_list_rejected() {
        let req = IngestionRequest::new("acme", vec![]);
        assert!(matches!(req.validate(), Err(IngestError::InvalidInput(_))));
    }

    #[test]
    fn stage_display_is_lowercase() {
        assert_eq!(Stage::Rasterizing.to_string(), "rasterizing");
        assert_eq!(serde_json::to_string(&Stage::Fetching).unwrap(), "\"fetching\"");
    }

    #[test]
    fn request_deserialises_with_tagged_sources() {
        let req: IngestionRequest = serde_json::from_str(
            r#"{"company_id":"acme","sources":[{"kind":"url","url":"https://docsend.com/view/x"}]}"#,
        )
        .unwrap();
        assert_eq!(req.company_name, None);
        assert_eq!(req.sources, vec![PdfSource::url("https://docsend.com/view/x")]);
    }
}
