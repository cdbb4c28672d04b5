//! # deck-ingest
//!
//! Fetch pitch-deck PDFs from whatever link a founder shared, rasterise
//! every page, and transcribe each one with a vision model whose output is
//! checked by a second model.
//!
//! ## Pipeline Overview
//!
//! ```text
//! sources (DocSend / Drive / URL / stored object)
//!  │
//!  ├─ 1. Fetch       first source that yields a real PDF wins
//!  ├─ 2. Store       canonical copy at {pdf_prefix}/{company_id}.pdf
//!  ├─ 3. Rasterise   pdfium, per-page DPI tier (spawn_blocking)
//!  ├─ 4. Transcribe  extract → verify → retry ×5 → longest-attempt fallback
//!  ├─ 5. Assemble    concurrent pages, reassembled in page order
//!  └─ 6. Record      transcript stored, company record success/failed
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use deck_ingest::{
//!     FilesystemObjectStorage, IngestionConfig, IngestionFlow, IngestionRequest,
//!     JsonFileRecordStore, PdfSource,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / …
//!     let flow = IngestionFlow::new(
//!         IngestionConfig::default(),
//!         Arc::new(FilesystemObjectStorage::new("deck-store")),
//!         Arc::new(JsonFileRecordStore::new("deck-records")),
//!     )?;
//!     let request = IngestionRequest::new(
//!         "acme",
//!         vec![
//!             PdfSource::url("https://docsend.com/view/abc123"),
//!             PdfSource::direct("https://acme.com/deck.pdf"),
//!         ],
//!     );
//!     let report = flow.run(&request).await?;
//!     println!("{}", report.transcript.text());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `deck-ingest` binary (clap + anyhow + indicatif + tracing-subscriber) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod flow;
pub mod model;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod records;
pub mod storage;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{IngestionConfig, IngestionConfigBuilder};
pub use error::{IngestError, SourceError};
pub use flow::{IngestionFlow, IngestionReport, IngestionRequest, Stage};
pub use model::{ClientPool, LlmProviderClient, ModelClient, ModelError, ModelRequest};
pub use output::{
    DocumentTranscript, ImageFormat, IngestionOutcome, IngestionStatus, PageTranscript, PdfSource,
    RasterPage, ResolutionTier, TranscriptionAttempt, Verdict,
};
pub use pipeline::render::{PdfiumRasterizer, Rasterizer};
pub use progress::{IngestionProgressCallback, NoopProgressCallback, ProgressCallback};
pub use records::{
    CompanyRecord, InMemoryRecordStore, JsonFileRecordStore, ProcessingStatus, RecordStore,
    RecordUpdate,
};
pub use storage::{FilesystemObjectStorage, InMemoryObjectStorage, ObjectStorage, StorageError};
