//! Error types for the deck-ingest library.
//!
//! Two error types mirror two failure scopes:
//!
//! * [`SourceError`]: a single PDF source could not be turned into bytes.
//!   Recoverable: the fetcher moves on to the next configured source.
//!
//! * [`IngestError`]: the ingestion run cannot complete (every source
//!   failed, the document will not open, storage is unreachable). Returned
//!   as `Err(IngestError)` from [`crate::flow::IngestionFlow::run`] after the
//!   failure has been recorded on the company record.
//!
//! Page transcription has no error type of its own: a page that never
//! passes verification degrades to its best attempt instead of failing.

use crate::records::RecordStoreError;
use crate::storage::StorageError;
use thiserror::Error;

/// Why one PDF source did not yield a document.
#[derive(Debug, Clone, Error, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SourceError {
    /// The link is malformed or the converter rejected it (HTTP 400).
    #[error("Invalid link '{url}': {detail}")]
    InvalidLink { url: String, detail: String },

    /// Neither the public nor the authenticated path could read the file.
    #[error("Access denied for '{url}': {detail}")]
    AccessDenied { url: String, detail: String },

    /// Upstream returned HTTP 429; the caller should back off before retrying.
    #[error("Rate limited by upstream for '{url}'")]
    RateLimited {
        url: String,
        retry_after_secs: Option<u64>,
    },

    /// The download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'")]
    DownloadTimedOut { url: String, secs: u64 },

    /// The resource exists but is not a PDF.
    #[error("'{url}' is not a PDF: {detail}")]
    NotAPdf { url: String, detail: String },

    /// The share-link converter answered with something other than a PDF,
    /// which in practice means a passcode/email gate or an expired link.
    #[error("'{url}' is password protected or expired")]
    PasswordProtectedOrExpired { url: String },

    /// A stored object could not be read back.
    #[error("Stored object '{bucket}/{key}' unavailable: {detail}")]
    ObjectMissing {
        bucket: String,
        key: String,
        detail: String,
    },

    /// Any other failure (non-2xx status, connection reset, bad body).
    #[error("Failed to download '{url}': {detail}")]
    DownloadFailed { url: String, detail: String },
}

/// All fatal errors of an ingestion run.
#[derive(Debug, Error)]
pub enum IngestError {
    // ── Fetch ─────────────────────────────────────────────────────────────
    /// Every configured source failed. `attempts` holds one error per source
    /// in priority order.
    #[error("No PDF source succeeded ({} tried){}", .attempts.len(), summarise(.attempts))]
    SourceUnavailable { attempts: Vec<SourceError> },

    // ── Document ──────────────────────────────────────────────────────────
    /// The PDF header/xref is corrupt or the document is encrypted.
    #[error("PDF is corrupt or unreadable: {detail}")]
    CorruptDocument { detail: String },

    /// pdfium failed on a specific page after the document opened.
    #[error("Rasterisation failed for page {page}: {detail}")]
    RasterisationFailed { page: usize, detail: String },

    // ── Collaborators ─────────────────────────────────────────────────────
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    RecordStore(#[from] RecordStoreError),

    /// The configured model provider could not be created.
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// The whole run exceeded `ingest_timeout_secs`.
    #[error("Ingestion timed out after {secs}s")]
    TimedOut { secs: u64 },

    // ── Input / config ────────────────────────────────────────────────────
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn summarise(attempts: &[SourceError]) -> String {
    match attempts.last() {
        Some(last) => format!("; last error: {last}"),
        None => String::new(),
    }
}

impl SourceError {
    /// The URL (or object path) the error refers to.
    pub fn target(&self) -> String {
        match self {
            SourceError::InvalidLink { url, .. }
            | SourceError::AccessDenied { url, .. }
            | SourceError::RateLimited { url, .. }
            | SourceError::DownloadTimedOut { url, .. }
            | SourceError::NotAPdf { url, .. }
            | SourceError::PasswordProtectedOrExpired { url }
            | SourceError::DownloadFailed { url, .. } => url.clone(),
            SourceError::ObjectMissing { bucket, key, .. } => format!("{bucket}/{key}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_unavailable_mentions_last_error() {
        let e = IngestError::SourceUnavailable {
            attempts: vec![
                SourceError::RateLimited {
                    url: "https://docsend.com/view/abc".into(),
                    retry_after_secs: Some(30),
                },
                SourceError::NotAPdf {
                    url: "https://example.com".into(),
                    detail: "content-type text/html".into(),
                },
            ],
        };
        let msg = e.to_string();
        assert!(msg.contains("2 tried"), "got: {msg}");
        assert!(msg.contains("text/html"), "got: {msg}");
    }

    #[test]
    fn source_unavailable_without_attempts() {
        let e = IngestError::SourceUnavailable { attempts: vec![] };
        assert_eq!(e.to_string(), "No PDF source succeeded (0 tried)");
    }

    #[test]
    fn object_missing_target_is_bucket_key() {
        let e = SourceError::ObjectMissing {
            bucket: "uploads".into(),
            key: "acme/deck.pdf".into(),
            detail: "not found".into(),
        };
        assert_eq!(e.target(), "uploads/acme/deck.pdf");
    }

    #[test]
    fn timeout_display() {
        let e = SourceError::DownloadTimedOut {
            url: "https://x.test/a.pdf".into(),
            secs: 60,
        };
        assert!(e.to_string().contains("60s"));
    }
}
