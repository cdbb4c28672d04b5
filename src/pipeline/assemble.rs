//! Document transcription: fan pages out to [`PageTranscriber`] and
//! reassemble them in page order.
//!
//! Pages run concurrently through `buffer_unordered(concurrency)`, so they
//! complete in any order. [`DocumentTranscript::from_pages`] sorts by page
//! number; the final text never depends on completion order.
//!
//! Dropping the returned future cancels every in-flight page. Nothing is
//! persisted until the full page set is back.

use crate::output::{DocumentTranscript, RasterPage};
use crate::pipeline::transcribe::PageTranscriber;
use crate::progress::ProgressCallback;
use futures::stream::{self, StreamExt};
use tracing::info;

pub struct DocumentTranscriber {
    transcriber: PageTranscriber,
    concurrency: usize,
    progress: Option<ProgressCallback>,
}

impl DocumentTranscriber {
    pub fn new(transcriber: PageTranscriber, concurrency: usize) -> Self {
        Self {
            transcriber,
            concurrency: concurrency.max(1),
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: Option<ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    /// Transcribe every page. One transcript per input page, sorted by
    /// page number.
    pub async fn transcribe_all(&self, pages: Vec<RasterPage>) -> DocumentTranscript {
        let total = pages.len();
        if let Some(cb) = &self.progress {
            cb.on_transcription_start(total);
        }
        info!(pages = total, concurrency = self.concurrency, "transcribing document");

        let transcripts = stream::iter(pages.into_iter().map(|page| {
            let transcriber = self.transcriber.clone();
            let progress = self.progress.clone();
            async move {
                if let Some(cb) = &progress {
                    cb.on_page_start(page.page_number, total);
                }
                let transcript = transcriber.transcribe(&page).await;
                if let Some(cb) = &progress {
                    cb.on_page_complete(
                        transcript.page_number,
                        total,
                        transcript.text.chars().count(),
                        transcript.degraded,
                    );
                }
                transcript
            }
        }))
        .buffer_unordered(self.concurrency)
        .collect::<Vec<_>>()
        .await;

        let document = DocumentTranscript::from_pages(transcripts);
        info!(
            pages = document.page_count(),
            degraded = document.degraded_page_count(),
            "document transcribed"
        );
        document
    }
}
