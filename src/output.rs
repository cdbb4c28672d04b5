//! Data model shared by every pipeline stage.
//!
//! Each stage hands the next one a typed value rather than a loose map:
//! the fetcher produces bytes for a [`PdfSource`], the rasteriser produces
//! [`RasterPage`]s, the transcriber turns each into a [`PageTranscript`],
//! the orchestrator assembles a [`DocumentTranscript`], and the flow reports
//! a single [`IngestionOutcome`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ── Sources ──────────────────────────────────────────────────────────────

/// Where a pitch-deck PDF can be fetched from.
///
/// Immutable; consumed once by [`crate::pipeline::fetch::SourceFetcher`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PdfSource {
    /// A share link that may or may not point at a PDF (DocSend, Google
    /// Drive, or a generic web page).
    Url { url: String },
    /// A link known to serve the PDF directly.
    DirectPdfUrl { url: String },
    /// A previously uploaded object in durable storage.
    StoredObject { bucket: String, key: String },
}

impl PdfSource {
    pub fn url(url: impl Into<String>) -> Self {
        PdfSource::Url { url: url.into() }
    }

    pub fn direct(url: impl Into<String>) -> Self {
        PdfSource::DirectPdfUrl { url: url.into() }
    }

    pub fn stored(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        PdfSource::StoredObject {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for PdfSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PdfSource::Url { url } => write!(f, "url:{url}"),
            PdfSource::DirectPdfUrl { url } => write!(f, "pdf:{url}"),
            PdfSource::StoredObject { bucket, key } => write!(f, "object:{bucket}/{key}"),
        }
    }
}

impl FromStr for PdfSource {
    type Err = String;

    /// Parse the CLI form: `pdf:<url>`, `url:<url>`, `object:<bucket>/<key>`,
    /// or a bare URL (treated as `url:`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(rest) = s.strip_prefix("pdf:") {
            return non_empty(rest).map(PdfSource::direct);
        }
        if let Some(rest) = s.strip_prefix("url:") {
            return non_empty(rest).map(PdfSource::url);
        }
        if let Some(rest) = s.strip_prefix("object:") {
            return match rest.split_once('/') {
                Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => {
                    Ok(PdfSource::stored(bucket, key))
                }
                _ => Err(format!("expected object:<bucket>/<key>, got '{s}'")),
            };
        }
        non_empty(s).map(PdfSource::url)
    }
}

fn non_empty(s: &str) -> Result<&str, String> {
    if s.is_empty() {
        Err("empty source".to_string())
    } else {
        Ok(s)
    }
}

// ── Raster pages ─────────────────────────────────────────────────────────

/// Encoded image format of a [`RasterPage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    #[default]
    Png,
}

impl ImageFormat {
    pub fn mime_type(self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
        }
    }
}

/// Render resolution chosen for a page from its visual area.
///
/// Page area is measured in points, i.e. pixels at the PDF default of
/// 72 DPI. Large pages already carry enough pixels; small ones are upscaled
/// so body text stays legible to the vision model.
///
/// | Area (px at 72 DPI)           | Tier     | DPI |
/// |-------------------------------|----------|-----|
/// | ≥ 1366 × 768                  | `High`   | 72  |
/// | between                       | `Medium` | 144 |
/// | ≤ 640 × 360                   | `Low`    | 216 |
///
/// The tier names describe the page's *native* resolution, not the render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionTier {
    Low,
    Medium,
    High,
}

impl ResolutionTier {
    pub const HIGH_AREA_THRESHOLD: f64 = 1366.0 * 768.0;
    pub const LOW_AREA_THRESHOLD: f64 = 640.0 * 360.0;

    /// Pick the tier for a page of `width × height` points.
    pub fn for_page(width_pts: f64, height_pts: f64) -> Self {
        let area = width_pts * height_pts;
        if area >= Self::HIGH_AREA_THRESHOLD {
            ResolutionTier::High
        } else if area <= Self::LOW_AREA_THRESHOLD {
            ResolutionTier::Low
        } else {
            ResolutionTier::Medium
        }
    }

    pub fn dpi(self) -> u32 {
        match self {
            ResolutionTier::High => 72,
            ResolutionTier::Medium => 144,
            ResolutionTier::Low => 216,
        }
    }

    /// Scale factor relative to the 72 DPI page space.
    pub fn scale(self) -> f32 {
        self.dpi() as f32 / 72.0
    }
}

/// One rendered page. Never mutated after the rasteriser creates it.
#[derive(Clone, PartialEq, Eq)]
pub struct RasterPage {
    /// 1-based.
    pub page_number: usize,
    pub image_bytes: Vec<u8>,
    pub format: ImageFormat,
    pub resolution_tier: ResolutionTier,
}

impl fmt::Debug for RasterPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RasterPage")
            .field("page_number", &self.page_number)
            .field("image_bytes", &format_args!("<{} bytes>", self.image_bytes.len()))
            .field("format", &self.format)
            .field("resolution_tier", &self.resolution_tier)
            .finish()
    }
}

// ── Transcription ────────────────────────────────────────────────────────

/// Verifier's judgement of one extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", content = "reason", rename_all = "snake_case")]
pub enum Verdict {
    Clean,
    Flagged(String),
}

impl Verdict {
    pub fn is_clean(&self) -> bool {
        matches!(self, Verdict::Clean)
    }
}

/// One extraction + verification round for a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptionAttempt {
    pub page_number: usize,
    /// 0-based.
    pub attempt_index: u32,
    pub raw_text: String,
    pub verification_verdict: Verdict,
}

/// Finalised text of one page. Exactly one per [`RasterPage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageTranscript {
    pub page_number: usize,
    pub text: String,
    /// Provenance line prefixed to the page in the assembled document.
    pub source_marker: String,
    /// `true` when no attempt passed verification and `text` is the longest
    /// raw attempt.
    pub degraded: bool,
    /// Counted extraction attempts (rate-limit waits excluded).
    pub attempts: u32,
}

impl PageTranscript {
    pub fn marker_for(page_number: usize) -> String {
        format!("[Page {page_number} of source document]")
    }
}

/// Separator placed between pages in [`DocumentTranscript::text`].
pub const PAGE_SEPARATOR: &str = "\n\n";

/// Ordered page transcripts of one document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentTranscript {
    pages: Vec<PageTranscript>,
}

impl DocumentTranscript {
    /// Build from pages in any order; they are sorted by page number.
    pub fn from_pages(mut pages: Vec<PageTranscript>) -> Self {
        pages.sort_by_key(|p| p.page_number);
        Self { pages }
    }

    pub fn pages(&self) -> &[PageTranscript] {
        &self.pages
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn degraded_page_count(&self) -> usize {
        self.pages.iter().filter(|p| p.degraded).count()
    }

    /// Concatenate every page as `marker\ntext`, in ascending page order.
    pub fn text(&self) -> String {
        self.pages
            .iter()
            .map(|p| format!("{}\n{}", p.source_marker, p.text.trim_end()))
            .collect::<Vec<_>>()
            .join(PAGE_SEPARATOR)
    }
}

// ── Outcome ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestionStatus {
    Success,
    Failed,
}

/// The single result of an ingestion run, mirrored onto the company record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionOutcome {
    pub company_id: String,
    pub status: IngestionStatus,
    pub canonical_pdf_location: Option<String>,
    pub transcript_location: Option<String>,
    pub extracted_text_length: Option<usize>,
    pub page_count: usize,
    pub degraded_page_count: usize,
    pub error_message: Option<String>,
}
