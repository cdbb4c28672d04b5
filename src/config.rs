//! Configuration for an ingestion run.
//!
//! Every knob lives in [`IngestionConfig`], built through
//! [`IngestionConfigBuilder`]. Setters clamp obviously invalid values;
//! [`IngestionConfigBuilder::build`] rejects combinations that cannot work.

use crate::error::IngestError;
use crate::model::ModelClient;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Default converter that turns DocSend share links into PDFs.
pub const DEFAULT_DOCSEND_CONVERTER_URL: &str = "https://docsend2pdf.com/api/convert";
/// Public (unauthenticated) Google Drive download endpoint.
pub const DEFAULT_DRIVE_DOWNLOAD_BASE: &str = "https://drive.google.com/uc";
/// Google Drive REST API root for the authenticated fallback.
pub const DEFAULT_DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";

/// Configuration for [`crate::flow::IngestionFlow`].
///
/// # Example
/// ```rust
/// use deck_ingest::IngestionConfig;
///
/// let config = IngestionConfig::builder()
///     .concurrency(4)
///     .max_attempts(5)
///     .extraction_model("gpt-4.1-mini")
///     .build()
///     .unwrap();
/// assert_eq!(config.temperature, 0.0);
/// ```
#[derive(Clone)]
pub struct IngestionConfig {
    /// Pages transcribed concurrently. Default: available parallelism.
    pub concurrency: usize,

    /// Sampling temperature for extraction and verification. Default: 0.0.
    pub temperature: f32,

    /// Output-token cap per model call. Default: 4096.
    pub max_tokens: usize,

    /// Extraction attempts per page before falling back to the longest
    /// attempt. Default: 5.
    pub max_attempts: u32,

    /// Pause after a flagged attempt, in milliseconds. Default: 500.
    pub retry_pause_ms: u64,

    /// Sleep after a provider rate-limit when no `retry-after` is given,
    /// in milliseconds. Default: 2000.
    pub rate_limit_backoff_ms: u64,

    /// Rate-limit waits tolerated per page before a rate-limit counts as a
    /// failed attempt. Default: 10.
    pub max_rate_limit_waits: u32,

    /// Timeout for each PDF download, in seconds. Default: 60.
    pub download_timeout_secs: u64,

    /// Timeout for the HEAD probe of generic links, in seconds. Default: 15.
    pub probe_timeout_secs: u64,

    /// Share-link converter endpoint for DocSend links.
    pub docsend_converter_url: String,

    /// Email submitted to DocSend links that gate on an address.
    pub docsend_email: Option<String>,

    /// Passcode submitted to DocSend links that gate on one.
    pub docsend_passcode: Option<String>,

    /// Public Drive download endpoint (`?export=download&id=…` is appended).
    pub drive_download_base: String,

    /// Drive API root used by the authenticated fallback.
    pub drive_api_base: String,

    /// Bearer token of the Drive service credential. Without it the
    /// authenticated fallback is skipped.
    pub drive_service_token: Option<String>,

    /// Explicit path to `libpdfium`. When `None` the system library is used.
    pub pdfium_lib_path: Option<PathBuf>,

    /// Object-storage prefix for canonical PDFs. Default: `pitch-decks`.
    pub pdf_prefix: String,

    /// Object-storage prefix for assembled transcripts. Default: `transcripts`.
    pub transcript_prefix: String,

    /// Deadline for a whole run, in seconds. Default: none.
    pub ingest_timeout_secs: Option<u64>,

    /// Provider name (e.g. "openai", "anthropic"). `None` auto-detects.
    pub provider_name: Option<String>,

    /// Vision models used for extraction, rotated per call.
    pub extraction_models: Vec<String>,

    /// Text model used for verification. `None` reuses the first
    /// extraction model.
    pub verification_model: Option<String>,

    /// Pre-built extraction clients. Take precedence over `extraction_models`.
    pub extraction_clients: Vec<Arc<dyn ModelClient>>,

    /// Pre-built verification client. Takes precedence over
    /// `verification_model`.
    pub verification_client: Option<Arc<dyn ModelClient>>,
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            temperature: 0.0,
            max_tokens: 4096,
            max_attempts: 5,
            retry_pause_ms: 500,
            rate_limit_backoff_ms: 2000,
            max_rate_limit_waits: 10,
            download_timeout_secs: 60,
            probe_timeout_secs: 15,
            docsend_converter_url: DEFAULT_DOCSEND_CONVERTER_URL.to_string(),
            docsend_email: None,
            docsend_passcode: None,
            drive_download_base: DEFAULT_DRIVE_DOWNLOAD_BASE.to_string(),
            drive_api_base: DEFAULT_DRIVE_API_BASE.to_string(),
            drive_service_token: None,
            pdfium_lib_path: None,
            pdf_prefix: "pitch-decks".to_string(),
            transcript_prefix: "transcripts".to_string(),
            ingest_timeout_secs: None,
            provider_name: None,
            extraction_models: Vec::new(),
            verification_model: None,
            extraction_clients: Vec::new(),
            verification_client: None,
        }
    }
}

impl fmt::Debug for IngestionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngestionConfig")
            .field("concurrency", &self.concurrency)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_attempts", &self.max_attempts)
            .field("retry_pause_ms", &self.retry_pause_ms)
            .field("rate_limit_backoff_ms", &self.rate_limit_backoff_ms)
            .field("download_timeout_secs", &self.download_timeout_secs)
            .field("docsend_converter_url", &self.docsend_converter_url)
            .field("drive_download_base", &self.drive_download_base)
            .field("drive_api_base", &self.drive_api_base)
            .field(
                "drive_service_token",
                &self.drive_service_token.as_ref().map(|_| "<redacted>"),
            )
            .field("pdf_prefix", &self.pdf_prefix)
            .field("transcript_prefix", &self.transcript_prefix)
            .field("ingest_timeout_secs", &self.ingest_timeout_secs)
            .field("provider_name", &self.provider_name)
            .field("extraction_models", &self.extraction_models)
            .field("verification_model", &self.verification_model)
            .field("extraction_clients", &self.extraction_clients.len())
            .field(
                "verification_client",
                &self.verification_client.as_ref().map(|_| "<dyn ModelClient>"),
            )
            .finish()
    }
}

impl IngestionConfig {
    pub fn builder() -> IngestionConfigBuilder {
        IngestionConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`IngestionConfig`].
#[derive(Debug)]
pub struct IngestionConfigBuilder {
    config: IngestionConfig,
}

impl IngestionConfigBuilder {
    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.max_attempts = n.max(1);
        self
    }

    pub fn retry_pause_ms(mut self, ms: u64) -> Self {
        self.config.retry_pause_ms = ms;
        self
    }

    pub fn rate_limit_backoff_ms(mut self, ms: u64) -> Self {
        self.config.rate_limit_backoff_ms = ms;
        self
    }

    pub fn max_rate_limit_waits(mut self, n: u32) -> Self {
        self.config.max_rate_limit_waits = n;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn probe_timeout_secs(mut self, secs: u64) -> Self {
        self.config.probe_timeout_secs = secs;
        self
    }

    pub fn docsend_converter_url(mut self, url: impl Into<String>) -> Self {
        self.config.docsend_converter_url = url.into();
        self
    }

    pub fn docsend_email(mut self, email: impl Into<String>) -> Self {
        self.config.docsend_email = Some(email.into());
        self
    }

    pub fn docsend_passcode(mut self, passcode: impl Into<String>) -> Self {
        self.config.docsend_passcode = Some(passcode.into());
        self
    }

    pub fn drive_download_base(mut self, url: impl Into<String>) -> Self {
        self.config.drive_download_base = url.into();
        self
    }

    pub fn drive_api_base(mut self, url: impl Into<String>) -> Self {
        self.config.drive_api_base = url.into();
        self
    }

    pub fn drive_service_token(mut self, token: impl Into<String>) -> Self {
        self.config.drive_service_token = Some(token.into());
        self
    }

    pub fn pdfium_lib_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.pdfium_lib_path = Some(path.into());
        self
    }

    pub fn pdf_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.pdf_prefix = prefix.into();
        self
    }

    pub fn transcript_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.transcript_prefix = prefix.into();
        self
    }

    pub fn ingest_timeout_secs(mut self, secs: u64) -> Self {
        self.config.ingest_timeout_secs = Some(secs);
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    /// Add a vision model to the extraction rotation.
    pub fn extraction_model(mut self, model: impl Into<String>) -> Self {
        self.config.extraction_models.push(model.into());
        self
    }

    pub fn verification_model(mut self, model: impl Into<String>) -> Self {
        self.config.verification_model = Some(model.into());
        self
    }

    /// Add a pre-built client to the extraction rotation.
    pub fn extraction_client(mut self, client: Arc<dyn ModelClient>) -> Self {
        self.config.extraction_clients.push(client);
        self
    }

    pub fn verification_client(mut self, client: Arc<dyn ModelClient>) -> Self {
        self.config.verification_client = Some(client);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<IngestionConfig, IngestError> {
        let c = &self.config;
        if c.concurrency == 0 {
            return Err(IngestError::InvalidConfig("Concurrency must be ≥ 1".into()));
        }
        if c.max_tokens == 0 {
            return Err(IngestError::InvalidConfig("max_tokens must be ≥ 1".into()));
        }
        if c.download_timeout_secs == 0 {
            return Err(IngestError::InvalidConfig(
                "download_timeout_secs must be ≥ 1".into(),
            ));
        }
        if c.pdf_prefix.trim_matches('/').is_empty() || c.transcript_prefix.trim_matches('/').is_empty()
        {
            return Err(IngestError::InvalidConfig(
                "storage prefixes must not be empty".into(),
            ));
        }
        if c.pdf_prefix == c.transcript_prefix {
            return Err(IngestError::InvalidConfig(format!(
                "pdf_prefix and transcript_prefix must differ (both '{}')",
                c.pdf_prefix
            )));
        }
        Ok(self.config)
    }
}
