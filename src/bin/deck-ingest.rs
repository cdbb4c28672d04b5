//! CLI binary for deck-ingest.
//!
//! A thin shim over the library: maps flags to `IngestionConfig`, wires the
//! filesystem storage and JSON record store, runs one ingestion, and prints
//! the outcome.

use anyhow::{Context, Result};
use clap::Parser;
use deck_ingest::{
    FilesystemObjectStorage, IngestionConfig, IngestionFlow, IngestionOutcome,
    IngestionProgressCallback, IngestionRequest, IngestionStatus, JsonFileRecordStore,
    PdfSource, ProgressCallback, Stage,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── Progress bar ─────────────────────────────────────────────────────────────

/// Spinner while fetching and rendering, bar while pages are transcribed.
struct CliProgress {
    bar: ProgressBar,
    degraded: AtomicUsize,
}

impl CliProgress {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(TICKS),
        );
        bar.set_prefix("Starting");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            degraded: AtomicUsize::new(0),
        })
    }
}

impl IngestionProgressCallback for CliProgress {
    fn on_stage(&self, company_id: &str, stage: Stage) {
        self.bar.set_prefix(match stage {
            Stage::Received => "Received",
            Stage::Fetching => "Fetching",
            Stage::Storing => "Storing",
            Stage::Rasterizing => "Rendering",
            Stage::Transcribing => "Transcribing",
        });
        self.bar.set_message(company_id.to_string());
    }

    fn on_transcription_start(&self, total_pages: usize) {
        self.bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} {prefix:.bold}  \
                 [{bar:42.green/238}] {pos:>3}/{len} pages  \
                 ⏱ {elapsed_precise}  ETA {eta_precise}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  ")
            .tick_strings(TICKS),
        );
        self.bar.set_length(total_pages as u64);
        self.bar.reset_eta();
    }

    fn on_page_complete(&self, page: usize, total: usize, text_len: usize, degraded: bool) {
        let mark = if degraded {
            self.degraded.fetch_add(1, Ordering::SeqCst);
            yellow("⚠")
        } else {
            green("✓")
        };
        self.bar.println(format!(
            "  {mark} Page {page:>3}/{total:<3}  {}{}",
            dim(&format!("{text_len:>5} chars")),
            if degraded { dim("  (longest attempt)") } else { String::new() },
        ));
        self.bar.inc(1);
    }

    fn on_ingestion_complete(&self, outcome: &IngestionOutcome) {
        self.bar.finish_and_clear();
        match outcome.status {
            IngestionStatus::Success => eprintln!(
                "{} {} pages transcribed for {}{}",
                green("✔"),
                bold(&outcome.page_count.to_string()),
                bold(&outcome.company_id),
                match self.degraded.load(Ordering::SeqCst) {
                    0 => String::new(),
                    n => format!("  ({} degraded)", yellow(&n.to_string())),
                }
            ),
            IngestionStatus::Failed => eprintln!(
                "{} ingestion failed for {}: {}",
                red("✘"),
                bold(&outcome.company_id),
                outcome.error_message.as_deref().unwrap_or("unknown error")
            ),
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # DocSend link, falling back to a direct PDF
  deck-ingest --company-id acme \
      --source https://docsend.com/view/abc123 \
      --source pdf:https://acme.com/deck.pdf

  # Previously uploaded object
  deck-ingest --company-id acme --source object:uploads/acme/deck.pdf

  # Print the transcript and the outcome as JSON
  deck-ingest --company-id acme --source https://acme.com/deck.pdf \
      --print-transcript --json

SOURCES:
  pdf:<url>                 link that serves the PDF directly
  url:<url> or bare <url>   share link (DocSend, Google Drive, or generic page)
  object:<bucket>/<key>     object under --storage-dir

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY            OpenAI API key
  ANTHROPIC_API_KEY         Anthropic API key
  GEMINI_API_KEY            Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER    Provider override (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL           Default model ID
  PDFIUM_LIB_PATH           libpdfium file or directory (default: system library)
  DECK_INGEST_*             every flag below, e.g. DECK_INGEST_STORAGE_DIR
"#;

/// Fetch a pitch deck, transcribe every slide, and record the result.
#[derive(Parser, Debug)]
#[command(
    name = "deck-ingest",
    version,
    about = "Fetch a pitch-deck PDF, transcribe every page with a vision model, and record the outcome",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Company identifier ([A-Za-z0-9_-]); names the stored PDF, transcript and record.
    #[arg(long, env = "DECK_INGEST_COMPANY_ID")]
    company_id: String,

    /// Human-readable company name for logs and the record.
    #[arg(long, env = "DECK_INGEST_COMPANY_NAME")]
    company_name: Option<String>,

    /// PDF source, in priority order. Repeat for fallbacks.
    #[arg(long = "source", required = true, value_name = "SOURCE")]
    sources: Vec<PdfSource>,

    /// Root directory for stored PDFs and transcripts.
    #[arg(long, env = "DECK_INGEST_STORAGE_DIR", default_value = "deck-store")]
    storage_dir: PathBuf,

    /// Directory holding one JSON record per company.
    #[arg(long, env = "DECK_INGEST_RECORDS_DIR", default_value = "deck-records")]
    records_dir: PathBuf,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_LLM_PROVIDER")]
    provider: Option<String>,

    /// Extraction model. Repeat to rotate calls across several models.
    #[arg(long = "model", env = "DECK_INGEST_MODELS", value_delimiter = ',')]
    models: Vec<String>,

    /// Verification model (default: the first extraction model).
    #[arg(long, env = "DECK_INGEST_VERIFICATION_MODEL")]
    verification_model: Option<String>,

    /// Pages transcribed concurrently (default: available parallelism).
    #[arg(short, long, env = "DECK_INGEST_CONCURRENCY")]
    concurrency: Option<usize>,

    /// Extraction attempts per page before degrading to the longest attempt.
    #[arg(long, env = "DECK_INGEST_MAX_ATTEMPTS", default_value_t = 5)]
    max_attempts: u32,

    /// Max output tokens per model call.
    #[arg(long, env = "DECK_INGEST_MAX_TOKENS", default_value_t = 4096)]
    max_tokens: usize,

    /// Per-download timeout in seconds.
    #[arg(long, env = "DECK_INGEST_DOWNLOAD_TIMEOUT", default_value_t = 60)]
    download_timeout: u64,

    /// Deadline for the whole run in seconds.
    #[arg(long, env = "DECK_INGEST_TIMEOUT")]
    timeout: Option<u64>,

    /// Share-link converter endpoint for DocSend links.
    #[arg(long, env = "DECK_INGEST_DOCSEND_CONVERTER_URL")]
    docsend_converter_url: Option<String>,

    /// Email to submit to email-gated DocSend links.
    #[arg(long, env = "DECK_INGEST_DOCSEND_EMAIL")]
    docsend_email: Option<String>,

    /// Passcode to submit to passcode-gated DocSend links.
    #[arg(long, env = "DECK_INGEST_DOCSEND_PASSCODE", hide_env_values = true)]
    docsend_passcode: Option<String>,

    /// Bearer token for the authenticated Google Drive fallback.
    #[arg(long, env = "DECK_INGEST_DRIVE_TOKEN", hide_env_values = true)]
    drive_token: Option<String>,

    /// libpdfium file or directory.
    #[arg(long, env = "PDFIUM_LIB_PATH")]
    pdfium_lib_path: Option<PathBuf>,

    /// Storage prefix for canonical PDFs.
    #[arg(long, env = "DECK_INGEST_PDF_PREFIX", default_value = "pitch-decks")]
    pdf_prefix: String,

    /// Storage prefix for transcripts.
    #[arg(long, env = "DECK_INGEST_TRANSCRIPT_PREFIX", default_value = "transcripts")]
    transcript_prefix: String,

    /// Print the assembled transcript to stdout.
    #[arg(long)]
    print_transcript: bool,

    /// Print the outcome as JSON to stdout.
    #[arg(long, env = "DECK_INGEST_JSON")]
    json: bool,

    /// Disable the progress bar.
    #[arg(long, env = "DECK_INGEST_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level logs.
    #[arg(short, long, env = "DECK_INGEST_VERBOSE")]
    verbose: bool,

    /// Suppress everything but errors.
    #[arg(short, long, env = "DECK_INGEST_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let config = build_config(&cli)?;
    let storage = Arc::new(FilesystemObjectStorage::new(&cli.storage_dir));
    let records = Arc::new(JsonFileRecordStore::new(&cli.records_dir));

    let mut flow = IngestionFlow::new(config, storage, records)
        .context("Failed to set up the ingestion flow")?;
    if show_progress {
        flow = flow.with_progress(CliProgress::new() as ProgressCallback);
    }

    let mut request = IngestionRequest::new(cli.company_id.clone(), cli.sources.clone());
    if let Some(name) = &cli.company_name {
        request = request.with_company_name(name.clone());
    }

    let report = flow
        .run(&request)
        .await
        .with_context(|| format!("Ingestion failed for '{}'", cli.company_id))?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    if cli.print_transcript {
        write_transcript(&mut out, &report.transcript.text())?;
    }
    if cli.json {
        let json = serde_json::to_string_pretty(&report.outcome)
            .context("Failed to serialise outcome")?;
        writeln!(out, "{json}").context("Failed to write outcome")?;
    } else if !cli.quiet && !show_progress {
        let o = &report.outcome;
        eprintln!(
            "{} {}: {} pages, {} chars, {} degraded  →  {}",
            green("✔"),
            o.company_id,
            o.page_count,
            o.extracted_text_length.unwrap_or(0),
            o.degraded_page_count,
            o.transcript_location.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

/// Write `text` followed by a newline if it lacks one.
fn write_transcript(out: &mut impl Write, text: &str) -> Result<()> {
    out.write_all(text.as_bytes())
        .context("Failed to write transcript to stdout")?;
    if !text.ends_with('\n') {
        out.write_all(b"\n")
            .context("Failed to write transcript to stdout")?;
    }
    Ok(())
}

/// Map CLI args to `IngestionConfig`.
fn build_config(cli: &Cli) -> Result<IngestionConfig> {
    let mut builder = IngestionConfig::builder()
        .max_attempts(cli.max_attempts)
        .max_tokens(cli.max_tokens)
        .download_timeout_secs(cli.download_timeout)
        .pdf_prefix(cli.pdf_prefix.clone())
        .transcript_prefix(cli.transcript_prefix.clone());

    if let Some(n) = cli.concurrency {
        builder = builder.concurrency(n);
    }
    if let Some(secs) = cli.timeout {
        builder = builder.ingest_timeout_secs(secs);
    }
    if let Some(p) = &cli.provider {
        builder = builder.provider_name(p.clone());
    }
    for m in &cli.models {
        builder = builder.extraction_model(m.clone());
    }
    if let Some(m) = &cli.verification_model {
        builder = builder.verification_model(m.clone());
    }
    if let Some(url) = &cli.docsend_converter_url {
        builder = builder.docsend_converter_url(url.clone());
    }
    if let Some(email) = &cli.docsend_email {
        builder = builder.docsend_email(email.clone());
    }
    if let Some(code) = &cli.docsend_passcode {
        builder = builder.docsend_passcode(code.clone());
    }
    if let Some(token) = &cli.drive_token {
        builder = builder.drive_service_token(token.clone());
    }
    if let Some(path) = &cli.pdfium_lib_path {
        builder = builder.pdfium_lib_path(path.clone());
    }

    builder.build().context("Invalid configuration")
}
