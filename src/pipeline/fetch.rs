//! Source fetching: turn a [`PdfSource`] into raw PDF bytes.
//!
//! Four strategies, chosen from the source kind and, for generic links,
//! the link's host:
//!
//! | Source                         | Strategy                                     |
//! |--------------------------------|----------------------------------------------|
//! | `Url` on `docsend.com`         | POST the link to the share-link converter    |
//! | `Url` on Google Drive / Docs   | public download, then authenticated API      |
//! | other `Url`                    | HEAD probe; PDFs continue as direct downloads|
//! | `DirectPdfUrl`                 | GET with redirects and a timeout             |
//! | `StoredObject`                 | read from [`ObjectStorage`]                  |
//!
//! Every payload is sniffed for the `%PDF-` header before it is accepted.
//! Content-type headers are advisory only: Drive serves some PDFs as
//! `text/html`, and a login page can arrive as `application/octet-stream`.
//!
//! [`SourceFetcher::fetch_first`] walks a source list in priority order and
//! returns the first document. Failed sources are not retried.

use crate::config::IngestionConfig;
use crate::error::{IngestError, SourceError};
use crate::output::PdfSource;
use crate::storage::{ObjectStorage, StorageError};
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Response, StatusCode, Url};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// How a generic `Url` source is handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkKind {
    DocSend,
    Drive { file_id: String },
    Generic,
}

/// Classify a share link by host.
pub fn classify_link(url: &str) -> Result<LinkKind, SourceError> {
    let parsed = Url::parse(url).map_err(|e| SourceError::InvalidLink {
        url: url.to_string(),
        detail: e.to_string(),
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(SourceError::InvalidLink {
            url: url.to_string(),
            detail: format!("unsupported scheme '{}'", parsed.scheme()),
        });
    }
    let host = parsed.host_str().unwrap_or_default().to_ascii_lowercase();

    if host == "docsend.com" || host.ends_with(".docsend.com") {
        return Ok(LinkKind::DocSend);
    }
    if host == "drive.google.com" || host == "docs.google.com" {
        return match drive_file_id(&parsed) {
            Some(file_id) => Ok(LinkKind::Drive { file_id }),
            None => Err(SourceError::InvalidLink {
                url: url.to_string(),
                detail: "no Drive file id in link".into(),
            }),
        };
    }
    Ok(LinkKind::Generic)
}

/// Extract the file id from `/file/d/{id}/…`, `/presentation/d/{id}/…`
/// or `?id={id}`.
fn drive_file_id(url: &Url) -> Option<String> {
    if let Some(segments) = url.path_segments() {
        let segments: Vec<&str> = segments.collect();
        if let Some(pos) = segments.iter().position(|s| *s == "d") {
            if let Some(id) = segments.get(pos + 1).filter(|s| !s.is_empty()) {
                return Some((*id).to_string());
            }
        }
    }
    url.query_pairs()
        .find(|(k, v)| k == "id" && !v.is_empty())
        .map(|(_, v)| v.into_owned())
}

/// `true` when `bytes` carry a PDF header, ignoring a UTF-8 BOM and leading
/// whitespace.
pub fn looks_like_pdf(bytes: &[u8]) -> bool {
    let body = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let start = body
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(body.len());
    body[start..].starts_with(b"%PDF-")
}

fn content_type(response: &Response) -> String {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase()
}

fn retry_after_secs(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn first_bytes(bytes: &[u8]) -> String {
    let n = bytes.len().min(16);
    format!("{:?}", String::from_utf8_lossy(&bytes[..n]))
}

/// A successfully fetched document and the source that produced it.
#[derive(Debug, Clone)]
pub struct FetchedPdf {
    pub source: PdfSource,
    /// Index of `source` in the list passed to `fetch_first`.
    pub source_index: usize,
    pub bytes: Vec<u8>,
}

#[derive(Serialize)]
struct ConverterRequest<'a> {
    url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    passcode: Option<&'a str>,
}

/// Resolves [`PdfSource`]s into PDF bytes.
pub struct SourceFetcher {
    client: reqwest::Client,
    storage: Arc<dyn ObjectStorage>,
    download_timeout: Duration,
    probe_timeout: Duration,
    docsend_converter_url: String,
    docsend_email: Option<String>,
    docsend_passcode: Option<String>,
    drive_download_base: String,
    drive_api_base: String,
    drive_service_token: Option<String>,
}

impl SourceFetcher {
    pub fn new(config: &IngestionConfig, storage: Arc<dyn ObjectStorage>) -> Result<Self, IngestError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .user_agent(concat!("deck-ingest/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| IngestError::Internal(format!("HTTP client: {e}")))?;

        Ok(Self {
            client,
            storage,
            download_timeout: Duration::from_secs(config.download_timeout_secs),
            probe_timeout: Duration::from_secs(config.probe_timeout_secs),
            docsend_converter_url: config.docsend_converter_url.clone(),
            docsend_email: config.docsend_email.clone(),
            docsend_passcode: config.docsend_passcode.clone(),
            drive_download_base: config.drive_download_base.clone(),
            drive_api_base: config.drive_api_base.trim_end_matches('/').to_string(),
            drive_service_token: config.drive_service_token.clone(),
        })
    }

    /// Try each source in order; the first one that yields a PDF wins.
    pub async fn fetch_first(&self, sources: &[PdfSource]) -> Result<FetchedPdf, IngestError> {
        let mut attempts = Vec::with_capacity(sources.len());
        for (idx, source) in sources.iter().enumerate() {
            match self.fetch(source).await {
                Ok(bytes) => {
                    info!(source = %source, bytes = bytes.len(), "PDF fetched");
                    return Ok(FetchedPdf {
                        source: source.clone(),
                        source_index: idx,
                        bytes,
                    });
                }
                Err(e) => {
                    if let SourceError::RateLimited {
                        retry_after_secs: Some(secs),
                        ..
                    } = &e
                    {
                        warn!(source = %source, retry_after_secs = secs, "source rate limited; back off before resubmitting");
                    }
                    warn!(source = %source, error = %e, "source failed, trying next");
                    attempts.push(e);
                }
            }
        }
        Err(IngestError::SourceUnavailable { attempts })
    }

    /// Fetch one source.
    #[instrument(skip(self, source), fields(source = %source))]
    pub async fn fetch(&self, source: &PdfSource) -> Result<Vec<u8>, SourceError> {
        match source {
            PdfSource::DirectPdfUrl { url } => self.fetch_direct(url).await,
            PdfSource::StoredObject { bucket, key } => self.fetch_stored(bucket, key).await,
            PdfSource::Url { url } => match classify_link(url)? {
                LinkKind::DocSend => self.fetch_docsend(url).await,
                LinkKind::Drive { file_id } => self.fetch_drive(url, &file_id).await,
                LinkKind::Generic => {
                    self.probe_generic(url).await?;
                    self.fetch_direct(url).await
                }
            },
        }
    }

    // ── Direct ───────────────────────────────────────────────────────────

    async fn fetch_direct(&self, url: &str) -> Result<Vec<u8>, SourceError> {
        let failed = |detail: String| SourceError::DownloadFailed {
            url: url.to_string(),
            detail,
        };

        let response = self
            .client
            .get(url)
            .timeout(self.download_timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    failed(format!("timed out after {}s", self.download_timeout.as_secs()))
                } else {
                    failed(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(failed(format!("HTTP {}", response.status())));
        }

        let bytes = response.bytes().await.map_err(|e| failed(e.to_string()))?;
        if !looks_like_pdf(&bytes) {
            return Err(SourceError::NotAPdf {
                url: url.to_string(),
                detail: format!("body starts with {}", first_bytes(&bytes)),
            });
        }
        debug!(url, bytes = bytes.len(), "direct download complete");
        Ok(bytes.to_vec())
    }

    // ── Generic link probe ───────────────────────────────────────────────

    /// Accept the link when the HEAD response or the file name says PDF.
    async fn probe_generic(&self, url: &str) -> Result<(), SourceError> {
        let path_says_pdf = Url::parse(url)
            .map(|u| u.path().to_ascii_lowercase().ends_with(".pdf"))
            .unwrap_or(false);

        let response = match self.client.head(url).timeout(self.probe_timeout).send().await {
            Ok(r) => r,
            Err(e) if path_says_pdf => {
                debug!(url, error = %e, "HEAD failed, trusting .pdf extension");
                return Ok(());
            }
            Err(e) if e.is_timeout() => {
                return Err(SourceError::DownloadTimedOut {
                    url: url.to_string(),
                    secs: self.probe_timeout.as_secs(),
                })
            }
            Err(e) => {
                return Err(SourceError::DownloadFailed {
                    url: url.to_string(),
                    detail: e.to_string(),
                })
            }
        };

        let ctype = content_type(&response);
        let disposition_says_pdf = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_ascii_lowercase().contains(".pdf"))
            .unwrap_or(false);

        if ctype.contains("application/pdf") || disposition_says_pdf || path_says_pdf {
            return Ok(());
        }
        Err(SourceError::NotAPdf {
            url: url.to_string(),
            detail: format!(
                "HEAD returned {} with content-type '{}'",
                response.status(),
                ctype
            ),
        })
    }

    // ── DocSend ──────────────────────────────────────────────────────────

    async fn fetch_docsend(&self, url: &str) -> Result<Vec<u8>, SourceError> {
        let body = ConverterRequest {
            url,
            email: self.docsend_email.as_deref(),
            passcode: self.docsend_passcode.as_deref(),
        };

        let response = self
            .client
            .post(&self.docsend_converter_url)
            .timeout(self.download_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(url, e))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(SourceError::RateLimited {
                url: url.to_string(),
                retry_after_secs: retry_after_secs(&response),
            });
        }
        if status == StatusCode::BAD_REQUEST {
            let detail = response.text().await.unwrap_or_default();
            return Err(SourceError::InvalidLink {
                url: url.to_string(),
                detail: detail.chars().take(200).collect(),
            });
        }
        if !status.is_success() {
            return Err(SourceError::DownloadFailed {
                url: url.to_string(),
                detail: format!("converter returned HTTP {status}"),
            });
        }

        if !content_type(&response).contains("application/pdf") {
            return Err(SourceError::PasswordProtectedOrExpired {
                url: url.to_string(),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| self.transport_error(url, e))?;
        if !looks_like_pdf(&bytes) {
            return Err(SourceError::NotAPdf {
                url: url.to_string(),
                detail: format!("converter body starts with {}", first_bytes(&bytes)),
            });
        }
        Ok(bytes.to_vec())
    }

    fn transport_error(&self, url: &str, e: reqwest::Error) -> SourceError {
        if e.is_timeout() {
            SourceError::DownloadTimedOut {
                url: url.to_string(),
                secs: self.download_timeout.as_secs(),
            }
        } else {
            SourceError::DownloadFailed {
                url: url.to_string(),
                detail: e.to_string(),
            }
        }
    }

    // ── Google Drive ─────────────────────────────────────────────────────

    async fn fetch_drive(&self, url: &str, file_id: &str) -> Result<Vec<u8>, SourceError> {
        let public_reason = match self.drive_public(file_id).await {
            Ok(bytes) => return Ok(bytes),
            Err(reason) => reason,
        };
        debug!(url, file_id, reason = %public_reason, "public Drive download unusable");

        let Some(token) = self.drive_service_token.as_deref() else {
            return Err(SourceError::AccessDenied {
                url: url.to_string(),
                detail: format!("{public_reason}; no Drive service credential configured"),
            });
        };

        info!(file_id, "falling back to authenticated Drive download");
        let api_url = Url::parse_with_params(
            &format!("{}/files/{}", self.drive_api_base, file_id),
            &[("alt", "media")],
        )
        .map_err(|e| SourceError::AccessDenied {
            url: url.to_string(),
            detail: format!("bad Drive API base: {e}"),
        })?;
        let response = self
            .client
            .get(api_url)
            .bearer_auth(token)
            .timeout(self.download_timeout)
            .send()
            .await
            .map_err(|e| self.transport_error(url, e))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(SourceError::RateLimited {
                url: url.to_string(),
                retry_after_secs: retry_after_secs(&response),
            });
        }
        if !status.is_success() {
            return Err(SourceError::AccessDenied {
                url: url.to_string(),
                detail: format!("{public_reason}; Drive API returned HTTP {status}"),
            });
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| self.transport_error(url, e))?;
        if !looks_like_pdf(&bytes) {
            return Err(SourceError::NotAPdf {
                url: url.to_string(),
                detail: format!("Drive file starts with {}", first_bytes(&bytes)),
            });
        }
        Ok(bytes.to_vec())
    }

    /// Unauthenticated download. `Err` carries why it was not usable.
    async fn drive_public(&self, file_id: &str) -> Result<Vec<u8>, String> {
        let download_url = Url::parse_with_params(
            &self.drive_download_base,
            &[("export", "download"), ("id", file_id)],
        )
        .map_err(|e| format!("bad Drive download base: {e}"))?;

        let response = self
            .client
            .get(download_url)
            .timeout(self.download_timeout)
            .send()
            .await
            .map_err(|e| format!("public download failed: {e}"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("public download returned HTTP {status}"));
        }
        let ctype = content_type(&response);
        let bytes = response
            .bytes()
            .await
            .map_err(|e| format!("public download body: {e}"))?;

        if looks_like_pdf(&bytes) {
            if ctype.contains("text/html") {
                debug!(file_id, "Drive served a PDF as text/html; accepting by header sniff");
            }
            return Ok(bytes.to_vec());
        }
        Err(format!(
            "public download returned '{ctype}' instead of a PDF (permission or login page)"
        ))
    }

    // ── Stored objects ───────────────────────────────────────────────────

    async fn fetch_stored(&self, bucket: &str, key: &str) -> Result<Vec<u8>, SourceError> {
        let path = format!("{}/{}", bucket.trim_matches('/'), key.trim_start_matches('/'));
        let bytes = self.storage.get(&path).await.map_err(|e| SourceError::ObjectMissing {
            bucket: bucket.to_string(),
            key: key.to_string(),
            detail: match e {
                StorageError::NotFound(_) => "not found".to_string(),
                other => other.to_string(),
            },
        })?;
        if !looks_like_pdf(&bytes) {
            return Err(SourceError::NotAPdf {
                url: path,
                detail: format!("object starts with {}", first_bytes(&bytes)),
            });
        }
        Ok(bytes)
    }
}
