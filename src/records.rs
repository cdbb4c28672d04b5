//! Company record store.
//!
//! One document per company, upserted by company id. The ingestion flow is
//! the only writer of the processing fields, so a read-then-write upsert is
//! sufficient; no multi-document transactions are involved.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

#[derive(Debug, Error)]
pub enum RecordStoreError {
    #[error("Record store I/O error for '{company_id}': {source}")]
    Io {
        company_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Record for '{company_id}' is not valid JSON: {source}")]
    Corrupt {
        company_id: String,
        #[source]
        source: serde_json::Error,
    },
}

pub type RecordResult<T> = Result<T, RecordStoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Processing,
    Success,
    Failed,
}

/// Stored state of one company's deck ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompanyRecord {
    pub company_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_name: Option<String>,
    pub status: ProcessingStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_text_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded_page_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// How an update treats the `lastError` annotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorAnnotation {
    Set(String),
    Clear,
}

/// Partial update; `None` fields keep their stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordUpdate {
    pub company_name: Option<String>,
    pub status: Option<ProcessingStatus>,
    pub pdf_location: Option<String>,
    pub transcript_location: Option<String>,
    pub extracted_text_length: Option<usize>,
    pub degraded_page_count: Option<usize>,
    pub last_error: Option<ErrorAnnotation>,
    /// Drop the transcript location, text length and degraded count left by
    /// an earlier run. Applied before the fields above.
    pub clear_results: bool,
}

impl RecordUpdate {
    pub fn status(status: ProcessingStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn company_name(mut self, name: Option<&str>) -> Self {
        self.company_name = name.map(str::to_string);
        self
    }

    pub fn clearing_results(mut self) -> Self {
        self.clear_results = true;
        self
    }

    /// Apply onto an existing record, or create one.
    pub fn apply(self, company_id: &str, existing: Option<CompanyRecord>, now: DateTime<Utc>) -> CompanyRecord {
        let mut record = existing.unwrap_or_else(|| CompanyRecord {
            company_id: company_id.to_string(),
            company_name: None,
            status: ProcessingStatus::Processing,
            pdf_location: None,
            transcript_location: None,
            extracted_text_length: None,
            degraded_page_count: None,
            last_error: None,
            updated_at: now,
        });

        if self.clear_results {
            record.transcript_location = None;
            record.extracted_text_length = None;
            record.degraded_page_count = None;
        }
        if let Some(name) = self.company_name {
            record.company_name = Some(name);
        }
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(loc) = self.pdf_location {
            record.pdf_location = Some(loc);
        }
        if let Some(loc) = self.transcript_location {
            record.transcript_location = Some(loc);
        }
        if let Some(len) = self.extracted_text_length {
            record.extracted_text_length = Some(len);
        }
        if let Some(n) = self.degraded_page_count {
            record.degraded_page_count = Some(n);
        }
        match self.last_error {
            Some(ErrorAnnotation::Set(msg)) => record.last_error = Some(msg),
            Some(ErrorAnnotation::Clear) => record.last_error = None,
            None => {}
        }
        record.updated_at = now;
        record
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Merge `update` into the record for `company_id`, creating it if absent.
    async fn upsert(&self, company_id: &str, update: RecordUpdate) -> RecordResult<CompanyRecord>;

    async fn get(&self, company_id: &str) -> RecordResult<Option<CompanyRecord>>;
}

// ── In-memory ────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: RwLock<HashMap<String, CompanyRecord>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn upsert(&self, company_id: &str, update: RecordUpdate) -> RecordResult<CompanyRecord> {
        let mut records = self.records.write().await;
        let existing = records.remove(company_id);
        let record = update.apply(company_id, existing, Utc::now());
        records.insert(company_id.to_string(), record.clone());
        Ok(record)
    }

    async fn get(&self, company_id: &str) -> RecordResult<Option<CompanyRecord>> {
        Ok(self.records.read().await.get(company_id).cloned())
    }
}

// ── JSON files ───────────────────────────────────────────────────────────

/// One pretty-printed `{company_id}.json` per company under a directory.
///
/// Company ids are validated by the flow before they reach a store, so they
/// are safe to use as file names.
#[derive(Debug)]
pub struct JsonFileRecordStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileRecordStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn record_path(&self, company_id: &str) -> PathBuf {
        self.dir.join(format!("{company_id}.json"))
    }

    async fn read(&self, company_id: &str) -> RecordResult<Option<CompanyRecord>> {
        let path = self.record_path(company_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|source| RecordStoreError::Corrupt {
                    company_id: company_id.to_string(),
                    source,
                }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(RecordStoreError::Io {
                company_id: company_id.to_string(),
                source,
            }),
        }
    }
}

#[async_trait]
impl RecordStore for JsonFileRecordStore {
    async fn upsert(&self, company_id: &str, update: RecordUpdate) -> RecordResult<CompanyRecord> {
        let _guard = self.write_lock.lock().await;
        let io = |source: std::io::Error| RecordStoreError::Io {
            company_id: company_id.to_string(),
            source,
        };

        let existing = self.read(company_id).await?;
        let record = update.apply(company_id, existing, Utc::now());

        let json = serde_json::to_vec_pretty(&record).map_err(|source| RecordStoreError::Corrupt {
            company_id: company_id.to_string(),
            source,
        })?;
        tokio::fs::create_dir_all(&self.dir).await.map_err(io)?;
        let path = self.record_path(company_id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await.map_err(io)?;
        tokio::fs::rename(&tmp, &path).await.map_err(io)?;

        debug!(company_id, status = ?record.status, "record upserted");
        Ok(record)
    }

    async fn get(&self, company_id: &str) -> RecordResult<Option<CompanyRecord>> {
        self.read(company_id).await
    }
}
