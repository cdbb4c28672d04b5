//! Durable object storage for canonical PDFs and transcripts.
//!
//! [`ObjectStorage`] is a two-call interface (`put`/`get`) keyed by a
//! slash-separated path. Two backends ship with the crate:
//!
//! - [`FilesystemObjectStorage`]: files under a root directory, written via
//!   temp file + rename so readers never observe a partial object.
//! - [`InMemoryObjectStorage`]: a map, for tests and dry runs.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Invalid object path '{0}'")]
    InvalidPath(String),

    #[error("Storage I/O error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Acknowledgement of a successful `put`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    /// Backend-specific location (file path, `memory://…`).
    pub location: String,
    pub size: usize,
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Store `bytes` at `path`, replacing any existing object.
    async fn put(&self, path: &str, bytes: &[u8], content_type: &str) -> StorageResult<StoredObject>;

    /// Read the object at `path`.
    async fn get(&self, path: &str) -> StorageResult<Vec<u8>>;

    fn backend_name(&self) -> &'static str;
}

/// Reject empty, absolute, or parent-traversing object paths.
fn validate_path(path: &str) -> StorageResult<()> {
    let p = Path::new(path);
    let ok = !path.is_empty()
        && p.components()
            .all(|c| matches!(c, Component::Normal(_)));
    if ok {
        Ok(())
    } else {
        Err(StorageError::InvalidPath(path.to_string()))
    }
}

// ── Filesystem ───────────────────────────────────────────────────────────

/// Stores objects as `{root}/{path}`.
#[derive(Debug, Clone)]
pub struct FilesystemObjectStorage {
    root: PathBuf,
}

impl FilesystemObjectStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, path: &str) -> StorageResult<PathBuf> {
        validate_path(path)?;
        Ok(self.root.join(path))
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[async_trait]
impl ObjectStorage for FilesystemObjectStorage {
    #[instrument(skip(self, bytes), fields(size = bytes.len()))]
    async fn put(&self, path: &str, bytes: &[u8], content_type: &str) -> StorageResult<StoredObject> {
        let target = self.object_path(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err(parent))?;
        }

        let mut tmp = target.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, bytes).await.map_err(io_err(&tmp))?;
        tokio::fs::rename(&tmp, &target).await.map_err(io_err(&target))?;

        info!(path = %target.display(), content_type, "object stored");
        Ok(StoredObject {
            location: target.display().to_string(),
            size: bytes.len(),
        })
    }

    #[instrument(skip(self))]
    async fn get(&self, path: &str) -> StorageResult<Vec<u8>> {
        let target = self.object_path(path)?;
        debug!(path = %target.display(), "reading object");
        match tokio::fs::read(&target).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(path.to_string()))
            }
            Err(e) => Err(io_err(&target)(e)),
        }
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }
}

// ── In-memory ────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct InMemoryObjectStorage {
    objects: RwLock<HashMap<String, (Vec<u8>, String)>>,
}

impl InMemoryObjectStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    /// Content type recorded for `path`, if present.
    pub async fn content_type(&self, path: &str) -> Option<String> {
        self.objects.read().await.get(path).map(|(_, ct)| ct.clone())
    }
}

#[async_trait]
impl ObjectStorage for InMemoryObjectStorage {
    async fn put(&self, path: &str, bytes: &[u8], content_type: &str) -> StorageResult<StoredObject> {
        validate_path(path)?;
        self.objects
            .write()
            .await
            .insert(path.to_string(), (bytes.to_vec(), content_type.to_string()));
        Ok(StoredObject {
            location: format!("memory://{path}"),
            size: bytes.len(),
        })
    }

    async fn get(&self, path: &str) -> StorageResult<Vec<u8>> {
        self.objects
            .read()
            .await
            .get(path)
            .map(|(bytes, _)| bytes.clone())
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
