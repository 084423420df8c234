//! File metadata collaborator.
//!
//! Metadata outlives task state: it describes what an owner has stored, and
//! download and delete runs select their work from it.

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::storage::{is_partial, owner_dir};

/// One stored file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    /// The owner the file belongs to.
    pub owner_id: String,
    /// Name within the owner's directory.
    pub filename: String,
    /// When the upload finished.
    pub uploaded_at: DateTime<Utc>,
    /// Size in bytes.
    pub size: u64,
}

/// Lookup and bookkeeping of stored files.
///
/// `list` returns files ordered by filename so that repeated listings of an
/// unchanged directory select the same work in the same order.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Records a finished upload, replacing any entry with the same name.
    async fn record(&self, metadata: FileMetadata) -> io::Result<()>;

    /// Lists the owner's files ordered by filename.
    async fn list(&self, owner_id: &str) -> io::Result<Vec<FileMetadata>>;

    /// Forgets a file. Removing an unknown file is not an error.
    async fn remove(&self, owner_id: &str, filename: &str) -> io::Result<()>;
}

/// Process-local metadata, keyed by owner.
#[derive(Debug, Default)]
pub struct InMemoryMetadataStore {
    files: DashMap<String, BTreeMap<String, FileMetadata>>,
}

impl InMemoryMetadataStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn record(&self, metadata: FileMetadata) -> io::Result<()> {
        self.files
            .entry(metadata.owner_id.clone())
            .or_default()
            .insert(metadata.filename.clone(), metadata);
        Ok(())
    }

    async fn list(&self, owner_id: &str) -> io::Result<Vec<FileMetadata>> {
        Ok(self
            .files
            .get(owner_id)
            .map(|files| files.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn remove(&self, owner_id: &str, filename: &str) -> io::Result<()> {
        if let Some(mut files) = self.files.get_mut(owner_id) {
            files.remove(filename);
        }
        Ok(())
    }
}

/// Metadata derived from the data directory itself.
///
/// Every regular file under `<root>/<owner>/` is a stored file, except
/// uploads still in flight. A file's modification time is its upload time.
/// `record` and `remove` have nothing to do because the directory already
/// reflects both.
#[derive(Debug, Clone)]
pub struct DirectoryMetadataStore {
    root: PathBuf,
}

impl DirectoryMetadataStore {
    /// Scans owner directories under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl MetadataStore for DirectoryMetadataStore {
    async fn record(&self, _metadata: FileMetadata) -> io::Result<()> {
        Ok(())
    }

    async fn list(&self, owner_id: &str) -> io::Result<Vec<FileMetadata>> {
        let dir = owner_dir(&self.root, owner_id)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            let Some(filename) = entry.file_name().to_str().map(str::to_string) else {
                tracing::debug!(path = %entry.path().display(), "skipping non UTF-8 filename");
                continue;
            };
            if is_partial(&filename) {
                continue;
            }
            files.push(FileMetadata {
                owner_id: owner_id.to_string(),
                filename,
                uploaded_at: DateTime::<Utc>::from(meta.modified()?),
                size: meta.len(),
            });
        }
        files.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(files)
    }

    async fn remove(&self, _owner_id: &str, _filename: &str) -> io::Result<()> {
        Ok(())
    }
}
