//! Delete: selected files removed from storage, one file per unit.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use xfer_tasks::TaskKind;

use super::operation::{CancelReason, ChunkOperation};
use crate::filter::CompiledFilter;
use crate::metadata::{FileMetadata, MetadataStore};
use crate::storage::FileStorage;

/// Removes the owner's files selected by a filter.
///
/// Files deleted by an earlier run are gone from the metadata store, so
/// `prepare` lists what is left instead of skipping by progress.
pub struct DeleteOperation {
    storage: Arc<dyn FileStorage>,
    metadata: Arc<dyn MetadataStore>,
    owner_id: String,
    filter: CompiledFilter,
    pending: VecDeque<FileMetadata>,
}

impl DeleteOperation {
    /// Creates a delete of the owner's files selected by `filter`.
    pub fn new(
        storage: Arc<dyn FileStorage>,
        metadata: Arc<dyn MetadataStore>,
        owner_id: impl Into<String>,
        filter: CompiledFilter,
    ) -> Self {
        Self {
            storage,
            metadata,
            owner_id: owner_id.into(),
            filter,
            pending: VecDeque::new(),
        }
    }
}

#[async_trait]
impl ChunkOperation for DeleteOperation {
    type Unit = FileMetadata;

    fn kind(&self) -> TaskKind {
        TaskKind::Delete
    }

    async fn prepare(&mut self, progress: u64) -> io::Result<()> {
        let files = self.metadata.list(&self.owner_id).await?;
        self.pending = self.filter.select(files).into();
        tracing::debug!(
            owner_id = %self.owner_id,
            remaining = self.pending.len(),
            already_deleted = progress,
            "delete positioned"
        );
        Ok(())
    }

    async fn next_unit(&mut self) -> io::Result<Option<FileMetadata>> {
        Ok(self.pending.pop_front())
    }

    async fn apply(&mut self, file: FileMetadata) -> io::Result<()> {
        let removed = self.storage.delete(&self.owner_id, &file.filename).await?;
        self.metadata.remove(&self.owner_id, &file.filename).await?;
        if !removed {
            tracing::debug!(filename = %file.filename, "file already gone");
        }
        Ok(())
    }

    async fn finish(&mut self) -> io::Result<()> {
        Ok(())
    }

    async fn abandon(&mut self, _reason: CancelReason) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FileFilter;
    use crate::metadata::DirectoryMetadataStore;
    use crate::storage::LocalStorage;

    #[tokio::test]
    async fn deletes_matching_files_one_per_unit() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("u1");
        std::fs::create_dir_all(&dir).unwrap();
        for name in ["a.log", "b.log", "keep.txt"] {
            std::fs::write(dir.join(name), name).unwrap();
        }

        let mut delete = DeleteOperation::new(
            Arc::new(LocalStorage::new(root.path())),
            Arc::new(DirectoryMetadataStore::new(root.path())),
            "u1",
            FileFilter::new("*.log").compile().unwrap(),
        );
        delete.prepare(0).await.unwrap();

        let first = delete.next_unit().await.unwrap().unwrap();
        assert_eq!(first.filename, "a.log");
        delete.apply(first).await.unwrap();
        assert!(!dir.join("a.log").exists());
        assert!(dir.join("b.log").exists());

        // A fresh run after one unit only sees what is left.
        delete.prepare(1).await.unwrap();
        let next = delete.next_unit().await.unwrap().unwrap();
        assert_eq!(next.filename, "b.log");
        delete.apply(next).await.unwrap();
        assert!(delete.next_unit().await.unwrap().is_none());

        assert!(dir.join("keep.txt").exists());
    }
}
