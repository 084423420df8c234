//! Upload: client bytes into storage, one chunk per unit.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use xfer_tasks::TaskKind;

use super::operation::{CancelReason, ChunkOperation};
use crate::metadata::{FileMetadata, MetadataStore};
use crate::storage::{partial_name, FileStorage, FileWriter};

/// Writes an incoming byte stream to `<owner>/<filename>`.
///
/// Chunks land in a hidden partial file that `finish` renames into place.
/// The client resends the whole stream on every run; `prepare` skips the
/// chunks a previous run already stored and reopens the partial file at the
/// matching offset.
pub struct UploadOperation<R> {
    storage: Arc<dyn FileStorage>,
    metadata: Arc<dyn MetadataStore>,
    owner_id: String,
    filename: String,
    partial: String,
    source: R,
    chunk_size: usize,
    writer: Option<FileWriter>,
    offset: u64,
    finished: bool,
}

impl<R> UploadOperation<R>
where
    R: AsyncRead + Send + Unpin,
{
    /// Creates an upload of `source` into the owner's `filename`.
    pub fn new(
        storage: Arc<dyn FileStorage>,
        metadata: Arc<dyn MetadataStore>,
        owner_id: impl Into<String>,
        filename: impl Into<String>,
        source: R,
        chunk_size: usize,
    ) -> Self {
        let filename = filename.into();
        Self {
            storage,
            metadata,
            owner_id: owner_id.into(),
            partial: partial_name(&filename),
            filename,
            source,
            chunk_size: chunk_size.max(1),
            writer: None,
            offset: 0,
            finished: false,
        }
    }

    fn writer(&mut self) -> io::Result<&mut FileWriter> {
        self.writer
            .as_mut()
            .ok_or_else(|| io::Error::other("upload target is not open"))
    }
}

/// Reads until `buf` is full or the stream ends. Returns the bytes read.
pub(crate) async fn read_full<R>(source: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]).await? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

#[async_trait]
impl<R> ChunkOperation for UploadOperation<R>
where
    R: AsyncRead + Send + Unpin,
{
    type Unit = Vec<u8>;

    fn kind(&self) -> TaskKind {
        TaskKind::Upload
    }

    async fn prepare(&mut self, progress: u64) -> io::Result<()> {
        let offset = progress.saturating_mul(self.chunk_size as u64);
        let skipped = tokio::io::copy(&mut (&mut self.source).take(offset), &mut tokio::io::sink())
            .await?;
        if skipped < offset {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("stream ended after {skipped} bytes, {offset} already stored"),
            ));
        }

        self.writer = Some(
            self.storage
                .open_for_write(&self.owner_id, &self.partial, offset)
                .await?,
        );
        self.offset = offset;
        tracing::debug!(filename = %self.filename, offset, "upload positioned");
        Ok(())
    }

    async fn next_unit(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut chunk = vec![0u8; self.chunk_size];
        let n = read_full(&mut self.source, &mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        chunk.truncate(n);
        Ok(Some(chunk))
    }

    async fn apply(&mut self, chunk: Vec<u8>) -> io::Result<()> {
        let writer = self.writer()?;
        writer.write_all(&chunk).await?;
        writer.flush().await?;
        self.offset += chunk.len() as u64;
        Ok(())
    }

    async fn finish(&mut self) -> io::Result<()> {
        self.writer()?.shutdown().await?;
        self.writer = None;
        self.storage
            .rename(&self.owner_id, &self.partial, &self.filename)
            .await?;
        self.finished = true;
        self.metadata
            .record(FileMetadata {
                owner_id: self.owner_id.clone(),
                filename: self.filename.clone(),
                uploaded_at: Utc::now(),
                size: self.offset,
            })
            .await
    }

    async fn abandon(&mut self, reason: CancelReason) {
        self.writer = None;
        if !matches!(reason, CancelReason::Aborted | CancelReason::Expired) {
            return;
        }
        // Once renamed, the upload occupies its final name.
        let target = if self.finished { &self.filename } else { &self.partial };
        match self.storage.delete(&self.owner_id, target).await {
            Ok(removed) => {
                tracing::debug!(filename = %target, removed, "abandoned upload removed");
            },
            Err(e) => {
                tracing::warn!(filename = %target, error = %e, "failed to remove abandoned upload");
            },
        }
        if self.finished {
            if let Err(e) = self.metadata.remove(&self.owner_id, &self.filename).await {
                tracing::warn!(filename = %self.filename, error = %e, "failed to forget abandoned upload");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::InMemoryMetadataStore;
    use crate::storage::LocalStorage;

    fn op(
        root: &std::path::Path,
        metadata: Arc<InMemoryMetadataStore>,
        bytes: &'static [u8],
    ) -> UploadOperation<&'static [u8]> {
        UploadOperation::new(
            Arc::new(LocalStorage::new(root)),
            metadata,
            "u1",
            "f.bin",
            bytes,
            4,
        )
    }

    #[tokio::test]
    async fn chunks_the_stream() {
        let root = tempfile::tempdir().unwrap();
        let mut upload = op(root.path(), Arc::new(InMemoryMetadataStore::new()), b"abcdefghij");
        upload.prepare(0).await.unwrap();

        let mut sizes = Vec::new();
        while let Some(chunk) = upload.next_unit().await.unwrap() {
            sizes.push(chunk.len());
            upload.apply(chunk).await.unwrap();
        }
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[tokio::test]
    async fn resume_skips_stored_chunks() {
        let root = tempfile::tempdir().unwrap();
        let metadata = Arc::new(InMemoryMetadataStore::new());

        let mut first = op(root.path(), Arc::clone(&metadata), b"abcdefghij");
        first.prepare(0).await.unwrap();
        let chunk = first.next_unit().await.unwrap().unwrap();
        first.apply(chunk).await.unwrap();
        // A second chunk was staged but never applied.
        first.next_unit().await.unwrap();
        drop(first);

        let mut second = op(root.path(), Arc::clone(&metadata), b"abcdefghij");
        second.prepare(1).await.unwrap();
        let mut applied = Vec::new();
        while let Some(chunk) = second.next_unit().await.unwrap() {
            applied.extend_from_slice(&chunk);
            second.apply(chunk).await.unwrap();
        }
        second.finish().await.unwrap();

        assert_eq!(applied, b"efghij");
        let stored = std::fs::read(root.path().join("u1").join("f.bin")).unwrap();
        assert_eq!(stored, b"abcdefghij");
        assert_eq!(metadata.list("u1").await.unwrap()[0].size, 10);
    }

    #[tokio::test]
    async fn short_resend_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        let mut upload = op(root.path(), Arc::new(InMemoryMetadataStore::new()), b"abc");
        let err = upload.prepare(2).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn chunks_stay_hidden_until_finish() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("u1");
        let mut upload = op(root.path(), Arc::new(InMemoryMetadataStore::new()), b"abcdef");
        upload.prepare(0).await.unwrap();
        while let Some(chunk) = upload.next_unit().await.unwrap() {
            upload.apply(chunk).await.unwrap();
        }
        assert!(dir.join(".f.bin.part").exists());
        assert!(!dir.join("f.bin").exists());

        upload.finish().await.unwrap();
        assert!(!dir.join(".f.bin.part").exists());
        assert_eq!(std::fs::read(dir.join("f.bin")).unwrap(), b"abcdef");
    }

    #[tokio::test]
    async fn abort_after_finish_removes_the_renamed_file() {
        let root = tempfile::tempdir().unwrap();
        let metadata = Arc::new(InMemoryMetadataStore::new());
        let mut upload = op(root.path(), Arc::clone(&metadata), b"abcd");
        upload.prepare(0).await.unwrap();
        let chunk = upload.next_unit().await.unwrap().unwrap();
        upload.apply(chunk).await.unwrap();
        upload.finish().await.unwrap();
        assert_eq!(metadata.list("u1").await.unwrap().len(), 1);

        upload.abandon(CancelReason::Aborted).await;
        assert!(!root.path().join("u1").join("f.bin").exists());
        assert!(metadata.list("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn abort_removes_partial_file_but_store_outage_keeps_it() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("u1").join(".f.bin.part");

        let mut upload = op(root.path(), Arc::new(InMemoryMetadataStore::new()), b"abcdefgh");
        upload.prepare(0).await.unwrap();
        let chunk = upload.next_unit().await.unwrap().unwrap();
        upload.apply(chunk).await.unwrap();

        upload.abandon(CancelReason::StoreUnavailable).await;
        assert!(path.exists());

        upload.abandon(CancelReason::Aborted).await;
        assert!(!path.exists());
    }
}
