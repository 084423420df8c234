//! Download: a zip of selected files streamed back, one chunk per unit.
//!
//! A chunk counts as sent only when the consumer confirms it, so progress
//! never covers bytes that were still buffered when the consumer went away.

use std::io::{self, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::io::AsyncSeekExt;
use tokio::sync::{mpsc, oneshot};
use xfer_tasks::TaskKind;

use super::operation::{CancelReason, ChunkOperation};
use super::upload::read_full;
use crate::archive::{ArchiveEncoder, ArchiveEntry, ARCHIVE_DIR};
use crate::filter::CompiledFilter;
use crate::metadata::MetadataStore;
use crate::storage::FileStorage;

/// One archive chunk on its way to the consumer.
#[derive(Debug)]
pub struct Delivery {
    pub(crate) bytes: Vec<u8>,
    pub(crate) ack: oneshot::Sender<()>,
}

fn receiver_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "download receiver dropped")
}

/// Stages the selected files, encodes them, and sends the archive in
/// chunks over a channel.
///
/// Staging and encoding are repeated by every run. The encoder is
/// deterministic, so a resumed run seeks to `progress * chunk_size` in a
/// byte-identical archive. The staging directory lives as long as the
/// operation.
pub struct DownloadOperation {
    storage: Arc<dyn FileStorage>,
    metadata: Arc<dyn MetadataStore>,
    encoder: Arc<dyn ArchiveEncoder>,
    owner_id: String,
    filter: CompiledFilter,
    archive_name: String,
    chunk_size: usize,
    sender: mpsc::Sender<Delivery>,
    staging: Option<TempDir>,
    archive: Option<tokio::fs::File>,
}

impl DownloadOperation {
    /// Creates a download of the owner's files selected by `filter`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<dyn FileStorage>,
        metadata: Arc<dyn MetadataStore>,
        encoder: Arc<dyn ArchiveEncoder>,
        owner_id: impl Into<String>,
        filter: CompiledFilter,
        archive_name: impl Into<String>,
        chunk_size: usize,
        sender: mpsc::Sender<Delivery>,
    ) -> Self {
        Self {
            storage,
            metadata,
            encoder,
            owner_id: owner_id.into(),
            filter,
            archive_name: archive_name.into(),
            chunk_size: chunk_size.max(1),
            sender,
            staging: None,
            archive: None,
        }
    }

    async fn stage(&self, staging: &TempDir) -> io::Result<Vec<ArchiveEntry>> {
        let data_dir = staging.path().join(ARCHIVE_DIR);
        tokio::fs::create_dir_all(&data_dir).await?;

        let selected = self.filter.select(self.metadata.list(&self.owner_id).await?);
        let mut entries = Vec::with_capacity(selected.len());
        for file in selected {
            let dest = data_dir.join(&file.filename);
            let mut source = self.storage.open_for_read(&self.owner_id, &file.filename).await?;
            let mut target = tokio::fs::File::create(&dest).await?;
            tokio::io::copy(&mut source, &mut target).await?;
            entries.push(ArchiveEntry {
                name: file.filename,
                source: dest,
            });
        }
        Ok(entries)
    }
}

#[async_trait]
impl ChunkOperation for DownloadOperation {
    type Unit = Vec<u8>;

    fn kind(&self) -> TaskKind {
        TaskKind::Download
    }

    async fn prepare(&mut self, progress: u64) -> io::Result<()> {
        let staging = tempfile::tempdir()?;
        let entries = self.stage(&staging).await?;

        let dest: PathBuf = staging.path().join(&self.archive_name);
        let encoder = Arc::clone(&self.encoder);
        let target = dest.clone();
        let size = tokio::task::spawn_blocking(move || encoder.encode(&entries, &target))
            .await
            .map_err(io::Error::other)??;

        let offset = progress.saturating_mul(self.chunk_size as u64);
        if offset > size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("archive has {size} bytes, {offset} already sent"),
            ));
        }

        let mut archive = tokio::fs::File::open(&dest).await?;
        archive.seek(SeekFrom::Start(offset)).await?;

        tracing::debug!(archive = %self.archive_name, size, offset, "archive staged");
        self.archive = Some(archive);
        self.staging = Some(staging);
        Ok(())
    }

    async fn next_unit(&mut self) -> io::Result<Option<Vec<u8>>> {
        let archive = self
            .archive
            .as_mut()
            .ok_or_else(|| io::Error::other("archive is not staged"))?;
        let mut chunk = vec![0u8; self.chunk_size];
        let n = read_full(archive, &mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        chunk.truncate(n);
        Ok(Some(chunk))
    }

    async fn apply(&mut self, chunk: Vec<u8>) -> io::Result<()> {
        let (ack, confirmed) = oneshot::channel();
        self.sender
            .send(Delivery { bytes: chunk, ack })
            .await
            .map_err(|_| receiver_gone())?;
        confirmed.await.map_err(|_| receiver_gone())
    }

    async fn finish(&mut self) -> io::Result<()> {
        self.archive = None;
        Ok(())
    }

    async fn abandon(&mut self, _reason: CancelReason) {
        self.archive = None;
        self.staging = None;
    }
}
