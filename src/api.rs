//! The boundary a request layer calls.
//!
//! [`TransferApi`] bundles the task registry, the executor and the file
//! collaborators. Control calls go straight to the registry; transfer calls
//! build the matching [`ChunkOperation`](crate::executor::ChunkOperation)
//! and run it.

use std::sync::Arc;

use chrono::Utc;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use xfer_tasks::{
    InMemoryStateStore, StateStore, TaskError, TaskKind, TaskRecord, TaskRegistry, TaskState,
};

use crate::archive::{archive_name, ArchiveEncoder, ZipEncoder};
use crate::config::{CacheBackend, CacheConfig, XferConfig};
use crate::error::{Error, Result};
use crate::executor::{
    DeleteOperation, Delivery, DownloadOperation, TransferExecutor, TransferOutcome,
    UploadOperation,
};
use crate::filter::FileFilter;
use crate::guard::RunTracker;
use crate::metadata::{DirectoryMetadataStore, MetadataStore};
use crate::storage::{is_partial, validate_segment, FileStorage, LocalStorage};

/// Chunks in flight between a download run and its consumer. The run waits
/// for each confirmation, so one slot is enough.
pub const DOWNLOAD_BUFFER: usize = 1;

/// A download in progress.
///
/// Read [`Download::chunks`] until it ends, then await `outcome`. Dropping
/// the chunk stream fails the run with a broken pipe; the task keeps the
/// progress of every confirmed chunk.
#[derive(Debug)]
pub struct Download {
    /// File name to present to the client.
    pub archive_name: String,
    /// Archive offset of the first chunk: zero for a fresh task, the bytes
    /// already confirmed for a resumed one.
    pub resume_offset: u64,
    /// Archive bytes, one chunk per unit.
    pub chunks: ChunkStream,
    /// The run itself.
    pub outcome: JoinHandle<Result<TransferOutcome>>,
}

/// The consumer side of a download.
///
/// A chunk is confirmed when the next one is requested, so a consumer that
/// stops after taking a chunk gets that chunk again on resume.
#[derive(Debug)]
pub struct ChunkStream {
    receiver: mpsc::Receiver<Delivery>,
    unconfirmed: Option<oneshot::Sender<()>>,
}

impl ChunkStream {
    /// Confirms the previous chunk and waits for the next one. `None` once
    /// the run has stopped sending.
    pub async fn next_chunk(&mut self) -> Option<Vec<u8>> {
        self.confirm();
        let delivery = self.receiver.recv().await?;
        self.unconfirmed = Some(delivery.ack);
        Some(delivery.bytes)
    }

    /// Confirms the last chunk taken without asking for another.
    pub fn confirm(&mut self) {
        if let Some(ack) = self.unconfirmed.take() {
            // A run that already stopped no longer needs the confirmation.
            let _ = ack.send(());
        }
    }
}

/// Task control and transfer entry points.
///
/// # Examples
///
/// ```
/// use xfer::{TransferApi, XferConfig};
/// use xfer_tasks::{TaskKind, TaskState};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), xfer::Error> {
/// let data = tempfile::tempdir()?;
/// let mut config = XferConfig::default();
/// config.transfer.data_dir = data.path().to_path_buf();
///
/// let api = TransferApi::from_config(&config).await?;
/// let task = api.create_task("alice", TaskKind::Upload).await?;
///
/// let outcome = api
///     .run_upload(&task.task_id, "alice", "hello.txt", &b"hello world"[..])
///     .await?;
/// assert!(outcome.is_completed());
///
/// let task = api.get_task(&task.task_id, "alice").await?;
/// assert_eq!(task.state, TaskState::Completed);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct TransferApi {
    registry: TaskRegistry,
    executor: Arc<TransferExecutor>,
    storage: Arc<dyn FileStorage>,
    metadata: Arc<dyn MetadataStore>,
    encoder: Arc<dyn ArchiveEncoder>,
}

impl std::fmt::Debug for TransferApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferApi")
            .field("registry", &self.registry)
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

impl TransferApi {
    /// Creates the API over `store`, with local storage, directory-scan
    /// metadata and zip archives under `config.transfer.data_dir`.
    pub fn new(store: Arc<dyn StateStore>, config: &XferConfig) -> Self {
        let registry = TaskRegistry::new(store).with_config(config.registry_config());
        let executor = TransferExecutor::new(registry.clone(), RunTracker::new())
            .with_config(config.executor_config());
        let data_dir = config.transfer.data_dir.clone();

        Self {
            registry,
            executor: Arc::new(executor),
            storage: Arc::new(LocalStorage::new(data_dir.clone())),
            metadata: Arc::new(DirectoryMetadataStore::new(data_dir)),
            encoder: Arc::new(ZipEncoder),
        }
    }

    /// Creates the API with the state store selected by `config.cache`.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if the backend is not compiled in or cannot be
    /// reached.
    pub async fn from_config(config: &XferConfig) -> Result<Self> {
        let store: Arc<dyn StateStore> = match config.cache.backend {
            CacheBackend::Memory => Arc::new(InMemoryStateStore::in_memory()),
            CacheBackend::Redis => redis_store(&config.cache).await?,
        };
        tracing::debug!(backend = ?config.cache.backend, "state store ready");
        Ok(Self::new(store, config))
    }

    /// Replaces the file storage.
    pub fn with_storage(mut self, storage: Arc<dyn FileStorage>) -> Self {
        self.storage = storage;
        self
    }

    /// Replaces the metadata store.
    pub fn with_metadata(mut self, metadata: Arc<dyn MetadataStore>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Replaces the archive encoder.
    pub fn with_encoder(mut self, encoder: Arc<dyn ArchiveEncoder>) -> Self {
        self.encoder = encoder;
        self
    }

    /// The task registry.
    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// Runs executing in this process.
    pub fn runs(&self) -> &RunTracker {
        self.executor.tracker()
    }

    // ---- Control ----

    /// Creates a task for `owner_id`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidPath`] if the owner cannot name a data directory.
    /// - [`TaskError::AlreadyActive`] if the owner has an unsettled task.
    pub async fn create_task(&self, owner_id: &str, kind: TaskKind) -> Result<TaskRecord> {
        validate_segment(owner_id)?;
        Ok(self.registry.create_task(owner_id, kind).await?)
    }

    /// Requests `Paused`, `Running` (resume) or `Aborted`.
    ///
    /// # Errors
    ///
    /// [`TaskError::InvalidTransition`], [`TaskError::Conflict`] or
    /// [`TaskError::NotFound`] from the registry.
    pub async fn set_state(
        &self,
        task_id: &str,
        owner_id: &str,
        desired: TaskState,
    ) -> Result<TaskRecord> {
        Ok(self.registry.set_state(task_id, owner_id, desired).await?)
    }

    /// Returns the owner's task.
    ///
    /// # Errors
    ///
    /// [`TaskError::NotFound`] if absent, lapsed or owned by someone else.
    pub async fn get_task(&self, task_id: &str, owner_id: &str) -> Result<TaskRecord> {
        Ok(self.registry.get(task_id, owner_id).await?)
    }

    // ---- Transfers ----

    /// Uploads `source` as the owner's `filename`.
    ///
    /// On a resumed task `source` must deliver the whole file again; the
    /// chunks already stored are skipped.
    pub async fn run_upload<R>(
        &self,
        task_id: &str,
        owner_id: &str,
        filename: &str,
        source: R,
    ) -> Result<TransferOutcome>
    where
        R: AsyncRead + Send + Unpin,
    {
        validate_segment(filename)?;
        if is_partial(filename) {
            return Err(Error::InvalidPath(filename.to_string()));
        }
        let operation = UploadOperation::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.metadata),
            owner_id,
            filename,
            source,
            self.executor.config().chunk_size,
        );
        self.executor.run(task_id, owner_id, operation).await
    }

    /// Starts streaming a zip of the owner's files selected by `filter`.
    ///
    /// Ownership and kind are checked before the run is spawned; everything
    /// later is reported through [`Download::outcome`].
    pub async fn run_download(
        &self,
        task_id: &str,
        owner_id: &str,
        filter: &FileFilter,
    ) -> Result<Download> {
        let compiled = filter.compile()?;
        let record = self.preflight(task_id, owner_id, TaskKind::Download).await?;
        let chunk_size = self.executor.config().chunk_size;

        let archive_name = archive_name(&Utc::now());
        let (sender, receiver) = mpsc::channel(DOWNLOAD_BUFFER);
        let operation = DownloadOperation::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.metadata),
            Arc::clone(&self.encoder),
            owner_id,
            compiled,
            archive_name.clone(),
            chunk_size,
            sender,
        );

        let executor = Arc::clone(&self.executor);
        let task_id = task_id.to_string();
        let owner_id = owner_id.to_string();
        let outcome =
            tokio::spawn(async move { executor.run(&task_id, &owner_id, operation).await });

        Ok(Download {
            archive_name,
            resume_offset: record.progress.saturating_mul(chunk_size as u64),
            chunks: ChunkStream {
                receiver,
                unconfirmed: None,
            },
            outcome,
        })
    }

    /// Deletes the owner's files selected by `filter`.
    pub async fn run_delete(
        &self,
        task_id: &str,
        owner_id: &str,
        filter: &FileFilter,
    ) -> Result<TransferOutcome> {
        let compiled = filter.compile()?;
        let operation = DeleteOperation::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.metadata),
            owner_id,
            compiled,
        );
        self.executor.run(task_id, owner_id, operation).await
    }

    async fn preflight(&self, task_id: &str, owner_id: &str, kind: TaskKind) -> Result<TaskRecord> {
        let record = self.registry.get(task_id, owner_id).await?;
        if record.kind != kind {
            return Err(Error::Task(TaskError::KindMismatch {
                task_id: task_id.to_string(),
                expected: kind,
                actual: record.kind,
            }));
        }
        Ok(record)
    }
}

#[cfg(feature = "redis")]
async fn redis_store(cache: &CacheConfig) -> Result<Arc<dyn StateStore>> {
    use crate::config::ConfigError;
    use xfer_tasks::{GenericStateStore, RedisBackend};

    let backend = RedisBackend::new(&cache.redis_url())
        .await
        .map_err(|e| ConfigError::Connect(e.to_string()))?
        .with_prefix(cache.key_prefix.clone());
    tracing::info!(host = %cache.host, port = cache.port, "connected to redis state store");
    Ok(Arc::new(GenericStateStore::new(backend)))
}

#[cfg(not(feature = "redis"))]
async fn redis_store(_cache: &CacheConfig) -> Result<Arc<dyn StateStore>> {
    Err(Error::Config(crate::config::ConfigError::Unsupported("redis")))
}
