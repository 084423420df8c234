//! # xfer
//!
//! Pausable, resumable and abortable file transfers.
//!
//! A transfer (upload, download or delete) is a task whose authoritative
//! state lives in a shared, TTL-bounded state store, so the process running
//! the transfer and the process handling a later pause, resume or abort do
//! not have to be the same. The running transfer checks the store between
//! chunks and reacts within one chunk, or within one poll interval while
//! paused.
//!
//! Task coordination (state machine, store contract, registry) lives in the
//! [`xfer_tasks`] crate. This crate adds the executor that drives chunked
//! work, the per-run resource guard, the file collaborators, configuration
//! and logging.
//!
//! ## Modules
//!
//! - [`api`] - [`TransferApi`], the entry points a request layer calls
//! - [`executor`] - the cooperative transfer loop and the three operations
//! - [`guard`] - [`ResourceGuard`] and the process-local [`RunTracker`]
//! - [`storage`], [`metadata`], [`archive`], [`filter`] - collaborators
//! - [`config`] - [`XferConfig`] loaded from `.xfer.toml` and `XFER_*`
//! - [`error`] - the boundary [`Error`]

pub mod api;
pub mod archive;
pub mod config;
pub mod error;
pub mod executor;
pub mod filter;
pub mod guard;
#[cfg(feature = "logging")]
pub mod logging;
pub mod metadata;
pub mod storage;

pub use api::{ChunkStream, Download, TransferApi};
pub use archive::{ArchiveEncoder, ArchiveEntry, ZipEncoder};
pub use config::{CacheBackend, ConfigError, XferConfig};
pub use error::{Error, Result};
pub use executor::{
    CancelReason, ChunkOperation, ExecutorConfig, TransferExecutor, TransferOutcome,
};
pub use filter::{CompiledFilter, FileFilter};
pub use guard::{ResourceGuard, RunLease, RunTracker};
#[cfg(feature = "logging")]
pub use logging::init_logging;
pub use metadata::{DirectoryMetadataStore, FileMetadata, InMemoryMetadataStore, MetadataStore};
pub use storage::{FileStorage, LocalStorage};

pub use xfer_tasks::{TaskError, TaskKind, TaskRecord, TaskRegistry, TaskState};
