//! Task lifecycle coordination for pausable, resumable file transfers.
//!
//! This crate owns the authoritative state of every transfer task: the
//! state machine, the shared TTL-bounded state store it lives in, and the
//! registry that is the only writer of task records. Executors and control
//! requests may run in different processes; they only ever meet through the
//! store.
//!
//! # Overview
//!
//! A task progresses through a state machine
//! (`created` -> `running` <-> `paused` -> `completed`, with `aborted`
//! reachable from any non-terminal state and `expired` imposed by the store
//! when the TTL lapses). Every write is a compare-and-set, so concurrent
//! control calls and progress writes linearize per task.
//!
//! # Module Organization
//!
//! - [`types`] - `TaskState` and `TaskKind`
//! - [`domain`] - `TaskRecord` and `ActiveSlot`, the stored values
//! - [`store`] - `StateStore` contract, `GenericStateStore`, backends
//! - [`registry`] - `TaskRegistry`, creation and transitions
//! - [`error`] - `TaskError` with status code mapping
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use xfer_tasks::{InMemoryStateStore, TaskKind, TaskRegistry, TaskState};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let registry = TaskRegistry::new(Arc::new(InMemoryStateStore::in_memory()));
//! let task = registry.create_task("u1", TaskKind::Upload).await.unwrap();
//!
//! let running = registry
//!     .start(&task.task_id, "u1", TaskKind::Upload, "run-1")
//!     .await
//!     .unwrap();
//! assert_eq!(running.state, TaskState::Running);
//!
//! let paused = registry.pause(&task.task_id, "u1").await.unwrap();
//! assert_eq!(paused.state, TaskState::Paused);
//! # }
//! ```

pub mod domain;
pub mod error;
pub mod registry;
pub mod store;
pub mod types;

pub use domain::{ActiveSlot, TaskRecord};
pub use error::TaskError;
pub use registry::{RegistryConfig, TaskRegistry};
pub use store::generic::GenericStateStore;
pub use store::memory::{InMemoryBackend, InMemoryStateStore};
#[cfg(feature = "redis")]
pub use store::redis::RedisBackend;
pub use store::{StateStore, StorageBackend, StorageError};
pub use types::{TaskKind, TaskState};
