//! File storage collaborator.
//!
//! Storage is a byte-addressable stream keyed by owner and filename. The
//! executor only ever appends at a resume offset, reads whole files, or
//! removes them.

pub mod local;

use std::io;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

pub use local::LocalStorage;

/// Write half handed out by [`FileStorage::open_for_write`].
pub type FileWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Read half handed out by [`FileStorage::open_for_read`].
pub type FileReader = Box<dyn AsyncRead + Send + Unpin>;

/// Owner-scoped file storage.
#[async_trait]
pub trait FileStorage: Send + Sync {
    /// Opens `filename` for writing, discarding anything past `offset`.
    ///
    /// An offset of zero truncates. A non-zero offset past the end of the
    /// stored file is an error, since the bytes before it were never
    /// written.
    async fn open_for_write(&self, owner_id: &str, filename: &str, offset: u64)
        -> io::Result<FileWriter>;

    /// Opens `filename` for reading from the start.
    async fn open_for_read(&self, owner_id: &str, filename: &str) -> io::Result<FileReader>;

    /// Removes `filename`. Returns `false` if it did not exist.
    async fn delete(&self, owner_id: &str, filename: &str) -> io::Result<bool>;

    /// Moves `from` to `to`, replacing `to` if it exists.
    async fn rename(&self, owner_id: &str, from: &str, to: &str) -> io::Result<()>;
}

/// The name an upload is written under until it completes.
///
/// Partial names are hidden from listings, so an interrupted upload is
/// never offered for download or selected for deletion.
pub fn partial_name(filename: &str) -> String {
    format!(".{filename}.part")
}

/// Returns `true` for names produced by [`partial_name`].
pub fn is_partial(name: &str) -> bool {
    name.strip_prefix('.')
        .and_then(|rest| rest.strip_suffix(".part"))
        .is_some_and(|stem| !stem.is_empty())
}

/// Checks that `name` is exactly one normal path component.
///
/// Rejects empty names, `.` and `..`, absolute paths, drive prefixes and
/// anything containing a separator.
pub fn validate_segment(name: &str) -> Result<(), PathError> {
    if name.is_empty() || name.contains(['/', '\\']) {
        return Err(PathError::InvalidPath(name.to_string()));
    }
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(PathError::InvalidPath(name.to_string())),
    }
}

/// `<root>/<owner>` after validating the owner as a single segment.
pub(crate) fn owner_dir(root: &Path, owner_id: &str) -> io::Result<PathBuf> {
    validate_segment(owner_id)?;
    Ok(root.join(owner_id))
}

/// A name that would leave its owner's directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    /// Empty, traversing, absolute or multi-component name
    InvalidPath(String),
}

impl std::fmt::Display for PathError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidPath(name) => write!(f, "not a plain file name: {name:?}"),
        }
    }
}

impl std::error::Error for PathError {}

impl From<PathError> for io::Error {
    fn from(e: PathError) -> Self {
        io::Error::new(io::ErrorKind::InvalidInput, e.to_string())
    }
}

impl From<PathError> for crate::Error {
    fn from(e: PathError) -> Self {
        match e {
            PathError::InvalidPath(name) => crate::Error::InvalidPath(name),
        }
    }
}
