//! The kind of transfer a task performs.

use serde::{Deserialize, Serialize};
use std::fmt;

/// What a task moves. Fixed at creation.
///
/// # Examples
///
/// ```
/// use xfer_tasks::TaskKind;
///
/// assert_eq!(TaskKind::Upload.to_string(), "upload");
/// assert_eq!("delete".parse::<TaskKind>().unwrap(), TaskKind::Delete);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Client bytes written into storage, one chunk per unit.
    Upload,
    /// A zip archive of selected files streamed back, one chunk per unit.
    Download,
    /// Selected files removed from storage, one file per unit.
    Delete,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upload => write!(f, "upload"),
            Self::Download => write!(f, "download"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

impl std::str::FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "upload" => Ok(Self::Upload),
            "download" => Ok(Self::Download),
            "delete" => Ok(Self::Delete),
            _ => Err(format!("unknown task kind: {s}")),
        }
    }
}
