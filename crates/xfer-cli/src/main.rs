//! xfer: drive and control resumable transfers from the command line.
//!
//! Control commands and transfer commands meet only through the state
//! store, so a transfer started in one shell can be paused, resumed or
//! aborted from another. That needs a shared backend (`XFER_CACHE_BACKEND=redis`);
//! with the in-memory backend every invocation starts from an empty store.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use xfer::{FileFilter, TransferApi, XferConfig};
use xfer_tasks::{TaskKind, TaskState};

/// Pausable, resumable file transfers
#[derive(Parser)]
#[command(name = "xfer")]
#[command(about = "Pausable, resumable uploads, downloads and deletes", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to ./.xfer.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Owner the tasks belong to
    #[arg(long, global = true, env = "XFER_OWNER", default_value = "default")]
    owner: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a task and print it
    Create {
        /// upload, download or delete
        kind: TaskKind,
    },

    /// Pause a running task
    Pause { task_id: String },

    /// Resume a paused task
    Resume { task_id: String },

    /// Abort a task
    Abort { task_id: String },

    /// Show a task
    Status { task_id: String },

    /// Upload a local file under an upload task
    ///
    /// Re-running the same command after a failure or a restart resumes
    /// from the last stored chunk.
    Upload {
        task_id: String,

        /// Local file to send
        file: PathBuf,

        /// Stored name (defaults to the local file name)
        #[arg(long)]
        name: Option<String>,
    },

    /// Download a zip of the owner's files under a download task
    ///
    /// Re-running with the same `--out` after a failure appends the rest of
    /// the archive to the partial file.
    Download {
        task_id: String,

        /// Where to write the archive (defaults to its generated name).
        /// Required when resuming.
        #[arg(long, short)]
        out: Option<PathBuf>,

        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Delete the owner's files under a delete task
    Delete {
        task_id: String,

        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Remove lapsed records from the state store
    Cleanup,
}

#[derive(Args)]
struct FilterArgs {
    /// Glob matched against file names
    #[arg(long, default_value = "*")]
    pattern: String,

    /// Only files uploaded at or after this RFC 3339 time
    #[arg(long)]
    from: Option<DateTime<Utc>>,

    /// Only files uploaded at or before this RFC 3339 time
    #[arg(long)]
    to: Option<DateTime<Utc>>,
}

impl FilterArgs {
    fn to_filter(&self) -> FileFilter {
        let mut filter = FileFilter::new(self.pattern.clone());
        if let Some(from) = self.from {
            filter = filter.from(from);
        }
        if let Some(to) = self.to {
            filter = filter.to(to);
        }
        filter
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    xfer::init_logging();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let api = TransferApi::from_config(&config)
        .await
        .context("failed to open the state store")?;

    execute_command(&api, &cli.owner, cli.command).await
}

fn load_config(path: Option<&Path>) -> Result<XferConfig> {
    match path {
        Some(path) => Ok(XferConfig::from_file(path)?),
        None => Ok(XferConfig::load()?),
    }
}

async fn execute_command(api: &TransferApi, owner: &str, command: Commands) -> Result<()> {
    match command {
        Commands::Create { kind } => {
            let task = api.create_task(owner, kind).await?;
            print_json(&task)?;
        },
        Commands::Pause { task_id } => {
            let task = api.set_state(&task_id, owner, TaskState::Paused).await?;
            print_json(&task)?;
        },
        Commands::Resume { task_id } => {
            let task = api.set_state(&task_id, owner, TaskState::Running).await?;
            print_json(&task)?;
        },
        Commands::Abort { task_id } => {
            let task = api.set_state(&task_id, owner, TaskState::Aborted).await?;
            print_json(&task)?;
        },
        Commands::Status { task_id } => {
            let task = api.get_task(&task_id, owner).await?;
            print_json(&task)?;
        },
        Commands::Upload {
            task_id,
            file,
            name,
        } => {
            let name = match name {
                Some(name) => name,
                None => stored_name(&file)?,
            };
            let source = tokio::fs::File::open(&file)
                .await
                .with_context(|| format!("failed to open {}", file.display()))?;
            let outcome = api.run_upload(&task_id, owner, &name, source).await?;
            print_json(&outcome)?;
        },
        Commands::Download {
            task_id,
            out,
            filter,
        } => {
            let task = api.get_task(&task_id, owner).await?;
            if task.progress > 0 && out.is_none() {
                bail!("task {task_id} already sent part of its archive; pass --out with the partial file");
            }

            let mut download = api.run_download(&task_id, owner, &filter.to_filter()).await?;
            let out = out.unwrap_or_else(|| PathBuf::from(&download.archive_name));
            let mut target = open_output(&out, download.resume_offset).await?;

            while let Some(chunk) = download.chunks.next_chunk().await {
                target.write_all(&chunk).await?;
                target.flush().await?;
            }

            let outcome = download.outcome.await.context("download run panicked")??;
            tracing::info!(archive = %out.display(), "archive written");
            print_json(&json!({ "archive": out, "outcome": outcome }))?;
        },
        Commands::Delete { task_id, filter } => {
            let outcome = api.run_delete(&task_id, owner, &filter.to_filter()).await?;
            print_json(&outcome)?;
        },
        Commands::Cleanup => {
            let removed = api.registry().cleanup_expired().await?;
            print_json(&json!({ "removed": removed }))?;
        },
    }
    Ok(())
}

/// Opens the archive file so the next write lands at `offset`.
///
/// A fresh download truncates. A resumed one keeps the confirmed prefix and
/// drops anything written after it.
async fn open_output(path: &Path, offset: u64) -> Result<tokio::fs::File> {
    if offset == 0 {
        return tokio::fs::File::create(path)
            .await
            .with_context(|| format!("failed to create {}", path.display()));
    }

    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .await
        .with_context(|| format!("cannot resume into {}", path.display()))?;
    let len = file.metadata().await?.len();
    if len < offset {
        bail!(
            "{} holds {len} bytes but the download resumes at {offset}",
            path.display()
        );
    }
    file.set_len(offset).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    Ok(file)
}

fn stored_name(file: &Path) -> Result<String> {
    match file.file_name().and_then(|n| n.to_str()) {
        Some(name) => Ok(name.to_string()),
        None => bail!("cannot derive a file name from {}", file.display()),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
