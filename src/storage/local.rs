//! Local filesystem storage under `<data_dir>/<owner>/`.

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncSeekExt;

use super::{owner_dir, validate_segment, FileReader, FileStorage, FileWriter};

/// Stores each owner's files flat in its own directory.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    /// Stores files under `root`. Owner directories are created on first
    /// write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The data directory root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_path(&self, owner_id: &str, filename: &str) -> io::Result<PathBuf> {
        validate_segment(filename)?;
        Ok(owner_dir(&self.root, owner_id)?.join(filename))
    }
}

#[async_trait]
impl FileStorage for LocalStorage {
    async fn open_for_write(
        &self,
        owner_id: &str,
        filename: &str,
        offset: u64,
    ) -> io::Result<FileWriter> {
        let path = self.file_path(owner_id, filename)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(offset == 0)
            .open(&path)
            .await?;

        if offset > 0 {
            let len = file.metadata().await?.len();
            if len < offset {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("{filename} has {len} bytes, cannot resume at {offset}"),
                ));
            }
            // Drop a chunk that was written but never recorded as progress.
            file.set_len(offset).await?;
            file.seek(SeekFrom::Start(offset)).await?;
        }

        tracing::debug!(path = %path.display(), offset, "opened for write");
        Ok(Box::new(file))
    }

    async fn open_for_read(&self, owner_id: &str, filename: &str) -> io::Result<FileReader> {
        let path = self.file_path(owner_id, filename)?;
        let file = tokio::fs::File::open(&path).await?;
        Ok(Box::new(file))
    }

    async fn delete(&self, owner_id: &str, filename: &str) -> io::Result<bool> {
        let path = self.file_path(owner_id, filename)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn rename(&self, owner_id: &str, from: &str, to: &str) -> io::Result<()> {
        let source = self.file_path(owner_id, from)?;
        let target = self.file_path(owner_id, to)?;
        tokio::fs::rename(&source, &target).await?;
        tracing::debug!(from = %source.display(), to = %target.display(), "renamed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn write(storage: &LocalStorage, name: &str, offset: u64, bytes: &[u8]) {
        let mut w = storage.open_for_write("u1", name, offset).await.unwrap();
        w.write_all(bytes).await.unwrap();
        w.shutdown().await.unwrap();
    }

    async fn read(storage: &LocalStorage, name: &str) -> Vec<u8> {
        let mut r = storage.open_for_read("u1", name).await.unwrap();
        let mut buf = Vec::new();
        r.read_to_end(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn writes_land_in_owner_directory() {
        let root = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(root.path());
        write(&storage, "a.txt", 0, b"hello").await;

        assert!(root.path().join("u1").join("a.txt").is_file());
        assert_eq!(read(&storage, "a.txt").await, b"hello");
    }

    #[tokio::test]
    async fn resume_offset_discards_unrecorded_tail() {
        let root = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(root.path());
        write(&storage, "a.bin", 0, b"aaaabbbbcc").await;

        write(&storage, "a.bin", 8, b"CCCC").await;
        assert_eq!(read(&storage, "a.bin").await, b"aaaabbbbCCCC");
    }

    #[tokio::test]
    async fn zero_offset_truncates() {
        let root = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(root.path());
        write(&storage, "a.bin", 0, b"long content").await;
        write(&storage, "a.bin", 0, b"new").await;
        assert_eq!(read(&storage, "a.bin").await, b"new");
    }

    #[tokio::test]
    async fn resume_past_end_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(root.path());
        write(&storage, "a.bin", 0, b"abc").await;

        let err = match storage.open_for_write("u1", "a.bin", 10).await {
            Err(e) => e,
            Ok(_) => panic!("resume past end should fail"),
        };
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn delete_reports_presence() {
        let root = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(root.path());
        write(&storage, "a.txt", 0, b"x").await;

        assert!(storage.delete("u1", "a.txt").await.unwrap());
        assert!(!storage.delete("u1", "a.txt").await.unwrap());
    }

    #[tokio::test]
    async fn rename_replaces_the_target() {
        let root = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(root.path());
        write(&storage, ".a.bin.part", 0, b"new").await;
        write(&storage, "a.bin", 0, b"old").await;

        storage.rename("u1", ".a.bin.part", "a.bin").await.unwrap();
        assert_eq!(read(&storage, "a.bin").await, b"new");
        assert!(!root.path().join("u1").join(".a.bin.part").exists());
        assert!(storage.rename("u1", "a.bin", "../a.bin").await.is_err());
    }

    #[tokio::test]
    async fn traversal_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(root.path());

        for (owner, name) in [("u1", "../escape"), ("..", "a.txt"), ("u1", "/etc/passwd")] {
            let err = match storage.open_for_write(owner, name, 0).await {
                Err(e) => e,
                Ok(_) => panic!("{owner}/{name} should be rejected"),
            };
            assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        }
        assert!(storage.delete("u1", "..").await.is_err());
    }
}
