//! Archive encoding for downloads.
//!
//! Encoding is synchronous and runs on the blocking pool. The output must be
//! byte-for-byte reproducible from the same inputs: a resumed download
//! re-encodes the archive and continues streaming at the persisted offset.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone};

/// Directory inside the archive that holds every file.
pub const ARCHIVE_DIR: &str = "data";

/// One file to put into an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Name inside [`ARCHIVE_DIR`].
    pub name: String,
    /// Where the bytes are read from.
    pub source: PathBuf,
}

/// Writes a set of files into a single archive file.
pub trait ArchiveEncoder: Send + Sync {
    /// Encodes `entries`, in order, into `dest`. Returns the archive size.
    fn encode(&self, entries: &[ArchiveEntry], dest: &Path) -> io::Result<u64>;
}

/// Deflate-compressed zip with fixed entry timestamps.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZipEncoder;

impl ArchiveEncoder for ZipEncoder {
    fn encode(&self, entries: &[ArchiveEntry], dest: &Path) -> io::Result<u64> {
        let file = File::create(dest)?;
        let mut zip = zip::ZipWriter::new(file);

        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .last_modified_time(zip::DateTime::default())
            .unix_permissions(0o644);

        zip.add_directory(format!("{ARCHIVE_DIR}/"), options)
            .map_err(io::Error::other)?;

        for entry in entries {
            zip.start_file(format!("{ARCHIVE_DIR}/{}", entry.name), options)
                .map_err(io::Error::other)?;
            let mut source = File::open(&entry.source)?;
            io::copy(&mut source, &mut zip)?;
        }

        let file = zip.finish().map_err(io::Error::other)?;
        Ok(file.metadata()?.len())
    }
}

/// Download archive name for a given instant, e.g. `2024-03-01T09-30-00.zip`.
pub fn archive_name<Tz: TimeZone>(at: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("{}.zip", at.format("%Y-%m-%dT%H-%M-%S"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::io::Read;

    fn entries(dir: &Path, files: &[(&str, &[u8])]) -> Vec<ArchiveEntry> {
        files
            .iter()
            .map(|(name, bytes)| {
                let source = dir.join(name);
                std::fs::write(&source, bytes).unwrap();
                ArchiveEntry {
                    name: (*name).to_string(),
                    source,
                }
            })
            .collect()
    }

    #[test]
    fn zip_holds_files_under_data() {
        let dir = tempfile::tempdir().unwrap();
        let entries = entries(dir.path(), &[("a.txt", b"alpha"), ("b.txt", b"beta")]);
        let dest = dir.path().join("out.zip");

        let size = ZipEncoder.encode(&entries, &dest).unwrap();
        assert_eq!(size, std::fs::metadata(&dest).unwrap().len());

        let mut archive = zip::ZipArchive::new(File::open(&dest).unwrap()).unwrap();
        let mut contents = String::new();
        archive
            .by_name("data/b.txt")
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "beta");
        assert!(archive.by_name("data/a.txt").is_ok());
    }

    #[test]
    fn encoding_is_reproducible() {
        let dir = tempfile::tempdir().unwrap();
        let entries = entries(dir.path(), &[("x.bin", &[7u8; 4096])]);
        let first = dir.path().join("1.zip");
        let second = dir.path().join("2.zip");

        ZipEncoder.encode(&entries, &first).unwrap();
        ZipEncoder.encode(&entries, &second).unwrap();
        assert_eq!(
            std::fs::read(&first).unwrap(),
            std::fs::read(&second).unwrap()
        );
    }

    #[test]
    fn empty_selection_is_a_valid_archive() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("empty.zip");
        ZipEncoder.encode(&[], &dest).unwrap();

        let archive = zip::ZipArchive::new(File::open(&dest).unwrap()).unwrap();
        assert_eq!(archive.len(), 1);
    }

    #[test]
    fn archive_names_are_timestamps() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 5).unwrap();
        assert_eq!(archive_name(&at), "2024-03-01T09-30-05.zip");
    }
}
