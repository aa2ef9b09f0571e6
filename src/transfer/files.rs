//! File access for both ends of a transfer: sources the sender reads and
//! sinks the receiver writes.

use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};

use crate::error::TransferError;
use crate::protocol::transfer::FileMeta;

/// How many collision suffixes to try before giving up.
const MAX_SUFFIX: u32 = 10_000;

/// One file offered for sending.
#[derive(Debug, Clone)]
pub struct FileSource {
    pub path: PathBuf,
    pub meta: FileMeta,
}

impl FileSource {
    /// Stat the file and detect its MIME type. Directories are rejected.
    pub async fn open(path: &Path) -> Result<FileSource, TransferError> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| TransferError::file(path, e))?;
        if !metadata.is_file() {
            return Err(TransferError::file(
                path,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a regular file"),
            ));
        }

        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                TransferError::file(
                    path,
                    std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid file name"),
                )
            })?
            .to_string();

        let mime_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();

        Ok(FileSource {
            path: path.to_path_buf(),
            meta: FileMeta {
                name,
                size: metadata.len(),
                mime_type,
            },
        })
    }

    /// Open a read handle positioned at `offset`.
    pub async fn reader_at(&self, offset: u64) -> Result<File, TransferError> {
        let mut file = File::open(&self.path)
            .await
            .map_err(|e| TransferError::file(&self.path, e))?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(|e| TransferError::file(&self.path, e))?;
        }
        Ok(file)
    }
}

/// An output file under construction. Writes land at explicit offsets so
/// retransmitted or resumed chunks overwrite instead of corrupting.
pub struct FileSink {
    path: PathBuf,
    file: File,
    cursor: u64,
    received: u64,
}

impl FileSink {
    /// Create the output file inside `dir`, uniquifying the name with
    /// ` (1)`, ` (2)`, ... before the extension on collision. Creation is
    /// `create_new`, so the chosen path is unique at creation time even
    /// against concurrent writers.
    pub async fn create(dir: &Path, name: &str) -> Result<FileSink, TransferError> {
        let safe = sanitize_file_name(name);
        for attempt in 0..MAX_SUFFIX {
            let candidate = dir.join(suffixed_name(&safe, attempt));
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&candidate)
                .await
            {
                Ok(file) => {
                    return Ok(FileSink {
                        path: candidate,
                        file,
                        cursor: 0,
                        received: 0,
                    })
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(TransferError::file(candidate, e)),
            }
        }
        Err(TransferError::file(
            dir.join(safe),
            std::io::Error::new(std::io::ErrorKind::AlreadyExists, "too many name collisions"),
        ))
    }

    /// Write bytes at the declared offset, seeking when it differs from the
    /// current cursor.
    pub async fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<(), TransferError> {
        if offset != self.cursor {
            self.file
                .seek(SeekFrom::Start(offset))
                .await
                .map_err(|e| TransferError::file(&self.path, e))?;
            self.cursor = offset;
        }
        self.file
            .write_all(bytes)
            .await
            .map_err(|e| TransferError::file(&self.path, e))?;
        self.cursor += bytes.len() as u64;
        self.received += bytes.len() as u64;
        Ok(())
    }

    /// Append at the current cursor (raw-byte streams carry no offsets).
    pub async fn append(&mut self, bytes: &[u8]) -> Result<(), TransferError> {
        let offset = self.cursor;
        self.write_at(offset, bytes).await
    }

    /// Total bytes written so far.
    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush and return the final path.
    pub async fn finish(mut self) -> Result<PathBuf, TransferError> {
        self.file
            .flush()
            .await
            .map_err(|e| TransferError::file(&self.path, e))?;
        Ok(self.path)
    }
}

/// Strip any directory components so a hostile name cannot escape the
/// output directory.
pub fn sanitize_file_name(name: &str) -> String {
    let candidate = Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file");
    let trimmed = candidate.trim();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        "file".to_string()
    } else {
        trimmed.to_string()
    }
}

/// `attempt` 0 keeps the name; attempt n becomes `stem (n).ext`.
fn suffixed_name(name: &str, attempt: u32) -> String {
    if attempt == 0 {
        return name.to_string();
    }
    let path = Path::new(name);
    match (path.file_stem().and_then(|s| s.to_str()), path.extension().and_then(|e| e.to_str())) {
        (Some(stem), Some(ext)) => format!("{stem} ({attempt}).{ext}"),
        _ => format!("{name} ({attempt})"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn collision_appends_numeric_suffix() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("photo.jpg"), b"one").unwrap();
        std::fs::write(dir.path().join("photo (1).jpg"), b"two").unwrap();

        let sink = FileSink::create(dir.path(), "photo.jpg").await.unwrap();
        assert_eq!(sink.path(), dir.path().join("photo (2).jpg"));

        // The originals are untouched.
        assert_eq!(std::fs::read(dir.path().join("photo.jpg")).unwrap(), b"one");
        assert_eq!(
            std::fs::read(dir.path().join("photo (1).jpg")).unwrap(),
            b"two"
        );
    }

    #[tokio::test]
    async fn extensionless_names_get_plain_suffix() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("README"), b"x").unwrap();

        let sink = FileSink::create(dir.path(), "README").await.unwrap();
        assert_eq!(sink.path(), dir.path().join("README (1)"));
    }

    #[tokio::test]
    async fn write_at_seeks_on_offset_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileSink::create(dir.path(), "data.bin").await.unwrap();

        sink.write_at(0, b"aaaa").await.unwrap();
        // Retransmission of the same span overwrites in place.
        sink.write_at(0, b"bbbb").await.unwrap();
        sink.write_at(4, b"cccc").await.unwrap();
        assert_eq!(sink.received(), 12);

        let path = sink.finish().await.unwrap();
        let mut contents = Vec::new();
        File::open(&path)
            .await
            .unwrap()
            .read_to_end(&mut contents)
            .await
            .unwrap();
        assert_eq!(contents, b"bbbbcccc");
    }

    #[tokio::test]
    async fn source_rejects_directories() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FileSource::open(dir.path()).await.is_err());
    }

    #[tokio::test]
    async fn source_detects_mime_type() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.pdf");
        std::fs::write(&path, b"%PDF-").unwrap();

        let source = FileSource::open(&path).await.unwrap();
        assert_eq!(source.meta.name, "report.pdf");
        assert_eq!(source.meta.size, 5);
        assert_eq!(source.meta.mime_type, "application/pdf");
    }

    #[test]
    fn sanitize_strips_directories() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("plain.txt"), "plain.txt");
        assert_eq!(sanitize_file_name(""), "file");
        assert_eq!(sanitize_file_name(".."), "file");
    }
}
