//! Log tailer — incremental reads of a file that may be rotated or truncated

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Upper bound on bytes consumed per poll
const MAX_READ_BYTES: u64 = 1024 * 1024;

/// A line longer than this is emitted without waiting for its newline
const MAX_PENDING_BYTES: usize = 64 * 1024;

/// Identity of the file behind a path (device + inode on Unix)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileIdentity {
    dev: u64,
    ino: u64,
}

#[cfg(unix)]
fn file_identity(meta: &std::fs::Metadata) -> Option<FileIdentity> {
    use std::os::unix::fs::MetadataExt;
    Some(FileIdentity {
        dev: meta.dev(),
        ino: meta.ino(),
    })
}

#[cfg(not(unix))]
fn file_identity(_meta: &std::fs::Metadata) -> Option<FileIdentity> {
    None
}

/// Follows a log file across rotation and truncation. Never blocks on a missing file.
pub struct LogTailer {
    path: PathBuf,
    read_existing: bool,
    file: Option<File>,
    identity: Option<FileIdentity>,
    offset: u64,
    pending: Vec<u8>,
    /// Whether any file has been opened at this path yet
    opened_once: bool,
}

impl LogTailer {
    /// Create a tailer. With `read_existing`, the first file seen is read from
    /// its beginning; otherwise from its end.
    pub fn new(path: impl AsRef<Path>, read_existing: bool) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            read_existing,
            file: None,
            identity: None,
            offset: 0,
            pending: Vec::new(),
            opened_once: false,
        }
    }

    /// Path being tailed
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current read offset in the open file
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Return complete lines appended since the last poll
    pub async fn poll(&mut self) -> std::io::Result<Vec<String>> {
        let meta = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if self.file.take().is_some() {
                    tracing::info!(path = %self.path.display(), "Log file disappeared, waiting for it to return");
                }
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let mut lines = Vec::new();
        let identity = file_identity(&meta);

        if self.file.is_none() {
            self.open(meta.len()).await?;
        } else if identity.is_some() && identity != self.identity {
            // Drain what the old file still holds before switching
            self.read_available(&mut lines).await?;
            self.flush_pending(&mut lines);
            tracing::info!(path = %self.path.display(), "Log file rotated, reopening");
            self.file = None;
            self.open(meta.len()).await?;
        } else if meta.len() < self.offset {
            tracing::info!(
                path = %self.path.display(),
                offset = self.offset,
                len = meta.len(),
                "Log file truncated, resuming from new end"
            );
            self.offset = meta.len();
            self.pending.clear();
        }

        self.read_available(&mut lines).await?;
        Ok(lines)
    }

    async fn open(&mut self, len: u64) -> std::io::Result<()> {
        let file = File::open(&self.path).await?;
        let meta = file.metadata().await?;
        self.identity = file_identity(&meta);
        self.offset = if !self.opened_once && self.read_existing {
            0
        } else {
            len
        };
        self.pending.clear();
        self.file = Some(file);
        self.opened_once = true;
        tracing::debug!(path = %self.path.display(), offset = self.offset, "Opened log file");
        Ok(())
    }

    async fn read_available(&mut self, lines: &mut Vec<String>) -> std::io::Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };

        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut buf = Vec::new();
        file.take(MAX_READ_BYTES).read_to_end(&mut buf).await?;
        if buf.is_empty() {
            return Ok(());
        }
        self.offset += buf.len() as u64;
        self.pending.extend_from_slice(&buf);

        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }

        if self.pending.len() > MAX_PENDING_BYTES {
            self.flush_pending(lines);
        }
        Ok(())
    }

    fn flush_pending(&mut self, lines: &mut Vec<String>) {
        if !self.pending.is_empty() {
            lines.push(String::from_utf8_lossy(&self.pending).into_owned());
            self.pending.clear();
        }
    }
}
