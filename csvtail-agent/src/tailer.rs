//! Rotation-aware incremental reader for a single file path.
//!
//! A [`TailCursor`] owns at most one open handle, the byte offset consumed from
//! that handle, and the identity of the file behind it. Each call to
//! [`TailCursor::read_appended_lines`] returns only the lines completed since the
//! previous call. Bytes after the last line terminator stay in a carry buffer
//! until the producer finishes the line.
//!
//! Structural changes to the followed path are handled by resetting state rather
//! than by reporting errors:
//! - the file shrank below the offset: it was truncated in place, restart at byte 0;
//! - the path names a different file than the open handle: reopen and restart.
//!
//! Bytes appended to the old file after it was replaced are never read.

use crate::metrics::{CURSOR_RESETS_TOTAL, READ_ERRORS_TOTAL};
use crate::parsers::UTF8_BOM;
use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tracing::{debug, info};

pub const DEFAULT_READ_CHUNK_BYTES: usize = 64 * 1024;

/// Fingerprint of the file a handle refers to.
///
/// Only compared for equality, to tell "same path" apart from "same file".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileIdentity {
    pub device: u64,
    pub index: u64,
}

impl FileIdentity {
    #[cfg(unix)]
    pub fn from_metadata(metadata: &Metadata) -> Option<Self> {
        use std::os::unix::fs::MetadataExt;

        Some(Self {
            device: metadata.dev(),
            index: metadata.ino(),
        })
    }

    /// Creation time stands in for the file index where the platform exposes no
    /// stable one. Without it, replacement detection is disabled and only
    /// truncation is noticed.
    #[cfg(not(unix))]
    pub fn from_metadata(metadata: &Metadata) -> Option<Self> {
        let created = metadata.created().ok()?;
        let nanos = created
            .duration_since(std::time::UNIX_EPOCH)
            .ok()?
            .as_nanos();
        Some(Self {
            device: 0,
            index: nanos as u64,
        })
    }
}

/// I/O failures seen while following a file. All of them are retried on the
/// next tick; none is fatal to the watch loop.
#[derive(thiserror::Error, Debug)]
pub enum TailError {
    #[error("failed to open {}: {source}", .path.display())]
    Open { path: PathBuf, source: io::Error },

    #[error("failed to query size of {}: {source}", .path.display())]
    Metadata { path: PathBuf, source: io::Error },

    #[error("failed to seek {} to offset {offset}: {source}", .path.display())]
    Seek {
        path: PathBuf,
        offset: u64,
        source: io::Error,
    },

    #[error("failed to read {} at offset {offset}: {source}", .path.display())]
    Read {
        path: PathBuf,
        offset: u64,
        source: io::Error,
    },
}

impl TailError {
    pub fn kind(&self) -> &'static str {
        match self {
            TailError::Open { .. } => "open",
            TailError::Metadata { .. } => "metadata",
            TailError::Seek { .. } => "seek",
            TailError::Read { .. } => "read",
        }
    }
}

/// Follows one path and yields newly completed lines.
///
/// `offset` always equals the number of bytes of the current handle that have
/// been moved into `carry`. It only moves backward through [`Self::reset_state`],
/// which clears `carry` at the same time.
#[derive(Debug)]
pub struct TailCursor {
    path: PathBuf,
    file: Option<File>,
    identity: Option<FileIdentity>,
    offset: u64,
    carry: Vec<u8>,
    skip_header: bool,
    /// Set once the leading bytes were checked for a BOM on this handle.
    bom_stripped: bool,
    header_skipped: bool,
    chunk_bytes: usize,
    last_error: Option<TailError>,
}

impl TailCursor {
    pub fn new(path: impl Into<PathBuf>, skip_header: bool) -> Self {
        Self {
            path: path.into(),
            file: None,
            identity: None,
            offset: 0,
            carry: Vec::new(),
            skip_header,
            bom_stripped: false,
            header_skipped: false,
            chunk_bytes: DEFAULT_READ_CHUNK_BYTES,
            last_error: None,
        }
    }

    pub fn with_chunk_bytes(mut self, chunk_bytes: usize) -> Self {
        self.chunk_bytes = chunk_bytes.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    pub fn identity(&self) -> Option<FileIdentity> {
        self.identity
    }

    /// Bytes held back because no line terminator has arrived for them yet.
    pub fn pending_bytes(&self) -> usize {
        self.carry.len()
    }

    /// Error recorded by the most recent call to [`Self::read_appended_lines`].
    pub fn last_error(&self) -> Option<&TailError> {
        self.last_error.as_ref()
    }

    /// Open the path unless a handle is already held.
    ///
    /// The handle never takes an exclusive lock, so producers remain free to
    /// append to, rename or delete the file while it is followed.
    pub async fn open(&mut self) -> Result<(), TailError> {
        if self.file.is_some() {
            return Ok(());
        }
        self.open_handle().await
    }

    pub fn close(&mut self) {
        self.file = None;
        self.identity = None;
    }

    /// Read everything appended since the last call and return the lines it
    /// completed, in file order. Transient failures leave the cursor untouched,
    /// get recorded in [`Self::last_error`] and yield an empty result.
    pub async fn read_appended_lines(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        self.last_error = None;

        if let Err(err) = self.open().await {
            self.record_error(err);
            return lines;
        }

        self.refresh_if_replaced().await;

        let size = match self.file.as_mut() {
            Some(file) => file.metadata().await.map(|meta| meta.len()),
            None => return lines,
        };
        let file_size = match size {
            Ok(len) => len,
            Err(source) => {
                self.record_error(TailError::Metadata {
                    path: self.path.clone(),
                    source,
                });
                return lines;
            }
        };

        if file_size < self.offset {
            info!(
                path = %self.path.display(),
                previous_offset = self.offset,
                current_size = file_size,
                "file truncated; restarting from beginning"
            );
            CURSOR_RESETS_TOTAL.with_label_values(&["truncated"]).inc();
            self.reset_state();
        }

        if file_size == self.offset {
            return lines;
        }

        let start = self.offset;
        let seeked = match self.file.as_mut() {
            Some(file) => file.seek(SeekFrom::Start(start)).await,
            None => return lines,
        };
        if let Err(source) = seeked {
            self.record_error(TailError::Seek {
                path: self.path.clone(),
                offset: start,
                source,
            });
            return lines;
        }

        let mut buffer = vec![0u8; self.chunk_bytes];
        let mut remaining = file_size - start;
        while remaining > 0 {
            let want = remaining.min(buffer.len() as u64) as usize;
            let read = match self.file.as_mut() {
                Some(file) => file.read(&mut buffer[..want]).await,
                None => break,
            };
            let bytes_read = match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(source) => {
                    self.record_error(TailError::Read {
                        path: self.path.clone(),
                        offset: self.offset,
                        source,
                    });
                    break;
                }
            };

            self.offset += bytes_read as u64;
            remaining -= bytes_read as u64;
            self.carry.extend_from_slice(&buffer[..bytes_read]);

            self.strip_bom_once();

            if self.skip_header && !self.header_skipped {
                match self.carry.iter().position(|byte| *byte == b'\n') {
                    Some(pos) => {
                        self.carry.drain(..=pos);
                        self.header_skipped = true;
                        debug!(path = %self.path.display(), "header line skipped");
                    }
                    // Header itself is still incomplete.
                    None => continue,
                }
            }

            for line in drain_complete_lines(&mut self.carry) {
                lines.push(line_to_string(trim_carriage_return(line)));
            }
        }

        debug!(
            path = %self.path.display(),
            offset = self.offset,
            line_count = lines.len(),
            pending_bytes = self.carry.len(),
            "read appended bytes"
        );

        lines
    }

    async fn open_handle(&mut self) -> Result<(), TailError> {
        let file = File::open(&self.path).await.map_err(|source| TailError::Open {
            path: self.path.clone(),
            source,
        })?;

        self.identity = match file.metadata().await {
            Ok(meta) => FileIdentity::from_metadata(&meta),
            Err(_) => None,
        };
        if self.identity.is_none() {
            debug!(
                path = %self.path.display(),
                "file identity unavailable; replacement detection disabled for this handle"
            );
        }

        self.file = Some(file);
        self.reset_state();

        info!(path = %self.path.display(), identity = ?self.identity, "opened file");
        Ok(())
    }

    /// Reopen when the path now names a different file than the held handle.
    /// A failed probe (file missing mid-rotation) keeps the current handle.
    async fn refresh_if_replaced(&mut self) -> bool {
        let Some(current) = self.identity else {
            return false;
        };

        let probed = match fs::metadata(&self.path).await {
            Ok(meta) => FileIdentity::from_metadata(&meta),
            Err(err) => {
                debug!(
                    error = %err,
                    path = %self.path.display(),
                    "identity probe failed; keeping current handle"
                );
                return false;
            }
        };

        match probed {
            Some(identity) if identity != current => {
                info!(
                    path = %self.path.display(),
                    previous = ?current,
                    current = ?identity,
                    discarded_bytes = self.carry.len(),
                    "file replaced; reopening"
                );
                CURSOR_RESETS_TOTAL.with_label_values(&["replaced"]).inc();
                self.close();
                if let Err(err) = self.open_handle().await {
                    self.reset_state();
                    self.record_error(err);
                }
                true
            }
            _ => false,
        }
    }

    fn reset_state(&mut self) {
        self.offset = 0;
        self.carry.clear();
        self.bom_stripped = false;
        self.header_skipped = false;
    }

    /// Drop a leading UTF-8 BOM once per handle. While the carry is still a
    /// strict prefix of the BOM the decision waits for more bytes.
    fn strip_bom_once(&mut self) {
        if self.bom_stripped || self.carry.is_empty() {
            return;
        }
        if self.carry.len() < UTF8_BOM.len() && UTF8_BOM.starts_with(&self.carry) {
            return;
        }
        if self.carry.starts_with(&UTF8_BOM) {
            self.carry.drain(..UTF8_BOM.len());
        }
        self.bom_stripped = true;
    }

    fn record_error(&mut self, err: TailError) {
        debug!(error = %err, path = %self.path.display(), "transient tail error; retrying next tick");
        READ_ERRORS_TOTAL.with_label_values(&[err.kind()]).inc();
        self.last_error = Some(err);
    }
}

fn drain_complete_lines(buffer: &mut Vec<u8>) -> Vec<Vec<u8>> {
    let mut lines = Vec::new();
    let mut start = 0usize;

    for (idx, byte) in buffer.iter().enumerate() {
        if *byte == b'\n' {
            lines.push(buffer[start..idx].to_vec());
            start = idx + 1;
        }
    }

    if start > 0 {
        buffer.drain(..start);
    }

    lines
}

fn trim_carriage_return(mut line: Vec<u8>) -> Vec<u8> {
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    line
}

fn line_to_string(line: Vec<u8>) -> String {
    String::from_utf8(line)
        .unwrap_or_else(|err| String::from_utf8_lossy(err.as_bytes()).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn append(path: &Path, bytes: &[u8]) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .expect("open for append");
        file.write_all(bytes).expect("append bytes");
    }

    #[tokio::test]
    async fn delivers_complete_lines_and_holds_partial_line() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("data.csv");
        std::fs::write(&path, "a,1\nb,").expect("write");

        let mut cursor = TailCursor::new(&path, false);
        assert_eq!(cursor.read_appended_lines().await, vec!["a,1"]);
        assert_eq!(cursor.pending_bytes(), 2);

        append(&path, b"2\n");
        assert_eq!(cursor.read_appended_lines().await, vec!["b,2"]);
        assert_eq!(cursor.pending_bytes(), 0);
        assert!(cursor.read_appended_lines().await.is_empty());
    }

    #[tokio::test]
    async fn delivered_lines_do_not_depend_on_append_chunking() {
        let content = b"id,name\r\n1,alpha\n2,beta\r\n\n3,gamma\n4,del";
        let expected = vec!["1,alpha", "2,beta", "", "3,gamma"];

        for step in [1usize, 2, 5, 7, content.len()] {
            let dir = tempfile::tempdir().expect("tempdir");
            let path = dir.path().join("chunks.csv");
            std::fs::write(&path, b"").expect("create");

            let mut cursor = TailCursor::new(&path, true).with_chunk_bytes(3);
            let mut delivered = Vec::new();
            for piece in content.chunks(step) {
                append(&path, piece);
                delivered.extend(cursor.read_appended_lines().await);
            }

            assert_eq!(delivered, expected, "append step {step}");
            assert_eq!(cursor.offset(), content.len() as u64);
        }
    }

    #[tokio::test]
    async fn strips_bom_and_header_once_with_crlf() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bom.csv");
        std::fs::write(&path, b"\xEF\xBB\xBFh1,h2\r\n1,2\r\n3,4\n").expect("write");

        let mut cursor = TailCursor::new(&path, true);
        assert_eq!(cursor.read_appended_lines().await, vec!["1,2", "3,4"]);

        append(&path, b"\xEF\xBB\xBF5,6\n");
        let lines = cursor.read_appended_lines().await;
        assert_eq!(lines, vec!["\u{feff}5,6"]);
    }

    #[tokio::test]
    async fn bom_split_across_reads_is_still_stripped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("split.csv");
        std::fs::write(&path, b"\xEF").expect("write");

        let mut cursor = TailCursor::new(&path, false);
        assert!(cursor.read_appended_lines().await.is_empty());

        append(&path, b"\xBB\xBFx,y\n");
        assert_eq!(cursor.read_appended_lines().await, vec!["x,y"]);
    }

    #[tokio::test]
    async fn incomplete_header_defers_all_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("header.csv");
        std::fs::write(&path, b"h1,h").expect("write");

        let mut cursor = TailCursor::new(&path, true);
        assert!(cursor.read_appended_lines().await.is_empty());

        append(&path, b"2\n1,2\n");
        assert_eq!(cursor.read_appended_lines().await, vec!["1,2"]);
    }

    #[tokio::test]
    async fn stalled_line_is_never_delivered() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("stall.csv");
        std::fs::write(&path, b"partial").expect("write");

        let mut cursor = TailCursor::new(&path, false);
        assert!(cursor.read_appended_lines().await.is_empty());
        assert!(cursor.read_appended_lines().await.is_empty());
        assert_eq!(cursor.pending_bytes(), 7);
        assert_eq!(cursor.offset(), 7);
    }

    #[tokio::test]
    async fn truncation_restarts_from_byte_zero() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("trunc.csv");
        let original: String = (0..10).map(|i| format!("row,{i:05}\n")).collect();
        assert_eq!(original.len(), 100);
        std::fs::write(&path, &original).expect("write");

        let mut cursor = TailCursor::new(&path, false);
        assert_eq!(cursor.read_appended_lines().await.len(), 10);
        assert_eq!(cursor.offset(), 100);

        let shorter: String = (0..4).map(|i| format!("new,{i:05}\n")).collect();
        assert_eq!(shorter.len(), 40);
        std::fs::write(&path, &shorter).expect("truncate and rewrite");

        let lines = cursor.read_appended_lines().await;
        assert_eq!(lines, vec!["new,00000", "new,00001", "new,00002", "new,00003"]);
        assert_eq!(cursor.offset(), 40);
    }

    #[tokio::test]
    async fn truncation_discards_stale_carry_and_skips_header_again() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("trunc_header.csv");
        std::fs::write(&path, b"header\n1\nstale").expect("write");

        let mut cursor = TailCursor::new(&path, true);
        assert_eq!(cursor.read_appended_lines().await, vec!["1"]);
        assert_eq!(cursor.pending_bytes(), 5);

        std::fs::write(&path, b"h\n2\n").expect("rewrite");
        assert_eq!(cursor.read_appended_lines().await, vec!["2"]);
        assert_eq!(cursor.pending_bytes(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn replacement_with_equal_size_is_detected_by_identity() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("rotating.csv");
        std::fs::write(&path, b"old1\nold2\n").expect("write");

        let mut cursor = TailCursor::new(&path, false);
        assert_eq!(cursor.read_appended_lines().await, vec!["old1", "old2"]);
        let first_identity = cursor.identity();
        assert!(first_identity.is_some());

        let staged = dir.path().join("rotating.csv.tmp");
        std::fs::write(&staged, b"new1\nnew2\n").expect("write replacement");
        std::fs::rename(&staged, &path).expect("rename over");

        assert_eq!(cursor.read_appended_lines().await, vec!["new1", "new2"]);
        assert_ne!(cursor.identity(), first_identity);
        assert_eq!(cursor.offset(), 10);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_path_during_rotation_keeps_current_handle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("moving.csv");
        std::fs::write(&path, b"1\n").expect("write");

        let mut cursor = TailCursor::new(&path, false);
        assert_eq!(cursor.read_appended_lines().await, vec!["1"]);

        let rotated = dir.path().join("moving.csv.1");
        std::fs::rename(&path, &rotated).expect("rotate away");
        append(&rotated, b"2\n");

        assert_eq!(cursor.read_appended_lines().await, vec!["2"]);
        assert!(cursor.is_open());
    }

    #[tokio::test]
    async fn open_failure_is_recorded_and_retried() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("later.csv");

        let mut cursor = TailCursor::new(&path, false);
        let err = cursor.open().await.expect_err("file does not exist yet");
        assert!(matches!(
            &err,
            TailError::Open { source, .. } if source.kind() == io::ErrorKind::NotFound
        ));
        assert_eq!(err.kind(), "open");

        assert!(cursor.read_appended_lines().await.is_empty());
        assert!(matches!(cursor.last_error(), Some(TailError::Open { .. })));
        assert!(!cursor.is_open());

        std::fs::write(&path, b"x\n").expect("create");
        assert_eq!(cursor.read_appended_lines().await, vec!["x"]);
        assert!(cursor.last_error().is_none());
    }

    #[test]
    fn tail_error_display_names_path() {
        let err = TailError::Read {
            path: PathBuf::from("/tmp/feed.csv"),
            offset: 42,
            source: io::Error::new(io::ErrorKind::Other, "boom"),
        };
        assert_eq!(
            err.to_string(),
            "failed to read /tmp/feed.csv at offset 42: boom"
        );
        assert_eq!(err.kind(), "read");
    }
}
