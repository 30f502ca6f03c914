//! Picks the newest matching file in a directory.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tracing::debug;

/// Suffix every candidate must carry, compared case-insensitively.
pub const REQUIRED_EXTENSION: &str = ".csv";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatestFile {
    pub path: PathBuf,
    pub file_name: String,
    pub modified: SystemTime,
}

impl LatestFile {
    /// Total order used for selection: newer modification time first, then the
    /// lexicographically greater name. `Greater` means "preferred".
    pub fn selection_cmp(&self, other: &Self) -> Ordering {
        self.modified
            .cmp(&other.modified)
            .then_with(|| self.file_name.cmp(&other.file_name))
    }
}

/// Whether `file_name` starts with `prefix` and ends with [`REQUIRED_EXTENSION`].
pub fn matches_name(file_name: &str, prefix: &str) -> bool {
    if !file_name.starts_with(prefix) {
        return false;
    }
    let Some(split) = file_name.len().checked_sub(REQUIRED_EXTENSION.len()) else {
        return false;
    };
    file_name
        .get(split..)
        .is_some_and(|suffix| suffix.eq_ignore_ascii_case(REQUIRED_EXTENSION))
}

/// Preferred candidate under [`LatestFile::selection_cmp`], independent of input order.
pub fn pick_latest(candidates: impl IntoIterator<Item = LatestFile>) -> Option<LatestFile> {
    candidates
        .into_iter()
        .max_by(|a, b| a.selection_cmp(b))
}

/// Scan `dir` for regular files named `<prefix>*.csv` and return the newest.
///
/// An unreadable directory or a directory without matches yields `None`; the
/// caller is expected to try again on its next tick.
pub async fn find_latest(dir: &Path, prefix: &str) -> Option<LatestFile> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) => {
            debug!(error = %err, dir = %dir.display(), "directory unreadable; skipping scan");
            return None;
        }
    };

    let mut candidates = Vec::new();
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(err) => {
                debug!(error = %err, dir = %dir.display(), "directory scan interrupted");
                break;
            }
        };

        let Ok(file_name) = entry.file_name().into_string() else {
            continue;
        };
        if !matches_name(&file_name, prefix) {
            continue;
        }

        let path = entry.path();
        let metadata = match fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(err) => {
                debug!(error = %err, path = %path.display(), "candidate vanished during scan");
                continue;
            }
        };
        if !metadata.is_file() {
            continue;
        }
        let Ok(modified) = metadata.modified() else {
            continue;
        };

        candidates.push(LatestFile {
            path,
            file_name,
            modified,
        });
    }

    debug!(
        dir = %dir.display(),
        prefix,
        candidate_count = candidates.len(),
        "directory scan complete"
    );

    pick_latest(candidates)
}
