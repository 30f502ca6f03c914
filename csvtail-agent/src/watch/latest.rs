//! Latest-file mode: re-deliver the newest matching file whenever it changes.
//!
//! There is no incremental cursor here. Every time the selection moves to a
//! different file, or the selected file's modification time advances, the whole
//! file is parsed again and every row is delivered again, including rows that
//! earlier ticks already delivered. Sinks that care must deduplicate.

use crate::config::WatcherConfig;
use crate::metrics::{
    FILE_RELOADS_TOTAL, LINES_READ_TOTAL, MODE_LATEST, PARSE_ERRORS_TOTAL, READ_ERRORS_TOTAL,
    ROWS_EMITTED_TOTAL, TICK_DURATION,
};
use crate::parsers::{strip_bom, TableParser};
use crate::selector::{find_latest, LatestFile};
use crate::sink::RowSink;
use crate::watch::{sleep_or_cancel, TickOutcome};
use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Selection remembered between ticks. Only updated after a successful read
/// and parse, so a failed attempt is retried on the next tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchState {
    pub last_path: Option<PathBuf>,
    pub last_modified: Option<SystemTime>,
}

impl WatchState {
    pub fn needs_reload(&self, candidate: &LatestFile) -> bool {
        if self.last_path.as_deref() != Some(candidate.path.as_path()) {
            return true;
        }
        match self.last_modified {
            Some(last) => candidate.modified > last,
            None => true,
        }
    }
}

pub struct LatestWatch {
    dir: PathBuf,
    prefix: String,
    parser: Arc<dyn TableParser>,
    sink: Box<dyn RowSink>,
    poll_interval: Duration,
    state: WatchState,
}

impl LatestWatch {
    /// `prefix` may be empty to consider every `.csv` file in `dir`.
    pub fn new(
        dir: impl Into<PathBuf>,
        prefix: impl Into<String>,
        watcher: &WatcherConfig,
        parser: Arc<dyn TableParser>,
        sink: Box<dyn RowSink>,
    ) -> Result<Self> {
        let dir = dir.into();
        let prefix = prefix.into();
        if dir.as_os_str().is_empty() {
            anyhow::bail!("latest-file mode requires a directory path");
        }
        if dir.exists() && !dir.is_dir() {
            anyhow::bail!(
                "latest-file mode expects a directory, but {} is not one",
                dir.display()
            );
        }
        if prefix.contains(|ch: char| ch == '/' || ch == '\\') {
            anyhow::bail!("file prefix must not contain path separators: {prefix:?}");
        }

        Ok(Self {
            dir,
            prefix,
            parser,
            sink,
            poll_interval: watcher.poll_interval(),
            state: WatchState::default(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state(&self) -> &WatchState {
        &self.state
    }

    /// One poll: select the newest file and, if it changed, deliver all its rows.
    pub async fn tick(&mut self) -> TickOutcome {
        let Some(latest) = find_latest(&self.dir, &self.prefix).await else {
            return TickOutcome::NoMatch;
        };
        if !self.state.needs_reload(&latest) {
            return TickOutcome::Unchanged;
        }

        let content = match fs::read(&latest.path).await {
            Ok(content) => content,
            Err(err) => {
                warn!(error = %err, path = %latest.path.display(), "failed to read selected file; retrying next tick");
                READ_ERRORS_TOTAL.with_label_values(&["reload"]).inc();
                return TickOutcome::ReadFailed;
            }
        };
        FILE_RELOADS_TOTAL.inc();

        let body = strip_bom(&content);
        let line_count = count_lines(body);
        let rows = match self.parser.parse_rows(body, false) {
            Ok(rows) => rows,
            Err(err) => {
                let reason = format!("{err:#}");
                warn!(
                    error = %reason,
                    path = %latest.path.display(),
                    bytes = body.len(),
                    "parse failed; selection not recorded"
                );
                PARSE_ERRORS_TOTAL.with_label_values(&[MODE_LATEST]).inc();
                return TickOutcome::ParseFailed { lines: line_count };
            }
        };

        if self.state.last_path.as_deref() != Some(latest.path.as_path()) {
            info!(
                path = %latest.path.display(),
                previous = ?self.state.last_path,
                "selected newer file"
            );
        }

        for row in &rows {
            self.sink.on_row(&latest.path, row);
        }
        self.sink.flush();
        LINES_READ_TOTAL
            .with_label_values(&[MODE_LATEST])
            .inc_by(line_count as u64);
        ROWS_EMITTED_TOTAL
            .with_label_values(&[MODE_LATEST])
            .inc_by(rows.len() as u64);

        debug!(
            path = %latest.path.display(),
            row_count = rows.len(),
            "file re-delivered"
        );

        self.state = WatchState {
            last_path: Some(latest.path),
            last_modified: Some(latest.modified),
        };

        TickOutcome::Delivered {
            lines: line_count,
            rows: rows.len(),
        }
    }

    /// Tick until `cancel_token` fires between two ticks.
    pub async fn run(mut self, cancel_token: CancellationToken) {
        info!(
            dir = %self.dir.display(),
            prefix = %self.prefix,
            poll_interval_secs = self.poll_interval.as_secs(),
            "starting latest-file watch"
        );

        loop {
            let tick_start = Instant::now();
            self.tick().await;
            TICK_DURATION
                .with_label_values(&[MODE_LATEST])
                .observe(tick_start.elapsed().as_secs_f64());

            if sleep_or_cancel(self.poll_interval, &cancel_token).await {
                break;
            }
        }

        info!(dir = %self.dir.display(), "latest-file watch stopped");
    }
}

/// Physical lines in `body`, counting a final line without a terminator.
fn count_lines(body: &[u8]) -> usize {
    let terminated = body.iter().filter(|byte| **byte == b'\n').count();
    match body.last() {
        Some(b'\n') | None => terminated,
        Some(_) => terminated + 1,
    }
}
