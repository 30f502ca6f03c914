//! Append mode: follow one file and forward each newly completed row.

use crate::config::WatcherConfig;
use crate::metrics::{
    LINES_READ_TOTAL, MODE_APPEND, PARSE_ERRORS_TOTAL, ROWS_EMITTED_TOTAL, TICK_DURATION,
};
use crate::parsers::{line_preview, TableParser, LINE_PREVIEW_LIMIT};
use crate::sink::RowSink;
use crate::tailer::TailCursor;
use crate::watch::{sleep_or_cancel, TickOutcome};
use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct AppendWatch {
    cursor: TailCursor,
    parser: Arc<dyn TableParser>,
    sink: Box<dyn RowSink>,
    poll_interval: Duration,
    open_retry_delay: Duration,
}

impl AppendWatch {
    /// The file does not need to exist yet; opening is retried on every tick.
    pub fn new(
        file_path: impl Into<PathBuf>,
        watcher: &WatcherConfig,
        parser: Arc<dyn TableParser>,
        sink: Box<dyn RowSink>,
    ) -> Result<Self> {
        let file_path = file_path.into();
        if file_path.as_os_str().is_empty() {
            anyhow::bail!("append mode requires a file path");
        }
        if file_path.is_dir() {
            anyhow::bail!(
                "append mode expects a file, but {} is a directory",
                file_path.display()
            );
        }
        if watcher.read_chunk_bytes == 0 {
            anyhow::bail!("watcher.read_chunk_bytes must be greater than zero");
        }

        Ok(Self {
            cursor: TailCursor::new(file_path, watcher.skip_header)
                .with_chunk_bytes(watcher.read_chunk_bytes),
            parser,
            sink,
            poll_interval: watcher.poll_interval(),
            open_retry_delay: watcher.open_retry_delay(),
        })
    }

    pub fn path(&self) -> &Path {
        self.cursor.path()
    }

    pub fn cursor(&self) -> &TailCursor {
        &self.cursor
    }

    /// One poll: read appended lines, parse them as a headerless chunk and
    /// deliver every row. A rejected chunk is dropped; its bytes stay consumed.
    pub async fn tick(&mut self) -> TickOutcome {
        if !self.cursor.is_open() {
            if let Err(err) = self.cursor.open().await {
                debug!(error = %err, path = %self.cursor.path().display(), "file not available; retrying");
                return TickOutcome::NotOpen;
            }
        }

        let lines = self.cursor.read_appended_lines().await;
        if lines.is_empty() {
            return TickOutcome::Unchanged;
        }

        let line_count = lines.len();
        LINES_READ_TOTAL
            .with_label_values(&[MODE_APPEND])
            .inc_by(line_count as u64);

        let mut chunk = String::with_capacity(lines.iter().map(|line| line.len() + 1).sum());
        for line in &lines {
            chunk.push_str(line);
            chunk.push('\n');
        }

        let rows = match self.parser.parse_rows(chunk.as_bytes(), false) {
            Ok(rows) => rows,
            Err(err) => {
                let reason = format!("{err:#}");
                warn!(
                    error = %reason,
                    path = %self.cursor.path().display(),
                    line_count,
                    preview = %line_preview(chunk.as_bytes(), LINE_PREVIEW_LIMIT),
                    "parse failed; dropping chunk"
                );
                PARSE_ERRORS_TOTAL.with_label_values(&[MODE_APPEND]).inc();
                return TickOutcome::ParseFailed { lines: line_count };
            }
        };

        for row in &rows {
            self.sink.on_row(self.cursor.path(), row);
        }
        self.sink.flush();
        ROWS_EMITTED_TOTAL
            .with_label_values(&[MODE_APPEND])
            .inc_by(rows.len() as u64);

        debug!(
            path = %self.cursor.path().display(),
            line_count,
            row_count = rows.len(),
            offset = self.cursor.offset(),
            "rows delivered"
        );

        TickOutcome::Delivered {
            lines: line_count,
            rows: rows.len(),
        }
    }

    /// Tick until `cancel_token` fires between two ticks.
    pub async fn run(mut self, cancel_token: CancellationToken) {
        info!(
            path = %self.cursor.path().display(),
            poll_interval_secs = self.poll_interval.as_secs(),
            "starting append watch"
        );

        loop {
            let tick_start = Instant::now();
            let outcome = self.tick().await;
            TICK_DURATION
                .with_label_values(&[MODE_APPEND])
                .observe(tick_start.elapsed().as_secs_f64());

            let delay = match outcome {
                TickOutcome::NotOpen => self.open_retry_delay,
                _ => self.poll_interval,
            };
            if sleep_or_cancel(delay, &cancel_token).await {
                break;
            }
        }

        info!(path = %self.cursor.path().display(), "append watch stopped");
    }
}
