//! Destinations for parsed rows.
//!
//! A [`RowSink`] is invoked synchronously on the watch loop that produced the
//! row, once per row, in file order, then flushed once at the end of the tick.
//! Whatever time it spends delays the next tick.

use crate::config::{OutputConfig, OutputFormat};
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, info, warn};

pub trait RowSink: Send {
    fn on_row(&mut self, source_path: &Path, row: &[String]);

    /// Called after the last row of a tick.
    fn flush(&mut self) {}
}

impl<F> RowSink for F
where
    F: FnMut(&Path, &[String]) + Send,
{
    fn on_row(&mut self, source_path: &Path, row: &[String]) {
        self(source_path, row)
    }
}

/// Prints `[<path>] col0=<v>|col1=<v>|` per row.
#[derive(Debug)]
pub struct ConsoleSink<W: Write + Send = io::Stdout> {
    out: W,
}

impl ConsoleSink {
    pub fn stdout() -> Self {
        Self { out: io::stdout() }
    }
}

impl<W: Write + Send> ConsoleSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

pub fn format_row(source_path: &Path, row: &[String]) -> String {
    let mut line = format!("[{}] ", source_path.display());
    for (idx, cell) in row.iter().enumerate() {
        line.push_str(&format!("col{idx}={cell}|"));
    }
    line
}

impl<W: Write + Send> RowSink for ConsoleSink<W> {
    fn on_row(&mut self, source_path: &Path, row: &[String]) {
        if let Err(err) = writeln!(self.out, "{}", format_row(source_path, row)) {
            warn!(error = %err, "failed to print row");
        }
    }

    fn flush(&mut self) {
        if let Err(err) = self.out.flush() {
            warn!(error = %err, "failed to flush console output");
        }
    }
}

/// Appends one JSON object per row to a file.
///
/// Rows are encoded into memory as they arrive and written with a single
/// write per tick, so the file only sees complete lines.
#[derive(Debug)]
pub struct JsonLinesSink {
    path: PathBuf,
    file: File,
    pending: Vec<u8>,
    pending_rows: usize,
}

#[derive(Serialize)]
struct PersistedRow<'a> {
    source_path: String,
    row: &'a [String],
    received_at_ms: u64,
}

impl JsonLinesSink {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;

        Ok(Self {
            path,
            file,
            pending: Vec::new(),
            pending_rows: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows encoded but not yet written to the file.
    pub fn pending_rows(&self) -> usize {
        self.pending_rows
    }

    fn encode_row(&mut self, source_path: &Path, row: &[String]) -> Result<()> {
        let persisted = PersistedRow {
            source_path: source_path.to_string_lossy().into_owned(),
            row,
            received_at_ms: current_timestamp_ms(),
        };
        let mark = self.pending.len();
        if let Err(err) = serde_json::to_writer(&mut self.pending, &persisted) {
            self.pending.truncate(mark);
            return Err(err).context("failed to encode row");
        }
        self.pending.push(b'\n');
        self.pending_rows += 1;
        Ok(())
    }
}

impl RowSink for JsonLinesSink {
    fn on_row(&mut self, source_path: &Path, row: &[String]) {
        if let Err(err) = self.encode_row(source_path, row) {
            warn!(
                error = %err,
                output = %self.path.display(),
                source = %source_path.display(),
                "failed to persist row; dropping it"
            );
        }
    }

    fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let file = &mut self.file;
        let pending = &self.pending;
        let written = run_blocking(|| file.write_all(pending).and_then(|()| file.flush()));
        match written {
            Ok(()) => debug!(
                output = %self.path.display(),
                row_count = self.pending_rows,
                "rows written"
            ),
            Err(err) => warn!(
                error = %err,
                output = %self.path.display(),
                row_count = self.pending_rows,
                "failed to write rows; dropping them"
            ),
        }
        self.pending.clear();
        self.pending_rows = 0;
    }
}

impl Drop for JsonLinesSink {
    fn drop(&mut self) {
        RowSink::flush(self);
    }
}

/// Blocking file I/O moves off the async worker when the runtime allows it.
fn run_blocking<T>(work: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if matches!(handle.runtime_flavor(), RuntimeFlavor::MultiThread) => {
            tokio::task::block_in_place(work)
        }
        _ => work(),
    }
}

/// Build the sink selected by `[output]`.
pub fn build_row_sink(config: &OutputConfig) -> Result<Box<dyn RowSink>> {
    match config.format {
        OutputFormat::Console => Ok(Box::new(ConsoleSink::stdout())),
        OutputFormat::Jsonl => {
            let path = config
                .output_path()
                .context("output.path is required for jsonl output")?;
            info!(output = %path.display(), "configured json lines row sink");
            Ok(Box::new(JsonLinesSink::create(path)?))
        }
    }
}

fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or_default()
}
