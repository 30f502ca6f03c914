//! Tabular parsing behind the watch loops.
//!
//! The watch loops never split cells themselves. They hand a text chunk to a
//! [`TableParser`] and forward whatever rows it returns, in order.

use anyhow::Result;

pub mod delimited;

pub use delimited::CsvParser;

pub const UTF8_BOM: [u8; 3] = [0xEF, 0xBB, 0xBF];
pub const LINE_PREVIEW_LIMIT: usize = 256;

/// Converts a chunk of text into rows of string cells.
///
/// # Examples
///
/// ```
/// # use anyhow::Result;
/// use csvtail_agent::parsers::{CsvParser, TableParser};
///
/// # fn demo() -> Result<()> {
/// let parser = CsvParser::default();
/// let rows = parser.parse_rows(b"h1,h2\n1,2\n", true)?;
/// assert_eq!(rows, vec![vec!["1".to_string(), "2".to_string()]]);
/// # Ok(())
/// # }
/// # demo().unwrap();
/// ```
pub trait TableParser: Send + Sync {
    /// Parse `chunk` into rows, preserving source order.
    ///
    /// With `has_header` set the first line is treated as column names and is
    /// not returned. Any malformed record fails the whole chunk, so callers
    /// never forward a partial result.
    fn parse_rows(&self, chunk: &[u8], has_header: bool) -> Result<Vec<Vec<String>>>;
}

/// Remove a leading UTF-8 byte-order mark, if any.
pub fn strip_bom(data: &[u8]) -> &[u8] {
    data.strip_prefix(UTF8_BOM.as_slice()).unwrap_or(data)
}

/// Truncated, lossy rendering of a chunk for log lines.
pub fn line_preview(data: &[u8], limit: usize) -> String {
    let text = String::from_utf8_lossy(data);
    let mut preview = String::new();
    for (idx, ch) in text.chars().enumerate() {
        if idx >= limit {
            preview.push('…');
            return preview;
        }
        preview.push(ch);
    }
    preview
}
