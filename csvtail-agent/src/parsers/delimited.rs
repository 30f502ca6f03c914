//! Delimited-text parser built on the `csv` crate.

use crate::config::ParserConfig;
use crate::parsers::TableParser;
use anyhow::{Context, Result};
use csv::{ReaderBuilder, StringRecord, Terminator, Trim};

#[derive(Debug, Clone)]
pub struct CsvParser {
    delimiter: u8,
    flexible: bool,
    trim: bool,
}

impl Default for CsvParser {
    fn default() -> Self {
        Self {
            delimiter: b',',
            flexible: true,
            trim: false,
        }
    }
}

impl CsvParser {
    pub fn new(delimiter: u8) -> Self {
        Self {
            delimiter,
            ..Self::default()
        }
    }

    /// Build from validated configuration.
    pub fn from_config(config: &ParserConfig) -> Result<Self> {
        Ok(Self {
            delimiter: config.delimiter_byte()?,
            flexible: config.flexible,
            trim: config.trim,
        })
    }

    pub fn flexible(mut self, flexible: bool) -> Self {
        self.flexible = flexible;
        self
    }

    pub fn trim(mut self, trim: bool) -> Self {
        self.trim = trim;
        self
    }
}

impl CsvParser {
    fn line_reader_builder(&self) -> ReaderBuilder {
        let mut builder = ReaderBuilder::new();
        builder
            .has_headers(false)
            .delimiter(self.delimiter)
            .flexible(true)
            .terminator(Terminator::Any(b'\n'))
            .trim(if self.trim { Trim::All } else { Trim::None });
        builder
    }
}

/// Each physical line is parsed as its own record, so a stray quote never
/// pulls the following lines into one cell.
impl TableParser for CsvParser {
    fn parse_rows(&self, chunk: &[u8], has_header: bool) -> Result<Vec<Vec<String>>> {
        let builder = self.line_reader_builder();
        let mut record = StringRecord::new();
        let mut header_pending = has_header;
        let mut expected_fields = None;
        let mut rows = Vec::new();

        for line in chunk.split(|byte| *byte == b'\n') {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.is_empty() {
                continue;
            }

            let index = rows.len();
            let mut reader = builder.from_reader(line);
            let found = reader
                .read_record(&mut record)
                .with_context(|| format!("malformed record at row {index}"))?;
            if !found {
                continue;
            }

            if !self.flexible {
                let expected = *expected_fields.get_or_insert(record.len());
                if record.len() != expected {
                    anyhow::bail!(
                        "malformed record at row {index}: expected {expected} fields, found {}",
                        record.len()
                    );
                }
            }
            if header_pending {
                header_pending = false;
                continue;
            }
            rows.push(record.iter().map(str::to_owned).collect());
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|cell| cell.to_string()).collect()
    }

    #[test]
    fn headerless_chunk_yields_every_line() {
        let rows = CsvParser::default()
            .parse_rows(b"1,2\n3,4\n", false)
            .expect("parse");
        assert_eq!(rows, vec![row(&["1", "2"]), row(&["3", "4"])]);
    }

    #[test]
    fn header_row_is_not_returned() {
        let rows = CsvParser::default()
            .parse_rows(b"h1,h2\n1,2\n", true)
            .expect("parse");
        assert_eq!(rows, vec![row(&["1", "2"])]);
    }

    #[test]
    fn quoted_cells_and_custom_delimiter() {
        let rows = CsvParser::new(b';')
            .parse_rows(b"\"a;b\";c\n", false)
            .expect("parse");
        assert_eq!(rows, vec![row(&["a;b", "c"])]);
    }

    #[test]
    fn flexible_allows_ragged_rows() {
        let rows = CsvParser::default()
            .parse_rows(b"1,2,3\n4\n", false)
            .expect("parse");
        assert_eq!(rows, vec![row(&["1", "2", "3"]), row(&["4"])]);
    }

    #[test]
    fn strict_mode_rejects_ragged_rows() {
        let err = CsvParser::default()
            .flexible(false)
            .parse_rows(b"1,2\n3\n", false)
            .expect_err("ragged row should fail");
        assert!(err.to_string().contains("malformed record at row 1"));
    }

    #[test]
    fn trim_strips_cell_whitespace() {
        let rows = CsvParser::default()
            .trim(true)
            .parse_rows(b" a , b \n", false)
            .expect("parse");
        assert_eq!(rows, vec![row(&["a", "b"])]);
    }

    #[test]
    fn unbalanced_quote_stops_at_line_end() {
        let parser = CsvParser::default();
        let whole = parser.parse_rows(b"1,\"abc\n2,3\n", false).expect("parse");
        let mut split = parser.parse_rows(b"1,\"abc\n", false).expect("parse");
        split.extend(parser.parse_rows(b"2,3\n", false).expect("parse"));

        assert_eq!(whole, vec![row(&["1", "abc"]), row(&["2", "3"])]);
        assert_eq!(whole, split);
        assert!(whole.iter().flatten().all(|cell| !cell.contains('\n')));
    }

    #[test]
    fn crlf_and_blank_lines_are_not_rows() {
        let rows = CsvParser::default()
            .parse_rows(b"a,b\r\n\r\n\nc,d\r\n", false)
            .expect("parse");
        assert_eq!(rows, vec![row(&["a", "b"]), row(&["c", "d"])]);
    }

    #[test]
    fn header_counts_toward_strict_field_width() {
        let err = CsvParser::default()
            .flexible(false)
            .parse_rows(b"h1,h2\n1\n", true)
            .expect_err("row narrower than header");
        assert!(err.to_string().contains("malformed record at row 0"));
    }

    #[test]
    fn empty_chunk_has_no_rows() {
        let rows = CsvParser::default().parse_rows(b"", false).expect("parse");
        assert!(rows.is_empty());
    }
}
