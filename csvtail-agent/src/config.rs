use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub watcher: WatcherConfig,
    pub parser: ParserConfig,
    pub output: OutputConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WatcherConfig {
    /// Seconds between ticks. Zero busy-polls.
    pub poll_interval_secs: u64,
    /// Delay before retrying a file that could not be opened (append mode).
    pub open_retry_ms: u64,
    /// Consume the first line of every newly opened handle as a header (append mode).
    pub skip_header: bool,
    pub read_chunk_bytes: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ParserConfig {
    pub delimiter: String,
    pub trim: bool,
    pub flexible: bool,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Console,
    Jsonl,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct OutputConfig {
    pub format: OutputFormat,
    pub path: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct MetricsConfig {
    pub listen_addr: Option<String>,
}

const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
const DEFAULT_OPEN_RETRY_MS: u64 = 500;
const DEFAULT_SKIP_HEADER: bool = true;
const DEFAULT_READ_CHUNK_BYTES: usize = crate::tailer::DEFAULT_READ_CHUNK_BYTES;

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            open_retry_ms: DEFAULT_OPEN_RETRY_MS,
            skip_header: DEFAULT_SKIP_HEADER,
            read_chunk_bytes: DEFAULT_READ_CHUNK_BYTES,
        }
    }
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            delimiter: ",".to_string(),
            trim: false,
            flexible: true,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Config = toml::from_str(raw).context("failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.parser.delimiter_byte()?;
        if self.watcher.read_chunk_bytes == 0 {
            anyhow::bail!("watcher.read_chunk_bytes must be greater than zero");
        }
        if self.output.format == OutputFormat::Jsonl && self.output.output_path().is_none() {
            anyhow::bail!("output.path is required when output.format = \"jsonl\"");
        }
        Ok(())
    }
}

impl WatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn open_retry_delay(&self) -> Duration {
        Duration::from_millis(self.open_retry_ms)
    }
}

impl ParserConfig {
    pub fn delimiter_byte(&self) -> Result<u8> {
        match self.delimiter.as_bytes() {
            [byte] if byte.is_ascii() => Ok(*byte),
            _ => anyhow::bail!(
                "parser.delimiter must be a single ASCII character, got {:?}",
                self.delimiter
            ),
        }
    }
}

impl OutputConfig {
    pub fn output_path(&self) -> Option<PathBuf> {
        self.path
            .as_ref()
            .map(|raw| raw.trim())
            .filter(|raw| !raw.is_empty())
            .map(|raw| PathBuf::from(shellexpand::tilde(raw).as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = Config::from_toml("").expect("defaults are valid");
        assert_eq!(config.watcher.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.watcher.open_retry_delay(), Duration::from_millis(500));
        assert!(config.watcher.skip_header);
        assert_eq!(config.watcher.read_chunk_bytes, 64 * 1024);
        assert_eq!(config.parser.delimiter_byte().expect("comma"), b',');
        assert_eq!(config.output.format, OutputFormat::Console);
        assert!(config.metrics.listen_addr.is_none());
    }

    #[test]
    fn parses_full_document() {
        let config = Config::from_toml(
            r#"
            [watcher]
            poll_interval_secs = 0
            skip_header = false

            [parser]
            delimiter = ";"
            trim = true

            [output]
            format = "jsonl"
            path = "/var/lib/csvtail/rows.jsonl"

            [metrics]
            listen_addr = "127.0.0.1:9191"
            "#,
        )
        .expect("valid config");

        assert!(config.watcher.poll_interval().is_zero());
        assert!(!config.watcher.skip_header);
        assert_eq!(config.parser.delimiter_byte().expect("semicolon"), b';');
        assert!(config.parser.trim);
        assert!(config.parser.flexible);
        assert_eq!(config.output.format, OutputFormat::Jsonl);
        assert_eq!(
            config.output.output_path(),
            Some(PathBuf::from("/var/lib/csvtail/rows.jsonl"))
        );
        assert_eq!(config.metrics.listen_addr.as_deref(), Some("127.0.0.1:9191"));
    }

    #[test]
    fn rejects_multi_character_delimiter() {
        let err = Config::from_toml("[parser]\ndelimiter = \"::\"\n").expect_err("invalid");
        assert!(err.to_string().contains("single ASCII character"));
    }

    #[test]
    fn rejects_jsonl_without_path() {
        let err = Config::from_toml("[output]\nformat = \"jsonl\"\n").expect_err("invalid");
        assert!(err.to_string().contains("output.path"));
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = Config::load(dir.path().join("missing.toml")).expect_err("missing");
        assert!(err.to_string().contains("failed to read config"));
    }
}
