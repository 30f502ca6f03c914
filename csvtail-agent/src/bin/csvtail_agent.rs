//! csvtail-agent - follow CSV files and print or persist every new row.

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser};
use csvtail_agent::config::Config;
use csvtail_agent::runner::{self, Mode};
use std::path::PathBuf;

const CONFIG_ENV: &str = "CSVTAIL_AGENT_CONFIG";

#[derive(Parser, Debug)]
#[command(
    name = "csvtail-agent",
    version,
    about = "Poll CSV files and emit their rows",
    group(ArgGroup::new("mode").required(true).args(["append", "latest"]))
)]
struct Cli {
    /// Follow FILE and emit each newly appended row.
    #[arg(short = 'a', long = "append", value_name = "FILE")]
    append: Option<PathBuf>,

    /// Re-read the newest DIR/PREFIX*.csv whenever it changes.
    #[arg(short = 'n', long = "latest", num_args = 2, value_names = ["DIR", "PREFIX"])]
    latest: Option<Vec<String>>,

    /// TOML configuration file (defaults to $CSVTAIL_AGENT_CONFIG, then built-in defaults).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Seconds between polls; overrides watcher.poll_interval_secs.
    #[arg(long, value_name = "SECS")]
    interval: Option<u64>,
}

impl Cli {
    fn mode(&self) -> Result<Mode> {
        if let Some(file) = &self.append {
            return Ok(Mode::Append { file: file.clone() });
        }
        match self.latest.as_deref() {
            Some([dir, prefix]) => Ok(Mode::Latest {
                dir: PathBuf::from(dir),
                prefix: prefix.clone(),
            }),
            _ => anyhow::bail!("exactly one of -a <FILE> or -n <DIR> <PREFIX> is required"),
        }
    }

    fn config_path(&self) -> Option<PathBuf> {
        self.config
            .clone()
            .or_else(|| std::env::var(CONFIG_ENV).ok().map(PathBuf::from))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();
    runner::install_failure_hook();

    let mut config = match cli.config_path() {
        Some(path) => Config::load(&path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(interval) = cli.interval {
        config.watcher.poll_interval_secs = interval;
    }

    runner::run(&config, cli.mode()?).await
}

fn init_tracing() {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
