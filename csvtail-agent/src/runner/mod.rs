//! Process-level supervision of watch loops.
//!
//! The [`Supervisor`] owns every spawned loop and the token that stops them.
//! Loops observe cancellation only while sleeping between ticks, so shutdown
//! never interrupts a read, a parse or a row delivery halfway.

pub mod metrics_server;

use crate::config::{Config, ParserConfig};
use crate::parsers::{CsvParser, TableParser};
use crate::sink::build_row_sink;
use crate::watch::{AppendWatch, LatestWatch};
use anyhow::Result;
use std::path::PathBuf;
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Which watch loop the process runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Append { file: PathBuf },
    Latest { dir: PathBuf, prefix: String },
}

pub struct Supervisor {
    cancel_token: CancellationToken,
    loops: Vec<(String, JoinHandle<()>)>,
    shutdown_timeout: Duration,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            loops: Vec::new(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn loop_count(&self) -> usize {
        self.loops.len()
    }

    pub fn spawn_append(&mut self, watch: AppendWatch) {
        let name = format!("append:{}", watch.path().display());
        let handle = tokio::spawn(watch.run(self.cancel_token.clone()));
        self.loops.push((name, handle));
    }

    pub fn spawn_latest(&mut self, watch: LatestWatch) {
        let name = format!("latest:{}", watch.dir().display());
        let handle = tokio::spawn(watch.run(self.cancel_token.clone()));
        self.loops.push((name, handle));
    }

    /// Block until Ctrl-C, then stop every loop.
    pub async fn run_until_shutdown(self) -> Result<()> {
        info!(loop_count = self.loops.len(), "csvtail-agent started");

        let mut shutdown_reason = "signal";
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    error!(error = %err, "failed while waiting for shutdown signal");
                    shutdown_reason = "signal listener failed";
                }
            }
            _ = self.cancel_token.cancelled() => {
                shutdown_reason = "cancelled";
            }
        }

        info!(reason = shutdown_reason, "initiating shutdown");
        self.shutdown().await;
        Ok(())
    }

    /// Cancel all loops and wait for each, aborting those that overrun the timeout.
    pub async fn shutdown(self) {
        self.cancel_token.cancel();

        for (name, mut handle) in self.loops {
            let timeout = sleep(self.shutdown_timeout);
            tokio::pin!(timeout);

            let result = tokio::select! {
                res = &mut handle => Some(res),
                _ = &mut timeout => None,
            };

            match result {
                Some(Ok(())) => info!(watch = %name, "watch loop stopped"),
                Some(Err(err)) => {
                    warn!(watch = %name, error = %err, "watch loop exited abnormally")
                }
                None => {
                    warn!(watch = %name, "watch loop did not stop within timeout; aborting");
                    handle.abort();
                }
            }
        }
    }
}

pub fn build_parser(config: &ParserConfig) -> Result<Arc<dyn TableParser>> {
    Ok(Arc::new(CsvParser::from_config(config)?))
}

/// Validate everything, start the loop for `mode`, and run until shutdown.
pub async fn run(config: &Config, mode: Mode) -> Result<()> {
    config.validate()?;
    let parser = build_parser(&config.parser)?;
    let sink = build_row_sink(&config.output)?;

    let mut supervisor = Supervisor::new();
    if let Some(listen_addr) = config.metrics.listen_addr.as_deref() {
        let listener = metrics_server::bind(listen_addr).await?;
        tokio::spawn(metrics_server::serve(listener, supervisor.cancel_token()));
    }

    match mode {
        Mode::Append { file } => {
            let watch = AppendWatch::new(file, &config.watcher, parser, sink)?;
            supervisor.spawn_append(watch);
        }
        Mode::Latest { dir, prefix } => {
            let watch = LatestWatch::new(dir, prefix, &config.watcher, parser, sink)?;
            supervisor.spawn_latest(watch);
        }
    }

    supervisor.run_until_shutdown().await
}

/// Route panics through tracing before the default hook runs. Idempotent.
pub fn install_failure_hook() {
    static INSTALLED: Once = Once::new();
    INSTALLED.call_once(chain_failure_hook);
}

fn chain_failure_hook() {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()))
            .unwrap_or_else(|| "unknown".to_string());
        let payload = info
            .payload()
            .downcast_ref::<&str>()
            .map(|msg| msg.to_string())
            .or_else(|| info.payload().downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        error!(%location, %payload, "panic");
        previous(info);
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WatcherConfig;
    use crate::sink::RowSink;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    fn counting_sink() -> (Box<dyn RowSink>, Arc<Mutex<usize>>) {
        let count = Arc::new(Mutex::new(0usize));
        let target = count.clone();
        let sink = move |_: &Path, _: &[String]| {
            *target.lock().expect("sink lock") += 1;
        };
        (Box::new(sink), count)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn supervisor_runs_both_modes_and_stops_them() {
        let dir = tempfile::tempdir().expect("tempdir");
        let followed = dir.path().join("follow.csv");
        std::fs::write(&followed, "h\n1\n2\n").expect("write followed");
        std::fs::write(dir.path().join("snap_1.csv"), "a\nb\nc\n").expect("write snapshot");

        let watcher = WatcherConfig {
            poll_interval_secs: 0,
            ..WatcherConfig::default()
        };
        let parser: Arc<dyn TableParser> = Arc::new(CsvParser::default());

        let (append_sink, appended) = counting_sink();
        let (latest_sink, snapshots) = counting_sink();

        let mut supervisor = Supervisor::new().with_shutdown_timeout(Duration::from_secs(5));
        supervisor.spawn_append(
            AppendWatch::new(&followed, &watcher, parser.clone(), append_sink).expect("append"),
        );
        supervisor.spawn_latest(
            LatestWatch::new(dir.path(), "snap_", &watcher, parser, latest_sink).expect("latest"),
        );
        assert_eq!(supervisor.loop_count(), 2);

        let wait = async {
            loop {
                let done_append = *appended.lock().expect("lock") >= 2;
                let done_latest = *snapshots.lock().expect("lock") >= 3;
                if done_append && done_latest {
                    break;
                }
                sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(10), wait)
            .await
            .expect("both loops delivered");

        let token = supervisor.cancel_token();
        tokio::time::timeout(Duration::from_secs(10), supervisor.shutdown())
            .await
            .expect("shutdown completes");
        assert!(token.is_cancelled());

        assert_eq!(*appended.lock().expect("lock"), 2);
        assert_eq!(*snapshots.lock().expect("lock"), 3);
    }

    #[tokio::test]
    async fn cancelled_token_ends_run_until_shutdown() {
        let supervisor = Supervisor::new();
        supervisor.cancel_token().cancel();
        tokio::time::timeout(Duration::from_secs(5), supervisor.run_until_shutdown())
            .await
            .expect("returns promptly")
            .expect("clean shutdown");
    }

    #[tokio::test]
    async fn run_rejects_invalid_configuration_before_spawning() {
        let mut config = Config::default();
        config.parser.delimiter = "||".to_string();
        let err = run(
            &config,
            Mode::Append {
                file: PathBuf::from("/tmp/never-opened.csv"),
            },
        )
        .await
        .expect_err("invalid delimiter");
        assert!(err.to_string().contains("delimiter"));
    }

    #[test]
    fn failure_hook_runs_previous_hook() {
        static PREVIOUS_RAN: AtomicBool = AtomicBool::new(false);

        let original = std::panic::take_hook();
        std::panic::set_hook(Box::new(|_| PREVIOUS_RAN.store(true, Ordering::SeqCst)));
        chain_failure_hook();

        let outcome = std::panic::catch_unwind(|| panic!("hook chain check"));

        drop(std::panic::take_hook());
        std::panic::set_hook(original);

        assert!(outcome.is_err());
        assert!(PREVIOUS_RAN.load(Ordering::SeqCst));
    }
}
