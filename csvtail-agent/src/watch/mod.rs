//! Polling loops that turn files into rows.
//!
//! Each loop owns its state exclusively and runs its ticks strictly in
//! sequence. The sleep between ticks is the only point where a loop can be
//! cancelled; a tick that has started always runs to completion.

pub mod append;
pub mod latest;

pub use append::AppendWatch;
pub use latest::{LatestWatch, WatchState};

use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// What a single tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Append mode could not open the followed file.
    NotOpen,
    /// Latest mode found no matching file.
    NoMatch,
    /// Nothing new since the previous tick.
    Unchanged,
    /// Rows were handed to the sink.
    Delivered { lines: usize, rows: usize },
    /// The parser rejected the chunk; it was dropped.
    ParseFailed { lines: usize },
    /// Latest mode could not read the selected file; it is retried next tick.
    ReadFailed,
}

/// Wait for `duration` unless `cancel_token` fires first. Returns true when
/// cancelled. A zero duration only yields to the scheduler.
pub async fn sleep_or_cancel(duration: Duration, cancel_token: &CancellationToken) -> bool {
    if duration.is_zero() {
        tokio::task::yield_now().await;
        return cancel_token.is_cancelled();
    }
    tokio::select! {
        biased;
        _ = cancel_token.cancelled() => true,
        _ = sleep(duration) => false,
    }
}
