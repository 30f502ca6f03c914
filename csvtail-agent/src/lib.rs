//! Poll-based ingestion of CSV rows from files that grow, get truncated, get
//! rotated, or are superseded by newer files.
//!
//! Two watch modes are provided:
//! - [`watch::AppendWatch`] follows one path with a rotation-aware
//!   [`tailer::TailCursor`] and delivers each newly completed row once.
//! - [`watch::LatestWatch`] re-reads the newest `<prefix>*.csv` in a directory
//!   whenever the selection or its modification time changes.

pub mod config;
pub mod metrics;
pub mod parsers;
pub mod runner;
pub mod selector;
pub mod sink;
pub mod tailer;
pub mod watch;
