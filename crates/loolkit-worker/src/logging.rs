//! Logging re-initialization for the forked worker.
//!
//! The supervisor's logging configuration does not survive the fork, so
//! the worker rebuilds its subscriber from the environment:
//!
//! - `LOOL_LOGLEVEL`: filter directive (`trace` .. `error`), default
//!   `info`.
//! - `LOOL_LOGFILE` + `LOOL_LOGFILENAME`: when both are set, log to the
//!   named file instead of stderr.
//! - `LOOL_LOGCOLOR`: enable ANSI color on the writer.

use std::fs::OpenOptions;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

/// Initializes the global tracing subscriber from the `LOOL_*`
/// environment. Safe to call more than once; later calls are no-ops.
pub fn init_from_env() {
    let level = std::env::var("LOOL_LOGLEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"));
    let color = std::env::var_os("LOOL_LOGCOLOR").is_some();

    let log_file = std::env::var_os("LOOL_LOGFILE")
        .and_then(|_| std::env::var_os("LOOL_LOGFILENAME"))
        .and_then(|name| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&name)
                .map_err(|err| {
                    eprintln!("loolkit: cannot open log file {name:?}: {err}");
                })
                .ok()
        });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let result = match log_file {
        Some(file) => builder
            .with_ansi(false)
            .with_writer(Arc::new(file))
            .try_init(),
        None => builder.with_ansi(color).with_writer(std::io::stderr).try_init(),
    };
    // Already-set subscribers happen under test harnesses; keep going.
    let _ = result;
}
