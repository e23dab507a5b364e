//! Log setup: daily rolling files under `<root>/logs`, plus stderr when
//! `TETHER_DEBUG_LOG` is set.
//!
//! stdout is reserved for command output (JSON lines), so nothing here
//! writes to it.

use std::env;

use fs_err as fs;
use tether_core::StorageConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const LOG_FILE_PREFIX: &str = "tether.log";

fn debug_enabled() -> bool {
    env::var("TETHER_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false)
}

fn stderr_layer<S>(debug: bool) -> Option<impl tracing_subscriber::Layer<S>>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    debug.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
    })
}

/// Keep the returned guard alive for the life of the process; dropping it
/// flushes buffered lines.
pub fn init(storage: &StorageConfig) -> Option<WorkerGuard> {
    let debug = debug_enabled();
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let logs_dir = storage.logs_dir();
    if let Err(err) = fs::create_dir_all(&logs_dir) {
        // Still usable without a file sink.
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer(debug))
            .try_init();
        tracing::warn!(error = %err, path = %logs_dir.display(), "Log directory unavailable");
        return None;
    }

    let appender = tracing_appender::rolling::daily(&logs_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false);

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer(debug))
        .try_init();
    Some(guard)
}
