//! Logging setup: stderr plus an optional daily-rolling file.

use std::fs;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

use crate::config::LoggingConfig;

const LOG_FILE_PREFIX: &str = "worldsync.log";

/// Keeps the file writer alive; drop it last.
pub struct TelemetryGuard {
    _guard: Option<WorkerGuard>,
}

/// Build the filter. `RUST_LOG` wins over the configured level.
pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

pub fn init(config: &LoggingConfig) -> Result<TelemetryGuard> {
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    layers.push(Box::new(
        tracing_subscriber::fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_ansi(config.ansi)
            .with_target(true),
    ));

    let mut guard = None;
    if let Some(dir) = &config.directory {
        fs::create_dir_all(dir)
            .with_context(|| format!("log dir init failed for {}", dir.display()))?;
        let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
        let (writer, worker) = tracing_appender::non_blocking(appender);
        layers.push(Box::new(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true),
        ));
        guard = Some(worker);
    }

    layers.push(Box::new(env_filter(&config.level)));

    Registry::default()
        .with(layers)
        .try_init()
        .context("tracing subscriber already installed")?;

    Ok(TelemetryGuard { _guard: guard })
}
