//! Helpers related to tracing, used by main entrypoints

use std::fs::File;
use std::sync::Arc;

use anyhow::{Context, Result};
use camino::Utf8Path;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// Initialize tracing with the default configuration.
///
/// `RUST_LOG` takes precedence over `level`. When `log_file` is given, a
/// plain-text copy of every event is written there as well; that file is
/// what gets archived into the installed system.
pub fn initialize_tracing(level: &str, log_file: Option<&Utf8Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("Parsing log level {level}"))?;

    // Don't include timestamps and such on stderr; the journal and the
    // log file carry their own.
    let stderr_layer = tracing_subscriber::fmt::layer()
        .without_time()
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr);

    let file_layer = log_file
        .map(|path| -> Result<_> {
            if let Some(parent) = path.parent().filter(|p| !p.as_str().is_empty()) {
                std::fs::create_dir_all(parent).with_context(|| format!("Creating {parent}"))?;
            }
            let f = File::create(path).with_context(|| format!("Creating log file {path}"))?;
            Ok(tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(f)))
        })
        .transpose()?;

    // Only add journald when we're actually talking to it.
    let journald_layer = tracing_journald::layer()
        .ok()
        .map(|l| l.with_syslog_identifier(crate::NAME.to_owned()));

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .with(journald_layer)
        .try_init()
        .context("Initializing tracing")?;
    Ok(())
}
