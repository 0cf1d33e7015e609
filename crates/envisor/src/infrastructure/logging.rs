//! provides logging helpers

use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::FilterExt;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// Target of the structured violation records
pub const VIOLATION_TARGET: &str = "enforcement.violations";

fn is_violation(metadata: &tracing::Metadata<'_>) -> bool {
    metadata.target() == VIOLATION_TARGET
}

/// initiate the global tracing subscriber
///
/// Diagnostics go through the shared formatting layer. With `violation_log`
/// set, violation records are additionally written as JSON lines to a daily
/// rotated file at that path.
pub fn init(violation_log: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy();
    let fmt_layer = utils::logging::get_fmt_layer(std::env::var(utils::logging::LOG_PATH_ENV_VAR).ok())
        .with_filter(env_filter);

    let Some(violation_log) = violation_log else {
        registry().with(fmt_layer).try_init()?;
        return Ok(None);
    };

    let directory = violation_log.parent().unwrap_or_else(|| Path::new("."));
    let prefix = violation_log
        .file_name()
        .and_then(|name| name.to_str())
        .context("violation log path has no file name")?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .max_log_files(7)
        .build(directory)
        .context("failed to create violation log appender")?;
    let (file_writer, file_guard) = tracing_appender::non_blocking(appender);

    let violation_layer = layer()
        .json()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_filter(filter::filter_fn(is_violation).and(filter::LevelFilter::INFO));

    registry().with(fmt_layer).with(violation_layer).try_init()?;
    Ok(Some(file_guard))
}
