//! provides logging helpers

use std::env;
use std::path::Path;

use tracing::Subscriber;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// When set, log lines go to a daily rotated file at this path instead of stderr.
pub const LOG_PATH_ENV_VAR: &str = "ENVISOR_LOG_PATH";

/// Returns the formatting layer shared by every binary of the workspace.
pub fn get_fmt_layer<S>(log_path: Option<String>) -> Box<dyn Layer<S> + Send + Sync + 'static>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    match log_path {
        Some(log_path) => {
            let path = Path::new(&log_path);
            let directory = path.parent().unwrap_or_else(|| Path::new("."));
            let prefix = path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or("envisor.log");
            let appender = tracing_appender::rolling::daily(directory, prefix);

            layer()
                .with_writer(appender)
                .with_ansi(false)
                .with_target(true)
                .boxed()
        }
        None => layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed(),
    }
}

/// initiate the global tracing subscriber
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init() {
    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy();

    let fmt_layer = get_fmt_layer(env::var(LOG_PATH_ENV_VAR).ok()).with_filter(env_filter);

    let _ = registry().with(fmt_layer).try_init();
}
