//! provides logging helpers

use std::path::Path;

use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

fn env_filter() -> filter::EnvFilter {
    filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy()
}

/// stderr layer shared by every binary of the workspace
pub fn get_fmt_layer<S>() -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    layer().with_writer(std::io::stderr).with_target(true)
}

/// initiate the global tracing subscriber
///
/// When `log_file` is set, logs are also written to a daily rolling file next
/// to it; keep the returned guard alive until exit so buffered lines get
/// flushed.
pub fn init<P: AsRef<Path>>(log_file: Option<P>) -> Option<WorkerGuard> {
    let fmt_layer = get_fmt_layer().with_filter(env_filter());

    let Some(log_file) = log_file else {
        registry().with(fmt_layer).init();
        return None;
    };

    let log_file = log_file.as_ref();
    let directory = log_file.parent().unwrap_or(Path::new("."));
    let prefix = log_file
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("fake-device-plugin.log");

    match RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .max_log_files(3)
        .build(directory)
    {
        Ok(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(env_filter());
            registry().with(fmt_layer).with(file_layer).init();
            Some(guard)
        }
        Err(e) => {
            registry().with(fmt_layer).init();
            tracing::warn!("failed to open log file {}: {}", log_file.display(), e);
            None
        }
    }
}
