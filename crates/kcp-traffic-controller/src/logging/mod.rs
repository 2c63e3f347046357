use std::{
    io::{Sink, sink},
    path::PathBuf,
};

use tracing_appender::rolling::RollingFileAppender;
use tracing_subscriber::{
    EnvFilter, Registry,
    fmt::{
        MakeWriter,
        writer::{EitherWriter, MakeWriterExt as _},
    },
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

pub mod controller;

/// Initializes `tracing` logging with options from the environment variable
/// given in the `env` parameter, e.g. `TRAFFIC_CONTROLLER_LOG`.
///
/// If the environment variable is not set (or cannot be parsed), the maximum log level is set to
/// INFO.
///
/// Log output can be copied to a file by setting `{env}_DIRECTORY` (e.g.
/// `TRAFFIC_CONTROLLER_LOG_DIRECTORY`) to a directory path. This file will be rotated regularly.
/// Calling this function more than once is a no-op.
pub fn initialize_logging(env: &str, app_name: &str) {
    let filter = EnvFilter::try_from_env(env)
        .unwrap_or_else(|_| EnvFilter::new(tracing::Level::INFO.to_string()));

    let file_appender_directory = std::env::var_os(format!("{env}_DIRECTORY")).map(PathBuf::from);
    let file_appender = file_appender_directory.as_deref().and_then(|log_dir| {
        RollingFileAppender::builder()
            .filename_suffix(format!("{app_name}.log"))
            .max_log_files(6)
            .build(log_dir)
            .inspect_err(|err| eprintln!("failed to initialize rolling file appender: {err}"))
            .ok()
    });
    let file_logging_enabled = file_appender.is_some();

    let fmt = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout.and(OptionalMakeWriter::from(file_appender)));

    if Registry::default().with(filter).with(fmt).try_init().is_err() {
        return;
    }

    // need to delay logging until after tracing is initialized
    match file_appender_directory {
        Some(dir) if file_logging_enabled => {
            tracing::info!(directory = %dir.display(), "file logging enabled");
        }
        _ => tracing::debug!("file logging disabled, because no usable log directory is set"),
    }
}

/// Like [`EitherWriter`] but implements [`MakeWriter`] instead of [`std::io::Write`].
/// For selecting writers depending on dynamic configuration.
enum EitherMakeWriter<A, B> {
    A(A),
    B(B),
}

impl<'a, A, B> MakeWriter<'a> for EitherMakeWriter<A, B>
where
    A: MakeWriter<'a>,
    B: MakeWriter<'a>,
{
    type Writer = EitherWriter<A::Writer, B::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        match self {
            Self::A(a) => EitherWriter::A(a.make_writer()),
            Self::B(b) => EitherWriter::B(b.make_writer()),
        }
    }

    fn make_writer_for(&'a self, meta: &tracing::Metadata<'_>) -> Self::Writer {
        match self {
            Self::A(a) => EitherWriter::A(a.make_writer_for(meta)),
            Self::B(b) => EitherWriter::B(b.make_writer_for(meta)),
        }
    }
}

type OptionalMakeWriter<T> = EitherMakeWriter<T, fn() -> Sink>;

impl<T> From<Option<T>> for OptionalMakeWriter<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(t) => Self::A(t),
            None => Self::B(sink),
        }
    }
}
