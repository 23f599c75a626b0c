use clap::ValueEnum;
use std::{fmt, fmt::Display};
use tracing_subscriber::{registry::LookupSpan, EnvFilter, Layer};

pub(crate) type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync>;

/// How log lines are rendered on stdout.
#[derive(Debug, Copy, Clone, ValueEnum, Eq, PartialEq, Default)]
pub enum LogFormat {
    /// One JSON object per event, for log shippers.
    Json,

    /// `key=value` pairs.
    #[value(name = "logfmt")]
    LogFmt,

    /// Human readable lines.
    #[default]
    Terminal,
}

impl LogFormat {
    /// Builds the stdout layer in this format behind the filter.
    ///
    /// Targets are only shown when the filter enables levels more verbose than `INFO`, unless
    /// `RUST_LOG_TARGET` says otherwise.
    pub(crate) fn apply<S>(&self, filter: EnvFilter, ansi: bool) -> BoxedLayer<S>
    where
        S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    {
        let target = std::env::var("RUST_LOG_TARGET")
            // `RUST_LOG_TARGET` always overrides default behaviour
            .map(|val| val != "0")
            .unwrap_or_else(|_| {
                filter.max_level_hint().map_or(true, |max_level| max_level > tracing::Level::INFO)
            });

        match self {
            LogFormat::Json => tracing_subscriber::fmt::layer()
                .json()
                .with_ansi(ansi)
                .with_target(target)
                .with_filter(filter)
                .boxed(),
            LogFormat::LogFmt => tracing_logfmt::layer().with_filter(filter).boxed(),
            LogFormat::Terminal => tracing_subscriber::fmt::layer()
                .with_ansi(ansi)
                .with_target(target)
                .with_filter(filter)
                .boxed(),
        }
    }
}

impl Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Json => "json",
            Self::LogFmt => "logfmt",
            Self::Terminal => "terminal",
        };
        f.write_str(name)
    }
}
