//!  The `tracing` module provides functionalities for setting up and configuring logging.
//!
//!  The module's primary entry point is the [`DosTracer`] struct, which writes to stdout in one
//!  of the [`LogFormat`]s, filtered by `RUST_LOG` style directives.
//!
//!  # Examples
//!
//!  ```
//!  use dos_tracing::{DosTracer, LayerInfo, LogFormat, Tracer};
//!
//!  fn main() -> eyre::Result<()> {
//!      let tracer = DosTracer::new().with_stdout(LayerInfo::new(
//!          LogFormat::Json,
//!          "info".to_string(),
//!          "sync::downloader=debug".to_string(),
//!          false,
//!      ));
//!
//!      tracer.init()?;
//!
//!      // Your application logic here
//!
//!      Ok(())
//!  }
//!  ```

#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]

// Re-export tracing crates
pub use tracing;
pub use tracing_subscriber;

pub use formatter::LogFormat;

mod formatter;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Tracer for application logging.
#[derive(Debug, Clone, Default)]
pub struct DosTracer {
    stdout: LayerInfo,
}

impl DosTracer {
    /// Constructs a new `Tracer` with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a custom configuration for the stdout layer.
    pub fn with_stdout(mut self, config: LayerInfo) -> Self {
        self.stdout = config;
        self
    }
}

/// Configuration for a logging layer.
///
/// This struct holds configuration parameters for a tracing layer, including
/// the format, filtering directives and coloring.
#[derive(Debug, Clone)]
pub struct LayerInfo {
    format: LogFormat,
    default_directive: String,
    filters: String,
    color: bool,
}

impl LayerInfo {
    /// Constructs a new `LayerInfo`.
    ///
    /// `default_directive` applies to everything `filters` does not mention, both follow the
    /// `RUST_LOG` syntax.
    pub fn new(format: LogFormat, default_directive: String, filters: String, color: bool) -> Self {
        Self { format, default_directive, filters, color }
    }

    fn env_filter(&self) -> eyre::Result<EnvFilter> {
        let mut filter = EnvFilter::try_new(&self.default_directive)?;
        for directive in self.filters.split(',').map(str::trim).filter(|d| !d.is_empty()) {
            filter = filter.add_directive(directive.parse()?);
        }
        Ok(filter)
    }
}

impl Default for LayerInfo {
    /// Terminal format at `info`, colored.
    fn default() -> Self {
        Self {
            format: LogFormat::Terminal,
            default_directive: "info".to_string(),
            filters: String::new(),
            color: true,
        }
    }
}

/// Trait defining a general interface for logging configuration.
pub trait Tracer {
    /// Initialize the logging configuration.
    ///
    /// Fails if the filter directives are invalid or a global subscriber is already installed.
    fn init(self) -> eyre::Result<()>;
}

impl Tracer for DosTracer {
    fn init(self) -> eyre::Result<()> {
        let filter = self.stdout.env_filter()?;
        let layer = self.stdout.format.apply::<Registry>(filter, self.stdout.color);
        tracing_subscriber::registry().with(layer).try_init()?;
        Ok(())
    }
}

/// Installs a subscriber writing through the test harness, filtered by `RUST_LOG`.
///
/// Does nothing if a subscriber is already installed, so every test may call it.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
