//! CLI definition and entrypoint to executable
use crate::commands::{config, node};
use clap::{ArgAction, Args, Parser, Subcommand};
use dos_tracing::{DosTracer, LayerInfo, LogFormat, Tracer};

/// Parse CLI options, set up logging and run the chosen command.
pub async fn run() -> eyre::Result<()> {
    let opt = Cli::parse();
    opt.logs.tracer(&opt.verbosity).init()?;

    match opt.command {
        Commands::Node(command) => command.execute().await,
        Commands::Config(command) => command.execute(),
    }
}

/// Commands to be executed
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start the node
    #[command(name = "node")]
    Node(node::Command),
    /// Print the configuration
    #[command(name = "config")]
    Config(config::Command),
}

#[derive(Debug, Parser)]
#[command(author, version, about = "dos", long_about = None)]
struct Cli {
    /// The command to run
    #[clap(subcommand)]
    command: Commands,

    #[clap(flatten)]
    logs: Logs,

    #[clap(flatten)]
    verbosity: Verbosity,
}

#[derive(Debug, Args)]
#[command(next_help_heading = "Logging")]
struct Logs {
    /// The format of the logs written to stdout.
    #[arg(long = "log.stdout.format", value_name = "FORMAT", global = true, value_enum, default_value_t = LogFormat::Terminal)]
    format: LogFormat,

    /// Additional filter directives, e.g. `sync::downloader=debug,les=trace`.
    #[arg(long = "log.stdout.filter", value_name = "FILTER", global = true, default_value = "")]
    filter: String,

    /// Disable colors in terminal output.
    #[arg(long = "log.no-color", global = true)]
    no_color: bool,
}

impl Logs {
    fn tracer(&self, verbosity: &Verbosity) -> DosTracer {
        DosTracer::new().with_stdout(LayerInfo::new(
            self.format,
            verbosity.directive().to_string(),
            self.filter.clone(),
            !self.no_color,
        ))
    }
}

#[derive(Debug, Args)]
#[command(next_help_heading = "Display")]
struct Verbosity {
    /// Set the minimum log level.
    ///
    /// -v      Errors
    /// -vv     Warnings
    /// -vvv    Info
    /// -vvvv   Debug
    /// -vvvvv  Traces (warning: very verbose!)
    #[clap(short, long, action = ArgAction::Count, global = true, default_value_t = 3, verbatim_doc_comment, help_heading = "Display")]
    verbosity: u8,

    /// Silence all log output.
    #[clap(long, alias = "silent", short = 'q', global = true, help_heading = "Display")]
    quiet: bool,
}

impl Verbosity {
    /// The default filter directive of the chosen verbosity.
    fn directive(&self) -> &'static str {
        if self.quiet {
            return "off"
        }
        match self.verbosity {
            0 | 1 => "error",
            2 => "warn",
            3 => "info",
            4 => "debug",
            _ => "trace",
        }
    }
}
