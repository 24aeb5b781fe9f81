//! NLP phenotype pipeline worker main executable

pub mod common;
pub mod conf;
pub mod err;
pub mod jobs;
pub mod runs;
pub mod terms;

use clap::{Args, Parser, Subcommand};
use console::{Emoji, Term};

/// CLI parser based on clap.
#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "NLP phenotype pipeline heavy lifting",
    long_about = "This tool filters NLP-derived phenotype terms and runs the variant prioritization jobs"
)]
struct Cli {
    /// Commonly used arguments
    #[command(flatten)]
    common: common::Args,

    /// The sub command to run
    #[command(subcommand)]
    command: Commands,
}

/// Enum supporting the parsing of top-level commands.
#[derive(Debug, Subcommand)]
enum Commands {
    /// Phenotype term related commands.
    Terms(Terms),
    /// Scoring job related commands.
    Jobs(Jobs),
}

/// Parsing of "terms *" sub commands.
#[derive(Debug, Args)]
#[command(args_conflicts_with_subcommands = true)]
struct Terms {
    /// The sub command to run
    #[command(subcommand)]
    command: TermsCommands,
}

/// Enum supporting the parsing of "terms *" sub commands.
#[derive(Debug, Subcommand)]
enum TermsCommands {
    Combine(terms::combine::Args),
    Filter(terms::filter::Args),
    FilterAll(terms::filter_all::Args),
}

/// Parsing of "jobs *" sub commands.
#[derive(Debug, Args)]
#[command(args_conflicts_with_subcommands = true)]
struct Jobs {
    /// The sub command to run
    #[command(subcommand)]
    command: JobsCommands,
}

/// Enum supporting the parsing of "jobs *" sub commands.
#[derive(Debug, Subcommand)]
enum JobsCommands {
    Dispatch(jobs::dispatch::Args),
    Run(jobs::worker::Args),
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    // Build a tracing subscriber according to the configuration in `cli.common`.
    let collector = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(match cli.common.verbose.log_level() {
            Some(level) => match level {
                log::Level::Error => tracing::Level::ERROR,
                log::Level::Warn => tracing::Level::WARN,
                log::Level::Info => tracing::Level::INFO,
                log::Level::Debug => tracing::Level::DEBUG,
                log::Level::Trace => tracing::Level::TRACE,
            },
            None => tracing::Level::INFO,
        })
        .compact()
        .finish();

    // Install collector globally so that logs from Rayon worker threads show.
    tracing::subscriber::set_global_default(collector)?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    // Go into sub commands.
    let term = Term::stderr();
    match &cli.command {
        Commands::Terms(terms) => match &terms.command {
            TermsCommands::Combine(args) => {
                runtime.block_on(terms::combine::run(&cli.common, args))?;
            }
            TermsCommands::Filter(args) => {
                terms::filter::run(&cli.common, args)?;
            }
            TermsCommands::FilterAll(args) => {
                runtime.block_on(terms::filter_all::run(&cli.common, args))?;
            }
        },
        Commands::Jobs(jobs) => match &jobs.command {
            JobsCommands::Dispatch(args) => jobs::dispatch::run(&cli.common, args)?,
            JobsCommands::Run(args) => runtime.block_on(jobs::worker::run(&cli.common, args))?,
        },
    }
    term.write_line(&format!("All done. Have a nice day!{}", Emoji(" 😃", "")))?;

    Ok(())
}
