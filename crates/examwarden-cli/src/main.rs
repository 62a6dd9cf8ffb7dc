//! examwarden CLI — runs timed assessments against the backend.

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand, ValueEnum};

mod commands;

#[derive(Parser)]
#[command(name = "examwarden", version, about = "Timed, sectioned assessment runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Output format for query commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Table,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Take an assessment, answering from an answer sheet
    Take {
        /// Answer sheet TOML
        #[arg(long)]
        answers: PathBuf,

        /// Question set to take (defaults to the sheet's set_id)
        #[arg(long)]
        set_id: Option<i64>,

        /// Config file path
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Check whether an assessment can be started or resumed
    Eligibility {
        /// Question set id
        #[arg(long)]
        set_id: i64,

        /// Output format
        #[arg(long, value_enum, default_value = "table")]
        format: Format,

        /// Config file path
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Show the backend timer of a session
    Status {
        /// Session id
        #[arg(long)]
        session: i64,

        /// Output format
        #[arg(long, value_enum, default_value = "table")]
        format: Format,

        /// Config file path
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Validate an answer sheet
    Validate {
        /// Answer sheet TOML
        #[arg(long)]
        answers: PathBuf,
    },

    /// Create a starter config and answer sheet
    Init,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("examwarden=info".parse().unwrap()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Take {
            answers,
            set_id,
            config,
        } => commands::take::execute(answers, set_id, config).await,
        Commands::Eligibility {
            set_id,
            format,
            config,
        } => commands::eligibility::execute(set_id, format, config).await,
        Commands::Status {
            session,
            format,
            config,
        } => commands::status::execute(session, format, config).await,
        Commands::Validate { answers } => commands::validate::execute(answers),
        Commands::Init => commands::init::execute(),
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}
