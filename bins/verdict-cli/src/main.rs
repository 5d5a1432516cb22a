mod commands;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use commands::SubmissionFiles;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "verdict-cli")]
#[command(about = "Verdict CLI - Judge submissions in isolate sandboxes and manage the queue", long_about = None)]
struct Cli {
    /// Language configuration file
    #[arg(long, global = true, default_value = "config/languages.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct SubmissionArgs {
    /// Language name as configured (e.g., c, cpp, python)
    #[arg(short, long)]
    language: String,

    /// Source file to judge
    #[arg(short, long)]
    source: PathBuf,

    /// File fed to the program's stdin
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Expected output; without it every clean run is accepted
    #[arg(short, long)]
    expected: Option<PathBuf>,

    /// Number of runs (defaults to NUMBER_OF_RUNS, then 1)
    #[arg(short, long)]
    runs: Option<u32>,
}

#[derive(Subcommand)]
enum Commands {
    /// Judge a submission locally and print the resulting record
    Judge {
        /// Submission id; also picks the sandbox slot under the modulo strategy
        #[arg(long, default_value = "1")]
        id: u64,

        #[command(flatten)]
        submission: SubmissionArgs,
    },

    /// Store a submission in Redis and queue it for the workers
    Submit {
        #[arg(long)]
        id: u64,

        /// Redis URL (defaults to REDIS_URL, then redis://127.0.0.1:6379)
        #[arg(long)]
        redis_url: Option<String>,

        #[command(flatten)]
        submission: SubmissionArgs,
    },

    /// Print a stored submission with its status
    Status {
        #[arg(long)]
        id: u64,

        #[arg(long)]
        redis_url: Option<String>,
    },

    /// List configured languages
    Languages,

    /// Print and validate the effective resource limits
    Limits,
}

fn files(id: u64, args: SubmissionArgs) -> SubmissionFiles {
    SubmissionFiles {
        id,
        language: args.language,
        source: args.source,
        input: args.input,
        expected: args.expected,
        runs: args.runs,
    }
}

fn redis_url(flag: Option<String>) -> String {
    flag.or_else(|| std::env::var("REDIS_URL").ok())
        .unwrap_or_else(|| "redis://127.0.0.1:6379".to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so stdout stays machine-readable
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Judge { id, submission } => {
            commands::judge(&cli.config, &files(id, submission)).await?;
        }
        Commands::Submit {
            id,
            redis_url: url,
            submission,
        } => {
            commands::submit(&cli.config, &redis_url(url), &files(id, submission)).await?;
        }
        Commands::Status { id, redis_url: url } => {
            commands::status(&redis_url(url), id).await?;
        }
        Commands::Languages => {
            commands::list_languages(&cli.config)?;
        }
        Commands::Limits => {
            commands::show_limits()?;
        }
    }

    Ok(())
}
