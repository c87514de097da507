mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "coderunner-cli")]
#[command(about = "CodeRunner CLI - Validate questions, submit jobs and inspect outcomes", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a question or job file without queueing it
    Validate {
        /// Path to a question JSON file (a job file also works)
        path: String,
    },

    /// Queue a job file for grading
    Submit {
        /// Path to a job JSON file ({question, submission, test_cases, is_precheck})
        path: String,

        /// Wait for the worker and print the outcome
        #[arg(short, long, default_value = "false")]
        wait: bool,

        /// Seconds to wait before giving up
        #[arg(short, long, default_value = "60")]
        timeout: u64,
    },

    /// Show the outcome of a submitted job
    #[command(name = "result")]
    Outcome {
        /// Job id printed by `submit`
        job_id: String,

        /// Print the raw outcome JSON
        #[arg(long, default_value = "false")]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { path } => {
            commands::validate_question(&path).await?;
        }
        Commands::Submit { path, wait, timeout } => {
            commands::submit_job(&path, wait, timeout).await?;
        }
        Commands::Outcome { job_id, json } => {
            commands::show_result(&job_id, json).await?;
        }
    }

    Ok(())
}
