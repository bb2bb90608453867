//! Weft command-line interface
//!
//! `weft run <query>` starts a research run, `weft continue <run_id>`
//! resumes an interrupted one, `weft replay <run_id>` streams a run's
//! events to stdout. Exit codes: 0 complete, 2 partial report, 1 fatal.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use weft::{EngineConfig, Orchestrator, RunStatus};

#[derive(Parser)]
#[command(name = "weft", version, about = "Open-ended deep research engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a research run for a query.
    Run {
        /// The research question.
        query: Option<String>,
        /// Read the research question from a file instead.
        #[arg(long, conflicts_with = "query")]
        query_file: Option<PathBuf>,
        /// Copy the final report to this path as well.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Resume an interrupted run.
    Continue {
        run_id: String,
    },
    /// Stream a run's journalled events to stdout.
    Replay {
        run_id: String,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {}", e);
            1
        }
    };
    std::process::exit(code);
}

async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    match cli.command {
        Command::Run {
            query,
            query_file,
            output,
        } => {
            let query = match (query, query_file) {
                (Some(query), _) => query,
                (None, Some(path)) => std::fs::read_to_string(&path)?.trim().to_string(),
                (None, None) => anyhow::bail!("provide a query or --query-file"),
            };
            if query.is_empty() {
                anyhow::bail!("query is empty");
            }

            let config = EngineConfig::from_env()?;
            let orchestrator = Orchestrator::from_config(config)?;
            let report = orchestrator.run(&query).await?;
            println!("{}", report.run_id);

            if let Some(out) = output {
                std::fs::copy(&report.report_path, &out)?;
            }
            Ok(exit_code(report.status))
        }
        Command::Continue { run_id } => {
            let config = EngineConfig::from_env()?;
            let orchestrator = Orchestrator::from_config(config)?;
            let report = orchestrator.resume(&run_id).await?;
            println!("{}", report.run_id);
            Ok(exit_code(report.status))
        }
        Command::Replay { run_id } => {
            // Replay only reads the journal; no providers, no API keys.
            let artifacts_dir = std::env::var("ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./artifacts"));
            let path = artifacts_dir
                .join(format!("run_{}", run_id))
                .join("events.jsonl");
            if !path.exists() {
                anyhow::bail!("unknown run: {}", run_id);
            }
            for event in weft::journal::EventJournal::load(&path)? {
                println!("{}", serde_json::to_string(&event)?);
            }
            Ok(0)
        }
    }
}

fn exit_code(status: RunStatus) -> i32 {
    match status {
        RunStatus::Complete => 0,
        RunStatus::Partial => 2,
    }
}
