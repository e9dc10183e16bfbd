//! # Workbook QA CLI (`wbqa`)
//!
//! Indexes spreadsheet workbooks and answers natural-language questions
//! about them, from the terminal or over HTTP.
//!
//! ## Usage
//!
//! ```bash
//! wbqa --config ./config/wbqa.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `wbqa index <file>` | Index a workbook and print its session id |
//! | `wbqa ask --session <id> "<question>"` | Answer a question about an indexed workbook |
//! | `wbqa usage --session <id>` | Show token usage and cost of the last question |
//! | `wbqa serve` | Start the HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! wbqa index ./tenders.xlsx
//! wbqa ask --session 6f1c... "How many tenders were won in 2016?"
//! wbqa ask --session 6f1c... "What was the submission date for 'Lulu at Palm Mall'?" --json
//! wbqa serve
//! ```

use anyhow::bail;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use workbook_qa::completion::CompletionClient;
use workbook_qa::config;
use workbook_qa::index::{session_dir, Indexer};
use workbook_qa::orchestrator::{ask_session, cost_rates, Pipeline};
use workbook_qa::progress::{ProgressMode, ProgressSink};
use workbook_qa::render::renderer_from_config;
use workbook_qa::server;
use workbook_qa::session::SessionContext;

/// Workbook QA: ask questions about spreadsheet workbooks.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/wbqa.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "wbqa",
    about = "Index spreadsheet workbooks and answer questions about them",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/wbqa.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index a workbook.
    ///
    /// Splits sheets into small (rendered to images) and big (materialized
    /// into SQLite), and prints the session id to use with `ask`.
    /// Re-indexing identical content returns the existing session.
    Index {
        /// Path to the `.xlsx` file.
        file: PathBuf,

        /// Print progress events as NDJSON on stdout.
        #[arg(long)]
        json: bool,
    },

    /// Answer a question about an indexed workbook.
    Ask {
        /// Session id printed by `index`.
        #[arg(long)]
        session: String,

        /// The question.
        question: String,

        /// Print progress events as NDJSON on stdout.
        #[arg(long)]
        json: bool,
    },

    /// Show the usage ledger of a session's last question.
    Usage {
        #[arg(long)]
        session: String,
    },

    /// Start the HTTP server.
    Serve,
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn progress_sink(json: bool) -> Box<dyn ProgressSink> {
    let mode = if json {
        ProgressMode::Json
    } else {
        ProgressMode::default_for_tty()
    };
    mode.sink()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Index { file, json } => {
            let bytes = std::fs::read(&file)?;
            let filename = file
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("workbook.xlsx")
                .to_string();
            std::fs::create_dir_all(&cfg.workspace.root)?;
            let indexer = Indexer::new(
                cfg.workspace.root.clone(),
                cfg.indexing.clone(),
                Arc::from(renderer_from_config(&cfg.indexing)),
            );
            let progress = progress_sink(json);
            let index = indexer
                .index_workbook(&filename, &bytes, progress.as_ref())
                .await?;
            if !json {
                let small = index.small_sheets().map(|s| s.len()).unwrap_or(0);
                let big = index.big_sheets().map(|t| t.len()).unwrap_or(0);
                println!(
                    "{}  ({} small sheet images, {} big sheet tables)",
                    index.session_id.unwrap_or_default(),
                    small,
                    big
                );
            }
        }
        Commands::Ask {
            session,
            question,
            json,
        } => {
            let client = CompletionClient::from_config(&cfg.completion)?;
            let pipeline = Pipeline::new(client, &cfg);
            let progress = progress_sink(json);
            let result = ask_session(
                &pipeline,
                &cfg.workspace.root,
                cost_rates(&cfg),
                &session,
                &question,
                progress.as_ref(),
            )
            .await;
            match result {
                Ok(answer) => {
                    if !json {
                        println!("{}", answer.text);
                    }
                }
                Err(e) => {
                    if json {
                        std::process::exit(1);
                    }
                    bail!(e);
                }
            }
        }
        Commands::Usage { session } => {
            let dir = session_dir(&cfg.workspace.root, &session);
            if !dir.is_dir() {
                bail!("session not found: {}", session);
            }
            let ctx = SessionContext::for_session_dir(&session, &dir, cost_rates(&cfg));
            let entries = ctx.ledger.entries()?;
            if entries.is_empty() {
                println!("No completion calls recorded for session {}.", session);
                return Ok(());
            }
            println!(
                "{:<40} {:>10} {:>10} {:>10}",
                "STAGE", "INPUT", "OUTPUT", "COST"
            );
            for e in &entries {
                println!(
                    "{:<40} {:>10} {:>10} {:>10}",
                    e.run_name,
                    e.input_tokens,
                    e.output_tokens,
                    format!("${:.4}", e.total_cost)
                );
            }
            let totals = ctx.ledger.totals()?;
            println!(
                "{:<40} {:>10} {:>10} {:>10}",
                format!("TOTAL ({} calls)", totals.calls),
                totals.input_tokens,
                totals.output_tokens,
                format!("${:.4}", totals.total_cost)
            );
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
