// dpau: Command-line interface

// CRITICAL: Enforce proper error handling - no unwrap/expect in production code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

use chrono::{Days, Utc};
use clap::{Parser, Subcommand};
use dpau::api::{serve, AppState};
use dpau::config::AppConfig;
use dpau::error::{EngineError, EngineResult};
use dpau::formats::{parse_day, read_events};
use dpau::ledger::Metric;
use dpau::pipeline::Pipeline;
use dpau::synth::{generate, write_jsonl, SynthConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::error;

#[derive(Parser)]
#[command(
    name = "dpau",
    version,
    about = "Differentially private DAU/MAU analytics over turnstile event streams"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API server
    Serve {
        #[arg(long, default_value = "0.0.0.0:8080")]
        bind: String,
    },
    /// Ingest an event file (.jsonl or .csv)
    Ingest { file: PathBuf },
    /// Release the DP daily active user count for a day
    Dau { day: String },
    /// Release the DP monthly active user count for a rolling window
    Mau {
        end: String,
        #[arg(long)]
        window: Option<u32>,
    },
    /// Generate a synthetic event stream into DATA_DIR/streams
    GenerateSynthetic {
        #[arg(long, default_value_t = 100)]
        users: usize,
        #[arg(long, default_value_t = 30)]
        days: u32,
        /// First day of the stream; defaults to `days` days ago
        #[arg(long)]
        start: Option<String>,
        #[arg(long, default_value_t = 0.05)]
        deletion_rate: f64,
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
    /// Replay all pending erasures now
    FlushDeletes,
    /// Zero the budget for a metric and month (YYYY-MM)
    ResetBudget { metric: String, month: String },
    /// Append a salt epoch effective from the given date
    RotateSalt {
        effective: String,
        #[arg(long)]
        rotation_days: Option<u32>,
    },
    /// Snapshot the ledger into DATA_DIR/backups
    Backup,
    /// Write the current month's budget snapshot report
    BudgetReport,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return match err.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => {
                    ExitCode::SUCCESS
                }
                _ => ExitCode::from(1),
            };
        }
    };

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{}", err);
            match err {
                EngineError::Validation(_) | EngineError::Auth(_) => ExitCode::from(1),
                EngineError::BudgetExhausted(_) => ExitCode::from(3),
                _ => ExitCode::from(2),
            }
        }
    }
}

async fn run(cli: Cli) -> EngineResult<()> {
    let config = AppConfig::from_env()?;
    let pipeline = Pipeline::open(config)?;

    match cli.command {
        Commands::Serve { bind } => {
            let state = Arc::new(AppState::new(pipeline)?);
            serve(state, &bind).await
        }
        Commands::Ingest { file } => {
            let events = read_events(&file)?;
            let accepted = pipeline.ingest(&events)?;
            println!("accepted {} events", accepted);
            Ok(())
        }
        Commands::Dau { day } => {
            let out = pipeline.release_dau(parse_day(&day)?)?;
            println!("{}", serde_json::to_string_pretty(&out)?);
            Ok(())
        }
        Commands::Mau { end, window } => {
            let out = pipeline.release_mau(parse_day(&end)?, window)?;
            println!("{}", serde_json::to_string_pretty(&out)?);
            Ok(())
        }
        Commands::GenerateSynthetic {
            users,
            days,
            start,
            deletion_rate,
            seed,
        } => {
            let start = match start {
                Some(raw) => parse_day(&raw)?,
                None => Utc::now()
                    .date_naive()
                    .checked_sub_days(Days::new(u64::from(days)))
                    .ok_or_else(|| {
                        EngineError::Validation(format!("day span {} underflows calendar", days))
                    })?,
            };
            let synth = SynthConfig {
                users,
                days,
                start,
                deletion_rate,
                ..SynthConfig::default()
            };
            let events = generate(&synth, seed);
            let path = write_jsonl(
                &events,
                &pipeline.config().streams_dir(),
                &format!("synthetic-{}", seed),
            )?;
            println!("wrote {} events to {}", events.len(), path.display());
            Ok(())
        }
        Commands::FlushDeletes => {
            let completed = pipeline.replay_deletions()?;
            println!("completed {} erasures", completed);
            Ok(())
        }
        Commands::ResetBudget { metric, month } => {
            pipeline.reset_budget(Metric::parse(&metric)?, &month)?;
            println!("budget reset for {} {}", metric, month);
            Ok(())
        }
        Commands::RotateSalt {
            effective,
            rotation_days,
        } => {
            pipeline.rotate_salt(parse_day(&effective)?, rotation_days)?;
            println!("salt epoch appended, effective {}", effective);
            Ok(())
        }
        Commands::Backup => {
            let path = pipeline.backup()?;
            println!("ledger backed up to {}", path.display());
            Ok(())
        }
        Commands::BudgetReport => {
            let path = pipeline.write_budget_report()?;
            println!("budget report written to {}", path.display());
            Ok(())
        }
    }
}
