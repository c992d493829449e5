//! # aqi-pipeline
//!
//! Scheduler-facing binary: one subcommand per trigger or operator action.
//! Results are printed as JSON on stdout; logs go to stderr.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde_json::json;

use aqi_forecast::common::config::AppCfg;
use aqi_forecast::common::log;
use aqi_forecast::data::JsonlObservationSource;
use aqi_forecast::registry::VersionId;
use aqi_forecast::{ErrorCode, Pipeline, PipelineError};

#[derive(Parser)]
#[command(name = "aqi-pipeline")]
#[command(about = "AQI feature-to-champion pipeline", long_about = None)]
struct Cli {
    /// JSON-lines observation export written by the upstream API client
    #[arg(long, env = "AQI_OBSERVATIONS", default_value = "observations.jsonl")]
    observations: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest the hour containing --at
    Hourly {
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },

    /// Train on the rolling window ending at --at and promote a better model
    Daily {
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },

    /// Ingest every hour of [start, end)
    Backfill {
        #[arg(long)]
        start: DateTime<Utc>,
        #[arg(long)]
        end: DateTime<Utc>,
    },

    /// Recompute feature rows of [start, end) from archived observations
    Reprocess {
        #[arg(long)]
        start: DateTime<Utc>,
        #[arg(long)]
        end: DateTime<Utc>,
    },

    /// Show the current champion
    Champion,

    /// List every champion version
    History,

    /// Re-score the champion under the configured evaluation protocol
    Rebaseline {
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },

    /// Re-promote a historical champion version
    Rollback {
        #[arg(long)]
        version: u64,
    },

    /// Forecast the hours after --at with the current champion
    Forecast {
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },

    /// Score the champion against the latest real hours
    CheckAccuracy {
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
}

fn print(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let cfg = AppCfg::load()?;
    log::init(&cfg);
    let source = Arc::new(JsonlObservationSource::new(&cli.observations));
    let pipeline = Pipeline::open(cfg, source)
        .with_context(|| format!("opening pipeline for {}", cli.observations.display()))?;
    let now = Utc::now();

    match cli.command {
        Commands::Hourly { at } => print(&pipeline.on_hourly_tick(at.unwrap_or(now))?),
        Commands::Daily { at } => {
            let outcome = pipeline.on_daily_tick(at.unwrap_or(now))?;
            print(outcome.audit())
        }
        Commands::Backfill { start, end } => {
            let report = pipeline.on_backfill_request(start, end)?;
            print(&json!({
                "batches": report.batches,
                "written": report.written,
                "gaps": report.gaps.iter().map(|g| json!({ "timestamp": g.timestamp, "reason": g.reason })).collect::<Vec<_>>(),
                "failed": report.failed.iter().map(|(k, reason)| json!({ "key": k.to_string(), "reason": reason })).collect::<Vec<_>>(),
            }))
        }
        Commands::Reprocess { start, end } => {
            let report = pipeline.reprocess(start, end)?;
            print(&json!({
                "written": report.upsert.written,
                "gaps": report.gaps.len(),
                "failed": report.upsert.failed.len(),
            }))
        }
        Commands::Champion => {
            let view = pipeline.dashboard().current_champion()?;
            print(&json!({ "champion": view.record, "stale": view.stale }))
        }
        Commands::History => print(&pipeline.history()?),
        Commands::Rebaseline { at } => print(&pipeline.rebaseline(at.unwrap_or(now))?),
        Commands::Rollback { version } => print(&pipeline.rollback(VersionId(version), now)?),
        Commands::Forecast { at } => {
            let at = at.unwrap_or(now);
            let outlook = pipeline.outlook(at).unwrap_or_else(|err| {
                tracing::warn!(error = %err, "no weather outlook; carrying the last readings forward");
                Vec::new()
            });
            let forecast = pipeline.forecast(at, &outlook)?;
            print(&json!({ "peak": forecast.peak(), "forecast": forecast }))
        }
        Commands::CheckAccuracy { at } => print(&pipeline.check_accuracy(at.unwrap_or(now))?),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = err
                .downcast_ref::<PipelineError>()
                .map_or(ErrorCode::Invalid, PipelineError::code);
            eprintln!("error: {err:#}");
            ExitCode::from(code as u8)
        }
    }
}
