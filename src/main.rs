use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod analysis;
mod config;
mod db;
mod dedup;
mod error;
mod history;
mod models;
mod pipeline;
mod rest;
mod source;
mod spotify;
mod store;
mod timestamp;
mod weekly;

use config::{AppConfig, CliConfig, FileConfig, StoreBackend};
use pipeline::{RunContext, SourceSelection};

#[derive(Parser)]
#[command(name = "listening-ledger")]
#[command(
    about = "Records song plays exactly once and rolls them up by hour, day and week",
    long_about = None
)]
struct Cli {
    /// Optional TOML file; its values override flags and env vars
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true, value_enum, env = "LEDGER_STORE")]
    store: Option<StoreBackend>,

    #[arg(long, global = true, env = "SUPABASE_URL", hide_env_values = true)]
    rest_url: Option<String>,

    #[arg(long, global = true, env = "SUPABASE_KEY", hide_env_values = true)]
    rest_key: Option<String>,

    #[arg(long, global = true, env = "DATABASE_URL", hide_env_values = true)]
    database_url: Option<String>,

    #[arg(long, global = true, env = "SPOTIFY_ACCESS_TOKEN", hide_env_values = true)]
    spotify_token: Option<String>,

    #[arg(long, global = true, env = "HISTORY_URL")]
    history_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the Postgres schema
    InitDb,
    /// Fetch recent plays and record the new ones
    Ingest {
        #[arg(long, value_enum, default_value_t = SourceSelection::All)]
        source: SourceSelection,
        /// Fetch this many hours back instead of resuming from the checkpoint
        #[arg(long)]
        hours: Option<u32>,
    },
    /// Hourly rollup of one local day, or of the last 24 hours
    Day {
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Seven-day rollup ending on a local date
    Week {
        #[arg(long)]
        end_date: Option<NaiveDate>,
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

impl Cli {
    fn to_config(&self) -> CliConfig {
        CliConfig {
            store: self.store,
            rest_url: self.rest_url.clone(),
            rest_key: self.rest_key.clone(),
            database_url: self.database_url.clone(),
            spotify_token: self.spotify_token.clone(),
            history_url: self.history_url.clone(),
        }
    }
}

fn write_json<T: Serialize>(value: &T, out: Option<&Path>) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    match out {
        Some(path) => {
            std::fs::write(path, json)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("Report written to {}.", path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("failed to initialise logging")?;

    let file_config = cli.config.as_deref().map(FileConfig::load).transpose()?;

    if let Commands::InitDb = cli.command {
        let mut cli_config = cli.to_config();
        cli_config.store = Some(StoreBackend::Postgres);
        let config = AppConfig::resolve(&cli_config, file_config)?;
        let url = config
            .store
            .database_url
            .as_deref()
            .context("DATABASE_URL must be set to run migrations")?;
        let store = db::PgStore::connect(url, config.http_timeout)
            .await
            .context("failed to connect to Postgres")?;
        store.init_db().await?;
        println!("Schema ready.");
        return Ok(());
    }

    let config = AppConfig::resolve(&cli.to_config(), file_config)?;
    let ctx = RunContext::connect(config)
        .await
        .context("failed to set up the run")?;

    match cli.command {
        Commands::InitDb => {}
        Commands::Ingest { source, hours } => {
            let sources = ctx.sources(source);
            if sources.is_empty() {
                bail!("no configured source matches --source {source:?}");
            }

            let summary = ctx.ingest_all(&sources, hours).await?;
            for report in &summary.reports {
                println!(
                    "Inserted {} events from {} ({} fetched, {} duplicates, {} malformed).",
                    report.inserted,
                    report.source,
                    report.fetched,
                    report.duplicates,
                    report.malformed
                );
            }
            if summary.reports.len() > 1 {
                println!("Inserted {} events in total.", summary.inserted());
            }
            for (kind, err) in &summary.failures {
                println!("Ingest from {kind} failed: {err}");
            }
            if !summary.is_success() {
                bail!("{} of {} sources failed", summary.failures.len(), sources.len());
            }
        }
        Commands::Day { date, out } => {
            let report = ctx.analyze_day(date).await?;
            write_json(&report, out.as_deref())?;
        }
        Commands::Week { end_date, out } => {
            let summary = ctx.analyze_week(end_date).await?;
            write_json(&summary, out.as_deref())?;
        }
    }

    Ok(())
}
