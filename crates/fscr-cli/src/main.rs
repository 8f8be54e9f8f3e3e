use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use fscr_core::{RunStatus, SyncMode};
use fscr_storage::PgCatalogStore;
use fscr_sync::{build_engine, maybe_build_scheduler, run_sync_once, SyncConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "fscr-cli")]
#[command(about = "Food stall catalog reconciler")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation pass and print its summary as JSON.
    Sync(SyncArgs),
    /// Run scheduled passes on FSCR_SYNC_CRON until Ctrl-C.
    Schedule,
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    /// dry-run or apply; overrides FSCR_SYNC_MODE.
    #[arg(long, value_parser = parse_mode)]
    mode: Option<SyncMode>,
    /// Commit even when the closure guardrail trips.
    #[arg(long)]
    force: bool,
    #[arg(long)]
    max_closure_ratio: Option<f64>,
}

fn parse_mode(value: &str) -> Result<SyncMode, String> {
    SyncMode::parse(value)
        .ok_or_else(|| format!("unknown mode {value}; expected dry-run or apply"))
}

impl SyncArgs {
    fn apply(self, mut config: SyncConfig) -> Result<SyncConfig> {
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if self.force {
            config.force_apply = true;
        }
        if let Some(ratio) = self.max_closure_ratio {
            config = config.with_max_closure_ratio(ratio)?;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env().context("reading configuration")?;

    match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => {
            let summary = run_sync_once(args.apply(config)?).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if summary.status == RunStatus::Failed {
                std::process::exit(1);
            }
        }
        Commands::Schedule => {
            let cron = config.sync_cron.clone();
            let store = PgCatalogStore::connect(&config.database_url)
                .await
                .context("connecting to catalog database")?;
            let engine = Arc::new(build_engine(config, Arc::new(store)).await?);
            let Some(mut sched) = maybe_build_scheduler(engine).await? else {
                anyhow::bail!("scheduler disabled; set FSCR_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler started");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
            info!("scheduler stopped");
        }
    }

    Ok(())
}
