use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use sph_core::Target;
use sph_sync::{HarvestConfig, RunOptions, RunReport};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "sph-cli")]
#[command(about = "Social post harvester command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Harvest every target listed in the harvest document.
    Harvest(RunArgs),
    /// Harvest a keyword search.
    Search {
        #[arg(long)]
        query: String,
        /// Language filter; defaults to SPH_DEFAULT_LANG.
        #[arg(long)]
        lang: Option<String>,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Harvest a user timeline.
    User {
        #[arg(long)]
        username: String,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Work through the persisted retry queue.
    Retry {
        #[arg(long)]
        dry_run: bool,
    },
    Migrate,
    /// Print the latest run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
    /// Harvest the document targets on SPH_SCHEDULE_CRON until interrupted.
    Schedule(RunArgs),
}

#[derive(Debug, Clone, Default, Args)]
struct RunArgs {
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    batch_size: Option<usize>,
    /// Keep results in memory instead of writing to Postgres.
    #[arg(long)]
    dry_run: bool,
    /// Replay listing snapshots from this directory instead of rendering live pages.
    #[arg(long)]
    fixtures: Option<PathBuf>,
}

impl From<RunArgs> for RunOptions {
    fn from(args: RunArgs) -> Self {
        RunOptions {
            limit: args.limit,
            batch_size: args.batch_size,
            dry_run: args.dry_run,
            fixtures: args.fixtures,
        }
    }
}

fn print_report(report: &RunReport) {
    let summary = &report.summary;
    println!(
        "harvest complete: run_id={} target={} collected={} enriched={} replies={} retry_queue={} reports={}",
        summary.run_id,
        summary.target.as_deref().unwrap_or("retry queue"),
        summary.stats.collected,
        summary.stats.enriched,
        summary.stats.replies_upserted,
        summary.retry_queue_len,
        report.reports_dir.display()
    );
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current record");
            token.cancel();
        }
    });
    cancel
}

async fn document_targets(config: &HarvestConfig) -> Result<Vec<Target>> {
    let document = config.load_document().await?;
    Ok(document
        .targets
        .into_iter()
        .map(|t| t.with_default_lang(&config.default_lang))
        .collect())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("sph=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = HarvestConfig::from_env()?;
    let cancel = cancel_on_ctrl_c();

    match cli.command.unwrap_or(Commands::Harvest(RunArgs::default())) {
        Commands::Harvest(run) => {
            let targets = document_targets(&config).await?;
            if targets.is_empty() {
                bail!("no targets in {}", config.config_path.display());
            }
            let reports = sph_sync::harvest_all(&config, &targets, &run.into(), &cancel).await;
            for report in &reports {
                print_report(report);
            }
            if reports.len() < targets.len() && !cancel.is_cancelled() {
                bail!("{} of {} targets failed", targets.len() - reports.len(), targets.len());
            }
        }
        Commands::Search { query, lang, run } => {
            let target = Target::search(query, lang.as_deref()).with_default_lang(&config.default_lang);
            let report = sph_sync::run_harvest(&config, &target, &run.into(), cancel).await?;
            print_report(&report);
        }
        Commands::User { username, run } => {
            let report = sph_sync::run_harvest(&config, &Target::user(username), &run.into(), cancel).await?;
            print_report(&report);
        }
        Commands::Retry { dry_run } => {
            let options = RunOptions {
                dry_run,
                ..RunOptions::default()
            };
            let report = sph_sync::run_retry(&config, &options, cancel).await?;
            print_report(&report);
        }
        Commands::Migrate => {
            sph_sync::migrate(&config).await?;
            println!("migrations applied");
        }
        Commands::Report { runs } => {
            println!("{}", sph_sync::report_recent_runs_markdown(runs, &config.reports_dir())?);
        }
        Commands::Schedule(run) => {
            let targets = document_targets(&config).await?;
            let Some(mut sched) =
                sph_sync::build_scheduler(Arc::new(config), targets, run.into(), cancel.clone()).await?
            else {
                bail!("SPH_SCHEDULE_CRON is not set");
            };
            sched.start().await?;
            info!("scheduler running; press Ctrl-C to stop");
            cancel.cancelled().await;
            sched.shutdown().await?;
        }
    }

    Ok(())
}
