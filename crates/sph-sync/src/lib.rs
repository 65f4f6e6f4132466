pub mod config;
pub mod coordinator;
pub mod pool;
pub mod retry;
pub mod sink;
pub mod window;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sph_adapters::{
    EnrichmentClient, FixtureSource, GraphqlEnrichmentClient, HarvestSource, RenderedPageSource,
};
use sph_core::{Credential, Target};
use sph_storage::{ArtifactStore, FetcherConfig, HttpFetcher};
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub use config::{load_accounts, AccountConfig, ConfigError, HarvestConfig, HarvestDocument};
pub use coordinator::{
    Coordinator, CoordinatorSettings, CoordinatorState, PendingBuffer, RotationOutcome, RunStats, RunSummary,
};
pub use pool::{Account, AccountHandle, AccountSnapshot, Clock, CredentialPool, ManualClock, PoolSettings, SystemClock};
pub use retry::{RetryItem, RetryQueue};
pub use sink::{MemorySink, PgRecordSink, RecordSink, SinkError, UpsertBatch, UpsertCall};
pub use window::RateWindow;

pub const CRATE_NAME: &str = "sph-sync";

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub limit: Option<usize>,
    pub batch_size: Option<usize>,
    pub dry_run: bool,
    pub fixtures: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub summary: RunSummary,
    pub reports_dir: PathBuf,
}

fn http_fetcher(config: &HarvestConfig) -> Result<HttpFetcher> {
    Ok(HttpFetcher::new(FetcherConfig {
        timeout: config.http_timeout(),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })?)
}

pub async fn build_pool(config: &HarvestConfig) -> Result<(CredentialPool, Credential)> {
    let document = config.load_document().await?;
    let cookie_base = config
        .config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config.workspace_root.clone());
    let credentials = load_accounts(&document.accounts, &cookie_base, &config.default_bearer).await?;
    let session = credentials
        .iter()
        .map(|(_, credential)| credential)
        .find(|credential| !credential.is_empty())
        .cloned()
        .unwrap_or_default();

    let pool = CredentialPool::from_credentials(
        credentials,
        PoolSettings {
            max_requests_per_window: config.max_requests_per_window,
            window: Some(Duration::from_secs(config.window_secs)),
        },
        Arc::new(SystemClock),
    );
    Ok((pool, session))
}

struct Pipeline {
    settings: CoordinatorSettings,
    source: Arc<dyn HarvestSource>,
    client: Arc<dyn EnrichmentClient>,
    sink: Arc<dyn RecordSink>,
    archive: ArtifactStore,
}

impl Pipeline {
    async fn build(config: &HarvestConfig, options: &RunOptions, session: Credential) -> Result<Self> {
        let fetcher = http_fetcher(config)?;
        let source: Arc<dyn HarvestSource> = match &options.fixtures {
            Some(dir) => Arc::new(FixtureSource::new(dir.clone(), &config.api_base)),
            None => Arc::new(
                RenderedPageSource::new(
                    fetcher.clone(),
                    &config.render_endpoint,
                    config.render_token.as_deref(),
                    &config.api_base,
                )
                .with_session(session),
            ),
        };
        let client: Arc<dyn EnrichmentClient> = Arc::new(GraphqlEnrichmentClient::new(
            fetcher,
            &config.api_base,
            config.require_detail_key()?,
        ));
        let sink: Arc<dyn RecordSink> = if options.dry_run {
            Arc::new(MemorySink::new())
        } else {
            Arc::new(
                PgRecordSink::connect(&config.database_url)
                    .await
                    .context("connecting to DATABASE_URL")?,
            )
        };

        let mut settings = CoordinatorSettings::from_config(config);
        if let Some(limit) = options.limit.filter(|l| *l > 0) {
            settings.limit = limit;
        }
        if let Some(batch_size) = options.batch_size.filter(|b| *b > 0) {
            settings.batch_size = batch_size;
        }
        info!(sink = sink.name(), source = source.name(), "coordinator ready");
        Ok(Self {
            settings,
            source,
            client,
            sink,
            archive: ArtifactStore::new(config.artifacts_dir()),
        })
    }

    fn coordinator(self, pool: CredentialPool, cancel: CancellationToken) -> Coordinator {
        Coordinator::new(self.settings, pool, self.source, self.client, self.sink)
            .with_archive(self.archive)
            .with_cancellation(cancel)
    }
}

// The pool always comes back, even when the pipeline cannot be built.
async fn harvest_with_pool(
    config: &HarvestConfig,
    target: &Target,
    options: &RunOptions,
    pool: CredentialPool,
    session: &Credential,
    cancel: CancellationToken,
) -> (CredentialPool, Result<RunReport>) {
    let pipeline = match Pipeline::build(config, options, session.clone()).await {
        Ok(pipeline) => pipeline,
        Err(err) => return (pool, Err(err)),
    };
    let mut coordinator = pipeline.coordinator(pool, cancel);
    let summary = coordinator.run(target).await;
    let pool = coordinator.into_pool();
    let report = write_run_report(&config.reports_dir(), &summary)
        .await
        .map(|reports_dir| RunReport { summary, reports_dir });
    (pool, report)
}

pub async fn run_harvest(
    config: &HarvestConfig,
    target: &Target,
    options: &RunOptions,
    cancel: CancellationToken,
) -> Result<RunReport> {
    let (pool, session) = build_pool(config).await?;
    let (mut pool, report) = harvest_with_pool(config, target, options, pool, &session, cancel).await;
    pool.shutdown().await;
    report
}

pub async fn run_retry(config: &HarvestConfig, options: &RunOptions, cancel: CancellationToken) -> Result<RunReport> {
    let (mut pool, session) = build_pool(config).await?;
    let pipeline = match Pipeline::build(config, options, session).await {
        Ok(pipeline) => pipeline,
        Err(err) => {
            pool.shutdown().await;
            return Err(err);
        }
    };
    let mut coordinator = pipeline.coordinator(pool, cancel);
    let summary = coordinator.run_retry_queue().await;
    coordinator.into_pool().shutdown().await;
    let reports_dir = write_run_report(&config.reports_dir(), &summary).await?;
    Ok(RunReport { summary, reports_dir })
}

pub async fn harvest_all(
    config: &HarvestConfig,
    targets: &[Target],
    options: &RunOptions,
    cancel: &CancellationToken,
) -> Vec<RunReport> {
    let (mut pool, session) = match build_pool(config).await {
        Ok(built) => built,
        Err(err) => {
            error!(error = %err, "could not load accounts");
            return Vec::new();
        }
    };
    let mut reports = Vec::with_capacity(targets.len());
    for target in targets {
        if cancel.is_cancelled() {
            break;
        }
        let (returned, outcome) =
            harvest_with_pool(config, target, options, pool, &session, cancel.child_token()).await;
        pool = returned;
        match outcome {
            Ok(report) => {
                info!(
                    run_id = %report.summary.run_id,
                    harvest_target = %target.label(),
                    collected = report.summary.stats.collected,
                    "harvest finished"
                );
                reports.push(report);
            }
            Err(err) => error!(harvest_target = %target.label(), error = %err, "harvest failed"),
        }
    }
    pool.shutdown().await;
    reports
}

pub async fn migrate(config: &HarvestConfig) -> Result<()> {
    let sink = PgRecordSink::connect(&config.database_url)
        .await
        .context("connecting to DATABASE_URL")?;
    sink.migrate().await.context("running migrations")?;
    Ok(())
}

fn run_brief_markdown(summary: &RunSummary) -> String {
    let stats = &summary.stats;
    let accounts = summary
        .accounts
        .iter()
        .map(|a| {
            let state = match (&a.available_at, &a.last_failure) {
                (Some(until), Some(reason)) => format!("backed off until {until} ({reason})"),
                _ if !a.has_credentials => "no credentials".to_string(),
                _ => "ok".to_string(),
            };
            format!("- {}: {} requests, {}", a.name, a.usage, state)
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "# Harvest Run Brief\n\n- Run ID: `{}`\n- Target: {}\n- Source: {}\n- Started: {}\n- Finished: {}\n- Collected: {}\n- Enriched: {}\n- Replies saved: {}\n- Rotations: {}\n- Cooldowns: {}\n- Retry queue left: {}\n- Cancelled: {}\n\n## Accounts\n{}\n",
        summary.run_id,
        summary.target.as_deref().unwrap_or("retry queue"),
        summary.source,
        summary.started_at,
        summary.finished_at,
        stats.collected,
        stats.enriched,
        stats.replies_upserted,
        stats.rotations,
        stats.cooldowns,
        summary.retry_queue_len,
        stats.cancelled,
        accounts
    )
}

pub async fn write_run_report(reports_root: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(dir.join("summary.json"), json)
        .await
        .context("writing summary.json")?;
    fs::write(dir.join("run_brief.md"), run_brief_markdown(summary))
        .await
        .context("writing run_brief.md")?;
    Ok(dir)
}

pub fn report_recent_runs_markdown(runs: usize, reports_root: &Path) -> Result<String> {
    let mut summaries = Vec::new();
    for entry in std::fs::read_dir(reports_root).with_context(|| format!("reading {}", reports_root.display()))? {
        let Ok(entry) = entry else {
            continue;
        };
        let path = entry.path().join("summary.json");
        let Ok(text) = std::fs::read_to_string(&path) else {
            continue;
        };
        let value: serde_json::Value =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        let finished = value
            .get("finished_at")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        summaries.push((finished, entry.path(), value));
    }
    summaries.sort_by(|a, b| b.0.cmp(&a.0));

    let mut lines = vec!["# Harvest Report".to_string(), String::new()];
    for (finished, dir, value) in summaries.into_iter().take(runs.max(1)) {
        let stat = |key: &str| {
            value
                .get("stats")
                .and_then(|s| s.get(key))
                .and_then(|v| v.as_u64())
                .unwrap_or(0)
        };
        let run_id = value.get("run_id").and_then(|v| v.as_str()).unwrap_or("unknown");
        let target = value
            .get("target")
            .and_then(|v| v.as_str())
            .unwrap_or("retry queue");
        lines.push(format!("## Run `{run_id}`"));
        lines.push(format!("- target: {target}"));
        lines.push(format!("- finished: {finished}"));
        lines.push(format!("- collected: {}", stat("collected")));
        lines.push(format!("- enriched: {}", stat("enriched")));
        lines.push(format!("- cooldowns: {}", stat("cooldowns")));
        lines.push(format!(
            "- retry queue left: {}",
            value.get("retry_queue_len").and_then(|v| v.as_u64()).unwrap_or(0)
        ));
        let brief = dir.join("run_brief.md");
        if brief.exists() {
            lines.push(format!("- brief: `{}`", brief.display()));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

pub async fn build_scheduler(
    config: Arc<HarvestConfig>,
    targets: Vec<Target>,
    options: RunOptions,
    cancel: CancellationToken,
) -> Result<Option<JobScheduler>> {
    let Some(cron) = config.schedule_cron.clone() else {
        return Ok(None);
    };
    if targets.is_empty() {
        warn!("schedule configured but the harvest document lists no targets");
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let busy = Arc::new(Mutex::new(()));
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let config = Arc::clone(&config);
        let targets = targets.clone();
        let options = options.clone();
        let cancel = cancel.clone();
        let busy = Arc::clone(&busy);
        Box::pin(async move {
            let Ok(_guard) = busy.try_lock() else {
                warn!("previous scheduled harvest still running; skipping tick");
                return;
            };
            let reports = harvest_all(&config, &targets, &options, &cancel).await;
            info!(runs = reports.len(), "scheduled harvest finished");
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
