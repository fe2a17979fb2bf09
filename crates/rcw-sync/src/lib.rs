//! Run orchestration for RCW: configuration, the scheduled and on-demand
//! pipelines, and cron wiring.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rcw_core::{diff_catalog, summarize, CatalogStats, RewardProduct};
use rcw_notify::{DigestRenderer, DigestSender, HttpApiSender, NoopSender};
use rcw_storage::{
    CatalogClientConfig, CatalogSource, FileSnapshotStore, HttpCatalogSource, SnapshotStore,
};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "rcw-sync";

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub catalog_endpoint: String,
    pub snapshot_path: PathBuf,
    pub thresholds: Vec<u64>,
    pub recipients: Vec<String>,
    pub sender_address: String,
    pub email_api_url: String,
    pub email_api_key: Option<String>,
    pub scheduler_enabled: bool,
    pub check_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub image_base: String,
    pub web_port: u16,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            catalog_endpoint: "https://www.sephora.com/api/bi/rewards?source=profile".to_string(),
            snapshot_path: PathBuf::from("./data/snapshot.json"),
            thresholds: vec![0],
            recipients: Vec::new(),
            sender_address: "rewards-bot@localhost".to_string(),
            email_api_url: "https://api.resend.com/emails".to_string(),
            email_api_key: None,
            scheduler_enabled: false,
            check_cron: "0 0 * * * *".to_string(),
            user_agent: "rcw-bot/0.1".to_string(),
            http_timeout_secs: 20,
            image_base: rcw_notify::DEFAULT_IMAGE_BASE.to_string(),
            web_port: 8000,
        }
    }
}

impl WatchConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            catalog_endpoint: std::env::var("RCW_CATALOG_URL")
                .unwrap_or(defaults.catalog_endpoint),
            snapshot_path: std::env::var("RCW_SNAPSHOT_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.snapshot_path),
            thresholds: std::env::var("RCW_NOTIFY_THRESHOLDS")
                .ok()
                .map(|v| parse_u64_list(&v))
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.thresholds),
            recipients: std::env::var("RCW_RECIPIENTS")
                .ok()
                .map(|v| parse_string_list(&v))
                .unwrap_or(defaults.recipients),
            sender_address: std::env::var("RCW_SENDER").unwrap_or(defaults.sender_address),
            email_api_url: std::env::var("RCW_EMAIL_API_URL").unwrap_or(defaults.email_api_url),
            email_api_key: std::env::var("RCW_EMAIL_API_KEY").ok(),
            scheduler_enabled: std::env::var("RCW_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.scheduler_enabled),
            check_cron: std::env::var("RCW_CHECK_CRON").unwrap_or(defaults.check_cron),
            user_agent: std::env::var("RCW_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: std::env::var("RCW_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            image_base: std::env::var("RCW_IMAGE_BASE").unwrap_or(defaults.image_base),
            web_port: std::env::var("RCW_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.web_port),
        }
    }
}

fn parse_u64_list(raw: &str) -> Vec<u64> {
    raw.split(',')
        .filter_map(|part| part.trim().parse().ok())
        .collect()
}

fn parse_string_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|part| part.trim().to_string())
        .filter(|part| !part.is_empty())
        .collect()
}

/// Outcome of one scheduled run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetched_total: usize,
    pub new_products: usize,
    pub persisted: bool,
    pub digests_sent: usize,
    pub stats: Option<CatalogStats>,
}

/// Outcome of one on-demand preview run. Never persists, never delivers.
#[derive(Debug, Clone)]
pub enum PreviewOutcome {
    NoNewProducts,
    NothingAboveThreshold { min_points: u64 },
    Report { stats: CatalogStats, digest_html: String },
}

/// The FETCH→DIFF→(PERSIST→THRESHOLD_LOOP)→STATISTICS pipeline.
///
/// All I/O goes through the injected collaborators; each invocation is a
/// self-contained run with no shared in-process state. Overlapping runs
/// race on the snapshot store, last writer wins.
pub struct WatchPipeline {
    config: WatchConfig,
    source: Arc<dyn CatalogSource>,
    store: Arc<dyn SnapshotStore>,
    sender: Arc<dyn DigestSender>,
    renderer: DigestRenderer,
}

impl WatchPipeline {
    pub fn new(
        config: WatchConfig,
        source: Arc<dyn CatalogSource>,
        store: Arc<dyn SnapshotStore>,
        sender: Arc<dyn DigestSender>,
    ) -> Self {
        let renderer = DigestRenderer::new(config.image_base.clone());
        Self {
            config,
            source,
            store,
            sender,
            renderer,
        }
    }

    /// Build a pipeline with the real collaborators described by `config`.
    pub fn from_config(config: WatchConfig) -> Result<Self> {
        let source = HttpCatalogSource::new(CatalogClientConfig {
            endpoint: config.catalog_endpoint.clone(),
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: config.user_agent.clone(),
        })
        .context("building catalog source")?;
        let store = FileSnapshotStore::new(config.snapshot_path.clone());
        let sender: Arc<dyn DigestSender> = match &config.email_api_key {
            Some(key) => Arc::new(HttpApiSender::new(
                config.email_api_url.clone(),
                key.clone(),
                config.sender_address.clone(),
            )),
            None => Arc::new(NoopSender),
        };
        Ok(Self::new(config, Arc::new(source), Arc::new(store), sender))
    }

    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    /// Last-persisted snapshot, without a live fetch.
    pub async fn stored_snapshot(&self) -> Result<Vec<RewardProduct>> {
        self.store.load().await
    }

    /// Scheduled path: persists the fresh catalog and dispatches digests.
    ///
    /// Fetch failures abort the run before any persistence. An empty diff
    /// returns early without overwriting the stored snapshot.
    pub async fn run_scheduled(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let latest = self
            .source
            .fetch_catalog()
            .await
            .context("fetching catalog")?;
        info!(%run_id, fetched = latest.len(), "fetched catalog");

        let previous = self.store.load().await.context("loading snapshot")?;
        let new_products = diff_catalog(&previous, &latest);
        info!(%run_id, new_products = new_products.len(), "computed catalog diff");

        if new_products.is_empty() {
            return Ok(RunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                fetched_total: latest.len(),
                new_products: 0,
                persisted: false,
                digests_sent: 0,
                stats: None,
            });
        }

        self.store
            .store(&latest)
            .await
            .context("persisting snapshot")?;

        let digests_sent = self.notify_all(run_id, &new_products).await;
        let stats = summarize(&new_products, &previous);

        Ok(RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            fetched_total: latest.len(),
            new_products: new_products.len(),
            persisted: true,
            digests_sent,
            stats: Some(stats),
        })
    }

    /// Per-threshold fan-out. Each threshold renders its own digest and
    /// each recipient is attempted independently; one failed delivery
    /// never aborts the rest. Returns the number of successful deliveries.
    async fn notify_all(&self, run_id: Uuid, new_products: &[RewardProduct]) -> usize {
        let mut delivered = 0usize;
        for &threshold in &self.config.thresholds {
            let digest = match self.renderer.render(new_products, threshold) {
                Ok(Some(digest)) => digest,
                Ok(None) => {
                    info!(%run_id, threshold, "no qualifying products; digest skipped");
                    continue;
                }
                Err(err) => {
                    error!(%run_id, threshold, error = %err, "digest rendering failed");
                    continue;
                }
            };
            let subject = digest.subject();
            for recipient in &self.config.recipients {
                match self.sender.send(recipient, &subject, &digest.html).await {
                    Ok(()) => delivered += 1,
                    Err(err) => {
                        warn!(
                            %run_id,
                            threshold,
                            recipient,
                            error = %err,
                            "digest delivery failed; continuing"
                        );
                    }
                }
            }
        }
        delivered
    }

    /// On-demand path: the same fetch/diff/statistics sequence with no
    /// persistence and no delivery, for a single caller-chosen threshold.
    pub async fn preview(&self, min_points: u64) -> Result<PreviewOutcome> {
        let latest = self
            .source
            .fetch_catalog()
            .await
            .context("fetching catalog")?;
        let previous = self.store.load().await.context("loading snapshot")?;
        let new_products = diff_catalog(&previous, &latest);

        if new_products.is_empty() {
            return Ok(PreviewOutcome::NoNewProducts);
        }

        let Some(digest) = self.renderer.render(&new_products, min_points)? else {
            return Ok(PreviewOutcome::NothingAboveThreshold { min_points });
        };

        Ok(PreviewOutcome::Report {
            stats: summarize(&new_products, &previous),
            digest_html: digest.html,
        })
    }
}

/// Cron wiring for the scheduled path. Job failures are logged and never
/// propagate to the scheduler.
pub async fn build_scheduler(pipeline: Arc<WatchPipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config().scheduler_enabled {
        return Ok(None);
    }

    let cron = pipeline.config().check_cron.clone();
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            match pipeline.run_scheduled().await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    new_products = summary.new_products,
                    digests_sent = summary.digests_sent,
                    persisted = summary.persisted,
                    "scheduled catalog check complete"
                ),
                Err(err) => error!(error = %err, "scheduled catalog check failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    sched.start().await.context("starting scheduler")?;
    Ok(Some(sched))
}
