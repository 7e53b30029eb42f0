//! Bulk fetch orchestration: dedup accumulator, pagination driver, detail
//! enrichment, and the pipeline that exports each run.

pub mod accumulator;
pub mod driver;
pub mod enrich;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use pagesweep_adapters::{
    DetailFetcher, EndpointConfig, FixturePageFetcher, JsonEndpointAdapter, PageFetcher, PageShape,
};
use pagesweep_core::{Cursor, FetchError, Record, TerminationReason};
use pagesweep_storage::{
    BackoffPolicy, ExportManifest, HttpClientConfig, HttpFetcher, SnapshotStore, TokenBucketConfig,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

pub use accumulator::{DedupAccumulator, PageTally};
pub use driver::{
    DriverOptions, FetchReport, FetchSession, PageStats, PaginationDriver, SessionState,
    DEFAULT_INTER_PAGE_DELAY,
};
pub use enrich::{enrich_details, EnrichFailure, EnrichOptions, EnrichmentReport, EnrichmentSummary};

pub const CRATE_NAME: &str = "pagesweep-sync";

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointRegistry {
    pub endpoints: Vec<EndpointConfig>,
}

impl EndpointRegistry {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text)?;
        let mut seen = std::collections::HashSet::new();
        for endpoint in &registry.endpoints {
            if !seen.insert(endpoint.endpoint_id.as_str()) {
                anyhow::bail!("duplicate endpoint_id {}", endpoint.endpoint_id);
            }
        }
        Ok(registry)
    }

    pub fn find(&self, endpoint_id: &str) -> Result<&EndpointConfig> {
        let endpoint = self
            .endpoints
            .iter()
            .find(|e| e.endpoint_id == endpoint_id)
            .with_context(|| format!("no endpoint registered as {endpoint_id}"))?;
        if !endpoint.enabled {
            anyhow::bail!("endpoint {endpoint_id} is disabled");
        }
        Ok(endpoint)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &EndpointConfig> {
        self.endpoints.iter().filter(|e| e.enabled)
    }
}

#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub endpoints_path: PathBuf,
    pub output_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub page_delay_ms: u64,
    pub max_retries: usize,
    pub detail_batch_size: usize,
    /// Requests per second across all endpoints; unset means unthrottled.
    pub rate_limit_per_sec: Option<u32>,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl SweepConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            endpoints_path: lookup("PAGESWEEP_ENDPOINTS")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./endpoints.yaml")),
            output_dir: lookup("PAGESWEEP_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./exports")),
            user_agent: lookup("PAGESWEEP_USER_AGENT").unwrap_or_else(|| "pagesweep/0.1".to_string()),
            http_timeout_secs: lookup("PAGESWEEP_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            page_delay_ms: lookup("PAGESWEEP_PAGE_DELAY_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_INTER_PAGE_DELAY.as_millis() as u64),
            max_retries: lookup("PAGESWEEP_MAX_RETRIES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            detail_batch_size: lookup("PAGESWEEP_DETAIL_BATCH")
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            rate_limit_per_sec: lookup("PAGESWEEP_RATE_LIMIT_PER_SEC")
                .and_then(|v| v.parse().ok())
                .filter(|n: &u32| *n > 0),
        }
    }

    fn token_bucket(&self) -> Option<TokenBucketConfig> {
        self.rate_limit_per_sec.map(|per_sec| TokenBucketConfig {
            capacity: per_sec,
            refill_every: Duration::from_secs(1) / per_sec,
        })
    }
}

/// Per-run knobs that override [`SweepConfig`] and the endpoint entry.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub initial_cursor: Option<Cursor>,
    pub page_delay: Option<Duration>,
    pub max_pages: Option<usize>,
    pub skip_detail: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepRunSummary {
    pub run_id: Uuid,
    pub endpoint_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub termination: TerminationReason,
    pub total_requests: usize,
    pub duplicates_found: usize,
    pub unique_records: usize,
    pub pages: Vec<PageStats>,
    pub enrichment: Option<EnrichmentSummary>,
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct SweepOutcome {
    pub summary: SweepRunSummary,
    pub manifest: ExportManifest,
    /// Set when the walk failed; the export then holds the partial snapshot.
    pub failure: Option<FetchError>,
}

impl SweepOutcome {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

pub struct SweepPipeline {
    config: SweepConfig,
    http: Arc<HttpFetcher>,
    store: SnapshotStore,
    cancellation: CancellationToken,
}

impl SweepPipeline {
    pub fn new(config: SweepConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: config.max_retries,
                ..Default::default()
            },
            token_bucket: config.token_bucket(),
            ..Default::default()
        })?;
        Ok(Self {
            store: SnapshotStore::new(config.output_dir.clone()),
            config,
            http: Arc::new(http),
            cancellation: CancellationToken::new(),
        })
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn load_registry(&self) -> Result<EndpointRegistry> {
        EndpointRegistry::load(&self.config.endpoints_path)
    }

    /// Walk a registered endpoint, enrich if it has a detail block, and export.
    pub async fn run_endpoint(&self, endpoint_id: &str, overrides: RunOverrides) -> Result<SweepOutcome> {
        let registry = self.load_registry()?;
        let endpoint = registry.find(endpoint_id)?.clone();
        self.run_endpoint_config(endpoint, overrides).await
    }

    pub async fn run_endpoint_config(
        &self,
        endpoint: EndpointConfig,
        mut overrides: RunOverrides,
    ) -> Result<SweepOutcome> {
        let run_id = Uuid::new_v4();
        if overrides.initial_cursor.is_none() {
            overrides.initial_cursor = endpoint.initial_cursor.clone();
        }
        let adapter = JsonEndpointAdapter::new(endpoint, Arc::clone(&self.http), run_id)
            .context("building endpoint adapter")?;
        let detail: Option<&dyn DetailFetcher> = if adapter.has_detail() && !overrides.skip_detail {
            Some(&adapter)
        } else {
            None
        };
        let endpoint_id = adapter.config().endpoint_id.clone();
        self.run_with(run_id, &endpoint_id, &adapter, detail, overrides).await
    }

    /// Replay captured `page_*.json` files offline.
    pub async fn replay_fixture(
        &self,
        label: &str,
        dir: &Path,
        shape: PageShape,
        overrides: RunOverrides,
    ) -> Result<SweepOutcome> {
        let fetcher = FixturePageFetcher::load(dir, shape)?;
        info!(pages = fetcher.page_count(), dir = %dir.display(), "replaying fixture pages");
        self.run_with(Uuid::new_v4(), label, &fetcher, None, overrides).await
    }

    pub async fn run_with(
        &self,
        run_id: Uuid,
        endpoint_id: &str,
        fetcher: &dyn PageFetcher,
        detail: Option<&dyn DetailFetcher>,
        overrides: RunOverrides,
    ) -> Result<SweepOutcome> {
        let started_at = Utc::now();
        let driver = PaginationDriver::new(DriverOptions {
            inter_page_delay: overrides
                .page_delay
                .unwrap_or(Duration::from_millis(self.config.page_delay_ms)),
            max_pages: overrides.max_pages,
            cancellation: Some(self.cancellation.clone()),
        });

        info!(%run_id, endpoint_id, "starting bulk fetch");
        let mut session = FetchSession::new();
        let walk = driver
            .run_all(&mut session, overrides.initial_cursor.clone(), fetcher)
            .await;

        let (records, termination, failure) = match walk {
            Ok(report) => (report.records, report.termination, None),
            Err(err) => {
                warn!(%run_id, endpoint_id, error = %err, "bulk fetch failed; exporting partial snapshot");
                (session.snapshot(), TerminationReason::Failed, Some(err))
            }
        };

        let (records, enrichment) = match detail {
            Some(detail) if failure.is_none() && !records.is_empty() => {
                let report = enrich_details(
                    records,
                    detail,
                    &EnrichOptions {
                        batch_size: self.config.detail_batch_size,
                        cancellation: Some(self.cancellation.clone()),
                        ..Default::default()
                    },
                )
                .await;
                (report.records, Some(report.summary))
            }
            _ => (records, None),
        };

        let summary = SweepRunSummary {
            run_id,
            endpoint_id: endpoint_id.to_string(),
            started_at,
            finished_at: Utc::now(),
            termination,
            total_requests: session.total_requests(),
            duplicates_found: session.duplicates_found(),
            unique_records: records.len(),
            pages: session.pages().to_vec(),
            enrichment,
            error: failure.as_ref().map(ToString::to_string),
        };

        let manifest = self.export(endpoint_id, started_at, &records, &summary).await?;
        info!(
            %run_id,
            termination = %summary.termination,
            requests = summary.total_requests,
            duplicates = summary.duplicates_found,
            unique = summary.unique_records,
            export = %manifest.directory.display(),
            "bulk fetch exported"
        );

        Ok(SweepOutcome {
            summary,
            manifest,
            failure,
        })
    }

    async fn export(
        &self,
        endpoint_id: &str,
        started_at: DateTime<Utc>,
        records: &[Record],
        summary: &SweepRunSummary,
    ) -> Result<ExportManifest> {
        self.store
            .export(endpoint_id, started_at, records, summary)
            .await
            .with_context(|| format!("exporting snapshot for {endpoint_id}"))
    }
}

/// Cancel `token` on Ctrl-C so an in-flight run exports what it has.
pub fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing current page");
            token.cancel();
        }
    });
}
