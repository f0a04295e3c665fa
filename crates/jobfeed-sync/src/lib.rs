//! Ingestion runs: registry loading, concurrent adapter execution, run reports and snapshots.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use jobfeed_adapters::{
    adapter_for_board, AdapterError, BoardConfig, MisconfiguredBoard, SourceAdapter,
};
use jobfeed_core::{Job, JobField};
use jobfeed_storage::{DedupReport, HttpClientConfig, HttpFetcher, ListingStore};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio_cron_scheduler::{Job as CronJob, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Contents of `sources.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<BoardConfig>,
}

impl SourceRegistry {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing source registry")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Enabled boards, or exactly the named ones (enabled or not) when `only` is non-empty.
    pub fn selected<'a>(&'a self, only: &'a [String]) -> impl Iterator<Item = &'a BoardConfig> + 'a {
        self.sources.iter().filter(move |board| {
            if only.is_empty() {
                board.enabled
            } else {
                only.iter().any(|id| id == &board.source_id)
            }
        })
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub reports_dir: PathBuf,
    pub sources_path: PathBuf,
    pub fixtures_dir: PathBuf,
    pub query: String,
    pub max_pages: u32,
    pub only_sources: Vec<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub request_delay_ms: u64,
    pub scheduler_enabled: bool,
    pub sync_cron_1: String,
    pub sync_cron_2: String,
    pub export_snapshots: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://jobs.db".to_string(),
            reports_dir: PathBuf::from("./reports"),
            sources_path: PathBuf::from("sources.yaml"),
            fixtures_dir: PathBuf::from("fixtures"),
            query: "software engineer".to_string(),
            max_pages: 5,
            only_sources: Vec::new(),
            user_agent: "jobfeed-bot/0.1".to_string(),
            http_timeout_secs: 20,
            request_delay_ms: 0,
            scheduler_enabled: false,
            sync_cron_1: "0 6 * * *".to_string(),
            sync_cron_2: "0 18 * * *".to_string(),
            export_snapshots: true,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`SyncConfig::from_env`] with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let text = |key: &str, default: String| lookup(key).unwrap_or(default);
        let path = |key: &str, default: PathBuf| lookup(key).map(PathBuf::from).unwrap_or(default);

        Self {
            database_url: text("DATABASE_URL", defaults.database_url),
            reports_dir: path("REPORTS_DIR", defaults.reports_dir),
            sources_path: path("JOBFEED_SOURCES", defaults.sources_path),
            fixtures_dir: path("JOBFEED_FIXTURES_DIR", defaults.fixtures_dir),
            query: text("JOBFEED_QUERY", defaults.query),
            max_pages: parsed(&lookup, "JOBFEED_MAX_PAGES", defaults.max_pages),
            only_sources: defaults.only_sources,
            user_agent: text("JOBFEED_USER_AGENT", defaults.user_agent),
            http_timeout_secs: parsed(&lookup, "JOBFEED_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            request_delay_ms: parsed(&lookup, "JOBFEED_REQUEST_DELAY_MS", defaults.request_delay_ms),
            scheduler_enabled: flag(&lookup, "JOBFEED_SCHEDULER_ENABLED", defaults.scheduler_enabled),
            sync_cron_1: text("SYNC_CRON_1", defaults.sync_cron_1),
            sync_cron_2: text("SYNC_CRON_2", defaults.sync_cron_2),
            export_snapshots: flag(&lookup, "JOBFEED_EXPORT_SNAPSHOTS", defaults.export_snapshots),
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    match lookup(key) {
        Some(v) => matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"),
        None => default,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceCount {
    pub source: String,
    pub total: u64,
    /// Rows gained during the run, floored at zero.
    pub net_new: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub adapters: Vec<String>,
    pub dedup_before: DedupReport,
    pub dedup_after: DedupReport,
    pub sources: Vec<SourceCount>,
    pub total_jobs: u64,
    pub reports_dir: Option<String>,
}

impl SyncRunSummary {
    pub fn source(&self, source: &str) -> Option<&SourceCount> {
        self.sources.iter().find(|s| s.source == source)
    }

    pub fn net_new_total(&self) -> u64 {
        self.sources.iter().map(|s| s.net_new).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub jobs: u64,
    pub files: Vec<SnapshotFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// The ingestion coordinator: owns the primary store handle and drives adapters.
pub struct SyncPipeline {
    config: SyncConfig,
    store: ListingStore,
    http: Arc<HttpFetcher>,
}

impl SyncPipeline {
    pub async fn open(config: SyncConfig) -> Result<Self> {
        let store = ListingStore::open(&config.database_url)
            .await
            .with_context(|| format!("opening {}", config.database_url))?;
        Self::with_store(config, store)
    }

    pub fn with_store(config: SyncConfig, store: ListingStore) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            request_delay: Duration::from_millis(config.request_delay_ms),
            ..Default::default()
        })?;
        Ok(Self {
            config,
            store,
            http: Arc::new(http),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &ListingStore {
        &self.store
    }

    /// Adapters for the selected registry entries. A board whose config does not
    /// build still gets an adapter, one that fails when scraped.
    pub async fn build_adapters(&self) -> Result<Vec<Arc<dyn SourceAdapter>>> {
        let registry = SourceRegistry::load(&self.config.sources_path).await?;
        for wanted in &self.config.only_sources {
            if !registry.sources.iter().any(|s| &s.source_id == wanted) {
                warn!(source_id = %wanted, "requested source is not in the registry");
            }
        }
        let adapters: Vec<Arc<dyn SourceAdapter>> = registry
            .selected(&self.config.only_sources)
            .map(|board| {
                match adapter_for_board(
                    board.clone(),
                    &self.config.query,
                    Arc::clone(&self.http),
                    &self.config.fixtures_dir,
                ) {
                    Ok(adapter) => adapter,
                    Err(err) => {
                        error!(source_id = %board.source_id, error = %err, "board cannot be built");
                        let failed = MisconfiguredBoard::new(&board.source_id, err.to_string());
                        Arc::new(failed) as Arc<dyn SourceAdapter>
                    }
                }
            })
            .collect();
        Ok(adapters)
    }

    /// Runs every adapter concurrently between two dedup passes and reports
    /// per-source totals. Adapter failures are logged, never propagated; store
    /// failures in the dedup or counting steps abort the run.
    pub async fn run_adapters(&self, adapters: Vec<Arc<dyn SourceAdapter>>) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, adapters = adapters.len(), "sync run starting");

        let dedup_before = self
            .store
            .deduplicate()
            .await
            .context("deduplicating before run")?;
        let initial = self
            .store
            .count_by(JobField::Source)
            .await
            .context("counting jobs before run")?;

        let adapter_ids: Vec<String> = adapters.iter().map(|a| a.source_id().to_string()).collect();
        let mut tasks = Vec::with_capacity(adapters.len());
        for adapter in adapters {
            let source_id = adapter.source_id().to_string();
            let span = info_span!("adapter", source_id = %source_id, %run_id);
            let task = run_adapter(adapter, self.store.clone(), self.config.max_pages);
            tasks.push((source_id, tokio::spawn(task.instrument(span))));
        }

        for (source_id, handle) in tasks {
            match handle.await {
                Ok(Ok(())) => info!(source_id = %source_id, "adapter completed"),
                Ok(Err(err)) => error!(source_id = %source_id, error = %err, "adapter failed"),
                Err(err) if err.is_panic() => {
                    error!(source_id = %source_id, "adapter panicked")
                }
                Err(err) => error!(source_id = %source_id, error = %err, "adapter task cancelled"),
            }
        }

        let dedup_after = self
            .store
            .deduplicate()
            .await
            .context("deduplicating after run")?;
        let final_counts = self
            .store
            .count_by(JobField::Source)
            .await
            .context("counting jobs after run")?;
        self.log_diagnostics(&final_counts).await?;

        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            adapters: adapter_ids.clone(),
            dedup_before,
            dedup_after,
            sources: source_counts(&adapter_ids, &initial, &final_counts),
            total_jobs: final_counts.values().sum(),
            reports_dir: None,
        };
        info!(
            %run_id,
            total_jobs = summary.total_jobs,
            net_new = summary.net_new_total(),
            "sync run finished"
        );
        Ok(summary)
    }

    /// One full run from the registry, followed by reports under `reports/<run_id>/`.
    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let adapters = self.build_adapters().await?;
        let mut summary = self.run_adapters(adapters).await?;

        let run_dir = self.config.reports_dir.join(summary.run_id.to_string());
        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("creating {}", run_dir.display()))?;
        summary.reports_dir = Some(run_dir.display().to_string());

        if self.config.export_snapshots {
            self.export_snapshots(&run_dir, summary.run_id).await?;
        }
        write_reports(&run_dir, &summary).await?;
        Ok(summary)
    }

    /// Writes the whole jobs table as parquet and JSON plus a checksummed manifest.
    pub async fn export_snapshots(&self, run_dir: &Path, run_id: Uuid) -> Result<PathBuf> {
        let snapshot_dir = run_dir.join("snapshots");
        fs::create_dir_all(&snapshot_dir)
            .await
            .with_context(|| format!("creating {}", snapshot_dir.display()))?;

        let jobs = self.store.all().await.context("reading jobs for snapshot")?;
        let parquet_path = snapshot_dir.join("jobs.parquet");
        let json_path = snapshot_dir.join("jobs.json");

        write_jobs_parquet(&parquet_path, &jobs)?;
        let json = serde_json::to_vec_pretty(&jobs).context("serializing jobs snapshot")?;
        fs::write(&json_path, json)
            .await
            .with_context(|| format!("writing {}", json_path.display()))?;

        let manifest = SnapshotManifest {
            schema_version: 1,
            run_id,
            jobs: jobs.len() as u64,
            files: vec![
                manifest_entry("jobs", run_dir, &parquet_path)?,
                manifest_entry("jobs_json", run_dir, &json_path)?,
            ],
        };
        let manifest_path = snapshot_dir.join("manifest.json");
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
        fs::write(&manifest_path, bytes)
            .await
            .with_context(|| format!("writing {}", manifest_path.display()))?;
        Ok(manifest_path)
    }

    /// Cron jobs calling [`SyncPipeline::run_once`]; `None` when the scheduler is disabled.
    pub async fn maybe_build_scheduler(self: Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for cron in [&self.config.sync_cron_1, &self.config.sync_cron_2] {
            let pipeline = Arc::clone(&self);
            let job = CronJob::new_async(cron.as_str(), move |_uuid, _l| {
                let pipeline = Arc::clone(&pipeline);
                Box::pin(async move {
                    match pipeline.run_once().await {
                        Ok(summary) => info!(
                            run_id = %summary.run_id,
                            net_new = summary.net_new_total(),
                            "scheduled sync finished"
                        ),
                        Err(err) => error!(error = %format!("{err:#}"), "scheduled sync failed"),
                    }
                })
            })
            .with_context(|| format!("creating scheduler job for cron {cron}"))?;
            sched.add(job).await.context("adding scheduler job")?;
        }
        Ok(Some(sched))
    }

    /// Runs the cron scheduler until ctrl-c.
    pub async fn run_scheduler(self: Arc<Self>) -> Result<()> {
        let Some(mut sched) = self.maybe_build_scheduler().await? else {
            warn!("scheduler disabled; set JOBFEED_SCHEDULER_ENABLED=1");
            return Ok(());
        };
        sched.start().await.context("starting scheduler")?;
        info!("scheduler running");
        tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
        sched.shutdown().await.context("stopping scheduler")?;
        Ok(())
    }

    async fn log_diagnostics(&self, counts: &BTreeMap<String, u64>) -> Result<()> {
        for (source, jobs) in counts {
            info!(source = %source, jobs, "jobs by source");
        }
        let remaining = self.store.duplicate_links().await?;
        if !remaining.is_empty() {
            warn!(links = remaining.len(), "duplicate links remain after dedup");
        }
        let missing_title = self.store.count_placeholder(JobField::Title).await?;
        let missing_link = self.store.count_placeholder(JobField::Link).await?;
        if missing_title > 0 || missing_link > 0 {
            warn!(missing_title, missing_link, "jobs with placeholder fields");
        }
        Ok(())
    }
}

/// Each adapter writes through its own connection.
async fn run_adapter(
    adapter: Arc<dyn SourceAdapter>,
    store: ListingStore,
    max_pages: u32,
) -> Result<(), AdapterError> {
    let handle = store.reconnect().await?;
    let result = adapter.scrape(&handle, max_pages).await;
    handle.close().await;
    result
}

fn source_counts(
    adapter_ids: &[String],
    initial: &BTreeMap<String, u64>,
    final_counts: &BTreeMap<String, u64>,
) -> Vec<SourceCount> {
    let names: BTreeSet<&str> = adapter_ids
        .iter()
        .chain(initial.keys())
        .chain(final_counts.keys())
        .map(String::as_str)
        .collect();

    names
        .into_iter()
        .map(|source| {
            let total = final_counts.get(source).copied().unwrap_or(0);
            let before = initial.get(source).copied().unwrap_or(0);
            SourceCount {
                source: source.to_string(),
                total,
                net_new: total.saturating_sub(before),
            }
        })
        .collect()
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let pipeline = SyncPipeline::open(SyncConfig::from_env()).await?;
    pipeline.run_once().await
}

pub fn render_run_brief(summary: &SyncRunSummary) -> String {
    let mut out = format!(
        "# Jobfeed Run Brief\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Adapters: {}\n- Duplicates removed: {} before, {} after\n- Jobs in store: {}\n- New this run: {}\n\n## Sources\n\n| source | total | new |\n|---|---|---|\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        if summary.adapters.is_empty() {
            "none".to_string()
        } else {
            summary.adapters.join(", ")
        },
        summary.dedup_before.removed,
        summary.dedup_after.removed,
        summary.total_jobs,
        summary.net_new_total(),
    );
    for source in &summary.sources {
        out.push_str(&format!(
            "| {} | {} | {} |\n",
            source.source, source.total, source.net_new
        ));
    }
    out
}

async fn write_reports(run_dir: &Path, summary: &SyncRunSummary) -> Result<()> {
    fs::write(run_dir.join("run_brief.md"), render_run_brief(summary))
        .await
        .context("writing run_brief.md")?;
    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(run_dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;
    Ok(())
}

/// Markdown digest of the `runs` most recent run directories under `reports_root`.
pub fn report_markdown(runs: usize, reports_root: &Path) -> Result<String> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
    {
        let dir = entry?.path();
        let summary_path = dir.join("run_summary.json");
        if !summary_path.is_file() {
            continue;
        }
        let value: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&summary_path)
                .with_context(|| format!("reading {}", summary_path.display()))?,
        )
        .with_context(|| format!("parsing {}", summary_path.display()))?;
        let started = value
            .get("started_at")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        found.push((started, dir, value));
    }
    found.sort_by(|a, b| b.0.cmp(&a.0));

    let mut lines = vec!["# Jobfeed Runs".to_string(), String::new()];
    if found.is_empty() {
        lines.push("No runs recorded yet.".to_string());
    }
    for (started, dir, value) in found.into_iter().take(runs.max(1)) {
        let run_id = value
            .get("run_id")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        let total = value.get("total_jobs").and_then(|v| v.as_u64()).unwrap_or(0);
        let sources = value
            .get("sources")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let net_new: u64 = sources
            .iter()
            .filter_map(|s| s.get("net_new").and_then(|v| v.as_u64()))
            .sum();

        lines.push(format!("## Run `{run_id}`"));
        lines.push(format!("- started: {started}"));
        lines.push(format!("- jobs in store: {total}"));
        lines.push(format!("- new listings: {net_new}"));
        for source in &sources {
            lines.push(format!(
                "  - {}: {} new, {} total",
                source.get("source").and_then(|v| v.as_str()).unwrap_or("?"),
                source.get("net_new").and_then(|v| v.as_u64()).unwrap_or(0),
                source.get("total").and_then(|v| v.as_u64()).unwrap_or(0),
            ));
        }
        let brief = dir.join("run_brief.md");
        if brief.exists() {
            lines.push(format!("- brief: `{}`", brief.display()));
        }
        let manifest = dir.join("snapshots").join("manifest.json");
        if manifest.exists() {
            lines.push(format!("- snapshot manifest: `{}`", manifest.display()));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_jobs_parquet(path: &Path, jobs: &[Job]) -> Result<()> {
    let mut fields = vec![ArrowField::new("id", DataType::Utf8, false)];
    let mut columns: Vec<ArrayRef> = vec![Arc::new(StringArray::from(
        jobs.iter().map(|j| j.id.as_str()).collect::<Vec<_>>(),
    ))];
    for field in JobField::ALL {
        fields.push(ArrowField::new(field.column(), DataType::Utf8, false));
        columns.push(Arc::new(StringArray::from(
            jobs.iter().map(|j| field.value(j)).collect::<Vec<_>>(),
        )));
    }

    let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
        .context("building jobs record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, run_dir: &Path, path: &Path) -> Result<SnapshotFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let sha256 = hex::encode(Sha256::digest(&bytes));
    let rel = path
        .strip_prefix(run_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(SnapshotFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use jobfeed_core::{normalize, RawJob};
    use std::collections::HashMap;

    struct FailingAdapter;

    #[async_trait]
    impl SourceAdapter for FailingAdapter {
        fn source_id(&self) -> &str {
            "broken"
        }

        async fn scrape(&self, _store: &ListingStore, _max_pages: u32) -> Result<(), AdapterError> {
            Err(AdapterError::Message("site unreachable".into()))
        }
    }

    struct PanickingAdapter;

    #[async_trait]
    impl SourceAdapter for PanickingAdapter {
        fn source_id(&self) -> &str {
            "panicky"
        }

        async fn scrape(&self, _store: &ListingStore, _max_pages: u32) -> Result<(), AdapterError> {
            panic!("selector blew up");
        }
    }

    struct LinkAdapter {
        source: String,
        links: Vec<String>,
    }

    impl LinkAdapter {
        fn new(source: &str, domain: &str, n: usize) -> Self {
            Self {
                source: source.to_string(),
                links: (0..n).map(|i| format!("https://{domain}/jobs/{i}")).collect(),
            }
        }
    }

    #[async_trait]
    impl SourceAdapter for LinkAdapter {
        fn source_id(&self) -> &str {
            &self.source
        }

        async fn scrape(&self, store: &ListingStore, _max_pages: u32) -> Result<(), AdapterError> {
            for link in &self.links {
                let raw = RawJob {
                    title: Some("Engineer".into()),
                    link: Some(link.clone()),
                    ..RawJob::default()
                };
                store.insert_if_absent(&normalize(raw.with_default_source(&self.source))).await?;
            }
            Ok(())
        }
    }

    fn job(source: &str, link: &str) -> Job {
        normalize(RawJob {
            title: Some("Engineer".into()),
            link: Some(link.into()),
            source: Some(source.into()),
            ..RawJob::default()
        })
    }

    async fn pipeline(dir: &tempfile::TempDir) -> SyncPipeline {
        let store = ListingStore::open_path(dir.path().join("jobs.db"))
            .await
            .unwrap();
        let config = SyncConfig {
            reports_dir: dir.path().join("reports"),
            ..SyncConfig::default()
        };
        SyncPipeline::with_store(config, store).unwrap()
    }

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
    }

    #[tokio::test]
    async fn failing_adapter_does_not_affect_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(&dir).await;

        let summary = pipeline
            .run_adapters(vec![
                Arc::new(FailingAdapter),
                Arc::new(LinkAdapter::new("boardb", "b.example", 5)),
            ])
            .await
            .unwrap();

        let broken = summary.source("broken").unwrap();
        assert_eq!((broken.total, broken.net_new), (0, 0));
        let b = summary.source("boardb").unwrap();
        assert_eq!((b.total, b.net_new), (5, 5));
        assert_eq!(summary.adapters, vec!["broken", "boardb"]);
        assert_eq!(pipeline.store().count().await.unwrap(), 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn panicking_adapter_is_contained() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(&dir).await;

        let summary = pipeline
            .run_adapters(vec![
                Arc::new(PanickingAdapter),
                Arc::new(LinkAdapter::new("boardb", "b.example", 3)),
            ])
            .await
            .unwrap();

        assert_eq!(summary.source("panicky").unwrap().net_new, 0);
        assert_eq!(summary.source("boardb").unwrap().net_new, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_adapters_lose_no_rows() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(&dir).await;

        let summary = pipeline
            .run_adapters(vec![
                Arc::new(LinkAdapter::new("boarda", "domain-a.example", 40)),
                Arc::new(LinkAdapter::new("boardb", "domain-b.example", 40)),
            ])
            .await
            .unwrap();

        assert_eq!(summary.total_jobs, 80);
        assert_eq!(summary.dedup_after.removed, 0);
        let jobs = pipeline.store().all().await.unwrap();
        let links: BTreeSet<_> = jobs.iter().map(|j| j.link.as_str()).collect();
        assert_eq!(links.len(), 80);
        for job in &jobs {
            let expected = if job.link.contains("domain-a") { "boarda" } else { "boardb" };
            assert_eq!(job.source, expected);
        }
    }

    #[tokio::test]
    async fn duplicates_of_existing_rows_count_as_nothing_new() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(&dir).await;
        let store = pipeline.store();
        store.insert_if_absent(&job("boarda", "https://a.example/jobs/0")).await.unwrap();
        store.insert_if_absent(&job("boarda", "https://a.example/jobs/0")).await.unwrap();
        store.insert_if_absent(&job("boarda", "https://a.example/jobs/1")).await.unwrap();

        let summary = pipeline
            .run_adapters(vec![Arc::new(LinkAdapter::new("boarda", "a.example", 3))])
            .await
            .unwrap();

        // the stale duplicate is cleared before counting starts
        assert_eq!(summary.dedup_before.removed, 1);
        assert_eq!(summary.dedup_after.removed, 2);
        let a = summary.source("boarda").unwrap();
        assert_eq!((a.total, a.net_new), (3, 1));
    }

    #[test]
    fn net_new_is_floored_at_zero() {
        let initial = BTreeMap::from([("a".to_string(), 7u64), ("gone".to_string(), 2)]);
        let final_counts = BTreeMap::from([("a".to_string(), 4u64), ("c".to_string(), 1)]);
        let counts = source_counts(&["b".to_string()], &initial, &final_counts);

        let by_name: HashMap<_, _> = counts.iter().map(|c| (c.source.as_str(), c)).collect();
        assert_eq!(by_name["a"].net_new, 0);
        assert_eq!(by_name["a"].total, 4);
        assert_eq!(by_name["b"].total, 0);
        assert_eq!(by_name["c"].net_new, 1);
        assert_eq!(by_name["gone"].total, 0);
    }

    #[tokio::test]
    async fn run_once_writes_reports_and_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let registry_path = dir.path().join("sources.yaml");
        std::fs::write(
            &registry_path,
            r#"
sources:
  - source_id: remoteok
    display_name: Remote OK
    mode: fixture
    listing_url: "https://remoteok.com/remote-{query}-jobs?page={page}"
    default_location: Remote
    selectors:
      card: "tr.job"
      title: "h2"
      link_attr: "data-href"
      company: "h3"
  - source_id: weworkremotely
    display_name: We Work Remotely
    enabled: false
    mode: fixture
    listing_url: "https://weworkremotely.com/remote-jobs/search?term={query}"
    selectors:
      card: "li.new-listing-container"
"#,
        )
        .unwrap();

        let store = ListingStore::open_path(dir.path().join("jobs.db")).await.unwrap();
        let config = SyncConfig {
            reports_dir: dir.path().join("reports"),
            sources_path: registry_path,
            fixtures_dir: workspace_root().join("fixtures"),
            ..SyncConfig::default()
        };
        let pipeline = SyncPipeline::with_store(config, store).unwrap();
        let summary = pipeline.run_once().await.unwrap();

        assert_eq!(summary.adapters, vec!["remoteok"]);
        let remoteok = summary.source("remoteok").unwrap();
        assert_eq!((remoteok.total, remoteok.net_new), (4, 4));
        assert_eq!(summary.dedup_after.removed, 1);

        let run_dir = PathBuf::from(summary.reports_dir.as_deref().unwrap());
        assert!(run_dir.join("run_brief.md").is_file());
        assert!(run_dir.join("run_summary.json").is_file());
        assert!(run_dir.join("snapshots/jobs.parquet").is_file());

        let manifest: SnapshotManifest = serde_json::from_str(
            &std::fs::read_to_string(run_dir.join("snapshots/manifest.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(manifest.jobs, 4);
        assert_eq!(manifest.files.len(), 2);
        assert!(manifest.files.iter().all(|f| f.sha256.len() == 64 && f.bytes > 0));

        let snapshot: Vec<Job> = serde_json::from_str(
            &std::fs::read_to_string(run_dir.join("snapshots/jobs.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(snapshot.len(), 4);

        let file = File::open(run_dir.join("snapshots/jobs.parquet")).unwrap();
        let reader = parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder::try_new(file)
            .unwrap()
            .build()
            .unwrap();
        let rows: usize = reader.map(|batch| batch.unwrap().num_rows()).sum();
        assert_eq!(rows, 4);

        let digest = report_markdown(3, &dir.path().join("reports")).unwrap();
        assert!(digest.contains(&summary.run_id.to_string()));
        assert!(digest.contains("remoteok: 4 new, 4 total"));
    }

    async fn registry_pipeline(dir: &tempfile::TempDir, registry: &str) -> SyncPipeline {
        let registry_path = dir.path().join("sources.yaml");
        std::fs::write(&registry_path, registry).unwrap();
        let store = ListingStore::open_path(dir.path().join("jobs.db")).await.unwrap();
        let config = SyncConfig {
            reports_dir: dir.path().join("reports"),
            sources_path: registry_path,
            fixtures_dir: workspace_root().join("fixtures"),
            export_snapshots: false,
            ..SyncConfig::default()
        };
        SyncPipeline::with_store(config, store).unwrap()
    }

    #[tokio::test]
    async fn bad_board_config_does_not_stop_other_boards() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = registry_pipeline(
            &dir,
            r#"
sources:
  - source_id: remoteok
    display_name: Remote OK
    mode: fixture
    listing_url: "https://remoteok.com/remote-{query}-jobs?page={page}"
    selectors:
      card: "tr.job"
      title: "h2"
      link_attr: "data-href"
  - source_id: broken
    display_name: Broken
    mode: fixture
    listing_url: "https://broken.example/{page}"
    selectors:
      card: "li..job"
"#,
        )
        .await;

        let summary = pipeline.run_once().await.unwrap();

        assert_eq!(summary.adapters, vec!["remoteok", "broken"]);
        let remoteok = summary.source("remoteok").unwrap();
        assert_eq!((remoteok.total, remoteok.net_new), (4, 4));
        let broken = summary.source("broken").unwrap();
        assert_eq!((broken.total, broken.net_new), (0, 0));
    }

    #[tokio::test]
    async fn run_reports_counts_when_every_adapter_fails() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = registry_pipeline(
            &dir,
            r#"
sources:
  - source_id: broken
    display_name: Broken
    mode: fixture
    listing_url: "https://broken.example/{page}"
    selectors:
      card: "li..job"
  - source_id: offline
    display_name: Offline
    mode: live
    listing_url: "https://bad host/{query}?page={page}"
    selectors:
      card: "li"
"#,
        )
        .await;

        let summary = pipeline.run_once().await.unwrap();

        assert_eq!(summary.total_jobs, 0);
        assert_eq!(summary.sources.len(), 2);
        assert!(summary.sources.iter().all(|s| s.total == 0 && s.net_new == 0));
        let run_dir = PathBuf::from(summary.reports_dir.as_deref().unwrap());
        assert!(run_dir.join("run_summary.json").is_file());
    }

    #[tokio::test]
    async fn misconfigured_board_fails_when_scraped() {
        let dir = tempfile::tempdir().unwrap();
        let store = ListingStore::open_path(dir.path().join("jobs.db")).await.unwrap();
        let board = MisconfiguredBoard::new("broken", "invalid selector `li..job`");

        assert_eq!(board.source_id(), "broken");
        let err = board.scrape(&store, 3).await.unwrap_err();
        assert!(matches!(err, AdapterError::Message(ref m) if m.contains("li..job")));
    }

    #[tokio::test]
    async fn only_sources_can_select_disabled_boards() {
        let registry = SourceRegistry::from_yaml(
            r#"
sources:
  - source_id: on
    display_name: On
    mode: fixture
    listing_url: "https://on.example/{page}"
    selectors: { card: "li" }
  - source_id: off
    display_name: Off
    enabled: false
    mode: fixture
    listing_url: "https://off.example/{page}"
    selectors: { card: "li" }
"#,
        )
        .unwrap();

        let default: Vec<_> = registry.selected(&[]).map(|b| b.source_id.as_str()).collect();
        assert_eq!(default, vec!["on"]);
        let only = vec!["off".to_string()];
        let picked: Vec<_> = registry.selected(&only).map(|b| b.source_id.as_str()).collect();
        assert_eq!(picked, vec!["off"]);
    }

    #[test]
    fn config_reads_overrides() {
        let vars = HashMap::from([
            ("DATABASE_URL", "sqlite:///tmp/feed.db"),
            ("JOBFEED_MAX_PAGES", "3"),
            ("JOBFEED_SCHEDULER_ENABLED", "true"),
            ("JOBFEED_EXPORT_SNAPSHOTS", "0"),
            ("JOBFEED_HTTP_TIMEOUT_SECS", "not-a-number"),
        ]);
        let config = SyncConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.database_url, "sqlite:///tmp/feed.db");
        assert_eq!(config.max_pages, 3);
        assert!(config.scheduler_enabled);
        assert!(!config.export_snapshots);
        assert_eq!(config.http_timeout_secs, 20);
        assert_eq!(config.query, "software engineer");
    }

    #[tokio::test]
    async fn disabled_scheduler_is_not_built() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Arc::new(pipeline(&dir).await);
        assert!(pipeline.maybe_build_scheduler().await.unwrap().is_none());
    }

    #[test]
    fn brief_lists_every_source() {
        let summary = SyncRunSummary {
            run_id: Uuid::nil(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            adapters: vec!["a".into(), "b".into()],
            dedup_before: DedupReport::default(),
            dedup_after: DedupReport::default(),
            sources: vec![
                SourceCount { source: "a".into(), total: 2, net_new: 2 },
                SourceCount { source: "b".into(), total: 0, net_new: 0 },
            ],
            total_jobs: 2,
            reports_dir: None,
        };
        let brief = render_run_brief(&summary);
        assert!(brief.contains("- Adapters: a, b"));
        assert!(brief.contains("| a | 2 | 2 |"));
        assert!(brief.contains("| b | 0 | 0 |"));
        assert!(brief.contains("- New this run: 2"));
    }
}
