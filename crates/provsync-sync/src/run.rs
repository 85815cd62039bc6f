//! Run orchestration: sheet sync, enrichment and insurance-plan discovery, plus run reports.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use provsync_adapters::{
    BrowserDriver, DocumentModel, HttpBrowser, HttpBrowserConfig, OpenAiDocumentModel,
    ProviderRegistry, SourceOfTruth,
};
use provsync_core::{
    AttemptRecord, EnrichmentTarget, FailureClass, FetchOutcome, MergeReport, RecordKind,
    RunFailure, ScrapeTarget,
};
use provsync_storage::{ArtifactStore, MemoryRecordStore, PgRecordStore, RecordStore};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::change::{ChangeDetector, Detection};
use crate::config::{load_provider_registry, RunConfig};
use crate::context::{RunAborted, RunContext};
use crate::cost::{CostGuard, SpendLedger};
use crate::extraction::{Extraction, ExtractionPipeline};
use crate::plans::PlanListingSource;
use crate::reconcile::SyncReconciler;
use crate::scheduler::EnrichmentScheduler;
use crate::scraper::{EngineConfig, ScraperEngine};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    SheetSync,
    Enrichment,
    InsurancePlans,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub kind: RunKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Sources whose fingerprint matched the last committed snapshot.
    pub unchanged_sources: usize,
    pub detected_changes: usize,
    pub targets_selected: usize,
    pub fetched: usize,
    pub fetch_failures: usize,
    pub deep_calls: usize,
    pub spent: f64,
    pub merge: MergeReport,
    pub failures: Vec<RunFailure>,
}

impl RunSummary {
    fn start(ctx: &RunContext, kind: RunKind) -> Self {
        Self {
            run_id: ctx.run_id,
            kind,
            started_at: ctx.started_at,
            finished_at: ctx.started_at,
            unchanged_sources: 0,
            detected_changes: 0,
            targets_selected: 0,
            fetched: 0,
            fetch_failures: 0,
            deep_calls: 0,
            spent: 0.0,
            merge: MergeReport::default(),
            failures: Vec::new(),
        }
    }

    fn finish(mut self, ctx: &RunContext) -> Self {
        self.finished_at = Utc::now();
        self.spent = ctx.ledger.spent();
        self.failures = ctx.failures();
        self
    }
}

pub struct SyncPipeline {
    config: RunConfig,
    store: Arc<dyn RecordStore>,
    registry: Arc<ProviderRegistry>,
    driver: Arc<dyn BrowserDriver>,
    model: Option<Arc<dyn DocumentModel>>,
    artifacts: ArtifactStore,
    ledger: Arc<SpendLedger>,
}

impl SyncPipeline {
    pub fn new(
        config: RunConfig,
        store: Arc<dyn RecordStore>,
        registry: Arc<ProviderRegistry>,
        driver: Arc<dyn BrowserDriver>,
    ) -> Self {
        let artifacts = ArtifactStore::new(config.artifacts_dir.clone());
        Self {
            config,
            store,
            registry,
            driver,
            model: None,
            artifacts,
            ledger: Arc::new(SpendLedger::new()),
        }
    }

    pub fn with_model(mut self, model: Arc<dyn DocumentModel>) -> Self {
        self.model = Some(model);
        self
    }

    /// Wires the production collaborators: PostgreSQL when `DATABASE_URL` is set, the
    /// HTTP browser driver, and the OpenAI document model when a key is configured.
    pub async fn from_config(config: RunConfig) -> Result<Self> {
        let store: Arc<dyn RecordStore> = match &config.database_url {
            Some(url) => {
                let store = PgRecordStore::connect(url)
                    .await
                    .context("connecting to DATABASE_URL")?;
                store.migrate().await.context("running migrations")?;
                Arc::new(store)
            }
            None => {
                warn!("DATABASE_URL not set, records are kept in memory for this process only");
                Arc::new(MemoryRecordStore::new())
            }
        };
        let registry = Arc::new(load_provider_registry(&config.workspace_root).await?);
        let driver = HttpBrowser::new(HttpBrowserConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;

        let mut pipeline = Self::new(config.clone(), store, registry, Arc::new(driver));
        match &config.openai_api_key {
            Some(key) => {
                let model = OpenAiDocumentModel::new(key.clone()).with_model(config.openai_model.clone());
                pipeline = pipeline.with_model(Arc::new(model));
            }
            None => warn!("OPENAI_API_KEY not set, deep-tier extraction disabled"),
        }
        Ok(pipeline)
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<SpendLedger> {
        &self.ledger
    }

    /// Starts a run; the shared ledger is reset.
    pub fn new_run(&self) -> RunContext {
        RunContext::new(self.config.clone(), self.ledger.clone())
    }

    pub async fn run_sheet_sync(&self, ctx: &RunContext, source: &dyn SourceOfTruth) -> Result<RunSummary> {
        let span = info_span!("sheet_sync", run_id = %ctx.run_id, source_id = source.source_id());
        async {
            let mut summary = RunSummary::start(ctx, RunKind::SheetSync);
            self.sync_source(ctx, source, &mut summary).await?;
            anyhow::Ok(summary.finish(ctx))
        }
        .instrument(span)
        .await
    }

    pub async fn run_enrichment(&self, ctx: &RunContext, kind: RecordKind) -> Result<RunSummary> {
        let span = info_span!("enrichment", run_id = %ctx.run_id, %kind);
        async {
            let mut summary = RunSummary::start(ctx, RunKind::Enrichment);
            let engine_cancel = ctx.cancel.child_token();
            let engine = self.engine(ctx, engine_cancel.clone());
            let outcome = self.enrich(ctx, kind, &engine, &engine_cancel, &mut summary).await;
            engine.pool().close_idle().await;
            outcome?;
            anyhow::Ok(summary.finish(ctx))
        }
        .instrument(span)
        .await
    }

    /// Discovers plans on every insurer's listing pages, syncs them like a source of
    /// truth, then enriches plans missing detail fields.
    pub async fn run_insurance_plans(&self, ctx: &RunContext) -> Result<RunSummary> {
        let span = info_span!("insurance_plans", run_id = %ctx.run_id);
        async {
            let mut summary = RunSummary::start(ctx, RunKind::InsurancePlans);
            let engine_cancel = ctx.cancel.child_token();
            let engine = self.engine(ctx, engine_cancel.clone());
            let outcome = self
                .discover_and_enrich_plans(ctx, &engine, &engine_cancel, &mut summary)
                .await;
            engine.pool().close_idle().await;
            outcome?;
            anyhow::Ok(summary.finish(ctx))
        }
        .instrument(span)
        .await
    }

    async fn discover_and_enrich_plans(
        &self,
        ctx: &RunContext,
        engine: &Arc<ScraperEngine>,
        engine_cancel: &CancellationToken,
        summary: &mut RunSummary,
    ) -> Result<()> {
        for adapter in self.registry.of_kind(RecordKind::InsurancePlan) {
            ctx.check_live()?;
            let Some(listing) = adapter.listing.as_ref() else {
                continue;
            };
            let targets: Vec<ScrapeTarget> = adapter
                .listing_urls
                .iter()
                .enumerate()
                .map(|(index, url)| ScrapeTarget {
                    target_id: format!("{}:listing:{index:03}", adapter.provider_id),
                    provider_id: adapter.provider_id.clone(),
                    url: url.clone(),
                })
                .collect();

            let mut results =
                until_aborted(ctx, engine_cancel, engine.fetch_batch(targets)).await?;
            results.sort_by(|a, b| a.target_id.cmp(&b.target_id));
            summary.fetched += results.len();

            let mut pages = Vec::new();
            for scrape in results {
                if !scrape.is_success() {
                    summary.fetch_failures += 1;
                    ctx.record_failure(
                        &scrape.target_id,
                        fetch_failure_class(scrape.outcome),
                        scrape.error.unwrap_or_else(|| "listing fetch failed".to_string()),
                    );
                    continue;
                }
                match listing.discover(&scrape.content) {
                    Ok(leads) => pages.push((scrape.url, leads)),
                    Err(err) => ctx.record_failure(&scrape.target_id, FailureClass::Permanent, err.to_string()),
                }
            }

            let source = PlanListingSource::new(adapter, &pages);
            if source.is_empty() {
                ctx.record_failure(
                    &adapter.provider_id,
                    FailureClass::Permanent,
                    "no plans discovered, provider skipped",
                );
                continue;
            }
            info!(provider_id = %adapter.provider_id, plans = source.rows().len(), "plans discovered");
            self.sync_source(ctx, &source, summary).await?;
        }

        self.enrich(ctx, RecordKind::InsurancePlan, engine, engine_cancel, summary)
            .await
    }

    fn engine(&self, ctx: &RunContext, cancel: CancellationToken) -> Arc<ScraperEngine> {
        ScraperEngine::new(self.driver.clone(), EngineConfig::from(&ctx.config), cancel)
    }

    async fn sync_source(
        &self,
        ctx: &RunContext,
        source: &dyn SourceOfTruth,
        summary: &mut RunSummary,
    ) -> Result<()> {
        ctx.check_live()?;
        let detector = ChangeDetector::new(self.store.clone());
        let detection = tokio::select! {
            abort = ctx.aborted() => return Err(abort.into()),
            detection = detector.detect(source) => detection?,
        };

        let pending = match detection {
            Detection::NoChange(snapshot) => {
                info!(source_id = %snapshot.source_id, "source unchanged, nothing to merge");
                summary.unchanged_sources += 1;
                return Ok(());
            }
            Detection::Changed(pending) => pending,
        };
        summary.detected_changes += pending.change_set.changes.len();

        ctx.check_live()?;
        if !pending.change_set.is_empty() {
            let report = SyncReconciler::new(self.store.clone())
                .merge_changes(&pending.change_set)
                .await
                .context("merging change set")?;
            summary.merge.absorb(report);
        }
        detector
            .confirm(pending)
            .await
            .context("committing source snapshot")?;
        Ok(())
    }

    async fn enrich(
        &self,
        ctx: &RunContext,
        kind: RecordKind,
        engine: &Arc<ScraperEngine>,
        engine_cancel: &CancellationToken,
        summary: &mut RunSummary,
    ) -> Result<()> {
        ctx.check_live()?;
        let scheduler = EnrichmentScheduler::new(self.store.clone(), self.registry.clone(), &ctx.config);
        let batch = scheduler
            .select_batch(kind, ctx.config.max_batch_size)
            .await
            .context("selecting enrichment batch")?;
        summary.targets_selected += batch.len();
        if batch.is_empty() {
            return Ok(());
        }

        let mut attempts = Vec::new();
        let mut scrape_targets = Vec::new();
        let mut by_id = HashMap::new();
        for target in batch {
            let url = self
                .registry
                .get(&target.provider_id)
                .and_then(|adapter| adapter.listing.as_ref())
                .and_then(|listing| listing.target_url(&target));
            match url {
                Some(url) => {
                    scrape_targets.push(ScrapeTarget {
                        target_id: target.external_id.clone(),
                        provider_id: target.provider_id.clone(),
                        url,
                    });
                    by_id.insert(target.external_id.clone(), target);
                }
                None => {
                    ctx.record_failure(
                        &target.external_id,
                        FailureClass::Permanent,
                        "not enough context to build a target url",
                    );
                    attempts.push(attempt_after(&target, false));
                }
            }
        }

        let guard = CostGuard::new(ctx.ledger.clone(), ctx.config.cost_ceiling, ctx.config.min_billable);
        let pipeline = ExtractionPipeline::new(self.registry.clone(), self.model.clone(), guard, &ctx.config)
            .with_artifacts(self.artifacts.clone())
            .with_engine(engine.clone());

        let work = fetch_and_extract(
            engine,
            &pipeline,
            scrape_targets,
            &by_id,
            engine_cancel,
            ctx.config.max_concurrency,
        );
        let (fetch_failures, mut extractions) = until_aborted(ctx, engine_cancel, work).await?;
        summary.fetch_failures += fetch_failures;
        extractions.sort_by(|a, b| a.record.target_id.cmp(&b.record.target_id));

        let mut records = Vec::with_capacity(extractions.len());
        for extraction in extractions {
            let Some(target) = by_id.get(&extraction.record.target_id) else {
                continue;
            };
            summary.fetched += 1;
            if extraction.deep_called {
                summary.deep_calls += 1;
            }
            if let Some((class, message)) = &extraction.issue {
                ctx.record_failure(&target.external_id, *class, message.clone());
            }
            attempts.push(attempt_after(target, extraction.record.is_mergeable()));
            records.push(extraction.record);
        }

        ctx.check_live()?;
        let report = SyncReconciler::new(self.store.clone())
            .merge_enrichment(&records, attempts)
            .await
            .context("merging enrichment results")?;
        info!(
            %kind,
            updated = report.updated,
            inserted = report.inserted,
            conflicted = report.conflicted,
            flagged = report.flagged_for_review,
            spent = ctx.ledger.spent(),
            "enrichment batch merged"
        );
        summary.merge.absorb(report);
        Ok(())
    }
}

async fn fetch_and_extract(
    engine: &Arc<ScraperEngine>,
    pipeline: &ExtractionPipeline,
    targets: Vec<ScrapeTarget>,
    by_id: &HashMap<String, EnrichmentTarget>,
    cancel: &CancellationToken,
    concurrency: usize,
) -> (usize, Vec<Extraction>) {
    let results = engine.fetch_batch(targets).await;
    let failed = results.iter().filter(|r| !r.is_success()).count();
    let extractions = stream::iter(results)
        .map(|scrape| async move {
            if cancel.is_cancelled() {
                return None;
            }
            let target = by_id.get(&scrape.target_id)?;
            Some(pipeline.extract(&scrape, target).await)
        })
        .buffer_unordered(concurrency.max(1))
        .filter_map(|extraction| async move { extraction })
        .collect()
        .await;
    (failed, extractions)
}

/// Runs `work` until it finishes or the run is aborted. On abort the engine is
/// cancelled and `work` is drained so no browser session stays checked out.
async fn until_aborted<F: Future>(
    ctx: &RunContext,
    engine_cancel: &CancellationToken,
    work: F,
) -> Result<F::Output, RunAborted> {
    tokio::pin!(work);
    tokio::select! {
        output = &mut work => Ok(output),
        abort = ctx.aborted() => {
            engine_cancel.cancel();
            let _ = (&mut work).await;
            warn!(run_id = %ctx.run_id, reason = %abort, "run aborted, in-flight batch discarded");
            Err(abort)
        }
    }
}

fn fetch_failure_class(outcome: FetchOutcome) -> FailureClass {
    match outcome {
        FetchOutcome::PermanentFailure => FailureClass::Permanent,
        _ => FailureClass::Transient,
    }
}

fn attempt_after(target: &EnrichmentTarget, succeeded: bool) -> AttemptRecord {
    AttemptRecord {
        external_id: target.external_id.clone(),
        last_attempt_at: Some(Utc::now()),
        consecutive_failures: if succeeded {
            0
        } else {
            target.consecutive_failures.saturating_add(1)
        },
    }
}

/// Writes `run_report.json` and `brief.md` under `<reports_root>/<run_id>/`.
pub async fn write_run_report(reports_root: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(dir.join("run_report.json"), json)
        .await
        .context("writing run_report.json")?;

    let mut failure_counts: BTreeMap<String, usize> = BTreeMap::new();
    for failure in &summary.failures {
        *failure_counts.entry(format!("{:?}", failure.class)).or_default() += 1;
    }
    let failure_lines: Vec<String> = failure_counts
        .iter()
        .map(|(class, count)| format!("- {class}: {count}"))
        .collect();

    let brief = format!(
        "# Provider Sync Run\n\n- Run ID: `{}`\n- Kind: {:?}\n- Started: {}\n- Finished: {}\n- Unchanged sources: {}\n- Detected changes: {}\n- Targets selected: {}\n- Fetched: {} ({} failed)\n- Deep-tier calls: {}\n- Spent: {:.2} units\n\n## Merge\n- inserted: {}\n- updated: {}\n- removed: {}\n- conflicted: {}\n- unchanged: {}\n- flagged for review: {}\n\n## Failures\n{}\n",
        summary.run_id,
        summary.kind,
        summary.started_at,
        summary.finished_at,
        summary.unchanged_sources,
        summary.detected_changes,
        summary.targets_selected,
        summary.fetched,
        summary.fetch_failures,
        summary.deep_calls,
        summary.spent,
        summary.merge.inserted,
        summary.merge.updated,
        summary.merge.removed,
        summary.merge.conflicted,
        summary.merge.unchanged,
        summary.merge.flagged_for_review,
        if failure_lines.is_empty() {
            "- none".to_string()
        } else {
            failure_lines.join("\n")
        }
    );
    fs::write(dir.join("brief.md"), brief)
        .await
        .context("writing brief.md")?;
    Ok(dir)
}

/// Markdown digest of the `runs` most recent run reports under `<workspace_root>/reports`.
pub fn report_recent_markdown(runs: usize, workspace_root: &Path) -> Result<String> {
    let reports_root = workspace_root.join("reports");
    let mut dirs = std::fs::read_dir(&reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .filter(|entry| entry.path().join("run_report.json").exists())
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut lines = vec!["# Provider Sync Report".to_string(), String::new()];
    for dir in dirs.into_iter().take(runs.max(1)) {
        let report_path = dir.path().join("run_report.json");
        let summary: RunSummary = serde_json::from_str(
            &std::fs::read_to_string(&report_path)
                .with_context(|| format!("reading {}", report_path.display()))?,
        )
        .with_context(|| format!("parsing {}", report_path.display()))?;

        lines.push(format!("## Run `{}` ({:?})", summary.run_id, summary.kind));
        lines.push(format!("- started: {}", summary.started_at));
        if summary.unchanged_sources > 0 {
            lines.push(format!("- unchanged sources: {}", summary.unchanged_sources));
        }
        lines.push(format!("- changes: {}", summary.detected_changes));
        lines.push(format!(
            "- merged: {} inserted, {} updated, {} removed, {} conflicted",
            summary.merge.inserted, summary.merge.updated, summary.merge.removed, summary.merge.conflicted
        ));
        lines.push(format!(
            "- enrichment: {} selected, {} fetched, {} deep calls, {:.2} units",
            summary.targets_selected, summary.fetched, summary.deep_calls, summary.spent
        ));
        if summary.merge.flagged_for_review > 0 {
            lines.push(format!("- flagged for review: {}", summary.merge.flagged_for_review));
        }
        lines.push(format!("- failures: {}", summary.failures.len()));
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}
