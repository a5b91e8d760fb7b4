//! Batch driver: pages through one workspace's records and enriches each.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use recon_core::{
    OutcomeKind, OverwritePolicy, RecordKind, RecordOutcome, RecordState, WorkspaceId,
};
use recon_storage::{
    BackoffPolicy, Checkpoint, CheckpointStore, SimpleTokenBucket, TokenBucketConfig,
};
use serde::Serialize;
use tokio::fs;
use tokio::sync::Semaphore;
use tokio::task::{self, JoinError, JoinSet};
use tracing::{info, warn};
use uuid::Uuid;

use crate::store::RecordFeed;
use crate::workflow::{EnrichmentWorkflow, RecordReport, RunContext};

/// Pause between consecutive records.
#[derive(Debug, Clone, Copy)]
pub enum Throttle {
    None,
    Fixed(Duration),
    TokenBucket(TokenBucketConfig),
}

enum Pacer {
    None,
    Fixed(Duration),
    Bucket(SimpleTokenBucket),
}

impl Pacer {
    fn new(throttle: Throttle) -> Self {
        match throttle {
            Throttle::None => Pacer::None,
            Throttle::Fixed(delay) if delay.is_zero() => Pacer::None,
            Throttle::Fixed(delay) => Pacer::Fixed(delay),
            Throttle::TokenBucket(config) => Pacer::Bucket(SimpleTokenBucket::from_config(config)),
        }
    }

    /// Waits before starting a record. The first record of a run starts
    /// immediately under a fixed delay.
    async fn wait(&self, first: bool) {
        match self {
            Pacer::None => {}
            Pacer::Fixed(delay) => {
                if !first {
                    tokio::time::sleep(*delay).await;
                }
            }
            Pacer::Bucket(bucket) => bucket.take().await,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub policy: OverwritePolicy,
    /// Stop after this many records (first attempts only).
    pub limit: Option<usize>,
    pub page_size: usize,
    /// Records processed at once within a page; 1 means strictly sequential.
    pub concurrency: usize,
    /// Total attempts per record for retryable outcomes.
    pub max_attempts: usize,
    pub retry_backoff: BackoffPolicy,
    pub throttle: Throttle,
    /// Continue after the saved checkpoint instead of from the beginning.
    pub resume: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            policy: OverwritePolicy::default(),
            limit: None,
            page_size: 100,
            concurrency: 1,
            max_attempts: 3,
            retry_backoff: BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(30),
            },
            throttle: Throttle::Fixed(Duration::from_millis(250)),
            resume: false,
        }
    }
}

/// Cooperative stop signal, checked between records.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordResult {
    pub record_id: String,
    pub outcome: RecordOutcome,
    pub attempts: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub run_id: Uuid,
    pub workspace_id: WorkspaceId,
    pub kind: RecordKind,
    pub source: String,
    pub policy: OverwritePolicy,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub processed: usize,
    pub counts: BTreeMap<OutcomeKind, usize>,
    pub results: Vec<RecordResult>,
    /// Records whose merge could not be persisted; need manual follow-up.
    pub persistence_failures: Vec<String>,
    /// Records still unavailable after every retry round.
    pub requeue: Vec<String>,
    pub retry_rounds: usize,
    pub cancelled: bool,
    pub resumed_after: Option<String>,
    pub checkpoint: Option<String>,
}

impl BatchSummary {
    pub fn count(&self, kind: OutcomeKind) -> usize {
        self.counts.get(&kind).copied().unwrap_or(0)
    }

    pub fn outcome_for(&self, record_id: &str) -> Option<&RecordOutcome> {
        self.results
            .iter()
            .find(|r| r.record_id == record_id)
            .map(|r| &r.outcome)
    }

    pub fn render_markdown(&self) -> String {
        let counts = OutcomeKind::ALL
            .iter()
            .map(|kind| format!("| {} | {} |", kind, self.count(*kind)))
            .collect::<Vec<_>>()
            .join("\n");
        let list = |ids: &[String]| {
            if ids.is_empty() {
                "- none".to_string()
            } else {
                ids.iter()
                    .map(|id| format!("- `{id}`"))
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        };
        format!(
            "# Enrichment Run {}\n\n- Workspace: `{}`\n- Kind: {}\n- Source: {}\n- Policy: {}\n- Started: {}\n- Finished: {}\n- Records processed: {}\n- Retry rounds: {}\n- Cancelled: {}\n- Resumed after: {}\n\n## Outcomes\n\n| outcome | count |\n|---|---|\n{}\n\n## Manual follow-up (persistence errors)\n{}\n\n## Re-queue candidates\n{}\n",
            self.run_id,
            self.workspace_id,
            self.kind,
            self.source,
            self.policy,
            self.started_at,
            self.finished_at,
            self.processed,
            self.retry_rounds,
            self.cancelled,
            self.resumed_after.as_deref().unwrap_or("-"),
            counts,
            list(&self.persistence_failures),
            list(&self.requeue),
        )
    }
}

/// Writes `summary.md` and `outcomes.json` under `<reports_root>/<run_id>/`.
pub async fn write_reports(summary: &BatchSummary, reports_root: &Path) -> Result<PathBuf> {
    let reports_dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    fs::write(reports_dir.join("summary.md"), summary.render_markdown())
        .await
        .context("writing summary.md")?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(reports_dir.join("outcomes.json"), json)
        .await
        .context("writing outcomes.json")?;

    Ok(reports_dir)
}

fn failed_task_report(record_id: &str, err: &JoinError) -> RecordReport {
    warn!(%record_id, error = %err, "record task failed");
    RecordReport {
        record_id: Some(record_id.to_string()),
        outcome: RecordOutcome::PersistenceError {
            detail: format!("record task failed: {err}"),
        },
        states: vec![RecordState::Pending, RecordState::PersistenceError],
    }
}

pub struct BatchDriver {
    workflow: Arc<EnrichmentWorkflow>,
    feed: Arc<dyn RecordFeed>,
    checkpoints: Option<CheckpointStore>,
    cancel: CancellationFlag,
}

impl BatchDriver {
    pub fn new(workflow: Arc<EnrichmentWorkflow>, feed: Arc<dyn RecordFeed>) -> Self {
        Self {
            workflow,
            feed,
            checkpoints: None,
            cancel: CancellationFlag::new(),
        }
    }

    pub fn with_checkpoints(mut self, store: CheckpointStore) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> CancellationFlag {
        self.cancel.clone()
    }

    async fn save_checkpoint(&self, ctx: &RunContext, kind: RecordKind, last: &str) {
        let Some(store) = &self.checkpoints else {
            return;
        };
        let checkpoint = Checkpoint {
            run_id: ctx.run_id,
            workspace_id: ctx.workspace_id.clone(),
            kind,
            last_processed_id: last.to_string(),
            updated_at: Utc::now(),
        };
        // Losing a checkpoint only costs rework on resume.
        if let Err(err) = store.save(&checkpoint).await {
            warn!(error = %err, "failed to save checkpoint");
        }
    }

    /// Runs one record on its own task so a panic inside the workflow costs
    /// that record only.
    async fn enrich_isolated(&self, ctx: &RunContext, kind: RecordKind, id: &str) -> RecordReport {
        let workflow = self.workflow.clone();
        let task_ctx = ctx.clone();
        let task_id = id.to_string();
        match tokio::spawn(async move { workflow.enrich_record(&task_ctx, kind, &task_id).await })
            .await
        {
            Ok(report) => report,
            Err(err) => failed_task_report(id, &err),
        }
    }

    /// Processes a page, returning reports in id order. Stops spawning new
    /// records once cancelled; records already started run to completion.
    async fn process_page(
        &self,
        ctx: &RunContext,
        kind: RecordKind,
        ids: Vec<String>,
        concurrency: usize,
        pacer: &Pacer,
        first: &mut bool,
    ) -> Vec<RecordReport> {
        if concurrency <= 1 {
            let mut reports = Vec::with_capacity(ids.len());
            for id in ids {
                if self.cancel.is_cancelled() {
                    break;
                }
                pacer.wait(*first).await;
                *first = false;
                let report = self.enrich_isolated(ctx, kind, &id).await;
                self.save_checkpoint(ctx, kind, &id).await;
                reports.push(report);
            }
            return reports;
        }

        let limit = Arc::new(Semaphore::new(concurrency));
        let mut tasks = JoinSet::new();
        let mut spawned: HashMap<task::Id, (usize, String)> = HashMap::new();
        for (index, id) in ids.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                break;
            }
            let Ok(permit) = limit.clone().acquire_owned().await else {
                break;
            };
            pacer.wait(*first).await;
            *first = false;
            let workflow = self.workflow.clone();
            let ctx = ctx.clone();
            let record_id = id.clone();
            let handle = tasks.spawn(async move {
                let _permit = permit;
                workflow.enrich_record(&ctx, kind, &record_id).await
            });
            spawned.insert(handle.id(), (index, id));
        }

        let mut finished = Vec::with_capacity(spawned.len());
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((task_id, report)) => {
                    if let Some((index, _)) = spawned.remove(&task_id) {
                        finished.push((index, report));
                    }
                }
                Err(err) => {
                    if let Some((index, id)) = spawned.remove(&err.id()) {
                        finished.push((index, failed_task_report(&id, &err)));
                    }
                }
            }
        }
        finished.sort_by_key(|(index, _)| *index);
        let reports = finished.into_iter().map(|(_, r)| r).collect::<Vec<_>>();
        if let Some(last) = reports.last().and_then(|r| r.record_id.clone()) {
            self.save_checkpoint(ctx, kind, &last).await;
        }
        reports
    }

    pub async fn run(
        &self,
        workspace_id: WorkspaceId,
        kind: RecordKind,
        options: BatchOptions,
    ) -> Result<BatchSummary> {
        let started_at = Utc::now();
        let ctx = RunContext::new(workspace_id.clone(), options.policy);
        let pacer = Pacer::new(options.throttle);

        let resumed_after = match (&self.checkpoints, options.resume) {
            (Some(store), true) => store
                .load(&workspace_id, kind)
                .await?
                .map(|checkpoint| checkpoint.last_processed_id),
            _ => None,
        };
        info!(
            run_id = %ctx.run_id,
            %workspace_id,
            %kind,
            policy = %options.policy,
            resumed_after = resumed_after.as_deref().unwrap_or("-"),
            "enrichment run started"
        );

        let mut results: Vec<RecordResult> = Vec::new();
        let mut cursor = resumed_after.clone();
        let mut exhausted = false;
        let mut first = true;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let remaining = options.limit.map(|limit| limit.saturating_sub(results.len()));
            if remaining == Some(0) {
                break;
            }
            let page_size = remaining
                .map_or(options.page_size, |r| r.min(options.page_size))
                .max(1);
            let ids = self
                .feed
                .list_record_ids(&workspace_id, kind, cursor.as_deref(), page_size)
                .await
                .with_context(|| format!("listing {kind} records for {workspace_id}"))?;
            if ids.is_empty() {
                exhausted = true;
                break;
            }
            let short_page = ids.len() < page_size;

            let reports = self
                .process_page(&ctx, kind, ids, options.concurrency, &pacer, &mut first)
                .await;
            for report in reports {
                let Some(record_id) = report.record_id else {
                    continue;
                };
                cursor = Some(record_id.clone());
                results.push(RecordResult {
                    record_id,
                    outcome: report.outcome,
                    attempts: 1,
                });
            }

            if short_page && !self.cancel.is_cancelled() {
                exhausted = true;
                break;
            }
        }

        let mut retry_rounds = 0;
        let mut pending = results
            .iter()
            .enumerate()
            .filter(|(_, r)| r.outcome.is_retryable())
            .map(|(i, _)| i)
            .collect::<Vec<_>>();
        while !pending.is_empty()
            && retry_rounds + 1 < options.max_attempts
            && !self.cancel.is_cancelled()
        {
            let delay = options.retry_backoff.delay_for_attempt(retry_rounds);
            retry_rounds += 1;
            info!(round = retry_rounds, records = pending.len(), ?delay, "retrying unavailable records");
            tokio::time::sleep(delay).await;

            let mut still_pending = Vec::new();
            for index in pending {
                if self.cancel.is_cancelled() {
                    still_pending.push(index);
                    continue;
                }
                pacer.wait(false).await;
                let entry = &mut results[index];
                let report = self.enrich_isolated(&ctx, kind, &entry.record_id).await;
                entry.outcome = report.outcome;
                entry.attempts += 1;
                if entry.outcome.is_retryable() {
                    still_pending.push(index);
                }
            }
            pending = still_pending;
        }

        let cancelled = self.cancel.is_cancelled();
        let checkpoint = match &self.checkpoints {
            Some(store) if exhausted && !cancelled => {
                store.clear(&workspace_id, kind).await?;
                None
            }
            Some(_) => cursor.clone(),
            None => None,
        };

        let mut counts = BTreeMap::new();
        for result in &results {
            *counts.entry(result.outcome.kind()).or_insert(0) += 1;
        }
        let ids_where = |kind: OutcomeKind| {
            results
                .iter()
                .filter(|r| r.outcome.kind() == kind)
                .map(|r| r.record_id.clone())
                .collect::<Vec<_>>()
        };
        let persistence_failures = ids_where(OutcomeKind::PersistenceError);
        let requeue = ids_where(OutcomeKind::ProviderUnavailable);

        let summary = BatchSummary {
            run_id: ctx.run_id,
            workspace_id,
            kind,
            source: self.workflow.source().to_string(),
            policy: options.policy,
            started_at,
            finished_at: Utc::now(),
            processed: results.len(),
            counts,
            results,
            persistence_failures,
            requeue,
            retry_rounds,
            cancelled,
            resumed_after,
            checkpoint,
        };
        info!(
            run_id = %summary.run_id,
            processed = summary.processed,
            merged = summary.count(OutcomeKind::Merged),
            requeue = summary.requeue.len(),
            cancelled,
            "enrichment run finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_are_sequential_and_throttled() {
        let options = BatchOptions::default();
        assert_eq!(options.concurrency, 1);
        assert_eq!(options.max_attempts, 3);
        assert_eq!(options.policy, OverwritePolicy::FillEmptyOnly);
        assert!(matches!(options.throttle, Throttle::Fixed(d) if d == Duration::from_millis(250)));
    }

    #[test]
    fn cancellation_is_shared_between_clones() {
        let flag = CancellationFlag::new();
        let handle = flag.clone();
        handle.cancel();
        assert!(flag.is_cancelled());
    }
}
