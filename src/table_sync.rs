// ABOUTME: Table Synchronizer - introspect, count, dispatch chunks, reconcile deletions for one table
// ABOUTME: Chunks run sequentially or on a bounded worker pool fed from a shared offset queue

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;

use crate::db::DatabaseAccess;
use crate::error::{AccessError, Result, SyncError};
use crate::planner;
use crate::progress::ChunkProgress;
use crate::reconciler::Reconciler;
use crate::schema::{self, TableSchema};
use crate::transform::TransformPolicy;
use crate::upsert::{UpsertExecutor, UpsertStrategy};

/// What the engine may assume about writers on the source during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SourceConsistency {
    /// The source is a quiescent copy; the row count snapshot is trusted
    #[default]
    Offline,
    /// The source takes writes during the run; row counts are re-checked and drift is reported
    Live,
}

/// Tunables consumed by the synchronizer. Parsing them is the caller's job.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub chunk_size: u64,
    /// Concurrent chunk workers per table; 1 means sequential dispatch
    pub workers: usize,
    pub strategy: UpsertStrategy,
    pub statement_timeout: Duration,
    /// Pause after each chunk so many workers don't monopolize the destination pool
    pub chunk_pause: Duration,
    pub source_consistency: SourceConsistency,
    pub show_progress: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            workers: 4,
            strategy: UpsertStrategy::OnConflict,
            statement_timeout: Duration::from_secs(30),
            chunk_pause: Duration::from_millis(10),
            source_consistency: SourceConsistency::Offline,
            show_progress: false,
        }
    }
}

/// Lifecycle of one table synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Introspecting,
    Counting,
    Dispatching,
    Reconciling,
    Done,
    Failed,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncPhase::Introspecting => "introspecting",
            SyncPhase::Counting => "counting",
            SyncPhase::Dispatching => "dispatching",
            SyncPhase::Reconciling => "reconciling",
            SyncPhase::Done => "done",
            SyncPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Per-table unit of work: created when the table is picked up, finished once
/// its deletion pass completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncJob {
    pub table: String,
    pub row_count: Option<u64>,
    pub skipped: bool,
}

impl SyncJob {
    pub fn new(table: impl Into<String>, skipped: bool) -> Self {
        Self {
            table: table.into(),
            row_count: None,
            skipped,
        }
    }

    /// Number of chunks the counted rows split into.
    pub fn planned_chunks(&self, chunk_size: u64) -> usize {
        self.row_count
            .map(|rows| planner::plan(rows, chunk_size).len())
            .unwrap_or(0)
    }
}

/// Summary of one table synchronization.
#[derive(Debug, Clone)]
pub struct TableReport {
    pub table: String,
    pub phase: SyncPhase,
    pub skipped: bool,
    /// True when the destination table was created during this run
    pub created: bool,
    pub rows_counted: u64,
    pub rows_fetched: u64,
    pub rows_upserted: u64,
    pub rows_deleted: u64,
    pub chunks_planned: usize,
    pub chunks_failed: usize,
    /// Source row count change observed during the run (live sources only)
    pub source_drift: Option<i64>,
    pub errors: Vec<String>,
    pub duration: Duration,
}

impl TableReport {
    fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            phase: SyncPhase::Introspecting,
            skipped: false,
            created: false,
            rows_counted: 0,
            rows_fetched: 0,
            rows_upserted: 0,
            rows_deleted: 0,
            chunks_planned: 0,
            chunks_failed: 0,
            source_drift: None,
            errors: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    /// Report for a table that failed before producing any counters.
    pub fn failed(table: &str, err: &SyncError) -> Self {
        let mut report = Self::new(table);
        report.phase = SyncPhase::Failed;
        report.errors.push(err.to_string());
        report
    }

    pub fn is_success(&self) -> bool {
        self.phase == SyncPhase::Done && self.errors.is_empty()
    }
}

#[derive(Debug, Default)]
struct ChunkStats {
    fetched: u64,
    upserted: u64,
}

/// Everything a chunk worker needs. Shared read-only between workers.
struct ChunkContext {
    source: Arc<dyn DatabaseAccess>,
    target: Arc<dyn DatabaseAccess>,
    policy: Arc<TransformPolicy>,
    schema: TableSchema,
    columns: Vec<String>,
    primary_key: String,
    options: SyncOptions,
    progress: ChunkProgress,
    aborted: AtomicBool,
}

impl ChunkContext {
    /// Extract, transform and upsert the page starting at `offset`.
    async fn process_chunk(&self, offset: u64) -> Result<ChunkStats> {
        let table = self.schema.name.as_str();

        let mut records = self
            .source
            .fetch_page(
                table,
                &self.columns,
                &self.primary_key,
                offset,
                self.options.chunk_size,
            )
            .await
            .map_err(|e| {
                SyncError::classify(self.source.name(), e, |source| SyncError::ChunkFetch {
                    table: table.to_string(),
                    offset,
                    source,
                })
            })?;

        let fetched = records.len() as u64;

        for record in &mut records {
            record
                .validate(&self.columns)
                .map_err(|reason| SyncError::InvalidRecord {
                    table: table.to_string(),
                    offset,
                    reason,
                })?;
            self.policy.transform(table, record, &self.primary_key);
        }

        let upserted = UpsertExecutor::new(
            self.target.as_ref(),
            self.options.strategy,
            self.options.statement_timeout,
        )
        .upsert(&self.schema, records)
        .await?;

        tracing::debug!(
            "Chunk {} @{}: {} rows fetched, {} upserted",
            table,
            offset,
            fetched,
            upserted
        );

        Ok(ChunkStats { fetched, upserted })
    }

    /// Run one chunk and account for it. Fatal errors stop further chunks.
    async fn run_chunk(&self, offset: u64) -> (u64, Result<ChunkStats>) {
        let result = self.process_chunk(offset).await;
        if matches!(&result, Err(e) if e.is_fatal()) {
            self.aborted.store(true, Ordering::SeqCst);
        }
        self.progress.chunk_done();

        if !self.options.chunk_pause.is_zero() {
            tokio::time::sleep(self.options.chunk_pause).await;
        }
        (offset, result)
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

/// Drives one table from introspection to reconciliation.
pub struct TableSynchronizer {
    source: Arc<dyn DatabaseAccess>,
    target: Arc<dyn DatabaseAccess>,
    policy: Arc<TransformPolicy>,
    options: SyncOptions,
}

impl TableSynchronizer {
    pub fn new(
        source: Arc<dyn DatabaseAccess>,
        target: Arc<dyn DatabaseAccess>,
        policy: Arc<TransformPolicy>,
        options: SyncOptions,
    ) -> Self {
        Self {
            source,
            target,
            policy,
            options,
        }
    }

    /// Synchronize one table.
    ///
    /// Table- and chunk-level failures are recorded in the returned report.
    /// Only a lost connection is returned as `Err`, since nothing else in the
    /// run can make progress after that.
    pub async fn sync_table(&self, mut job: SyncJob) -> Result<TableReport> {
        let start = Instant::now();
        let mut report = TableReport::new(&job.table);

        if job.skipped {
            tracing::info!("Skipping {} (on skip-list)", job.table);
            report.skipped = true;
            report.phase = SyncPhase::Done;
            return Ok(report);
        }

        let result = self.run(&mut job, &mut report).await;
        report.duration = start.elapsed();

        match result {
            Ok(()) => {
                self.enter(&mut report, SyncPhase::Done);
                Ok(report)
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                tracing::warn!("Failed to sync {} during {}: {}", job.table, report.phase, e);
                report.phase = SyncPhase::Failed;
                report.errors.push(e.to_string());
                Ok(report)
            }
        }
    }

    async fn run(&self, job: &mut SyncJob, report: &mut TableReport) -> Result<()> {
        let table = job.table.clone();

        self.enter(report, SyncPhase::Introspecting);
        let schema = schema::describe_columns(self.source.as_ref(), &table).await?;
        let primary_key = schema.key_column()?.to_string();
        report.created = schema::ensure_table_exists(self.target.as_ref(), &schema).await?;

        self.enter(report, SyncPhase::Counting);
        let row_count = self.count_rows(&table).await?;
        job.row_count = Some(row_count);
        report.rows_counted = row_count;

        if row_count > 0 {
            self.enter(report, SyncPhase::Dispatching);
            self.dispatch(schema.clone(), primary_key, row_count, report)
                .await?;

            if self.options.source_consistency == SourceConsistency::Live {
                let after = self.count_rows(&table).await?;
                let drift = after as i64 - row_count as i64;
                if drift != 0 {
                    tracing::warn!(
                        "Source row count of {} changed during sync ({} -> {}); rows may have been skipped or duplicated",
                        table,
                        row_count,
                        after
                    );
                }
                report.source_drift = Some(drift);
            }
        }

        self.enter(report, SyncPhase::Reconciling);
        let reconciler = Reconciler::new(
            self.source.as_ref(),
            self.target.as_ref(),
            self.options.statement_timeout,
        );
        let outcome = reconciler
            .reconcile_deletions(&schema, self.options.chunk_size)
            .await?;
        report.rows_deleted = outcome.deleted;

        tracing::info!(
            "Synced {}: {} fetched, {} upserted, {} deleted ({} of {} chunks failed)",
            table,
            report.rows_fetched,
            report.rows_upserted,
            report.rows_deleted,
            report.chunks_failed,
            report.chunks_planned
        );

        Ok(())
    }

    fn enter(&self, report: &mut TableReport, phase: SyncPhase) {
        tracing::debug!("{}: {} -> {}", report.table, report.phase, phase);
        report.phase = phase;
    }

    async fn count_rows(&self, table: &str) -> Result<u64> {
        let count = self.source.count(table).await.map_err(|e| {
            SyncError::classify(self.source.name(), e, |source| SyncError::Count {
                table: table.to_string(),
                source,
            })
        })?;
        Ok(count.max(0) as u64)
    }

    /// Run every planned chunk once. Chunk failures are recorded in `report`;
    /// a fatal failure is returned after in-flight chunks settle.
    async fn dispatch(
        &self,
        schema: TableSchema,
        primary_key: String,
        row_count: u64,
        report: &mut TableReport,
    ) -> Result<()> {
        let offsets = planner::plan(row_count, self.options.chunk_size);
        report.chunks_planned = offsets.len();

        let ctx = Arc::new(ChunkContext {
            source: self.source.clone(),
            target: self.target.clone(),
            policy: self.policy.clone(),
            columns: schema.column_names(),
            progress: ChunkProgress::new(&schema.name, offsets.len() as u64, self.options.show_progress),
            schema,
            primary_key,
            options: self.options.clone(),
            aborted: AtomicBool::new(false),
        });

        let workers = self.options.workers.max(1).min(offsets.len());
        tracing::info!(
            "Dispatching {} chunks of {} ({} rows, {} worker{})",
            offsets.len(),
            ctx.schema.name,
            row_count,
            workers,
            if workers == 1 { "" } else { "s" }
        );

        let results = if workers <= 1 {
            let mut results = Vec::with_capacity(offsets.len());
            for offset in offsets {
                if ctx.is_aborted() {
                    break;
                }
                results.push(ctx.run_chunk(offset).await);
            }
            results
        } else {
            Self::dispatch_pool(ctx.clone(), offsets, workers).await
        };

        ctx.progress.finish();

        let mut fatal = None;
        for (offset, result) in results {
            match result {
                Ok(stats) => {
                    report.rows_fetched += stats.fetched;
                    report.rows_upserted += stats.upserted;
                }
                Err(e) if e.is_fatal() => {
                    fatal.get_or_insert(e);
                }
                Err(e) => {
                    tracing::warn!("Chunk at offset {} of {} failed: {}", offset, report.table, e);
                    report.chunks_failed += 1;
                    report.errors.push(e.to_string());
                }
            }
        }

        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Fan chunks out to `workers` tasks pulling from one bounded queue, then
    /// wait for all of them before returning.
    async fn dispatch_pool(
        ctx: Arc<ChunkContext>,
        offsets: Vec<u64>,
        workers: usize,
    ) -> Vec<(u64, Result<ChunkStats>)> {
        let (tx, rx) = mpsc::channel::<u64>(workers * 2);
        let rx = Arc::new(Mutex::new(rx));
        let mut set = JoinSet::new();

        for _ in 0..workers {
            let rx = rx.clone();
            let ctx = ctx.clone();
            set.spawn(async move {
                let mut results = Vec::new();
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some(offset) = next else { break };
                    if ctx.is_aborted() {
                        continue;
                    }
                    results.push(ctx.run_chunk(offset).await);
                }
                results
            });
        }

        for offset in offsets {
            if tx.send(offset).await.is_err() {
                // Every worker is gone; join_next below reports why
                break;
            }
        }
        drop(tx);

        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(worker_results) => results.extend(worker_results),
                Err(e) => {
                    tracing::error!("Chunk worker for {} panicked: {}", ctx.schema.name, e);
                    results.push((
                        u64::MAX,
                        Err(SyncError::Write {
                            table: ctx.schema.name.clone(),
                            source: AccessError::Query(anyhow::anyhow!(
                                "chunk worker terminated: {}",
                                e
                            )),
                        }),
                    ));
                }
            }
        }

        results.sort_by_key(|(offset, _)| *offset);
        results
    }
}
