// ABOUTME: Sync Orchestrator - walks the environment chain hop by hop, one table at a time
// ABOUTME: Aggregates per-table reports into hop and chain reports with a pass/fail verdict

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::db::DatabaseAccess;
use crate::error::{Result, SyncError};
use crate::table_sync::{SyncJob, SyncOptions, TableReport, TableSynchronizer};
use crate::transform::TransformPolicy;

/// Outcome of one source → destination hop.
#[derive(Debug, Clone)]
pub struct HopReport {
    pub source: String,
    pub target: String,
    pub tables: Vec<TableReport>,
    /// Hop-level failure that stopped table processing (listing, connectivity)
    pub error: Option<String>,
    pub duration: Duration,
}

impl HopReport {
    fn new(source: &str, target: &str) -> Self {
        Self {
            source: source.to_string(),
            target: target.to_string(),
            tables: Vec::new(),
            error: None,
            duration: Duration::ZERO,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.tables.iter().all(|t| t.is_success())
    }

    pub fn failed_tables(&self) -> Vec<&TableReport> {
        self.tables.iter().filter(|t| !t.is_success()).collect()
    }

    pub fn synced_count(&self) -> usize {
        self.tables
            .iter()
            .filter(|t| !t.skipped && t.is_success())
            .count()
    }

    pub fn skipped_count(&self) -> usize {
        self.tables.iter().filter(|t| t.skipped).count()
    }
}

/// Outcome of a whole run across every hop of the chain.
#[derive(Debug, Clone, Default)]
pub struct ChainReport {
    pub hops: Vec<HopReport>,
    /// Set when a run-fatal error aborted the chain
    pub aborted: Option<String>,
    pub duration: Duration,
}

impl ChainReport {
    pub fn is_success(&self) -> bool {
        self.aborted.is_none() && self.hops.iter().all(|h| h.is_success())
    }

    pub fn rows_upserted(&self) -> u64 {
        self.hops
            .iter()
            .flat_map(|h| &h.tables)
            .map(|t| t.rows_upserted)
            .sum()
    }

    pub fn rows_deleted(&self) -> u64 {
        self.hops
            .iter()
            .flat_map(|h| &h.tables)
            .map(|t| t.rows_deleted)
            .sum()
    }

    /// Print a human-readable summary of the run to stdout.
    pub fn print(&self) {
        println!();
        println!("Sync Summary");
        println!("{}", "═".repeat(61));
        println!();

        for hop in &self.hops {
            println!("{} → {}:", hop.source, hop.target);
            for table in &hop.tables {
                let icon = if table.skipped {
                    "-"
                } else if table.is_success() {
                    "✓"
                } else {
                    "✗"
                };

                if table.skipped {
                    println!("  {} {} (skipped)", icon, table.table);
                    continue;
                }

                println!(
                    "  {} {}: {} upserted, {} deleted in {:.1}s",
                    icon,
                    table.table,
                    table.rows_upserted,
                    table.rows_deleted,
                    table.duration.as_secs_f64()
                );
                if let Some(drift) = table.source_drift.filter(|d| *d != 0) {
                    println!("      source row count drifted by {:+} during sync", drift);
                }
                for error in &table.errors {
                    println!("      {}", error);
                }
            }
            if let Some(error) = &hop.error {
                println!("  ✗ {}", error);
            }
            println!(
                "  {} synced, {} skipped, {} failed ({:.1}s)",
                hop.synced_count(),
                hop.skipped_count(),
                hop.failed_tables().len(),
                hop.duration.as_secs_f64()
            );
            println!();
        }

        println!("{}", "═".repeat(61));
        println!("Total time: {:.1}s", self.duration.as_secs_f64());
        if let Some(reason) = &self.aborted {
            println!("ABORTED: {}", reason);
        } else if self.is_success() {
            println!(
                "PASSED: {} rows upserted, {} rows deleted",
                self.rows_upserted(),
                self.rows_deleted()
            );
        } else {
            let failed: usize = self.hops.iter().map(|h| h.failed_tables().len()).sum();
            println!("FAILED: {} table(s) did not sync cleanly", failed);
        }
        println!();
    }
}

/// Runs table synchronizers across an ordered chain of databases.
pub struct SyncOrchestrator {
    options: SyncOptions,
    skip_tables: BTreeSet<String>,
    policy: Arc<TransformPolicy>,
}

impl SyncOrchestrator {
    pub fn new(options: SyncOptions, skip_tables: &[String], policy: TransformPolicy) -> Self {
        Self {
            options,
            skip_tables: skip_tables.iter().cloned().collect(),
            policy: Arc::new(policy),
        }
    }

    pub fn is_skipped(&self, table: &str) -> bool {
        self.skip_tables.contains(table)
    }

    /// List the jobs a hop out of `source` would run, without touching any
    /// destination.
    pub async fn plan(&self, source: &dyn DatabaseAccess) -> Result<Vec<SyncJob>> {
        let tables = self.list_tables(source).await?;
        let mut jobs = Vec::with_capacity(tables.len());

        for table in tables {
            let mut job = SyncJob::new(&table, self.is_skipped(&table));
            if !job.skipped {
                let count = source.count(&table).await.map_err(|e| {
                    SyncError::classify(source.name(), e, |source| SyncError::Count {
                        table: table.clone(),
                        source,
                    })
                })?;
                job.row_count = Some(count.max(0) as u64);
            }
            jobs.push(job);
        }

        Ok(jobs)
    }

    /// Synchronize each adjacent pair of `chain`, in order.
    ///
    /// A hop whose tables can't be listed ends the run, since later hops would
    /// read from a destination that was never refreshed. Failed tables are
    /// recorded and the hop moves on.
    ///
    /// # Returns
    ///
    /// The chain report, or a configuration error when fewer than two databases are given.
    pub async fn sync_chain(&self, chain: &[Arc<dyn DatabaseAccess>]) -> Result<ChainReport> {
        self.sync_chain_with(chain.len(), |position| {
            std::future::ready(Ok(chain[position].clone()))
        })
        .await
    }

    /// Like [`sync_chain`](Self::sync_chain), but each database of a chain of
    /// `len` is opened with `connect(position)` only once the run reaches it,
    /// so `d0 → d1` completes before `d2` is ever contacted.
    ///
    /// A failure to open a database aborts the chain after the hops already run.
    pub async fn sync_chain_with<F, Fut>(&self, len: usize, mut connect: F) -> Result<ChainReport>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<Arc<dyn DatabaseAccess>>>,
    {
        if len < 2 {
            return Err(SyncError::Config(format!(
                "a sync chain needs at least two databases, got {}",
                len
            )));
        }

        let start = Instant::now();
        let mut report = ChainReport::default();

        let mut source = match connect(0).await {
            Ok(db) => db,
            Err(e) => {
                tracing::error!("Aborting sync chain: {}", e);
                report.aborted = Some(e.to_string());
                report.duration = start.elapsed();
                return Ok(report);
            }
        };

        for position in 1..len {
            let target = match connect(position).await {
                Ok(db) => db,
                Err(e) => {
                    tracing::error!("Aborting sync chain: {}", e);
                    report.aborted = Some(e.to_string());
                    break;
                }
            };
            tracing::info!("Starting hop {} → {}", source.name(), target.name());

            let hop = match self.sync_hop(source.clone(), target.clone()).await {
                Ok(hop) => hop,
                Err((hop, e)) => {
                    tracing::error!("Aborting sync chain: {}", e);
                    report.aborted = Some(e.to_string());
                    report.hops.push(hop);
                    break;
                }
            };

            let stop = hop.error.is_some();
            report.hops.push(hop);
            if stop {
                tracing::error!("Stopping sync chain after failed hop");
                break;
            }
            source = target;
        }

        report.duration = start.elapsed();
        Ok(report)
    }

    /// Run one hop. A fatal error is returned alongside the partial report.
    async fn sync_hop(
        &self,
        source: Arc<dyn DatabaseAccess>,
        target: Arc<dyn DatabaseAccess>,
    ) -> std::result::Result<HopReport, (HopReport, SyncError)> {
        let start = Instant::now();
        let mut hop = HopReport::new(source.name(), target.name());

        for db in [&source, &target] {
            if let Err(e) = db.ping().await {
                let err = SyncError::Connection {
                    database: db.name().to_string(),
                    source: e,
                };
                hop.error = Some(err.to_string());
                hop.duration = start.elapsed();
                return Err((hop, err));
            }
        }

        let tables = match self.list_tables(source.as_ref()).await {
            Ok(tables) => tables,
            Err(e) if e.is_fatal() => {
                hop.error = Some(e.to_string());
                hop.duration = start.elapsed();
                return Err((hop, e));
            }
            Err(e) => {
                tracing::error!("Failed to list tables on {}: {}", source.name(), e);
                hop.error = Some(e.to_string());
                hop.duration = start.elapsed();
                return Ok(hop);
            }
        };

        tracing::info!(
            "Found {} tables on {} ({} skipped)",
            tables.len(),
            source.name(),
            tables.iter().filter(|t| self.is_skipped(t)).count()
        );

        let synchronizer = TableSynchronizer::new(
            source.clone(),
            target.clone(),
            self.policy.clone(),
            self.options.clone(),
        );

        for table in tables {
            let job = SyncJob::new(&table, self.is_skipped(&table));
            match synchronizer.sync_table(job).await {
                Ok(table_report) => hop.tables.push(table_report),
                Err(e) => {
                    hop.tables.push(TableReport::failed(&table, &e));
                    hop.duration = start.elapsed();
                    return Err((hop, e));
                }
            }
        }

        hop.duration = start.elapsed();
        tracing::info!(
            "Finished hop {} → {}: {} synced, {} skipped, {} failed",
            hop.source,
            hop.target,
            hop.synced_count(),
            hop.skipped_count(),
            hop.failed_tables().len()
        );
        Ok(hop)
    }

    async fn list_tables(&self, source: &dyn DatabaseAccess) -> Result<Vec<String>> {
        source.list_tables().await.map_err(|e| {
            SyncError::classify(source.name(), e, |e| {
                SyncError::Config(format!("failed to list tables on {}: {}", source.name(), e))
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table_sync::SyncPhase;

    fn done(table: &str) -> TableReport {
        let mut report = TableReport::failed(table, &SyncError::Config("x".into()));
        report.phase = SyncPhase::Done;
        report.errors.clear();
        report
    }

    #[test]
    fn test_hop_success_requires_every_table() {
        let mut hop = HopReport::new("production", "staging");
        hop.tables.push(done("users"));
        assert!(hop.is_success());

        hop.tables
            .push(TableReport::failed("orders", &SyncError::Config("boom".into())));
        assert!(!hop.is_success());
        assert_eq!(hop.failed_tables().len(), 1);
        assert_eq!(hop.synced_count(), 1);
    }

    #[test]
    fn test_chain_verdict() {
        let mut chain = ChainReport::default();
        let mut hop = HopReport::new("production", "staging");
        hop.tables.push(done("users"));
        chain.hops.push(hop);
        assert!(chain.is_success());

        chain.aborted = Some("lost connection".to_string());
        assert!(!chain.is_success());
    }

    #[test]
    fn test_skip_list_lookup() {
        let orchestrator = SyncOrchestrator::new(
            SyncOptions::default(),
            &["audit_logs".to_string()],
            TransformPolicy::default(),
        );
        assert!(orchestrator.is_skipped("audit_logs"));
        assert!(!orchestrator.is_skipped("users"));
    }
}
