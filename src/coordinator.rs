//! Run coordinator - one reconciliation pass
//!
//! ```text
//! Idle → LateWatermarkRead → LatePhase → EarlyWatermarkRead → EarlyPhase
//!      → Maintenance → ServiceRefresh → Idle
//! ```
//!
//! The coordinator is responsible for:
//! - Reading watermarks fresh before each phase
//! - Walking, selecting and committing each phase
//! - Retention purge and catalog maintenance
//! - Service refresh
//! - Run bookkeeping in the catalog
//!
//! A `CatalogError` anywhere ends the run as failed. Earlier commits stay.
//! A listing failure ends only its phase; candidates already listed are still
//! committed.

use crate::catalog::{keys, CatalogStats, CatalogStore, WatermarkReader, Watermarks};
use crate::error::{CatalogResult, FileOutcome};
use crate::pipeline::{
    CommitPipeline, FailurePolicy, PipelineCounters, PipelineOptions, RasterTransform,
    StagingArea,
};
use crate::remote::{RetryPolicy, TransferClient};
use crate::selector::{CandidateSelector, SkipCounts};
use crate::service::{RefreshOutcome, ServiceControl};
use crate::timestamp::TimestampCodec;
use crate::types::ProductClass;
use crate::walker::{self, PartitionTemplate};
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Coordinator states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    LateWatermarkRead,
    LatePhase,
    EarlyWatermarkRead,
    EarlyPhase,
    Maintenance,
    ServiceRefresh,
}

/// Final status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Every phase ran to completion without file failures
    Completed,
    /// Ran to completion, but some files failed or a listing aborted a phase
    Partial,
    /// Catalog error; no maintenance or refresh happened
    Failed,
    /// Cancelled by signal
    Interrupted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
            RunStatus::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings for a reconciliation run
#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    pub codec: TimestampCodec,
    pub template: PartitionTemplate,

    /// `{base}` of the Late hierarchy
    pub late_base: String,

    /// `{base}` of the Early hierarchy
    pub early_base: String,

    pub late_staging: PathBuf,
    pub early_staging: PathBuf,
    pub final_store: PathBuf,

    /// Days of data kept; older slots are purged and never fetched
    pub retention_days: u32,

    pub workers: usize,

    /// Retry policy for listings and downloads
    pub retry: RetryPolicy,

    pub failure_policy: FailurePolicy,

    /// Skip maintenance (purge, statistics, compaction)
    pub skip_maintenance: bool,
}

impl ReconcileSettings {
    /// Remote base directory of a class
    pub fn base_for(&self, class: ProductClass) -> &str {
        match class {
            ProductClass::Late => &self.late_base,
            ProductClass::Early => &self.early_base,
        }
    }

    /// Staging directory of a class
    pub fn staging_for(&self, class: ProductClass) -> &PathBuf {
        match class {
            ProductClass::Late => &self.late_staging,
            ProductClass::Early => &self.early_staging,
        }
    }

    /// First retained date
    pub fn cutoff(&self, today: NaiveDate) -> NaiveDate {
        today - TimeDelta::days(i64::from(self.retention_days))
    }
}

/// Counts for one phase
#[derive(Debug, Clone, Default)]
pub struct PhaseSummary {
    pub partitions: u64,
    pub listed: u64,
    pub candidates: u64,
    pub fetched: u64,
    pub committed: u64,
    pub superseded: u64,
    pub skipped: SkipCounts,
    pub failed: u64,
    pub deferred: u64,
    pub bytes: u64,

    /// Reason the phase stopped early, if it did
    pub aborted: Option<String>,

    /// Names of files that failed, with reasons
    pub failures: Vec<(String, String)>,
}

impl PhaseSummary {
    /// True if nothing went wrong in this phase
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.aborted.is_none()
    }
}

/// Counts for the maintenance step
#[derive(Debug, Clone, Default)]
pub struct MaintenanceSummary {
    /// Catalog entries older than the cutoff
    pub purged_entries: u64,

    /// Raster files removed, backing purged entries or orphaned
    pub purged_files: u64,

    pub stats: CatalogStats,
}

/// Result of a run
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub status: RunStatus,
    pub started: DateTime<Utc>,
    pub duration: Duration,
    pub before: Watermarks,
    pub after: Watermarks,
    pub late: Option<PhaseSummary>,
    pub early: Option<PhaseSummary>,
    pub maintenance: Option<MaintenanceSummary>,
    pub refresh: Option<RefreshOutcome>,

    /// Fatal error message when status is Failed
    pub error: Option<String>,
}

impl RunSummary {
    fn new() -> Self {
        Self {
            status: RunStatus::Completed,
            started: Utc::now(),
            duration: Duration::ZERO,
            before: Watermarks::default(),
            after: Watermarks::default(),
            late: None,
            early: None,
            maintenance: None,
            refresh: None,
            error: None,
        }
    }

    /// Summary of one phase
    pub fn phase(&self, class: ProductClass) -> Option<&PhaseSummary> {
        match class {
            ProductClass::Late => self.late.as_ref(),
            ProductClass::Early => self.early.as_ref(),
        }
    }

    /// Files committed across both phases
    pub fn committed(&self) -> u64 {
        self.late.as_ref().map_or(0, |p| p.committed)
            + self.early.as_ref().map_or(0, |p| p.committed)
    }

    /// Files failed across both phases
    pub fn failed(&self) -> u64 {
        self.late.as_ref().map_or(0, |p| p.failed) + self.early.as_ref().map_or(0, |p| p.failed)
    }

    /// Early entries retired by Late entries
    pub fn superseded(&self) -> u64 {
        self.late.as_ref().map_or(0, |p| p.superseded)
    }
}

/// Drives one reconciliation pass against a catalog
pub struct Reconciler<'a, T, X, C, S>
where
    T: TransferClient + ?Sized,
    X: RasterTransform + ?Sized,
    C: CatalogStore + ?Sized,
    S: ServiceControl + ?Sized,
{
    client: &'a T,
    transform: &'a X,
    catalog: &'a C,
    service: &'a S,
    settings: ReconcileSettings,
    shutdown: Arc<AtomicBool>,
    counters: Arc<PipelineCounters>,
}

impl<'a, T, X, C, S> Reconciler<'a, T, X, C, S>
where
    T: TransferClient + ?Sized,
    X: RasterTransform + ?Sized,
    C: CatalogStore + ?Sized,
    S: ServiceControl + ?Sized,
{
    pub fn new(
        client: &'a T,
        transform: &'a X,
        catalog: &'a C,
        service: &'a S,
        settings: ReconcileSettings,
    ) -> Self {
        Self {
            client,
            transform,
            catalog,
            service,
            settings,
            shutdown: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(PipelineCounters::default()),
        }
    }

    /// Get a clone of the shutdown flag (for signal handlers)
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Live pipeline counters (for progress display)
    pub fn counters(&self) -> Arc<PipelineCounters> {
        Arc::clone(&self.counters)
    }

    pub fn settings(&self) -> &ReconcileSettings {
        &self.settings
    }

    fn cancelled(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    fn enter(&self, state: RunState) {
        debug!("Run state -> {:?}", state);
    }

    /// Run both phases, maintenance and refresh as of `today`
    pub fn run(&self, today: NaiveDate) -> RunSummary {
        let start = Instant::now();
        let mut summary = RunSummary::new();

        info!(
            late_base = %self.settings.late_base,
            early_base = %self.settings.early_base,
            "Starting reconciliation as of {}",
            today
        );
        self.bookkeep(keys::LAST_RUN_START, &summary.started.to_rfc3339());

        if let Err(e) = self.run_states(today, &mut summary) {
            error!("Run aborted: {}", e);
            summary.status = RunStatus::Failed;
            summary.error = Some(e.to_string());
        } else if self.cancelled() {
            summary.status = RunStatus::Interrupted;
        } else if !summary.late.as_ref().map_or(true, PhaseSummary::is_clean)
            || !summary.early.as_ref().map_or(true, PhaseSummary::is_clean)
        {
            summary.status = RunStatus::Partial;
        }

        self.enter(RunState::Idle);
        summary.duration = start.elapsed();
        self.finish_bookkeeping(&summary);

        info!(
            status = %summary.status,
            committed = summary.committed(),
            failed = summary.failed(),
            "Reconciliation finished in {:.1}s",
            summary.duration.as_secs_f64()
        );
        summary
    }

    fn run_states(&self, today: NaiveDate, summary: &mut RunSummary) -> CatalogResult<()> {
        let reader = WatermarkReader::new(self.catalog);
        let cutoff = self.settings.cutoff(today);

        self.enter(RunState::LateWatermarkRead);
        let marks = reader.read()?;
        summary.before = marks;
        summary.after = marks;
        info!("Watermarks before run: {}", marks);

        self.enter(RunState::LatePhase);
        summary.late = Some(self.run_phase(ProductClass::Late, marks, cutoff, today)?);
        if self.cancelled() {
            summary.after = reader.read()?;
            return Ok(());
        }

        // Late commits moved the Late watermark; Early must see the new value
        self.enter(RunState::EarlyWatermarkRead);
        let marks = reader.read()?;

        self.enter(RunState::EarlyPhase);
        summary.early = Some(self.run_phase(ProductClass::Early, marks, cutoff, today)?);
        summary.after = reader.read()?;
        if self.cancelled() {
            return Ok(());
        }

        self.enter(RunState::Maintenance);
        if self.settings.skip_maintenance {
            info!("Skipping maintenance");
        } else {
            summary.maintenance = Some(self.maintain(cutoff)?);
            summary.after = reader.read()?;
        }

        self.enter(RunState::ServiceRefresh);
        let refresh = self.service.refresh();
        if let RefreshOutcome::Failed { reason } = &refresh {
            warn!("Service refresh failed: {}", reason);
        }
        summary.refresh = Some(refresh);

        Ok(())
    }

    /// Walk, select and commit one class
    fn run_phase(
        &self,
        class: ProductClass,
        marks: Watermarks,
        cutoff: NaiveDate,
        today: NaiveDate,
    ) -> CatalogResult<PhaseSummary> {
        let mut phase = PhaseSummary::default();
        let base = self.settings.base_for(class);
        let walk_start = marks.walk_start(class, cutoff);
        info!("{} phase: walking {} from {} to {}", class, base, walk_start, today);

        let staging = match self.open_staging(class) {
            Ok(staging) => staging,
            Err(reason) => {
                error!("{} phase aborted: {}", class, reason);
                phase.aborted = Some(reason);
                return Ok(phase);
            }
        };

        let mut selector = CandidateSelector::new(&self.settings.codec, class, marks, cutoff);
        let mut listings = walker::walk(
            self.client,
            walk_start,
            today,
            base,
            &self.settings.template,
            self.settings.retry,
        );
        for listing in listings.by_ref() {
            if self.cancelled() {
                break;
            }
            match listing {
                Ok(listing) => selector.add_listing(&listing),
                Err(e) => {
                    warn!(
                        "{} phase listing aborted; committing {} candidates found so far",
                        class,
                        selector.selected()
                    );
                    phase.aborted = Some(e.to_string());
                }
            }
        }
        phase.partitions = listings.listed();

        let selection = selector.finish();
        phase.listed = selection.listed;
        phase.skipped = selection.skipped;
        phase.candidates = selection.candidates.len() as u64;
        info!(
            "{} phase: {} candidates from {} names in {} partitions",
            class, phase.candidates, phase.listed, phase.partitions
        );

        let options = PipelineOptions {
            workers: self.settings.workers,
            retry: self.settings.retry,
            failure_policy: self.settings.failure_policy,
            final_store: self.settings.final_store.clone(),
        };
        let report =
            CommitPipeline::new(self.client, self.transform, self.catalog, &staging, &options)
                .with_shutdown(&self.shutdown)
                .with_counters(&self.counters)
                .run(selection.candidates)?;

        phase.fetched = report.fetched;
        phase.committed = report.committed;
        phase.superseded = report.superseded;
        phase.failed = report.failed;
        phase.deferred = report.deferred;
        phase.bytes = report.bytes;
        phase.failures = report
            .outcomes
            .into_iter()
            .filter_map(|outcome| match outcome {
                FileOutcome::Failed { name, reason } => Some((name, reason)),
                _ => None,
            })
            .collect();

        info!(
            "{} phase: {} committed, {} superseded, {} failed, {} deferred",
            class, phase.committed, phase.superseded, phase.failed, phase.deferred
        );
        Ok(phase)
    }

    fn open_staging(&self, class: ProductClass) -> Result<StagingArea, String> {
        let dir = self.settings.staging_for(class);
        let staging = StagingArea::open(dir)
            .map_err(|e| format!("cannot create staging {}: {}", dir.display(), e))?;
        match staging.sweep() {
            Ok(0) => {}
            Ok(n) => info!("Removed {} stale files from {}", n, dir.display()),
            Err(e) => warn!("Could not sweep {}: {}", dir.display(), e),
        }
        Ok(staging)
    }

    /// Retention purge, orphan sweep, statistics and compaction
    fn maintain(&self, cutoff: NaiveDate) -> CatalogResult<MaintenanceSummary> {
        let mut maintenance = MaintenanceSummary::default();
        let cutoff_ts = cutoff.and_time(chrono::NaiveTime::MIN);

        info!("Purging rasters dated before {}", cutoff);
        let purged = self.catalog.remove_older_than(cutoff_ts)?;
        maintenance.purged_entries = purged.len() as u64;
        for entry in &purged {
            match fs::remove_file(&entry.location) {
                Ok(()) => maintenance.purged_files += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to delete {}: {}", entry.location.display(), e),
            }
        }
        maintenance.purged_files += self.sweep_orphans(cutoff);
        info!(
            "Purged {} catalog entries and {} raster files",
            maintenance.purged_entries, maintenance.purged_files
        );

        maintenance.stats = self.catalog.compute_statistics()?;
        self.catalog.compact()?;
        Ok(maintenance)
    }

    /// Delete rasters in the final store dated before `cutoff` that no
    /// catalog entry references any more
    fn sweep_orphans(&self, cutoff: NaiveDate) -> u64 {
        let dir = &self.settings.final_store;
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Cannot read final store {}: {}", dir.display(), e);
                return 0;
            }
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let is_raster = path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("tif"));
            if !is_raster {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Ok(slot) = self.settings.codec.parse(name) else {
                continue;
            };
            if slot.date() < cutoff {
                match fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(e) => warn!("Failed to delete orphan {}: {}", path.display(), e),
                }
            }
        }
        if removed > 0 {
            debug!("Removed {} orphaned rasters", removed);
        }
        removed
    }

    fn bookkeep(&self, key: &str, value: &str) {
        if let Err(e) = self.catalog.set_info(key, value) {
            warn!("Failed to record {}: {}", key, e);
        }
    }

    fn finish_bookkeeping(&self, summary: &RunSummary) {
        self.bookkeep(keys::LAST_RUN_END, &Utc::now().to_rfc3339());
        self.bookkeep(keys::LAST_RUN_STATUS, summary.status.as_str());
        self.bookkeep(keys::LAST_RUN_COMMITTED, &summary.committed().to_string());
        self.bookkeep(keys::LAST_RUN_FAILED, &summary.failed().to_string());
        self.bookkeep(keys::LAST_RUN_SUPERSEDED, &summary.superseded().to_string());
    }
}
