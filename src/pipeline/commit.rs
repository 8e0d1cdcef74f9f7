//! Staged commit of selected candidates
//!
//! Architecture:
//! ```text
//! Job Queue (crossbeam channel, candidates in slot order)
//! │
//! ├── Worker 0: download → transform → send staged file
//! ├── Worker 1: download → transform → send staged file
//! └── Worker N: download → transform → send staged file
//! │
//! └── Committer (calling thread): reorder by index → supersede → relocate
//!     → register → release staging
//! ```
//!
//! Fetching is parallel; registration is strictly sequential in ascending slot
//! order so the watermark only ever advances over a contiguous committed
//! prefix (under the fence policy). Jobs are handed out one per committed
//! slot, so no more than `workers` payloads sit in staging at once even when
//! the head of the line is slow.

use super::staging::{StagedFile, StagingArea};
use super::transform::RasterTransform;
use super::{FailurePolicy, PipelineCounters, PipelineOptions};
use crate::catalog::CatalogStore;
use crate::error::{CatalogResult, FileOutcome, SyncError};
use crate::remote::{RetryPolicy, TransferClient};
use crate::supersede::{remove_retired_file, SupersessionResolver};
use crate::types::{CatalogEntry, Observation};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tracing::{debug, info, warn};

/// Tally of one pipeline run
#[derive(Debug, Default)]
pub struct CommitReport {
    /// Per-candidate outcomes, in slot order
    pub outcomes: Vec<FileOutcome>,
    pub fetched: u64,
    pub committed: u64,
    pub superseded: u64,
    pub failed: u64,
    pub deferred: u64,
    pub bytes: u64,
}

impl CommitReport {
    fn record(&mut self, outcome: FileOutcome) {
        match &outcome {
            FileOutcome::Committed {
                bytes, superseded, ..
            } => {
                self.committed += 1;
                self.bytes += bytes;
                if *superseded {
                    self.superseded += 1;
                }
            }
            FileOutcome::Failed { .. } => self.failed += 1,
            FileOutcome::Deferred { .. } => self.deferred += 1,
        }
        self.outcomes.push(outcome);
    }
}

/// Payload ready for commit
struct Staged {
    guard: StagedFile,
    output: PathBuf,
    bytes: u64,
}

/// Worker result for one candidate
struct Prepared {
    index: usize,
    obs: Observation,
    /// `None` when the worker skipped the candidate (halted or cancelled)
    result: Option<Result<Staged, SyncError>>,
}

/// Commits candidates of one phase
pub struct CommitPipeline<'a, T, X, C>
where
    T: TransferClient + ?Sized,
    X: RasterTransform + ?Sized,
    C: CatalogStore + ?Sized,
{
    client: &'a T,
    transform: &'a X,
    catalog: &'a C,
    staging: &'a StagingArea,
    options: &'a PipelineOptions,
    shutdown: Option<&'a AtomicBool>,
    counters: Option<&'a PipelineCounters>,
}

impl<'a, T, X, C> CommitPipeline<'a, T, X, C>
where
    T: TransferClient + ?Sized,
    X: RasterTransform + ?Sized,
    C: CatalogStore + ?Sized,
{
    pub fn new(
        client: &'a T,
        transform: &'a X,
        catalog: &'a C,
        staging: &'a StagingArea,
        options: &'a PipelineOptions,
    ) -> Self {
        Self {
            client,
            transform,
            catalog,
            staging,
            options,
            shutdown: None,
            counters: None,
        }
    }

    /// Stop starting new files once `flag` is set
    pub fn with_shutdown(mut self, flag: &'a AtomicBool) -> Self {
        self.shutdown = Some(flag);
        self
    }

    /// Publish live counts for progress display
    pub fn with_counters(mut self, counters: &'a PipelineCounters) -> Self {
        self.counters = Some(counters);
        self
    }

    fn cancelled(&self) -> bool {
        self.shutdown.is_some_and(|f| f.load(Ordering::Relaxed))
    }

    /// Fetch, transform and register `candidates` (ascending slot order).
    ///
    /// File-level failures are reported in the returned outcomes. A
    /// `CatalogError` aborts the remaining candidates and is returned.
    pub fn run(&self, candidates: Vec<Observation>) -> CatalogResult<CommitReport> {
        let mut report = CommitReport::default();
        if candidates.is_empty() {
            return Ok(report);
        }

        let workers = self.options.workers.clamp(1, candidates.len());
        debug!("Committing {} candidates with {} workers", candidates.len(), workers);

        let (job_tx, job_rx) = unbounded::<(usize, Observation)>();
        let mut jobs = Dispatcher {
            queue: candidates.into_iter().enumerate(),
            tx: Some(job_tx),
        };
        // At most `workers` candidates are in flight or waiting for their
        // turn, which bounds the payloads held in staging
        jobs.dispatch(workers);

        let (result_tx, result_rx) = bounded::<Prepared>(workers);
        let halt = AtomicBool::new(false);

        let client = self.client;
        let transform = self.transform;
        let staging = self.staging;
        let retry = self.options.retry;
        let shutdown = self.shutdown;
        let counters = self.counters;

        let outcome = thread::scope(|scope| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                let halt = &halt;
                scope.spawn(move || {
                    fetch_worker(
                        client, transform, staging, retry, job_rx, result_tx, halt, shutdown,
                        counters,
                    )
                });
            }
            drop(result_tx);

            let outcome = self.commit_in_order(&result_rx, &mut jobs, &halt, &mut report);
            if outcome.is_err() {
                halt.store(true, Ordering::SeqCst);
            }
            // Lets idle workers see the end of the queue
            jobs.close();
            // Unblocks workers waiting on a full channel
            drop(result_rx);
            outcome
        });

        outcome?;
        Ok(report)
    }

    fn commit_in_order(
        &self,
        results: &Receiver<Prepared>,
        jobs: &mut Dispatcher,
        halt: &AtomicBool,
        report: &mut CommitReport,
    ) -> CatalogResult<()> {
        let mut pending: BTreeMap<usize, Prepared> = BTreeMap::new();
        let mut next = 0usize;
        let mut fenced = false;

        for prepared in results.iter() {
            pending.insert(prepared.index, prepared);

            while let Some(prepared) = pending.remove(&next) {
                next += 1;
                if prepared.result.as_ref().is_some_and(|r| r.is_ok()) {
                    report.fetched += 1;
                }
                let outcome = self.commit_one(prepared, &mut fenced, halt)?;
                report.record(outcome);
                jobs.dispatch(1);
            }
        }
        Ok(())
    }

    fn commit_one(
        &self,
        prepared: Prepared,
        fenced: &mut bool,
        halt: &AtomicBool,
    ) -> CatalogResult<FileOutcome> {
        let Prepared { obs, result, .. } = prepared;
        let name = obs.name.clone();

        if *fenced || self.cancelled() {
            return Ok(FileOutcome::Deferred { name });
        }

        let staged = match result {
            None => return Ok(FileOutcome::Deferred { name }),
            Some(Err(e)) => {
                warn!("Skipping {}: {}", name, e);
                return Ok(self.fail(name, e.to_string(), fenced, halt));
            }
            Some(Ok(staged)) => staged,
        };

        let retired = SupersessionResolver::new(self.catalog).resolve(&obs)?;

        let destination = self.options.final_store.join(&obs.name);
        if let Err(e) = relocate(&staged.output, &destination) {
            warn!("Failed to relocate {} to {}: {}", name, destination.display(), e);
            return Ok(self.fail(name, SyncError::Io(e).to_string(), fenced, halt));
        }

        let entry = CatalogEntry::for_observation(&obs, destination.clone());
        match &retired {
            Some(early) => {
                self.catalog.supersede(early, &entry)?;
                if let Err(e) = remove_retired_file(early, &destination) {
                    warn!("Failed to remove superseded raster {}: {}", early.location.display(), e);
                }
                info!("{} superseded {}", entry.name, early.name);
            }
            None => self.catalog.insert_or_replace(&entry)?,
        }

        let bytes = staged.bytes;
        drop(staged.guard);

        if let Some(counters) = self.counters {
            counters.committed.fetch_add(1, Ordering::Relaxed);
        }
        debug!("Committed {} ({} bytes)", name, bytes);

        Ok(FileOutcome::Committed {
            name,
            bytes,
            superseded: retired.is_some(),
        })
    }

    fn fail(
        &self,
        name: String,
        reason: String,
        fenced: &mut bool,
        halt: &AtomicBool,
    ) -> FileOutcome {
        if let Some(counters) = self.counters {
            counters.failed.fetch_add(1, Ordering::Relaxed);
        }
        if self.options.failure_policy == FailurePolicy::Fence {
            *fenced = true;
            halt.store(true, Ordering::SeqCst);
            info!("Deferring remaining candidates after failure of {}", name);
        }
        FileOutcome::Failed { name, reason }
    }
}

/// Feeds candidates to the workers as the committer frees up room
struct Dispatcher {
    queue: std::iter::Enumerate<std::vec::IntoIter<Observation>>,
    tx: Option<Sender<(usize, Observation)>>,
}

impl Dispatcher {
    fn dispatch(&mut self, count: usize) {
        for _ in 0..count {
            match self.queue.next() {
                Some(job) => {
                    if let Some(tx) = &self.tx {
                        // Workers hold the receiver until the sender is dropped
                        let _ = tx.send(job);
                    }
                }
                None => {
                    self.close();
                    return;
                }
            }
        }
    }

    fn close(&mut self) {
        self.tx = None;
    }
}

#[allow(clippy::too_many_arguments)]
fn fetch_worker<T, X>(
    client: &T,
    transform: &X,
    staging: &StagingArea,
    retry: RetryPolicy,
    jobs: Receiver<(usize, Observation)>,
    results: Sender<Prepared>,
    halt: &AtomicBool,
    shutdown: Option<&AtomicBool>,
    counters: Option<&PipelineCounters>,
) where
    T: TransferClient + ?Sized,
    X: RasterTransform + ?Sized,
{
    for (index, obs) in jobs.iter() {
        let stopped = halt.load(Ordering::Relaxed)
            || shutdown.is_some_and(|f| f.load(Ordering::Relaxed));

        let result = if stopped {
            None
        } else {
            let prepared = prepare(client, transform, staging, retry, &obs);
            if let (Ok(staged), Some(counters)) = (&prepared, counters) {
                counters.fetched.fetch_add(1, Ordering::Relaxed);
                counters.bytes.fetch_add(staged.bytes, Ordering::Relaxed);
            }
            Some(prepared)
        };

        if results.send(Prepared { index, obs, result }).is_err() {
            break;
        }
    }
}

fn prepare<T, X>(
    client: &T,
    transform: &X,
    staging: &StagingArea,
    retry: RetryPolicy,
    obs: &Observation,
) -> Result<Staged, SyncError>
where
    T: TransferClient + ?Sized,
    X: RasterTransform + ?Sized,
{
    let mut guard = staging.stage(&obs.name);
    let bytes = retry.run(&obs.source_path, || {
        client.download(&obs.source_path, guard.path())
    })?;

    let output = transform.filter(guard.path())?;
    guard.track(output.clone());

    Ok(Staged {
        guard,
        output,
        bytes,
    })
}

/// Move `src` to `dst`, replacing any file already there.
///
/// Falls back to copying when a rename is not possible (e.g. across
/// filesystems); the source is then left for its staging guard to remove.
pub fn relocate(src: &Path, dst: &Path) -> io::Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    if fs::rename(src, dst).is_ok() {
        return Ok(());
    }
    fs::copy(src, dst)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SqliteCatalog;
    use crate::error::{TransferError, TransferResult, TransformError};
    use crate::pipeline::{CommandTransform, Passthrough};
    use crate::timestamp::TimestampCodec;
    use crate::types::ProductClass;
    use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    /// Serves fixed payloads; paths in `broken` fail permanently
    struct FakeRemote {
        broken: HashSet<String>,
        downloads: Mutex<Vec<String>>,
    }

    impl FakeRemote {
        fn new(broken: &[&str]) -> Self {
            Self {
                broken: broken.iter().map(|s| s.to_string()).collect(),
                downloads: Mutex::new(Vec::new()),
            }
        }
    }

    impl TransferClient for FakeRemote {
        fn list_directory(&self, _path: &str) -> TransferResult<Vec<String>> {
            Ok(Vec::new())
        }

        fn download(&self, remote: &str, local: &Path) -> TransferResult<u64> {
            self.downloads.lock().unwrap().push(remote.to_string());
            if self.broken.contains(remote) {
                return Err(TransferError::Status {
                    url: remote.to_string(),
                    status: 403,
                });
            }
            fs::write(local, remote.as_bytes()).unwrap();
            Ok(remote.len() as u64)
        }
    }

    /// Holds back the first download and records how many payloads were
    /// staged at once
    struct SlowHead {
        head: String,
        peak: AtomicUsize,
    }

    impl TransferClient for SlowHead {
        fn list_directory(&self, _path: &str) -> TransferResult<Vec<String>> {
            Ok(Vec::new())
        }

        fn download(&self, remote: &str, local: &Path) -> TransferResult<u64> {
            if remote == self.head {
                thread::sleep(Duration::from_millis(200));
            }
            fs::write(local, remote.as_bytes()).unwrap();
            let staged = fs::read_dir(local.parent().unwrap()).unwrap().count();
            self.peak.fetch_max(staged, Ordering::SeqCst);
            Ok(remote.len() as u64)
        }
    }

    struct Rejecting;

    impl RasterTransform for Rejecting {
        fn filter(&self, input: &Path) -> Result<PathBuf, TransformError> {
            Err(TransformError::Failed {
                input: input.to_path_buf(),
                status: "exit status: 1".into(),
                stderr: "bad raster".into(),
            })
        }
    }

    struct Fixture {
        _dir: TempDir,
        staging: StagingArea,
        options: PipelineOptions,
        catalog: SqliteCatalog,
    }

    impl Fixture {
        fn pipeline<'a, T, X>(
            &'a self,
            remote: &'a T,
            transform: &'a X,
        ) -> CommitPipeline<'a, T, X, SqliteCatalog>
        where
            T: TransferClient,
            X: RasterTransform,
        {
            CommitPipeline::new(remote, transform, &self.catalog, &self.staging, &self.options)
        }
    }

    fn fixture(policy: FailurePolicy, workers: usize) -> Fixture {
        let dir = tempdir().unwrap();
        let staging = StagingArea::open(dir.path().join("staging")).unwrap();
        let options = PipelineOptions {
            workers,
            retry: RetryPolicy::none(),
            failure_policy: policy,
            final_store: dir.path().join("store"),
        };
        Fixture {
            _dir: dir,
            staging,
            options,
            catalog: SqliteCatalog::open_in_memory(TimestampCodec::default()).unwrap(),
        }
    }

    fn slot(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2018, 8, 10)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn obs(class: ProductClass, start: NaiveDateTime) -> Observation {
        let name = format!(
            "3B-HHR-{}.MS.MRG.3IMERG.{}.30min.tif",
            class.marker(),
            start.format("%Y%m%d-S%H%M%S")
        );
        Observation {
            class,
            slot_start: start,
            interval: TimeDelta::minutes(30),
            source_path: format!("/remote/{}", name),
            name,
        }
    }

    fn staging_is_empty(staging: &StagingArea) -> bool {
        fs::read_dir(staging.dir()).unwrap().next().is_none()
    }

    #[test]
    fn test_commits_in_slot_order() {
        let fx = fixture(FailurePolicy::Fence, 4);
        let remote = FakeRemote::new(&[]);
        let candidates: Vec<_> = (0..8)
            .map(|i| obs(ProductClass::Late, slot(i, 0)))
            .collect();

        let report = fx.pipeline(&remote, &Passthrough)
            .run(candidates.clone())
            .unwrap();

        assert_eq!(report.committed, 8);
        let names: Vec<_> = report.outcomes.iter().map(|o| o.name().to_string()).collect();
        let expected: Vec<_> = candidates.iter().map(|o| o.name.clone()).collect();
        assert_eq!(names, expected);

        let entries = fx.catalog.entries().unwrap();
        assert_eq!(entries.len(), 8);
        for entry in &entries {
            assert!(entry.location.exists());
        }
        assert!(staging_is_empty(&fx.staging));
    }

    #[test]
    fn test_fence_defers_after_failure() {
        let fx = fixture(FailurePolicy::Fence, 1);
        let candidates = vec![
            obs(ProductClass::Late, slot(1, 0)),
            obs(ProductClass::Late, slot(1, 30)),
            obs(ProductClass::Late, slot(2, 0)),
        ];
        let remote = FakeRemote::new(&[candidates[1].source_path.as_str()]);

        let report = fx.pipeline(&remote, &Passthrough)
            .run(candidates)
            .unwrap();

        assert_eq!((report.committed, report.failed, report.deferred), (1, 1, 1));
        assert_eq!(
            fx.catalog.query_max_slot(ProductClass::Late).unwrap(),
            Some(slot(1, 0))
        );
        assert!(staging_is_empty(&fx.staging));
    }

    #[test]
    fn test_continue_commits_past_failure() {
        let fx = fixture(FailurePolicy::Continue, 2);
        let candidates = vec![
            obs(ProductClass::Early, slot(1, 0)),
            obs(ProductClass::Early, slot(1, 30)),
            obs(ProductClass::Early, slot(2, 0)),
        ];
        let remote = FakeRemote::new(&[candidates[1].source_path.as_str()]);

        let report = fx.pipeline(&remote, &Passthrough)
            .run(candidates)
            .unwrap();

        assert_eq!((report.committed, report.failed, report.deferred), (2, 1, 0));
        assert_eq!(
            fx.catalog.query_max_slot(ProductClass::Early).unwrap(),
            Some(slot(2, 0))
        );
    }

    #[test]
    fn test_transform_failure_is_file_local() {
        let fx = fixture(FailurePolicy::Continue, 2);
        let remote = FakeRemote::new(&[]);
        let report = fx.pipeline(&remote, &Rejecting)
            .run(vec![obs(ProductClass::Late, slot(3, 0))])
            .unwrap();

        assert_eq!(report.failed, 1);
        assert!(fx.catalog.entries().unwrap().is_empty());
        assert!(staging_is_empty(&fx.staging));
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_filter_leaves_nothing_staged() {
        let fx = fixture(FailurePolicy::Continue, 1);
        let remote = FakeRemote::new(&[]);
        let filter = CommandTransform::new(
            "sh",
            vec![
                "-c".into(),
                "cp \"$0\" \"$1\"; exit 1".into(),
                "{input}".into(),
                "{output}".into(),
            ],
        );

        let report = fx.pipeline(&remote, &filter)
            .run(vec![obs(ProductClass::Late, slot(2, 0))])
            .unwrap();

        assert_eq!(report.failed, 1);
        assert!(fx.catalog.entries().unwrap().is_empty());
        let left: Vec<_> = fs::read_dir(fx.staging.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert!(left.is_empty(), "staging not released: {:?}", left);
    }

    #[test]
    fn test_slow_head_bounds_staging() {
        let fx = fixture(FailurePolicy::Fence, 2);
        let candidates: Vec<_> = (0..10)
            .map(|i| obs(ProductClass::Late, slot(i, 0)))
            .collect();
        let remote = SlowHead {
            head: candidates[0].source_path.clone(),
            peak: AtomicUsize::new(0),
        };

        let report = fx.pipeline(&remote, &Passthrough)
            .run(candidates)
            .unwrap();

        assert_eq!(report.committed, 10);
        assert!(remote.peak.load(Ordering::SeqCst) <= 2);
        assert!(staging_is_empty(&fx.staging));
    }

    #[test]
    fn test_late_supersedes_early() {
        let fx = fixture(FailurePolicy::Fence, 2);
        let remote = FakeRemote::new(&[]);
        let pipeline = fx.pipeline(&remote, &Passthrough);

        pipeline.run(vec![obs(ProductClass::Early, slot(2, 0))]).unwrap();
        let early_location = fx.catalog.entries().unwrap()[0].location.clone();
        assert!(early_location.exists());

        let report = pipeline.run(vec![obs(ProductClass::Late, slot(2, 0))]).unwrap();
        assert_eq!(report.superseded, 1);

        let entries = fx.catalog.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].class, ProductClass::Late);
        assert!(entries[0].location.exists());
        assert!(!early_location.exists());
    }

    #[test]
    fn test_cancelled_run_defers_everything() {
        let fx = fixture(FailurePolicy::Fence, 2);
        let remote = FakeRemote::new(&[]);
        let shutdown = AtomicBool::new(true);

        let report = fx.pipeline(&remote, &Passthrough)
            .with_shutdown(&shutdown)
            .run(vec![
                obs(ProductClass::Late, slot(1, 0)),
                obs(ProductClass::Late, slot(2, 0)),
            ])
            .unwrap();

        assert_eq!(report.deferred, 2);
        assert!(remote.downloads.lock().unwrap().is_empty());
        assert!(fx.catalog.entries().unwrap().is_empty());
    }

    #[test]
    fn test_relocate_overwrites() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("staged.tif");
        let dst = dir.path().join("store/final.tif");
        fs::create_dir_all(dst.parent().unwrap()).unwrap();
        fs::write(&dst, b"old").unwrap();
        fs::write(&src, b"new").unwrap();

        relocate(&src, &dst).unwrap();
        assert_eq!(fs::read(&dst).unwrap(), b"new");
        assert!(!src.exists());
    }
}
