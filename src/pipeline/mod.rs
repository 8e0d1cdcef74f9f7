//! Staged commit pipeline
//!
//! Per candidate: fetch into staging → transform → resolve supersession →
//! relocate into the final store → register in the catalog → release staging.

pub mod commit;
pub mod staging;
pub mod transform;

pub use commit::{relocate, CommitPipeline, CommitReport};
pub use staging::{StagedFile, StagingArea};
pub use transform::{CommandTransform, Passthrough, RasterTransform};

use crate::remote::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

/// What happens to later slots of a phase after a file fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Defer later slots so the watermark stays behind the failed slot and
    /// the next run retries it
    #[default]
    Fence,

    /// Keep committing later slots; the failed slot falls behind the watermark
    Continue,
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::Fence => f.write_str("fence"),
            FailurePolicy::Continue => f.write_str("continue"),
        }
    }
}

/// Settings shared by both phases
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Concurrent fetch/transform workers
    pub workers: usize,

    /// Download retry policy
    pub retry: RetryPolicy,

    pub failure_policy: FailurePolicy,

    /// Directory committed rasters live in
    pub final_store: PathBuf,
}

/// Live counters for progress display
#[derive(Debug, Default)]
pub struct PipelineCounters {
    pub fetched: AtomicU64,
    pub committed: AtomicU64,
    pub failed: AtomicU64,
    pub bytes: AtomicU64,
}

impl PipelineCounters {
    /// (fetched, committed, failed, bytes)
    pub fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.fetched.load(Ordering::Relaxed),
            self.committed.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
            self.bytes.load(Ordering::Relaxed),
        )
    }
}
