//! Remote directory walker
//!
//! Lazily lists the month partitions between a start date and an end date.
//!
//! # Architecture
//!
//! ```text
//!   partitions(start, end)          pure (year, month) sequence
//!            │
//!            ▼
//!   PartitionTemplate::render       {base}/{year}/{month}
//!            │
//!            ▼
//!   RetryPolicy + TransferClient    list_directory, backoff on transient errors
//!            │
//!            ▼
//!   RemoteListing                   names sorted, NotFound -> empty
//! ```
//!
//! The walk yields at most one error and then ends, so a caller that stops on
//! the first `Err` has already consumed everything the walk will produce.

pub mod partition;

pub use partition::{
    partitions, Partition, PartitionTemplate, Partitions, DEFAULT_PARTITION_TEMPLATE,
};

use crate::error::TransferResult;
use crate::remote::{RetryPolicy, TransferClient};
use chrono::NaiveDate;
use tracing::{debug, info, warn};

/// Names found in one partition directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteListing {
    pub partition: Partition,

    /// Remote directory that was listed
    pub dir: String,

    /// Entry names, sorted
    pub names: Vec<String>,
}

/// Lazy walk over the partitions of one product hierarchy
pub struct PartitionWalk<'a, C: TransferClient + ?Sized> {
    client: &'a C,
    partitions: Partitions,
    base: String,
    template: PartitionTemplate,
    retry: RetryPolicy,
    finished: bool,
    listed: u64,
}

impl<'a, C: TransferClient + ?Sized> PartitionWalk<'a, C> {
    pub fn new(
        client: &'a C,
        start: NaiveDate,
        end: NaiveDate,
        base: impl Into<String>,
        template: PartitionTemplate,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            partitions: partitions(start, end),
            base: base.into(),
            template,
            retry,
            finished: false,
            listed: 0,
        }
    }

    /// Partitions listed so far
    pub fn listed(&self) -> u64 {
        self.listed
    }
}

impl<C: TransferClient + ?Sized> Iterator for PartitionWalk<'_, C> {
    type Item = TransferResult<RemoteListing>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let Some(partition) = self.partitions.next() else {
            self.finished = true;
            return None;
        };

        let dir = self.template.render(&self.base, partition);
        let client = self.client;
        let result = self.retry.run(&dir, || client.list_directory(&dir));

        let mut names = match result {
            Ok(names) => names,
            Err(e) if e.is_not_found() => {
                debug!("Partition {} not populated yet", dir);
                Vec::new()
            }
            Err(e) => {
                warn!("Listing {} failed: {}", dir, e);
                self.finished = true;
                return Some(Err(e));
            }
        };
        names.sort();

        self.listed += 1;
        info!("Listed {} entries in {}", names.len(), dir);
        Some(Ok(RemoteListing {
            partition,
            dir,
            names,
        }))
    }
}

/// Walk the partitions from `start`'s month to `end`'s month
pub fn walk<'a, C: TransferClient + ?Sized>(
    client: &'a C,
    start: NaiveDate,
    end: NaiveDate,
    base: &str,
    template: &PartitionTemplate,
    retry: RetryPolicy,
) -> PartitionWalk<'a, C> {
    PartitionWalk::new(client, start, end, base, template.clone(), retry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransferError;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::Mutex;

    /// Serves canned listings; unknown directories are NotFound
    struct CannedClient {
        listings: HashMap<String, Vec<String>>,
        failing: Option<String>,
        calls: Mutex<Vec<String>>,
    }

    impl CannedClient {
        fn new(listings: &[(&str, &[&str])]) -> Self {
            Self {
                listings: listings
                    .iter()
                    .map(|(dir, names)| {
                        (dir.to_string(), names.iter().map(|n| n.to_string()).collect())
                    })
                    .collect(),
                failing: None,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl TransferClient for CannedClient {
        fn list_directory(&self, path: &str) -> TransferResult<Vec<String>> {
            self.calls.lock().unwrap().push(path.to_string());
            if self.failing.as_deref() == Some(path) {
                return Err(TransferError::Timeout { path: path.into() });
            }
            self.listings
                .get(path)
                .cloned()
                .ok_or_else(|| TransferError::NotFound { path: path.into() })
        }

        fn download(&self, remote: &str, _local: &Path) -> TransferResult<u64> {
            Err(TransferError::NotFound { path: remote.into() })
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_walk_lists_in_order() {
        let client = CannedClient::new(&[
            ("/gis/2017/12", &["b.tif", "a.tif"]),
            ("/gis/2018/01", &["c.tif"]),
        ]);
        let listings: Vec<_> = walk(
            &client,
            date(2017, 12, 30),
            date(2018, 1, 2),
            "/gis",
            &PartitionTemplate::default(),
            RetryPolicy::none(),
        )
        .collect::<TransferResult<_>>()
        .unwrap();

        assert_eq!(listings.len(), 2);
        assert_eq!(listings[0].dir, "/gis/2017/12");
        assert_eq!(listings[0].names, vec!["a.tif", "b.tif"]);
        assert_eq!(listings[1].names, vec!["c.tif"]);
    }

    #[test]
    fn test_missing_future_partition_is_empty() {
        let client = CannedClient::new(&[("/gis/2018/08", &["a.tif"])]);
        let listings: Vec<_> = walk(
            &client,
            date(2018, 8, 1),
            date(2018, 9, 1),
            "/gis",
            &PartitionTemplate::default(),
            RetryPolicy::none(),
        )
        .collect::<TransferResult<_>>()
        .unwrap();

        assert_eq!(listings.len(), 2);
        assert!(listings[1].names.is_empty());
    }

    #[test]
    fn test_failure_is_yielded_once_then_fused() {
        let mut client = CannedClient::new(&[("/gis/2018/07", &["a.tif"])]);
        client.failing = Some("/gis/2018/08".into());

        let mut listings = walk(
            &client,
            date(2018, 7, 1),
            date(2018, 10, 1),
            "/gis",
            &PartitionTemplate::default(),
            RetryPolicy::new(2).with_base_delay(std::time::Duration::ZERO),
        );

        assert!(listings.next().unwrap().is_ok());
        assert!(matches!(
            listings.next(),
            Some(Err(TransferError::Exhausted { attempts: 3, .. }))
        ));
        assert!(listings.next().is_none());
        assert!(listings.next().is_none());
        assert_eq!(listings.listed(), 1);

        // 1 listing + 3 attempts at the failing partition, nothing after
        assert_eq!(client.calls.lock().unwrap().len(), 4);
    }
}
