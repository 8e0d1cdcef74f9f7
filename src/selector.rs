//! Candidate selection
//!
//! Decides from watermarks alone which listed remote files are new:
//!
//! - Late: `slot_start > late`
//! - Early: `slot_start > late && slot_start > early`
//!
//! Comparisons are strict, and a `None` watermark admits every slot. Slots
//! dated before the retention cutoff are never selected since maintenance
//! would purge them in the same run.

use crate::catalog::Watermarks;
use crate::error::ParseError;
use crate::timestamp::TimestampCodec;
use crate::types::{Observation, ProductClass};
use crate::walker::RemoteListing;
use chrono::{NaiveDate, NaiveDateTime};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// Late inclusion rule
pub fn late_rule(slot: NaiveDateTime, marks: &Watermarks) -> bool {
    newer(slot, marks.late)
}

/// Early inclusion rule
pub fn early_rule(slot: NaiveDateTime, marks: &Watermarks) -> bool {
    newer(slot, marks.late) && newer(slot, marks.early)
}

/// Inclusion rule for `class`
pub fn admits(class: ProductClass, slot: NaiveDateTime, marks: &Watermarks) -> bool {
    match class {
        ProductClass::Late => late_rule(slot, marks),
        ProductClass::Early => early_rule(slot, marks),
    }
}

fn newer(slot: NaiveDateTime, mark: Option<NaiveDateTime>) -> bool {
    mark.map_or(true, |mark| slot > mark)
}

/// Why listed names were not selected
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SkipCounts {
    /// Not a product file (placeholders, sidecars)
    pub not_product: u64,
    /// Product-like name that failed to parse
    pub malformed: u64,
    /// Product of the other class
    pub wrong_class: u64,
    /// At or below the watermark
    pub not_newer: u64,
    /// Dated before the retention cutoff
    pub expired: u64,
    /// Identity key already selected
    pub duplicate: u64,
}

impl SkipCounts {
    /// Skips that count against the phase (everything except non-products)
    pub fn total(&self) -> u64 {
        self.malformed + self.wrong_class + self.not_newer + self.expired + self.duplicate
    }
}

/// Result of a selection pass
#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// Ascending by slot start, one per identity key
    pub candidates: Vec<Observation>,

    /// Names seen across all listings
    pub listed: u64,

    pub skipped: SkipCounts,
}

/// Accumulates candidates of one class across partition listings
pub struct CandidateSelector<'a> {
    codec: &'a TimestampCodec,
    class: ProductClass,
    marks: Watermarks,
    cutoff: NaiveDate,
    selected: BTreeMap<NaiveDateTime, Observation>,
    listed: u64,
    skipped: SkipCounts,
}

impl<'a> CandidateSelector<'a> {
    pub fn new(
        codec: &'a TimestampCodec,
        class: ProductClass,
        marks: Watermarks,
        cutoff: NaiveDate,
    ) -> Self {
        Self {
            codec,
            class,
            marks,
            cutoff,
            selected: BTreeMap::new(),
            listed: 0,
            skipped: SkipCounts::default(),
        }
    }

    /// Consider every name of one listing
    pub fn add_listing(&mut self, listing: &RemoteListing) {
        let before = self.selected.len();
        for name in &listing.names {
            self.consider(&listing.dir, name);
        }
        debug!(
            "{} {} candidates from {}",
            self.selected.len() - before,
            self.class,
            listing.dir
        );
    }

    fn consider(&mut self, dir: &str, name: &str) {
        self.listed += 1;

        let obs = match self.codec.observe(dir, name) {
            Ok(obs) => obs,
            Err(ParseError::NotAProduct { .. }) => {
                self.skipped.not_product += 1;
                return;
            }
            Err(e) => {
                debug!("Skipping {}: {}", name, e);
                self.skipped.malformed += 1;
                return;
            }
        };

        if obs.class != self.class {
            self.skipped.wrong_class += 1;
            return;
        }
        if obs.slot_start.date() < self.cutoff {
            self.skipped.expired += 1;
            return;
        }
        if !admits(self.class, obs.slot_start, &self.marks) {
            trace!("{} is not newer than {}", name, self.marks);
            self.skipped.not_newer += 1;
            return;
        }

        match self.selected.entry(obs.slot_start) {
            Entry::Vacant(slot) => {
                slot.insert(obs);
            }
            Entry::Occupied(_) => self.skipped.duplicate += 1,
        }
    }

    /// Candidates selected so far
    pub fn selected(&self) -> usize {
        self.selected.len()
    }

    /// Finish, yielding candidates in ascending slot order
    pub fn finish(self) -> Selection {
        Selection {
            candidates: self.selected.into_values().collect(),
            listed: self.listed,
            skipped: self.skipped,
        }
    }
}

/// Select candidates of `class` from complete listings
pub fn select(
    codec: &TimestampCodec,
    class: ProductClass,
    marks: Watermarks,
    cutoff: NaiveDate,
    listings: &[RemoteListing],
) -> Selection {
    let mut selector = CandidateSelector::new(codec, class, marks, cutoff);
    for listing in listings {
        selector.add_listing(listing);
    }
    selector.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::walker::Partition;

    fn ts(d: u32, h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2018, 8, d)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn name(class: ProductClass, slot: NaiveDateTime) -> String {
        format!(
            "3B-HHR-{}.MS.MRG.3IMERG.{}-E000000.0000.V05B.30min.tif",
            class.marker(),
            slot.format("%Y%m%d-S%H%M%S")
        )
    }

    fn listing(names: Vec<String>) -> RemoteListing {
        RemoteListing {
            partition: Partition {
                year: 2018,
                month: 8,
            },
            dir: "/data/imerg/gis/2018/08".into(),
            names,
        }
    }

    fn cutoff() -> NaiveDate {
        NaiveDate::from_ymd_opt(2018, 5, 1).unwrap()
    }

    fn slots(selection: &Selection) -> Vec<NaiveDateTime> {
        selection.candidates.iter().map(|o| o.slot_start).collect()
    }

    #[test]
    fn test_late_rule_boundaries() {
        let marks = Watermarks {
            late: Some(ts(9, 23, 0)),
            early: Some(ts(10, 1, 0)),
        };
        // Equal to the watermark is not newer
        assert!(!late_rule(ts(9, 23, 0), &marks));
        assert!(late_rule(ts(9, 23, 30), &marks));
        // The Early watermark does not constrain Late candidates
        assert!(late_rule(ts(10, 0, 30), &marks));
        assert!(late_rule(ts(10, 2, 0), &marks));
    }

    #[test]
    fn test_early_rule_boundaries() {
        let marks = Watermarks {
            late: Some(ts(10, 3, 0)),
            early: Some(ts(10, 1, 0)),
        };
        // Fails the Late condition even though it beats the Early watermark
        assert!(!early_rule(ts(10, 1, 30), &marks));
        assert!(!early_rule(ts(10, 2, 30), &marks));
        assert!(!early_rule(ts(10, 3, 0), &marks));
        assert!(early_rule(ts(10, 3, 30), &marks));

        let marks = Watermarks {
            late: Some(ts(10, 2, 0)),
            early: Some(ts(10, 1, 0)),
        };
        assert!(early_rule(ts(10, 2, 30), &marks));
        assert!(!early_rule(ts(10, 2, 0), &marks));
    }

    #[test]
    fn test_none_watermark_admits_everything() {
        let none = Watermarks::default();
        assert!(late_rule(ts(1, 0, 0), &none));
        assert!(early_rule(ts(1, 0, 0), &none));

        let only_early = Watermarks {
            late: None,
            early: Some(ts(5, 0, 0)),
        };
        assert!(!early_rule(ts(5, 0, 0), &only_early));
        assert!(early_rule(ts(5, 0, 30), &only_early));
    }

    #[test]
    fn test_late_selection_example() {
        let codec = TimestampCodec::default();
        let marks = Watermarks {
            late: Some(ts(9, 23, 30)),
            early: Some(ts(10, 1, 0)),
        };
        let names = vec![
            "3B-HHR-L.MS.MRG.3IMERG.20180809-S233000-E235959.1410.V05B.30min.tif".to_string(),
            name(ProductClass::Late, ts(10, 2, 0)),
            name(ProductClass::Early, ts(10, 2, 30)),
        ];

        let selection = select(&codec, ProductClass::Late, marks, cutoff(), &[listing(names)]);
        assert_eq!(slots(&selection), vec![ts(10, 2, 0)]);
        assert_eq!(selection.skipped.not_newer, 1);
        assert_eq!(selection.skipped.wrong_class, 1);
        assert_eq!(selection.listed, 3);
    }

    #[test]
    fn test_early_selection_after_late_phase() {
        let codec = TimestampCodec::default();
        let marks = Watermarks {
            late: Some(ts(10, 2, 0)),
            early: Some(ts(10, 1, 0)),
        };
        let names = vec![
            name(ProductClass::Early, ts(10, 1, 30)),
            name(ProductClass::Early, ts(10, 2, 30)),
            name(ProductClass::Early, ts(10, 3, 0)),
        ];

        let selection = select(&codec, ProductClass::Early, marks, cutoff(), &[listing(names)]);
        assert_eq!(slots(&selection), vec![ts(10, 2, 30), ts(10, 3, 0)]);
        assert_eq!(selection.skipped.not_newer, 1);
    }

    #[test]
    fn test_never_selects_at_or_below_watermark() {
        let codec = TimestampCodec::default();
        let marks = Watermarks {
            late: Some(ts(10, 12, 0)),
            early: Some(ts(10, 18, 0)),
        };

        // Every half hour across two days, both classes
        let mut names = Vec::new();
        let mut slot = ts(9, 0, 0);
        while slot < ts(11, 0, 0) {
            names.push(name(ProductClass::Late, slot));
            names.push(name(ProductClass::Early, slot));
            slot += chrono::TimeDelta::minutes(30);
        }

        for class in ProductClass::ALL {
            let selection = select(&codec, class, marks, cutoff(), &[listing(names.clone())]);
            assert!(!selection.candidates.is_empty());
            for obs in &selection.candidates {
                assert_eq!(obs.class, class);
                assert!(obs.slot_start > marks.late.unwrap());
                if class == ProductClass::Early {
                    assert!(obs.slot_start > marks.early.unwrap());
                }
            }
        }
    }

    #[test]
    fn test_sorted_and_deduplicated_across_listings() {
        let codec = TimestampCodec::default();
        let first = listing(vec![
            name(ProductClass::Late, ts(10, 3, 0)),
            name(ProductClass::Late, ts(10, 1, 0)),
        ]);
        let second = listing(vec![
            name(ProductClass::Late, ts(10, 1, 0)),
            name(ProductClass::Late, ts(10, 2, 0)),
        ]);

        let selection = select(
            &codec,
            ProductClass::Late,
            Watermarks::default(),
            cutoff(),
            &[first, second],
        );
        assert_eq!(slots(&selection), vec![ts(10, 1, 0), ts(10, 2, 0), ts(10, 3, 0)]);
        assert_eq!(selection.skipped.duplicate, 1);
    }

    #[test]
    fn test_skip_reasons() {
        let codec = TimestampCodec::default();
        let names = vec![
            ".".to_string(),
            "..".to_string(),
            "3B-HHR-L.MS.MRG.3IMERG.2018080-S2330.30min.tif".to_string(),
            "3B-HHR-X.MS.MRG.3IMERG.20180809-S233000-E235959.1410.V05B.30min.tif".to_string(),
            name(
                ProductClass::Late,
                NaiveDate::from_ymd_opt(2018, 4, 30).unwrap().and_hms_opt(23, 30, 0).unwrap(),
            ),
        ];

        let selection = select(
            &codec,
            ProductClass::Late,
            Watermarks::default(),
            cutoff(),
            &[listing(names)],
        );
        assert!(selection.candidates.is_empty());
        assert_eq!(selection.skipped.not_product, 2);
        assert_eq!(selection.skipped.malformed, 2);
        assert_eq!(selection.skipped.expired, 1);
        assert_eq!(selection.skipped.total(), 3);
    }
}
