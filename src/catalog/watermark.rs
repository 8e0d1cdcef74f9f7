//! Per-class watermarks derived from the catalog
//!
//! A watermark is the latest committed slot start of a class, or `None` when
//! nothing of that class has been committed. Watermarks are read once per
//! phase and passed by value; nothing caches them across phases.

use crate::catalog::store::CatalogStore;
use crate::error::CatalogResult;
use crate::types::ProductClass;
use chrono::{NaiveDate, NaiveDateTime};
use std::fmt;

/// Snapshot of both watermarks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Watermarks {
    pub late: Option<NaiveDateTime>,
    pub early: Option<NaiveDateTime>,
}

impl Watermarks {
    /// Watermark of one class
    pub fn get(&self, class: ProductClass) -> Option<NaiveDateTime> {
        match class {
            ProductClass::Late => self.late,
            ProductClass::Early => self.early,
        }
    }

    /// Date the walk of `class` should start from.
    ///
    /// The Late walk starts at the Late watermark. The Early walk starts at
    /// whichever of the two watermarks is later, since Early candidates must
    /// beat both. Neither walk starts before the retention cutoff.
    pub fn walk_start(&self, class: ProductClass, cutoff: NaiveDate) -> NaiveDate {
        let mark = match class {
            ProductClass::Late => self.late,
            ProductClass::Early => self.late.max(self.early),
        };
        mark.map(|ts| ts.date()).unwrap_or(cutoff).max(cutoff)
    }
}

impl fmt::Display for Watermarks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "late={} early={}",
            describe(self.late),
            describe(self.early)
        )
    }
}

fn describe(mark: Option<NaiveDateTime>) -> String {
    mark.map(|ts| ts.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "none".to_string())
}

/// Reads watermarks from a catalog
pub struct WatermarkReader<'a, C: CatalogStore + ?Sized> {
    catalog: &'a C,
}

impl<'a, C: CatalogStore + ?Sized> WatermarkReader<'a, C> {
    pub fn new(catalog: &'a C) -> Self {
        Self { catalog }
    }

    /// Latest committed slot start of `class`
    pub fn latest(&self, class: ProductClass) -> CatalogResult<Option<NaiveDateTime>> {
        self.catalog.query_max_slot(class)
    }

    /// Fresh snapshot of both watermarks
    pub fn read(&self) -> CatalogResult<Watermarks> {
        Ok(Watermarks {
            late: self.latest(ProductClass::Late)?,
            early: self.latest(ProductClass::Early)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::store::SqliteCatalog;
    use crate::timestamp::TimestampCodec;
    use crate::types::CatalogEntry;
    use chrono::TimeDelta;
    use std::path::PathBuf;

    fn ts(d: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2018, 8, d)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    fn day(m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2018, m, d).unwrap()
    }

    #[test]
    fn test_reader_tracks_commits() {
        let cat = SqliteCatalog::open_in_memory(TimestampCodec::default()).unwrap();
        let reader = WatermarkReader::new(&cat);
        assert_eq!(reader.read().unwrap(), Watermarks::default());

        cat.insert_or_replace(&CatalogEntry {
            name: "late".into(),
            class: ProductClass::Late,
            slot_start: ts(9, 23),
            slot_end: ts(9, 23) + TimeDelta::minutes(30),
            location: PathBuf::from("/store/late.tif"),
        })
        .unwrap();

        let marks = reader.read().unwrap();
        assert_eq!(marks.late, Some(ts(9, 23)));
        assert_eq!(marks.early, None);
        assert_eq!(marks.get(ProductClass::Late), Some(ts(9, 23)));
    }

    #[test]
    fn test_walk_start() {
        let cutoff = day(7, 1);
        let none = Watermarks::default();
        assert_eq!(none.walk_start(ProductClass::Late, cutoff), cutoff);
        assert_eq!(none.walk_start(ProductClass::Early, cutoff), cutoff);

        let marks = Watermarks {
            late: Some(ts(9, 23)),
            early: Some(ts(10, 2)),
        };
        assert_eq!(marks.walk_start(ProductClass::Late, cutoff), day(8, 9));
        assert_eq!(marks.walk_start(ProductClass::Early, cutoff), day(8, 10));

        // Watermarks older than the retention window are clamped
        assert_eq!(marks.walk_start(ProductClass::Late, day(9, 1)), day(9, 1));
    }

    #[test]
    fn test_display() {
        let marks = Watermarks {
            late: Some(ts(9, 23)),
            early: None,
        };
        assert_eq!(marks.to_string(), "late=2018-08-09 23:00 early=none");
    }
}
