//! Catalog store contract and SQLite implementation
//!
//! The catalog is the only state that survives between runs. Every watermark
//! is derived from it, so writes must be durable before they return.

use crate::catalog::schema::{self, keys};
use crate::error::{CatalogError, CatalogResult};
use crate::timestamp::TimestampCodec;
use crate::types::{CatalogEntry, ProductClass};
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Summary returned by catalog maintenance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogStats {
    pub early: u64,
    pub late: u64,
    pub oldest: Option<NaiveDateTime>,
    pub newest: Option<NaiveDateTime>,
}

impl CatalogStats {
    /// Total entries across classes
    pub fn total(&self) -> u64 {
        self.early + self.late
    }
}

/// Persistent catalog of committed observations
pub trait CatalogStore {
    /// Latest committed slot start for a class
    fn query_max_slot(&self, class: ProductClass) -> CatalogResult<Option<NaiveDateTime>>;

    /// Look up the entry for an identity key
    fn find(&self, slot_start: NaiveDateTime, class: ProductClass)
        -> CatalogResult<Option<CatalogEntry>>;

    /// Register an entry, replacing any entry with the same identity key
    fn insert_or_replace(&self, entry: &CatalogEntry) -> CatalogResult<()>;

    /// Delete an entry; returns whether one existed
    fn delete(&self, slot_start: NaiveDateTime, class: ProductClass) -> CatalogResult<bool>;

    /// Retire `retired` and register `entry`.
    ///
    /// The default deletes then inserts, which briefly exposes a slot with no
    /// entry to concurrent readers. Stores with transactions override this to
    /// swap atomically.
    fn supersede(&self, retired: &CatalogEntry, entry: &CatalogEntry) -> CatalogResult<()> {
        self.delete(retired.slot_start, retired.class)?;
        self.insert_or_replace(entry)
    }

    /// Remove and return every entry whose slot starts before `cutoff`
    fn remove_older_than(&self, cutoff: NaiveDateTime) -> CatalogResult<Vec<CatalogEntry>>;

    /// Number of entries of a class
    fn count(&self, class: ProductClass) -> CatalogResult<u64>;

    /// All entries in ascending slot order
    fn entries(&self) -> CatalogResult<Vec<CatalogEntry>>;

    /// Refresh statistics and return counts
    fn compute_statistics(&self) -> CatalogResult<CatalogStats>;

    /// Reclaim storage
    fn compact(&self) -> CatalogResult<()>;

    /// Store a run bookkeeping value
    fn set_info(&self, key: &str, value: &str) -> CatalogResult<()>;

    /// Read a run bookkeeping value
    fn get_info(&self, key: &str) -> CatalogResult<Option<String>>;
}

/// SQLite-backed catalog
pub struct SqliteCatalog {
    conn: Connection,
    codec: TimestampCodec,
    path: Option<PathBuf>,
}

impl SqliteCatalog {
    /// Open (creating if needed) the catalog at `path`
    pub fn open(path: &Path, codec: TimestampCodec) -> CatalogResult<Self> {
        let conn = Connection::open(path).map_err(|e| map_open_error(path, e))?;
        schema::create_catalog(&conn).map_err(|e| match e {
            CatalogError::Sqlite(inner) => map_open_error(path, inner),
            other => other,
        })?;
        schema::set_sync_info(&conn, keys::SYNC_VERSION, env!("CARGO_PKG_VERSION"))?;

        debug!("Opened catalog {}", path.display());
        Ok(Self {
            conn,
            codec,
            path: Some(path.to_path_buf()),
        })
    }

    /// Open a throwaway in-memory catalog
    pub fn open_in_memory(codec: TimestampCodec) -> CatalogResult<Self> {
        let conn = Connection::open_in_memory()?;
        schema::create_catalog(&conn)?;
        Ok(Self {
            conn,
            codec,
            path: None,
        })
    }

    /// Path of the catalog file, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn insert_with(&self, conn: &Connection, entry: &CatalogEntry) -> CatalogResult<()> {
        let mut stmt = conn.prepare_cached(
            "INSERT OR REPLACE INTO rasters
                 (name, product_class, slot_start, slot_end, catalog_key, location, registered_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?;
        stmt.execute(params![
            entry.name,
            entry.class.as_str(),
            to_unix(entry.slot_start),
            to_unix(entry.slot_end),
            self.codec.format(entry.slot_start),
            entry.location.to_string_lossy(),
            Utc::now().to_rfc3339(),
        ])?;
        Ok(())
    }

    fn delete_with(
        conn: &Connection,
        slot_start: NaiveDateTime,
        class: ProductClass,
    ) -> CatalogResult<bool> {
        let removed = conn.execute(
            "DELETE FROM rasters WHERE slot_start = ?1 AND product_class = ?2",
            params![to_unix(slot_start), class.as_str()],
        )?;
        Ok(removed > 0)
    }
}

impl CatalogStore for SqliteCatalog {
    fn query_max_slot(&self, class: ProductClass) -> CatalogResult<Option<NaiveDateTime>> {
        let max: Option<i64> = self.conn.query_row(
            "SELECT MAX(slot_start) FROM rasters WHERE product_class = ?1",
            [class.as_str()],
            |row| row.get(0),
        )?;
        max.map(from_unix).transpose()
    }

    fn find(
        &self,
        slot_start: NaiveDateTime,
        class: ProductClass,
    ) -> CatalogResult<Option<CatalogEntry>> {
        let raw = self
            .conn
            .query_row(
                "SELECT name, product_class, slot_start, slot_end, location
                 FROM rasters WHERE slot_start = ?1 AND product_class = ?2",
                params![to_unix(slot_start), class.as_str()],
                read_row,
            )
            .optional()?;
        raw.map(RawEntry::decode).transpose()
    }

    fn insert_or_replace(&self, entry: &CatalogEntry) -> CatalogResult<()> {
        self.insert_with(&self.conn, entry)
    }

    fn delete(&self, slot_start: NaiveDateTime, class: ProductClass) -> CatalogResult<bool> {
        Self::delete_with(&self.conn, slot_start, class)
    }

    fn supersede(&self, retired: &CatalogEntry, entry: &CatalogEntry) -> CatalogResult<()> {
        let tx = self.conn.unchecked_transaction()?;
        Self::delete_with(&tx, retired.slot_start, retired.class)?;
        self.insert_with(&tx, entry)?;
        tx.commit()?;
        Ok(())
    }

    fn remove_older_than(&self, cutoff: NaiveDateTime) -> CatalogResult<Vec<CatalogEntry>> {
        let tx = self.conn.unchecked_transaction()?;
        let removed = {
            let mut stmt = tx.prepare_cached(
                "SELECT name, product_class, slot_start, slot_end, location
                 FROM rasters WHERE slot_start < ?1 ORDER BY slot_start",
            )?;
            let rows = stmt
                .query_map([to_unix(cutoff)], read_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter()
                .map(RawEntry::decode)
                .collect::<CatalogResult<Vec<_>>>()?
        };
        tx.execute("DELETE FROM rasters WHERE slot_start < ?1", [to_unix(cutoff)])?;
        tx.commit()?;
        Ok(removed)
    }

    fn count(&self, class: ProductClass) -> CatalogResult<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM rasters WHERE product_class = ?1",
            [class.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn entries(&self) -> CatalogResult<Vec<CatalogEntry>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT name, product_class, slot_start, slot_end, location
             FROM rasters ORDER BY slot_start, product_class",
        )?;
        let rows = stmt
            .query_map([], read_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawEntry::decode).collect()
    }

    fn compute_statistics(&self) -> CatalogResult<CatalogStats> {
        schema::analyze(&self.conn)?;

        let (oldest, newest): (Option<i64>, Option<i64>) = self.conn.query_row(
            "SELECT MIN(slot_start), MAX(slot_start) FROM rasters",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        Ok(CatalogStats {
            early: self.count(ProductClass::Early)?,
            late: self.count(ProductClass::Late)?,
            oldest: oldest.map(from_unix).transpose()?,
            newest: newest.map(from_unix).transpose()?,
        })
    }

    fn compact(&self) -> CatalogResult<()> {
        if self.path.is_none() {
            return Ok(());
        }
        schema::vacuum(&self.conn)
    }

    fn set_info(&self, key: &str, value: &str) -> CatalogResult<()> {
        schema::set_sync_info(&self.conn, key, value)
    }

    fn get_info(&self, key: &str) -> CatalogResult<Option<String>> {
        schema::get_sync_info(&self.conn, key)
    }
}

/// Row as stored, before decoding
struct RawEntry {
    name: String,
    class: String,
    slot_start: i64,
    slot_end: i64,
    location: String,
}

impl RawEntry {
    fn decode(self) -> CatalogResult<CatalogEntry> {
        let class = self
            .class
            .parse::<ProductClass>()
            .map_err(CatalogError::Corrupt)?;
        Ok(CatalogEntry {
            name: self.name,
            class,
            slot_start: from_unix(self.slot_start)?,
            slot_end: from_unix(self.slot_end)?,
            location: PathBuf::from(self.location),
        })
    }
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawEntry> {
    Ok(RawEntry {
        name: row.get(0)?,
        class: row.get(1)?,
        slot_start: row.get(2)?,
        slot_end: row.get(3)?,
        location: row.get(4)?,
    })
}

fn to_unix(ts: NaiveDateTime) -> i64 {
    ts.and_utc().timestamp()
}

fn from_unix(secs: i64) -> CatalogResult<NaiveDateTime> {
    DateTime::from_timestamp(secs, 0)
        .map(|dt| dt.naive_utc())
        .ok_or_else(|| CatalogError::Corrupt(format!("timestamp {} out of range", secs)))
}

fn map_open_error(path: &Path, e: rusqlite::Error) -> CatalogError {
    match CatalogError::from(e) {
        CatalogError::Sqlite(e) => CatalogError::OpenFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeDelta};
    use tempfile::tempdir;

    fn ts(d: u32, h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2018, 8, d)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn entry(class: ProductClass, start: NaiveDateTime) -> CatalogEntry {
        CatalogEntry {
            name: format!("{}-{}", class, start.format("%Y%m%d%H%M")),
            class,
            slot_start: start,
            slot_end: start + TimeDelta::minutes(30),
            location: PathBuf::from(format!("/store/{}.tif", start.format("%Y%m%d%H%M"))),
        }
    }

    fn catalog() -> SqliteCatalog {
        SqliteCatalog::open_in_memory(TimestampCodec::default()).unwrap()
    }

    #[test]
    fn test_empty_catalog_has_no_watermark() {
        let cat = catalog();
        assert_eq!(cat.query_max_slot(ProductClass::Late).unwrap(), None);
        assert_eq!(cat.query_max_slot(ProductClass::Early).unwrap(), None);
    }

    #[test]
    fn test_max_slot_per_class() {
        let cat = catalog();
        cat.insert_or_replace(&entry(ProductClass::Late, ts(9, 23, 0))).unwrap();
        cat.insert_or_replace(&entry(ProductClass::Late, ts(9, 22, 30))).unwrap();
        cat.insert_or_replace(&entry(ProductClass::Early, ts(10, 1, 0))).unwrap();

        assert_eq!(cat.query_max_slot(ProductClass::Late).unwrap(), Some(ts(9, 23, 0)));
        assert_eq!(cat.query_max_slot(ProductClass::Early).unwrap(), Some(ts(10, 1, 0)));
    }

    #[test]
    fn test_insert_or_replace_is_idempotent() {
        let cat = catalog();
        let e = entry(ProductClass::Late, ts(9, 23, 0));
        cat.insert_or_replace(&e).unwrap();
        cat.insert_or_replace(&e).unwrap();
        assert_eq!(cat.entries().unwrap().len(), 1);
        assert_eq!(cat.find(e.slot_start, e.class).unwrap(), Some(e));
    }

    #[test]
    fn test_supersede_swaps_atomically() {
        let cat = catalog();
        let early = entry(ProductClass::Early, ts(10, 2, 0));
        let late = entry(ProductClass::Late, ts(10, 2, 0));
        cat.insert_or_replace(&early).unwrap();

        cat.supersede(&early, &late).unwrap();

        let all = cat.entries().unwrap();
        assert_eq!(all, vec![late]);
        assert!(cat.find(ts(10, 2, 0), ProductClass::Early).unwrap().is_none());
    }

    #[test]
    fn test_busy_write_is_locked() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("imerg.db");
        let cat = SqliteCatalog::open(&path, TimestampCodec::default()).unwrap();
        cat.conn.busy_timeout(std::time::Duration::from_millis(50)).unwrap();

        let other = Connection::open(&path).unwrap();
        other.execute_batch("BEGIN EXCLUSIVE").unwrap();

        let early = entry(ProductClass::Early, ts(10, 2, 0));
        let late = entry(ProductClass::Late, ts(10, 2, 0));
        assert!(matches!(cat.insert_or_replace(&early), Err(CatalogError::Locked)));
        assert!(matches!(cat.supersede(&early, &late), Err(CatalogError::Locked)));

        other.execute_batch("ROLLBACK").unwrap();
        cat.insert_or_replace(&early).unwrap();
    }

    #[test]
    fn test_delete() {
        let cat = catalog();
        let e = entry(ProductClass::Early, ts(10, 2, 0));
        cat.insert_or_replace(&e).unwrap();
        assert!(cat.delete(e.slot_start, e.class).unwrap());
        assert!(!cat.delete(e.slot_start, e.class).unwrap());
    }

    #[test]
    fn test_remove_older_than() {
        let cat = catalog();
        cat.insert_or_replace(&entry(ProductClass::Late, ts(1, 0, 0))).unwrap();
        cat.insert_or_replace(&entry(ProductClass::Late, ts(2, 0, 0))).unwrap();
        cat.insert_or_replace(&entry(ProductClass::Early, ts(3, 0, 0))).unwrap();

        let removed = cat.remove_older_than(ts(2, 0, 0)).unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].slot_start, ts(1, 0, 0));
        assert_eq!(cat.entries().unwrap().len(), 2);
    }

    #[test]
    fn test_statistics() {
        let cat = catalog();
        cat.insert_or_replace(&entry(ProductClass::Late, ts(1, 0, 0))).unwrap();
        cat.insert_or_replace(&entry(ProductClass::Early, ts(3, 0, 0))).unwrap();

        let stats = cat.compute_statistics().unwrap();
        assert_eq!(stats.late, 1);
        assert_eq!(stats.early, 1);
        assert_eq!(stats.total(), 2);
        assert_eq!(stats.oldest, Some(ts(1, 0, 0)));
        assert_eq!(stats.newest, Some(ts(3, 0, 0)));
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catalog.db");

        {
            let cat = SqliteCatalog::open(&path, TimestampCodec::default()).unwrap();
            cat.insert_or_replace(&entry(ProductClass::Late, ts(9, 23, 0))).unwrap();
            cat.compact().unwrap();
        }

        let cat = SqliteCatalog::open(&path, TimestampCodec::default()).unwrap();
        assert_eq!(cat.query_max_slot(ProductClass::Late).unwrap(), Some(ts(9, 23, 0)));
        assert_eq!(
            cat.get_info(keys::SYNC_VERSION).unwrap().as_deref(),
            Some(env!("CARGO_PKG_VERSION"))
        );
    }
}
