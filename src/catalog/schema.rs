//! Catalog schema definitions and creation
//!
//! This module defines the SQLite schema for the raster catalog and
//! provides functions to create and maintain the database.

use crate::error::CatalogResult;
use rusqlite::{Connection, OptionalExtension};

/// Current schema version for migrations
pub const SCHEMA_VERSION: u32 = 1;

/// SQL to create the raster catalog table
/// One row per committed observation; (slot_start, product_class) is the identity key.
const CREATE_RASTERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS rasters (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    product_class TEXT NOT NULL,  -- 'EARLY' or 'LATE'
    slot_start INTEGER NOT NULL,  -- Unix timestamp (UTC)
    slot_end INTEGER NOT NULL,
    catalog_key TEXT NOT NULL,    -- e.g. 201808100230
    location TEXT NOT NULL,       -- Final store path
    registered_at TEXT NOT NULL,  -- ISO 8601
    UNIQUE (slot_start, product_class)
)
"#;

/// SQL to create sync metadata table
const CREATE_SYNC_INFO_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS sync_info (
    key TEXT PRIMARY KEY,
    value TEXT
)
"#;

/// SQL to create indexes for watermark and retention queries
const CREATE_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_rasters_class_slot ON rasters(product_class, slot_start)",
    "CREATE INDEX IF NOT EXISTS idx_rasters_name ON rasters(name)",
];

/// Pragmas for a durable single-writer catalog.
/// synchronous = FULL so a registered entry survives a crash before the next
/// watermark query observes it.
const CATALOG_PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = FULL;
PRAGMA foreign_keys = ON;
PRAGMA temp_store = MEMORY;
PRAGMA busy_timeout = 5000;
"#;

/// Create and configure the catalog
pub fn create_catalog(conn: &Connection) -> CatalogResult<()> {
    conn.execute_batch(CATALOG_PRAGMAS)?;

    conn.execute(CREATE_RASTERS_TABLE, [])?;
    conn.execute(CREATE_SYNC_INFO_TABLE, [])?;
    create_indexes(conn)?;

    set_sync_info(conn, keys::SCHEMA_VERSION, &SCHEMA_VERSION.to_string())?;
    Ok(())
}

/// Create indexes
pub fn create_indexes(conn: &Connection) -> CatalogResult<()> {
    for sql in CREATE_INDEXES {
        conn.execute(sql, [])?;
    }
    Ok(())
}

/// Refresh query planner statistics
pub fn analyze(conn: &Connection) -> CatalogResult<()> {
    conn.execute("ANALYZE", [])?;
    Ok(())
}

/// Reclaim free pages
pub fn vacuum(conn: &Connection) -> CatalogResult<()> {
    conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE); VACUUM;")?;
    Ok(())
}

/// Store sync metadata
pub fn set_sync_info(conn: &Connection, key: &str, value: &str) -> CatalogResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO sync_info (key, value) VALUES (?1, ?2)",
        [key, value],
    )?;
    Ok(())
}

/// Get sync metadata
pub fn get_sync_info(conn: &Connection, key: &str) -> CatalogResult<Option<String>> {
    let value = conn
        .query_row(
            "SELECT value FROM sync_info WHERE key = ?1",
            [key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

/// Metadata keys used by the synchronizer
pub mod keys {
    /// Remote source that was synchronized
    pub const SOURCE: &str = "source";

    /// Timestamp when the last run started (ISO 8601)
    pub const LAST_RUN_START: &str = "last_run_start";

    /// Timestamp when the last run ended (ISO 8601)
    pub const LAST_RUN_END: &str = "last_run_end";

    /// Status of the last run: "completed", "partial", "failed", "interrupted"
    pub const LAST_RUN_STATUS: &str = "last_run_status";

    /// Files committed by the last run
    pub const LAST_RUN_COMMITTED: &str = "last_run_committed";

    /// File-level failures in the last run
    pub const LAST_RUN_FAILED: &str = "last_run_failed";

    /// Early entries retired by Late entries in the last run
    pub const LAST_RUN_SUPERSEDED: &str = "last_run_superseded";

    /// Schema version
    pub const SCHEMA_VERSION: &str = "schema_version";

    /// Synchronizer version
    pub const SYNC_VERSION: &str = "sync_version";
}
