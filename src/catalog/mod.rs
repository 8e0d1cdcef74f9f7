//! Raster catalog
//!
//! SQLite-backed record of committed observations. The catalog is the sole
//! source of watermarks.

pub mod schema;
pub mod store;
pub mod watermark;

pub use schema::{keys, SCHEMA_VERSION};
pub use store::{CatalogStats, CatalogStore, SqliteCatalog};
pub use watermark::{WatermarkReader, Watermarks};
