//! imerg-sync - Incremental IMERG archive synchronizer
//!
//! Mirrors a remote archive of 30 minute precipitation rasters into a local
//! raster store and a SQLite catalog. Each product comes in two releases for
//! the same time slot: a provisional Early one and a corrected Late one that
//! supersedes it.
//!
//! # Features
//!
//! - **Watermark Driven**: The newest committed slot per class decides what
//!   is new, so a re-run with nothing new upstream does nothing.
//!
//! - **Ordered Commits**: Files are fetched and filtered in parallel but
//!   registered strictly in time order, so the watermark never passes a gap.
//!
//! - **Supersession**: A Late product atomically replaces the Early entry of
//!   the same slot; the catalog never holds two entries for one slot.
//!
//! - **Retention**: Rasters older than the retention window are purged from
//!   the catalog and the store.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │              Remote archive (HTTP, proxied FTP, mirror)         │
//! │               {base}/{year}/{month}/3B-HHR-L....tif             │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │ list_directory / download
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  PartitionWalk ──► CandidateSelector ──► CommitPipeline          │
//! │  (month dirs)      (watermark filter)    ┌─────────┐             │
//! │                                          │Worker 1 │ fetch       │
//! │                                          │Worker N │ transform   │
//! │                                          └────┬────┘             │
//! │                                               ▼                  │
//! │                                    reorder ─► relocate ─► register
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//!                    ┌──────────────────┐     ┌──────────────────┐
//!                    │   Final store    │     │  SQLite catalog  │
//!                    │   (*.tif)        │     │   (imerg.db)     │
//!                    └──────────────────┘     └──────────────────┘
//! ```
//!
//! The [`coordinator::Reconciler`] runs the Late phase, then the Early phase,
//! then maintenance and the service refresh.
//!
//! # Example
//!
//! ```bash
//! # Mirror over HTTPS
//! imerg-sync https://archive.example.net/data/imerg/gis \
//!     --staging /scratch/imerg --final-store /data/imerg --catalog imerg.db
//!
//! # Inspect the catalog
//! imerg-sync status imerg.db
//! ```

pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod pipeline;
pub mod progress;
pub mod remote;
pub mod selector;
pub mod service;
pub mod supersede;
pub mod timestamp;
pub mod types;
pub mod walker;

pub use catalog::{CatalogStore, SqliteCatalog, WatermarkReader, Watermarks};
pub use config::{CliArgs, SyncConfig};
pub use coordinator::{ReconcileSettings, Reconciler, RunStatus, RunSummary};
pub use error::{Result, SyncError};
pub use timestamp::TimestampCodec;
pub use types::{CatalogEntry, Observation, ProductClass};
