//! Error types for imerg-sync
//!
//! This module defines the error hierarchy for a reconciliation run:
//! - Filename parsing errors (skip the entry)
//! - Remote transfer errors (retry, then skip the file or abort the phase)
//! - Raster transform errors (skip the file)
//! - Catalog errors (abort the run, no rollback)
//! - Service control errors (reported only)
//! - Configuration errors (startup)
//!
//! Library code returns these typed errors; only `main.rs` wraps them in
//! `anyhow` for display.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for a synchronization run
#[derive(Error, Debug)]
pub enum SyncError {
    /// Malformed remote filename
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// Network or remote I/O error
    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    /// Value-filter transform failed
    #[error("Transform error: {0}")]
    Transform(#[from] TransformError),

    /// Catalog store unreachable or write failed
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// Service refresh failed
    #[error("Service control error: {0}")]
    ServiceControl(#[from] ServiceControlError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Local filesystem errors (staging, relocation)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Interrupted by signal
    #[error("Operation interrupted by signal")]
    Interrupted,
}

/// Errors decoding a remote filename into an observation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Name does not carry the product suffix (directory placeholders, sidecars)
    #[error("'{name}' is not a product file (missing '{suffix}')")]
    NotAProduct { name: String, suffix: String },

    /// Name is too short to carry a class marker
    #[error("'{name}' is truncated: no class marker at position {position}")]
    Truncated { name: String, position: usize },

    /// Class marker is neither Early nor Late
    #[error("'{name}' has unknown class marker '{marker}'")]
    UnknownClass { name: String, marker: char },

    /// No date/start-time token found
    #[error("No timestamp token in '{name}'")]
    MissingTimestamp { name: String },

    /// Token found but not a valid date-time
    #[error("Invalid timestamp '{token}' in '{name}': {reason}")]
    InvalidTimestamp {
        name: String,
        token: String,
        reason: String,
    },
}

/// Remote transfer errors
#[derive(Error, Debug, Clone)]
pub enum TransferError {
    /// Failed to parse the remote source
    #[error("Invalid remote source '{source_url}': {reason}")]
    InvalidSource { source_url: String, reason: String },

    /// Could not reach the remote host
    #[error("Failed to connect to '{host}': {reason}")]
    ConnectionFailed { host: String, reason: String },

    /// Directory listing failed
    #[error("Failed to list '{path}': {reason}")]
    ListFailed { path: String, reason: String },

    /// Download failed
    #[error("Failed to download '{path}': {reason}")]
    DownloadFailed { path: String, reason: String },

    /// Remote path does not exist (e.g. a partition not yet populated)
    #[error("Remote path not found: '{path}'")]
    NotFound { path: String },

    /// Unexpected HTTP status
    #[error("HTTP {status} from '{url}'")]
    Status { url: String, status: u16 },

    /// Request timed out
    #[error("Timed out: '{path}'")]
    Timeout { path: String },

    /// Local write of a downloaded payload failed
    #[error("Failed to write '{}': {reason}", path.display())]
    LocalWrite { path: PathBuf, reason: String },

    /// Retries exhausted
    #[error("Gave up on '{path}' after {attempts} attempts: {last}")]
    Exhausted {
        path: String,
        attempts: u32,
        last: Box<TransferError>,
    },
}

impl TransferError {
    /// Check if a retry may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::ConnectionFailed { .. }
            | TransferError::ListFailed { .. }
            | TransferError::DownloadFailed { .. }
            | TransferError::Timeout { .. } => true,
            TransferError::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Check if this error means the remote path is absent
    pub fn is_not_found(&self) -> bool {
        matches!(self, TransferError::NotFound { .. })
    }
}

/// Raster transform errors
#[derive(Error, Debug)]
pub enum TransformError {
    /// Transform program could not be started
    #[error("Failed to launch transform '{program}': {reason}")]
    Launch { program: String, reason: String },

    /// Transform program exited unsuccessfully
    #[error("Transform of '{}' exited with {status}: {stderr}", input.display())]
    Failed {
        input: PathBuf,
        status: String,
        stderr: String,
    },

    /// Transform reported success but produced no output
    #[error("Transform produced no output at '{}'", path.display())]
    MissingOutput { path: PathBuf },
}

/// Catalog errors
#[derive(Error, Debug)]
pub enum CatalogError {
    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[source] rusqlite::Error),

    /// Failed to open the catalog
    #[error("Failed to open catalog at '{}': {reason}", path.display())]
    OpenFailed { path: PathBuf, reason: String },

    /// Stored row is not decodable
    #[error("Corrupt catalog row: {0}")]
    Corrupt(String),

    /// Database is locked
    #[error("Catalog is locked - another process may be using it")]
    Locked,
}

impl From<rusqlite::Error> for CatalogError {
    /// Busy and locked results surface as [`CatalogError::Locked`] wherever
    /// they occur, not only while opening
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked) => {
                CatalogError::Locked
            }
            _ => CatalogError::Sqlite(e),
        }
    }
}

/// Service refresh errors
#[derive(Error, Debug)]
pub enum ServiceControlError {
    /// Token request failed
    #[error("Failed to obtain admin token from '{url}': {reason}")]
    Token { url: String, reason: String },

    /// Stop/start request failed at the transport level
    #[error("Failed to {action} service '{service}': {reason}")]
    Request {
        action: &'static str,
        service: String,
        reason: String,
    },

    /// Server answered but did not report success
    #[error("Service '{service}' {action} returned status '{status}'")]
    Rejected {
        action: &'static str,
        service: String,
        status: String,
    },
}

/// Configuration and CLI errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Invalid worker count
    #[error("Invalid worker count {count}: must be between 1 and {max}")]
    InvalidWorkerCount { count: usize, max: usize },

    /// Invalid retry count
    #[error("Invalid retry count {count}: must be at most {max}")]
    InvalidRetryCount { count: u32, max: u32 },

    /// Required option missing from both CLI and config file
    #[error("Missing required option '{0}'")]
    Missing(&'static str),

    /// Invalid timestamp pattern
    #[error("Invalid timestamp pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// Invalid date format
    #[error("Invalid date format '{format}': {reason}")]
    InvalidDateFormat { format: String, reason: String },

    /// Invalid partition template
    #[error("Invalid partition template '{template}': {reason}")]
    InvalidTemplate { template: String, reason: String },

    /// Invalid remote source
    #[error("Invalid remote source: {0}")]
    InvalidSource(#[from] TransferError),

    /// Path error
    #[error("Invalid path '{}': {reason}", path.display())]
    InvalidPath { path: PathBuf, reason: String },

    /// Config file unreadable or malformed
    #[error("Cannot load config file '{}': {reason}", path.display())]
    InvalidFile { path: PathBuf, reason: String },

    /// Value out of range
    #[error("Invalid value for '{name}': {reason}")]
    InvalidValue { name: &'static str, reason: String },
}

/// Result type alias for SyncError
pub type Result<T> = std::result::Result<T, SyncError>;

/// Result type alias for TransferError
pub type TransferResult<T> = std::result::Result<T, TransferError>;

/// Result type alias for CatalogError
pub type CatalogResult<T> = std::result::Result<T, CatalogError>;

/// Represents the outcome of processing a single candidate file
#[derive(Debug)]
pub enum FileOutcome {
    /// Registered in the catalog
    Committed {
        name: String,
        bytes: u64,
        superseded: bool,
    },

    /// Failed at a file-local stage; not registered
    Failed { name: String, reason: String },

    /// Not attempted (fenced behind an earlier failure, or cancelled)
    Deferred { name: String },
}

impl FileOutcome {
    /// Returns true if this outcome represents a commit
    pub fn is_committed(&self) -> bool {
        matches!(self, FileOutcome::Committed { .. })
    }

    /// Returns the file name associated with this outcome
    pub fn name(&self) -> &str {
        match self {
            FileOutcome::Committed { name, .. } => name,
            FileOutcome::Failed { name, .. } => name,
            FileOutcome::Deferred { name } => name,
        }
    }
}
