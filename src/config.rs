//! Configuration types for imerg-sync
//!
//! This module defines:
//! - CLI argument parsing using clap derive macros
//! - The optional JSON config file
//! - Runtime configuration with validation
//!
//! Values given on the command line override the config file.

use crate::coordinator::ReconcileSettings;
use crate::error::ConfigError;
use crate::pipeline::{CommandTransform, FailurePolicy};
use crate::remote::{RemoteSource, RetryPolicy, TransferMode};
use crate::service::ServiceTarget;
use crate::timestamp::{
    TimestampCodec, DEFAULT_DATE_FORMAT, DEFAULT_KEY_FORMAT, DEFAULT_TIMESTAMP_PATTERN,
};
use crate::walker::{PartitionTemplate, DEFAULT_PARTITION_TEMPLATE};
use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Maximum reasonable worker count
const MAX_WORKERS: usize = 64;

/// Maximum retry attempts per remote operation
const MAX_RETRIES: u32 = 10;

/// Retention window when neither CLI nor config file sets one
pub const DEFAULT_RETENTION_DAYS: u32 = 90;

/// Default ArcGIS service type
const DEFAULT_SERVICE_TYPE: &str = "ImageServer";

/// Default log file prefix
const DEFAULT_LOG_PREFIX: &str = "imerg_sync";

/// Incremental mirror of the IMERG 30 minute rainfall archive
#[derive(Parser, Debug, Clone)]
#[command(
    name = "imerg-sync",
    version,
    about = "Incremental mirror of the IMERG 30 minute rainfall archive",
    long_about = "Mirrors Early and Late IMERG 30 minute rasters into a local store and a SQLite catalog.\n\n\
                  Each run lists the remote month partitions from the catalog watermarks up to today,\n\
                  commits newer products in time order, lets Late products supersede Early ones,\n\
                  purges rasters older than the retention window and refreshes the map service.",
    after_help = "EXAMPLES:\n    \
        imerg-sync https://archive.example.net/data/imerg/gis --final-store /data/imerg \\\n        \
            --staging /scratch/imerg --catalog imerg.db\n    \
        imerg-sync ftp://jsimpson.pps.eosdis.nasa.gov/data/imerg/gis \\\n        \
            --proxy https://proxy.example.net/ProxyFTP.aspx --config imerg.json\n    \
        imerg-sync /mnt/mirror/data/imerg/gis --config imerg.json -v\n    \
        imerg-sync status imerg.db",
    args_conflicts_with_subcommands = true,
    subcommand_negates_reqs = true
)]
pub struct CliArgs {
    /// Remote source of the Late hierarchy (https://, ftp:// with --proxy, file:// or a path)
    #[arg(value_name = "SOURCE")]
    pub source: Option<String>,

    /// Subcommand (status)
    #[command(subcommand)]
    pub command: Option<Command>,

    /// JSON config file
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Remote base directory of Late products (default: the source path)
    #[arg(long, value_name = "PATH")]
    pub late_base: Option<String>,

    /// Remote base directory of Early products (default: <late base>/early)
    #[arg(long, value_name = "PATH")]
    pub early_base: Option<String>,

    /// Staging root; Late and Early files stage in its late/ and early/ subdirectories
    #[arg(long, value_name = "DIR")]
    pub staging: Option<PathBuf>,

    /// Staging directory for Late files (overrides --staging)
    #[arg(long, value_name = "DIR")]
    pub late_staging: Option<PathBuf>,

    /// Staging directory for Early files (overrides --staging)
    #[arg(long, value_name = "DIR")]
    pub early_staging: Option<PathBuf>,

    /// Directory committed rasters are stored in
    #[arg(long, value_name = "DIR")]
    pub final_store: Option<PathBuf>,

    /// SQLite catalog file
    #[arg(short = 'c', long, value_name = "FILE")]
    pub catalog: Option<PathBuf>,

    /// Days of rasters to keep
    #[arg(long, value_name = "DAYS")]
    pub retention_days: Option<u32>,

    /// Concurrent fetch/transform workers
    #[arg(short = 'w', long, default_value_t = default_workers(), value_name = "NUM")]
    pub workers: usize,

    /// Retry attempts for transient remote errors
    #[arg(long, default_value = "3", value_name = "NUM")]
    pub retries: u32,

    /// Network timeout in seconds
    #[arg(long, default_value = "60", value_name = "SECS")]
    pub timeout: u64,

    /// What to do with later files of a phase after a file fails
    #[arg(long, value_enum, default_value_t = FailurePolicy::Fence)]
    pub failure_policy: FailurePolicy,

    /// Relay listings and downloads through a proxy endpoint
    #[arg(long, value_name = "URL")]
    pub proxy: Option<String>,

    /// Remote archive user
    #[arg(long, env = "IMERG_USER", value_name = "USER")]
    pub user: Option<String>,

    /// Remote archive password
    #[arg(long, env = "IMERG_PASSWORD", value_name = "PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Command run on each staged raster, with {input} and {output} placeholders
    #[arg(long, value_name = "COMMAND")]
    pub transform: Option<String>,

    /// Regex locating the slot start token in filenames
    #[arg(long, value_name = "REGEX")]
    pub timestamp_pattern: Option<String>,

    /// chrono format of the slot start token
    #[arg(long, value_name = "FORMAT")]
    pub date_format: Option<String>,

    /// chrono format of catalog keys
    #[arg(long, value_name = "FORMAT")]
    pub key_format: Option<String>,

    /// Remote partition path template
    #[arg(long, value_name = "TEMPLATE")]
    pub partition_template: Option<String>,

    /// ArcGIS Server admin URL of the published service
    #[arg(long, value_name = "URL")]
    pub service_url: Option<String>,

    /// Service folder
    #[arg(long, value_name = "NAME")]
    pub service_folder: Option<String>,

    /// Service name
    #[arg(long, value_name = "NAME")]
    pub service_name: Option<String>,

    /// Service type
    #[arg(long, value_name = "TYPE")]
    pub service_type: Option<String>,

    /// Service admin user
    #[arg(long, env = "IMERG_SERVICE_USER", value_name = "USER")]
    pub service_user: Option<String>,

    /// Service admin password
    #[arg(long, env = "IMERG_SERVICE_PASSWORD", value_name = "PASSWORD", hide_env_values = true)]
    pub service_password: Option<String>,

    /// Skip retention purge and catalog maintenance
    #[arg(long)]
    pub skip_maintenance: bool,

    /// Also write logs to a daily file in this directory
    #[arg(long, value_name = "DIR")]
    pub log_dir: Option<PathBuf>,

    /// Log file name prefix
    #[arg(long, value_name = "PREFIX")]
    pub log_prefix: Option<String>,

    /// Quiet mode - suppress progress output
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Verbose output (debug logging)
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

/// Subcommands
#[derive(clap::Subcommand, Debug, Clone)]
pub enum Command {
    /// Show watermarks, catalog statistics and the last run
    Status {
        /// SQLite catalog file
        #[arg(value_name = "CATALOG")]
        catalog: PathBuf,
    },
}

fn default_workers() -> usize {
    // Downloads are I/O bound; a handful of connections is plenty
    num_cpus::get().clamp(2, 8)
}

/// JSON config file
///
/// Keys follow the legacy ETL configuration dictionary; keys that
/// do not apply here (geodatabase and mosaic names) are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    /// Remote host, combined with `ftp_baseLateFolder` into the source
    #[serde(rename = "ftp_host")]
    pub host: Option<String>,
    #[serde(rename = "ftp_user")]
    pub user: Option<String>,
    #[serde(rename = "ftp_pswrd")]
    pub password: Option<String>,
    #[serde(rename = "ftp_baseLateFolder")]
    pub late_base: Option<String>,
    #[serde(rename = "ftp_baseEarlyFolder")]
    pub early_base: Option<String>,
    pub proxy: Option<String>,

    #[serde(rename = "extract_LateFolder")]
    pub late_staging: Option<PathBuf>,
    #[serde(rename = "extract_EarlyFolder")]
    pub early_staging: Option<PathBuf>,
    #[serde(rename = "final_Folder")]
    pub final_store: Option<PathBuf>,
    #[serde(rename = "catalogPath")]
    pub catalog: Option<PathBuf>,

    /// Stored as a string in older configs
    #[serde(rename = "DaysToKeepRasters")]
    pub retention_days: Option<NumberOrString>,

    #[serde(rename = "RegEx_StartDateFilterString")]
    pub timestamp_pattern: Option<String>,
    #[serde(rename = "Filename_StartDateFormat")]
    pub date_format: Option<String>,
    #[serde(rename = "GDB_DateFormat")]
    pub key_format: Option<String>,

    #[serde(rename = "logFileDir")]
    pub log_dir: Option<PathBuf>,
    #[serde(rename = "logFilePrefix")]
    pub log_prefix: Option<String>,

    #[serde(rename = "svc_adminURL")]
    pub service_url: Option<String>,
    #[serde(rename = "svc_username")]
    pub service_user: Option<String>,
    #[serde(rename = "svc_password")]
    pub service_password: Option<String>,
    #[serde(rename = "svc_folder")]
    pub service_folder: Option<String>,
    #[serde(rename = "svc_Name")]
    pub service_name: Option<String>,
    #[serde(rename = "svc_Type")]
    pub service_type: Option<String>,
}

/// A JSON value that may be written as `90` or `"90"`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum NumberOrString {
    Number(u64),
    String(String),
}

impl NumberOrString {
    fn to_u32(&self, name: &'static str) -> Result<u32, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidValue { name, reason };
        match self {
            NumberOrString::Number(n) => u32::try_from(*n).map_err(|e| invalid(e.to_string())),
            NumberOrString::String(s) => {
                s.trim().parse().map_err(|e| invalid(format!("'{s}': {e}")))
            }
        }
    }
}

impl FileConfig {
    /// Load and parse a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidFile {
            path: path.to_path_buf(),
            reason,
        };
        let text = fs::read_to_string(path).map_err(|e| invalid(e.to_string()))?;
        serde_json::from_str(&text).map_err(|e| invalid(e.to_string()))
    }

    /// Source assembled from `ftp_host` and `ftp_baseLateFolder`
    fn source(&self) -> Option<String> {
        let host = self.host.as_deref()?.trim_end_matches('/');
        let base = self.late_base.as_deref().unwrap_or("");
        if host.contains("://") {
            Some(format!("{}{}", host, base))
        } else {
            Some(format!("ftp://{}{}", host, base))
        }
    }
}

/// Credentials and target of the service to refresh
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub target: ServiceTarget,
    pub username: String,
    pub password: String,
}

/// Validated runtime configuration
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Parsed remote source
    pub source: RemoteSource,

    /// Direct or proxied transfers
    pub transfer_mode: TransferMode,

    /// Remote archive credentials
    pub credentials: Option<(String, String)>,

    pub late_base: String,
    pub early_base: String,

    pub late_staging: PathBuf,
    pub early_staging: PathBuf,

    /// Final raster store
    pub final_store: PathBuf,

    /// SQLite catalog path
    pub catalog_path: PathBuf,

    pub codec: TimestampCodec,
    pub template: PartitionTemplate,

    pub retention_days: u32,

    /// Number of worker threads
    pub worker_count: usize,

    /// Retry count for transient errors
    pub retry_count: u32,

    /// Network timeout
    pub timeout: Duration,

    pub failure_policy: FailurePolicy,

    /// External raster filter
    pub transform: Option<CommandTransform>,

    /// Service to refresh after each run
    pub service: Option<ServiceSettings>,

    pub skip_maintenance: bool,

    /// Show progress indicator
    pub show_progress: bool,

    /// Verbose logging
    pub verbose: bool,

    /// Daily log file directory
    pub log_dir: Option<PathBuf>,

    pub log_prefix: String,
}

impl SyncConfig {
    /// Create and validate configuration from CLI arguments, reading the
    /// config file they name
    pub fn from_args(args: CliArgs) -> Result<Self, ConfigError> {
        let file = match &args.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::merge(args, file)
    }

    /// Combine CLI arguments with a parsed config file and validate
    pub fn merge(args: CliArgs, file: FileConfig) -> Result<Self, ConfigError> {
        let source_str = args
            .source
            .clone()
            .or_else(|| file.source())
            .ok_or(ConfigError::Missing("source"))?;
        let source = RemoteSource::parse(&source_str)?;

        let transfer_mode = match args.proxy.or(file.proxy) {
            Some(endpoint) => TransferMode::Proxy { endpoint },
            None => TransferMode::Direct,
        };
        if transfer_mode == TransferMode::Direct
            && matches!(source, RemoteSource::Url { .. })
            && !source.is_http()
        {
            return Err(ConfigError::InvalidValue {
                name: "proxy",
                reason: format!("'{}' cannot be read directly; configure a proxy", source),
            });
        }

        let credentials = match (args.user.or(file.user), args.password.or(file.password)) {
            (Some(user), Some(password)) => Some((user, password)),
            (None, None) => None,
            _ => {
                return Err(ConfigError::InvalidValue {
                    name: "user",
                    reason: "user and password must be given together".into(),
                })
            }
        };

        // The source path is the Late base unless overridden
        let late_base = args
            .late_base
            .unwrap_or_else(|| source.base_path())
            .trim_end_matches('/')
            .to_string();
        let early_base = args
            .early_base
            .or(file.early_base)
            .map(|b| b.trim_end_matches('/').to_string())
            .unwrap_or_else(|| format!("{}/early", late_base));

        let staging_root = args.staging;
        let late_staging = args
            .late_staging
            .or_else(|| staging_root.as_ref().map(|root| root.join("late")))
            .or(file.late_staging)
            .ok_or(ConfigError::Missing("late-staging"))?;
        let early_staging = args
            .early_staging
            .or_else(|| staging_root.as_ref().map(|root| root.join("early")))
            .or(file.early_staging)
            .ok_or(ConfigError::Missing("early-staging"))?;
        if late_staging == early_staging {
            return Err(ConfigError::InvalidPath {
                path: late_staging,
                reason: "Late and Early staging directories must differ".into(),
            });
        }

        let final_store = args
            .final_store
            .or(file.final_store)
            .ok_or(ConfigError::Missing("final-store"))?;
        if final_store == late_staging || final_store == early_staging {
            return Err(ConfigError::InvalidPath {
                path: final_store,
                reason: "final store must not be a staging directory".into(),
            });
        }

        let catalog_path = args
            .catalog
            .or(file.catalog)
            .ok_or(ConfigError::Missing("catalog"))?;
        if let Some(parent) = catalog_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                return Err(ConfigError::InvalidPath {
                    path: catalog_path.clone(),
                    reason: format!("Parent directory '{}' does not exist", parent.display()),
                });
            }
        }

        let pattern = args
            .timestamp_pattern
            .or(file.timestamp_pattern)
            .unwrap_or_else(|| DEFAULT_TIMESTAMP_PATTERN.to_string());
        let date_format = args
            .date_format
            .or(file.date_format)
            .unwrap_or_else(|| DEFAULT_DATE_FORMAT.to_string());
        let key_format = args
            .key_format
            .or(file.key_format)
            .unwrap_or_else(|| DEFAULT_KEY_FORMAT.to_string());
        let codec = TimestampCodec::new(&pattern, &date_format)?.with_key_format(&key_format)?;

        let template = PartitionTemplate::parse(
            args.partition_template
                .as_deref()
                .unwrap_or(DEFAULT_PARTITION_TEMPLATE),
        )?;

        let retention_days = match (args.retention_days, &file.retention_days) {
            (Some(days), _) => days,
            (None, Some(value)) => value.to_u32("retention-days")?,
            (None, None) => DEFAULT_RETENTION_DAYS,
        };
        if retention_days == 0 {
            return Err(ConfigError::InvalidValue {
                name: "retention-days",
                reason: "must be at least 1".into(),
            });
        }

        if args.workers == 0 || args.workers > MAX_WORKERS {
            return Err(ConfigError::InvalidWorkerCount {
                count: args.workers,
                max: MAX_WORKERS,
            });
        }

        if args.retries > MAX_RETRIES {
            return Err(ConfigError::InvalidRetryCount {
                count: args.retries,
                max: MAX_RETRIES,
            });
        }

        if args.timeout == 0 {
            return Err(ConfigError::InvalidValue {
                name: "timeout",
                reason: "must be at least 1 second".into(),
            });
        }

        let transform = match args.transform {
            Some(cmdline) => Some(CommandTransform::parse(&cmdline).ok_or(ConfigError::InvalidValue {
                name: "transform",
                reason: "command is empty".into(),
            })?),
            None => None,
        };

        let service = match args.service_url.or(file.service_url) {
            Some(admin_url) => {
                let target = ServiceTarget {
                    admin_url,
                    folder: args
                        .service_folder
                        .or(file.service_folder)
                        .ok_or(ConfigError::Missing("service-folder"))?,
                    name: args
                        .service_name
                        .or(file.service_name)
                        .ok_or(ConfigError::Missing("service-name"))?,
                    service_type: args
                        .service_type
                        .or(file.service_type)
                        .unwrap_or_else(|| DEFAULT_SERVICE_TYPE.to_string()),
                };
                Some(ServiceSettings {
                    target,
                    username: args
                        .service_user
                        .or(file.service_user)
                        .ok_or(ConfigError::Missing("service-user"))?,
                    password: args
                        .service_password
                        .or(file.service_password)
                        .ok_or(ConfigError::Missing("service-password"))?,
                })
            }
            None => None,
        };

        Ok(Self {
            source,
            transfer_mode,
            credentials,
            late_base,
            early_base,
            late_staging,
            early_staging,
            final_store,
            catalog_path,
            codec,
            template,
            retention_days,
            worker_count: args.workers,
            retry_count: args.retries,
            timeout: Duration::from_secs(args.timeout),
            failure_policy: args.failure_policy,
            transform,
            service,
            skip_maintenance: args.skip_maintenance,
            show_progress: !args.quiet,
            verbose: args.verbose,
            log_dir: args.log_dir.or(file.log_dir),
            log_prefix: args
                .log_prefix
                .or(file.log_prefix)
                .unwrap_or_else(|| DEFAULT_LOG_PREFIX.to_string()),
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_count)
    }

    /// Settings handed to the run coordinator
    pub fn reconcile_settings(&self) -> ReconcileSettings {
        ReconcileSettings {
            codec: self.codec.clone(),
            template: self.template.clone(),
            late_base: self.late_base.clone(),
            early_base: self.early_base.clone(),
            late_staging: self.late_staging.clone(),
            early_staging: self.early_staging.clone(),
            final_store: self.final_store.clone(),
            retention_days: self.retention_days,
            workers: self.worker_count,
            retry: self.retry_policy(),
            failure_policy: self.failure_policy,
            skip_maintenance: self.skip_maintenance,
        }
    }
}
