//! Remote file source access
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │              TransferClient (Send + Sync)            │
//! │  - list_directory: names under one partition         │
//! │  - download: payload into a local staging path       │
//! └──────────────────────────────────────────────────────┘
//!          │                              │
//!          ▼                              ▼
//! ┌────────────────────────┐   ┌─────────────────────────┐
//! │  HttpTransferClient    │   │   LocalMirrorClient     │
//! │  direct or proxy URLs  │   │   mounted mirror / file │
//! └────────────────────────┘   └─────────────────────────┘
//! ```
//!
//! Paths handed to a client are remote-absolute (`/data/imerg/gis/2018/08`);
//! the client maps them onto its origin. Retrying is the caller's job via
//! [`RetryPolicy`], so clients stay single-shot.

mod http;
mod local;

pub use http::{HttpTransferClient, TransferMode};
pub use local::LocalMirrorClient;

use crate::error::{TransferError, TransferResult};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use tracing::debug;

/// Access to the remote archive
pub trait TransferClient: Send + Sync {
    /// Names of the entries directly under `path`
    fn list_directory(&self, path: &str) -> TransferResult<Vec<String>>;

    /// Copy the remote file at `remote` to `local`, returning bytes written
    fn download(&self, remote: &str, local: &Path) -> TransferResult<u64>;
}

impl<T: TransferClient + ?Sized> TransferClient for &T {
    fn list_directory(&self, path: &str) -> TransferResult<Vec<String>> {
        (**self).list_directory(path)
    }

    fn download(&self, remote: &str, local: &Path) -> TransferResult<u64> {
        (**self).download(remote, local)
    }
}

impl<T: TransferClient + ?Sized> TransferClient for Box<T> {
    fn list_directory(&self, path: &str) -> TransferResult<Vec<String>> {
        (**self).list_directory(path)
    }

    fn download(&self, remote: &str, local: &Path) -> TransferResult<u64> {
        (**self).download(remote, local)
    }
}

/// Bounded retry with exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub retries: u32,

    /// Delay before the first retry; doubles each retry
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn new(retries: u32) -> Self {
        Self {
            retries,
            ..Self::default()
        }
    }

    /// Single attempt, no delay
    pub fn none() -> Self {
        Self {
            retries: 0,
            base_delay: Duration::ZERO,
        }
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Delay before retry number `attempt` (1-based): 100ms, 200ms, 400ms, ...
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << (attempt.saturating_sub(1)).min(16);
        self.base_delay.saturating_mul(factor)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// Non-retryable errors (not found, bad status) are returned unchanged.
    /// Exhaustion wraps the last error in [`TransferError::Exhausted`].
    pub fn run<T, F>(&self, path: &str, mut op: F) -> TransferResult<T>
    where
        F: FnMut() -> TransferResult<T>,
    {
        let mut last_error = None;

        for attempt in 0..=self.retries {
            if attempt > 0 {
                let delay = self.delay_for(attempt);
                debug!("Retry {} for {} after {:?}", attempt, path, delay);
                std::thread::sleep(delay);
            }

            match op() {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => last_error = Some(e),
            }
        }

        let last = last_error.unwrap_or_else(|| TransferError::ListFailed {
            path: path.to_string(),
            reason: "no attempt was made".into(),
        });
        if self.retries == 0 {
            return Err(last);
        }
        Err(TransferError::Exhausted {
            path: path.to_string(),
            attempts: self.retries + 1,
            last: Box::new(last),
        })
    }
}

/// Regex for URL sources: scheme://host[:port][/path]
static URL_SOURCE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(https?|ftp)://([^/\s]+)(/[^\s]*)?$").expect("Invalid source URL regex")
});

/// Parsed remote source location
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteSource {
    /// Network origin, e.g. `ftp://arthurhou.pps.eosdis.nasa.gov`
    Url {
        scheme: String,
        /// `scheme://host[:port]`
        origin: String,
        /// Base path of the Late hierarchy
        base_path: String,
    },

    /// Locally mounted mirror
    Local { root: PathBuf },
}

impl RemoteSource {
    /// Parse a source string
    ///
    /// Accepts formats:
    /// - https://host/data/imerg/gis
    /// - ftp://host:21/data/imerg/gis (proxy mode only)
    /// - file:///mnt/mirror/data/imerg/gis
    /// - /mnt/mirror/data/imerg/gis
    pub fn parse(source: &str) -> TransferResult<Self> {
        let source = source.trim();
        let invalid = |reason: &str| TransferError::InvalidSource {
            source_url: source.to_string(),
            reason: reason.to_string(),
        };

        if let Some(path) = source.strip_prefix("file://") {
            if !path.starts_with('/') {
                return Err(invalid("file:// source must be an absolute path"));
            }
            return Ok(RemoteSource::Local {
                root: PathBuf::from(trim_path(path)),
            });
        }

        if source.starts_with('/') {
            return Ok(RemoteSource::Local {
                root: PathBuf::from(trim_path(source)),
            });
        }

        let caps = URL_SOURCE_REGEX
            .captures(source)
            .ok_or_else(|| invalid("expected http(s)://, ftp://, file:// or an absolute path"))?;

        let scheme = caps[1].to_ascii_lowercase();
        let host = &caps[2];
        let base_path = caps.get(3).map(|m| trim_path(m.as_str())).unwrap_or_default();

        Ok(RemoteSource::Url {
            origin: format!("{}://{}", scheme, host),
            scheme,
            base_path,
        })
    }

    /// Base path substituted for `{base}` in partition templates
    pub fn base_path(&self) -> String {
        match self {
            RemoteSource::Url { base_path, .. } => base_path.clone(),
            RemoteSource::Local { root } => root.to_string_lossy().into_owned(),
        }
    }

    /// True for sources a plain HTTP client can read without a proxy
    pub fn is_http(&self) -> bool {
        matches!(self, RemoteSource::Url { scheme, .. } if scheme.starts_with("http"))
    }
}

impl std::fmt::Display for RemoteSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteSource::Url {
                origin, base_path, ..
            } => write!(f, "{}{}", origin, base_path),
            RemoteSource::Local { root } => write!(f, "file://{}", root.display()),
        }
    }
}

/// Strip trailing slashes, keeping a lone "/"
fn trim_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() && path.starts_with('/') {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}
