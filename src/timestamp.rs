//! Timestamp codec for remote filenames and catalog keys
//!
//! Remote products carry their slot start in the filename:
//!
//! ```text
//! 3B-HHR-L.MS.MRG.3IMERG.20180809-S233000-E235959.1410.V05B.30min.tif
//!        ^               ^^^^^^^^^^^^^^^^                   ^^^^^^^^^^
//!        class marker    slot start token                   product suffix
//! ```
//!
//! Grammar accepted by [`TimestampCodec::classify`]:
//! - the name ends with the product suffix (default `.30min.tif`)
//! - character 7 is the class marker, `E` (Early) or `L` (Late)
//! - the first match of the timestamp pattern parses with the date format
//!
//! Anything else is a [`ParseError`]; callers skip the entry.

use crate::error::{ConfigError, ParseError};
use crate::types::{Observation, ProductClass, DEFAULT_SLOT_MINUTES};
use chrono::format::{Item, StrftimeItems};
use chrono::{NaiveDateTime, TimeDelta};
use regex::Regex;
use std::sync::LazyLock;

/// Default regex locating the slot start token, e.g. `20150802-S083000`
pub const DEFAULT_TIMESTAMP_PATTERN: &str = r"\d{4}[01]\d[0-3]\d-S[0-2]\d{5}";

/// Default chrono format of the slot start token
pub const DEFAULT_DATE_FORMAT: &str = "%Y%m%d-S%H%M%S";

/// Default catalog key format (minute resolution)
pub const DEFAULT_KEY_FORMAT: &str = "%Y%m%d%H%M";

/// Default product suffix
pub const DEFAULT_PRODUCT_SUFFIX: &str = ".30min.tif";

/// Character index of the Early/Late marker
pub const CLASS_MARKER_POSITION: usize = 7;

static DEFAULT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(DEFAULT_TIMESTAMP_PATTERN).expect("Invalid default timestamp regex")
});

/// Parses and formats the timestamps that identify observations
#[derive(Debug, Clone)]
pub struct TimestampCodec {
    pattern: Regex,
    date_format: String,
    key_format: String,
    product_suffix: String,
    interval: TimeDelta,
}

impl Default for TimestampCodec {
    fn default() -> Self {
        Self {
            pattern: DEFAULT_PATTERN.clone(),
            date_format: DEFAULT_DATE_FORMAT.to_string(),
            key_format: DEFAULT_KEY_FORMAT.to_string(),
            product_suffix: DEFAULT_PRODUCT_SUFFIX.to_string(),
            interval: TimeDelta::minutes(DEFAULT_SLOT_MINUTES),
        }
    }
}

impl TimestampCodec {
    /// Create a codec from a pattern and date format, validating both
    pub fn new(pattern: &str, date_format: &str) -> Result<Self, ConfigError> {
        let regex = Regex::new(pattern).map_err(|e| ConfigError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        validate_format(date_format)?;

        Ok(Self {
            pattern: regex,
            date_format: date_format.to_string(),
            ..Self::default()
        })
    }

    /// Override the catalog key format
    pub fn with_key_format(mut self, key_format: &str) -> Result<Self, ConfigError> {
        validate_format(key_format)?;
        self.key_format = key_format.to_string();
        Ok(self)
    }

    /// Override the product suffix
    pub fn with_product_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.product_suffix = suffix.into();
        self
    }

    /// Parse the slot start embedded in a filename
    pub fn parse(&self, name: &str) -> Result<NaiveDateTime, ParseError> {
        let token = self
            .pattern
            .find(name)
            .ok_or_else(|| ParseError::MissingTimestamp {
                name: name.to_string(),
            })?
            .as_str();

        NaiveDateTime::parse_from_str(token, &self.date_format).map_err(|e| {
            ParseError::InvalidTimestamp {
                name: name.to_string(),
                token: token.to_string(),
                reason: e.to_string(),
            }
        })
    }

    /// Format a timestamp as a catalog key
    pub fn format(&self, ts: NaiveDateTime) -> String {
        ts.format(&self.key_format).to_string()
    }

    /// Parse a catalog key back into a timestamp
    pub fn parse_key(&self, key: &str) -> Result<NaiveDateTime, ParseError> {
        NaiveDateTime::parse_from_str(key, &self.key_format).map_err(|e| {
            ParseError::InvalidTimestamp {
                name: key.to_string(),
                token: key.to_string(),
                reason: e.to_string(),
            }
        })
    }

    /// Decode product class and slot start from a remote filename
    pub fn classify(&self, name: &str) -> Result<(ProductClass, NaiveDateTime), ParseError> {
        if !name.ends_with(&self.product_suffix) {
            return Err(ParseError::NotAProduct {
                name: name.to_string(),
                suffix: self.product_suffix.clone(),
            });
        }

        let marker = name
            .chars()
            .nth(CLASS_MARKER_POSITION)
            .ok_or_else(|| ParseError::Truncated {
                name: name.to_string(),
                position: CLASS_MARKER_POSITION,
            })?;

        let class = ProductClass::from_marker(marker).ok_or_else(|| ParseError::UnknownClass {
            name: name.to_string(),
            marker,
        })?;

        Ok((class, self.parse(name)?))
    }

    /// Build an observation for `name` listed under remote directory `dir`
    pub fn observe(&self, dir: &str, name: &str) -> Result<Observation, ParseError> {
        let (class, slot_start) = self.classify(name)?;
        Ok(Observation {
            class,
            slot_start,
            interval: self.interval,
            name: name.to_string(),
            source_path: join_remote(dir, name),
        })
    }
}

/// Join a remote directory and a name with exactly one separator
pub fn join_remote(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        return name.to_string();
    }
    format!("{}/{}", dir.trim_end_matches('/'), name.trim_start_matches('/'))
}

fn validate_format(format: &str) -> Result<(), ConfigError> {
    if format.is_empty() {
        return Err(ConfigError::InvalidDateFormat {
            format: format.to_string(),
            reason: "format is empty".into(),
        });
    }
    if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
        return Err(ConfigError::InvalidDateFormat {
            format: format.to_string(),
            reason: "unrecognised strftime specifier".into(),
        });
    }
    Ok(())
}
