//! Month partitions of the remote archive
//!
//! The archive is laid out as `<base>/<year>/<month>`. Partitions between two
//! dates are a pure function of those dates, which makes every walk
//! restartable from recomputed watermarks.

use crate::error::ConfigError;
use chrono::{Datelike, NaiveDate};
use std::fmt;

/// Default partition path template
pub const DEFAULT_PARTITION_TEMPLATE: &str = "{base}/{year}/{month}";

/// One `(year, month)` directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Partition {
    pub year: i32,
    pub month: u32,
}

impl Partition {
    /// Partition containing `date`
    pub fn containing(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    /// Following month, rolling December into January
    pub fn next(self) -> Self {
        if self.month >= 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}/{:02}", self.year, self.month)
    }
}

/// Ascending, inclusive sequence of partitions between two dates
#[derive(Debug, Clone)]
pub struct Partitions {
    next: Option<Partition>,
    last: Partition,
}

impl Iterator for Partitions {
    type Item = Partition;

    fn next(&mut self) -> Option<Partition> {
        let current = self.next?;
        self.next = if current < self.last {
            Some(current.next())
        } else {
            None
        };
        Some(current)
    }
}

/// Partitions from `start`'s month to `end`'s month inclusive.
/// Empty when `start` is after `end`.
pub fn partitions(start: NaiveDate, end: NaiveDate) -> Partitions {
    let first = Partition::containing(start);
    let last = Partition::containing(end);
    Partitions {
        next: (first <= last).then_some(first),
        last,
    }
}

/// Validated `{base}/{year}/{month}` style path template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionTemplate {
    template: String,
}

impl Default for PartitionTemplate {
    fn default() -> Self {
        Self {
            template: DEFAULT_PARTITION_TEMPLATE.to_string(),
        }
    }
}

impl PartitionTemplate {
    /// Parse a template; `{year}` and `{month}` are required, `{base}` optional
    pub fn parse(template: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidTemplate {
            template: template.to_string(),
            reason: reason.to_string(),
        };

        for required in ["{year}", "{month}"] {
            if !template.contains(required) {
                return Err(invalid(&format!("missing {}", required)));
            }
        }

        let stripped = template
            .replace("{base}", "")
            .replace("{year}", "")
            .replace("{month}", "");
        if stripped.contains('{') || stripped.contains('}') {
            return Err(invalid("only {base}, {year} and {month} are supported"));
        }

        Ok(Self {
            template: template.to_string(),
        })
    }

    /// Remote directory of `partition` under `base`
    pub fn render(&self, base: &str, partition: Partition) -> String {
        self.template
            .replace("{base}", base.trim_end_matches('/'))
            .replace("{year}", &format!("{:04}", partition.year))
            .replace("{month}", &format!("{:02}", partition.month))
    }

    pub fn as_str(&self) -> &str {
        &self.template
    }
}
