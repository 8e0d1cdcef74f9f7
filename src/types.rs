//! Observation and catalog data structures
//!
//! An `Observation` is one remote raster artifact for one time slot. A
//! `CatalogEntry` is the persisted record of a committed observation.

use chrono::{NaiveDateTime, TimeDelta};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Default slot width of the 30 minute product
pub const DEFAULT_SLOT_MINUTES: i64 = 30;

/// Release class of a product
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProductClass {
    /// Provisional release
    Early,
    /// Corrected release, authoritative over Early
    Late,
}

impl ProductClass {
    /// Both classes in processing order
    pub const ALL: [ProductClass; 2] = [ProductClass::Late, ProductClass::Early];

    /// Catalog representation ("EARLY" / "LATE")
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductClass::Early => "EARLY",
            ProductClass::Late => "LATE",
        }
    }

    /// Marker character embedded in remote filenames
    pub fn marker(&self) -> char {
        match self {
            ProductClass::Early => 'E',
            ProductClass::Late => 'L',
        }
    }

    /// Convert from a filename marker
    pub fn from_marker(marker: char) -> Option<Self> {
        match marker {
            'E' => Some(ProductClass::Early),
            'L' => Some(ProductClass::Late),
            _ => None,
        }
    }
}

impl fmt::Display for ProductClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProductClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "EARLY" => Ok(ProductClass::Early),
            "LATE" => Ok(ProductClass::Late),
            other => Err(format!("unknown product class '{}'", other)),
        }
    }
}

/// A remote raster artifact for one logical time slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    /// Early or Late
    pub class: ProductClass,

    /// Slot start parsed from the filename
    pub slot_start: NaiveDateTime,

    /// Slot width
    pub interval: TimeDelta,

    /// Remote filename (no directory)
    pub name: String,

    /// Full remote path
    pub source_path: String,
}

impl Observation {
    /// Slot end, always derived from start and interval
    pub fn slot_end(&self) -> NaiveDateTime {
        self.slot_start + self.interval
    }

    /// Filename without extension, the catalog `name`
    pub fn stem(&self) -> &str {
        file_stem(&self.name)
    }
}

/// A committed observation as stored in the catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    /// Filename without extension
    pub name: String,

    /// Early or Late
    pub class: ProductClass,

    /// Slot start
    pub slot_start: NaiveDateTime,

    /// Slot end
    pub slot_end: NaiveDateTime,

    /// Location of the raster in the final store
    pub location: PathBuf,
}

impl CatalogEntry {
    /// Build the entry for an observation relocated to `location`
    pub fn for_observation(obs: &Observation, location: PathBuf) -> Self {
        Self {
            name: obs.stem().to_string(),
            class: obs.class,
            slot_start: obs.slot_start,
            slot_end: obs.slot_end(),
            location,
        }
    }
}

/// Strip the last extension from a filename
pub fn file_stem(name: &str) -> &str {
    match name.rfind('.') {
        Some(idx) if idx > 0 => &name[..idx],
        _ => name,
    }
}
