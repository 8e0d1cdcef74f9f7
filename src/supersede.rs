//! Early to Late supersession
//!
//! A Late observation retires the Early entry registered for the same slot.
//! The catalog swap happens in one store call ([`CatalogStore::supersede`]);
//! the Early raster is deleted only after that call returns, so a catalog
//! entry never points at a missing file.

use crate::catalog::CatalogStore;
use crate::error::CatalogResult;
use crate::types::{CatalogEntry, Observation, ProductClass};
use std::fs;
use std::io::{self, ErrorKind};
use std::path::Path;
use tracing::debug;

/// Finds the Early entry a Late candidate replaces
pub struct SupersessionResolver<'a, C: CatalogStore + ?Sized> {
    catalog: &'a C,
}

impl<'a, C: CatalogStore + ?Sized> SupersessionResolver<'a, C> {
    pub fn new(catalog: &'a C) -> Self {
        Self { catalog }
    }

    /// Early entry with the same slot start, if `obs` is Late
    pub fn resolve(&self, obs: &Observation) -> CatalogResult<Option<CatalogEntry>> {
        if obs.class != ProductClass::Late {
            return Ok(None);
        }
        let retired = self.catalog.find(obs.slot_start, ProductClass::Early)?;
        if let Some(entry) = &retired {
            debug!("{} supersedes {}", obs.name, entry.name);
        }
        Ok(retired)
    }
}

/// Delete the raster of a retired entry.
///
/// Returns false when there was nothing to delete. The file is kept if it is
/// also the location of its replacement.
pub fn remove_retired_file(retired: &CatalogEntry, replacement: &Path) -> io::Result<bool> {
    if retired.location == replacement {
        return Ok(false);
    }
    match fs::remove_file(&retired.location) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
