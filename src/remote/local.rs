//! Transfer client for a locally mounted mirror of the archive

use super::TransferClient;
use crate::error::{TransferError, TransferResult};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

/// Reads the archive hierarchy from the local filesystem
///
/// Remote paths are used as-is, so the walker's `{base}` must be the mirror
/// root (see [`super::RemoteSource::Local`]).
#[derive(Debug, Clone, Default)]
pub struct LocalMirrorClient;

impl LocalMirrorClient {
    pub fn new() -> Self {
        Self
    }
}

impl TransferClient for LocalMirrorClient {
    fn list_directory(&self, path: &str) -> TransferResult<Vec<String>> {
        let entries = fs::read_dir(path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => TransferError::NotFound {
                path: path.to_string(),
            },
            _ => TransferError::ListFailed {
                path: path.to_string(),
                reason: e.to_string(),
            },
        })?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| TransferError::ListFailed {
                path: path.to_string(),
                reason: e.to_string(),
            })?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn download(&self, remote: &str, local: &Path) -> TransferResult<u64> {
        fs::copy(remote, local).map_err(|e| match e.kind() {
            ErrorKind::NotFound if !Path::new(remote).exists() => TransferError::NotFound {
                path: remote.to_string(),
            },
            ErrorKind::NotFound | ErrorKind::PermissionDenied => {
                TransferError::LocalWrite {
                    path: local.to_path_buf(),
                    reason: e.to_string(),
                }
            }
            _ => TransferError::DownloadFailed {
                path: remote.to_string(),
                reason: e.to_string(),
            },
        })
    }
}
