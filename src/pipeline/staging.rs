//! Temp staging area for downloaded payloads
//!
//! Every payload lives in a [`StagedFile`] guard from download until commit.
//! The guard deletes everything it tracks when dropped, whether the file was
//! committed, failed, or abandoned on cancellation. Relocation moves the
//! payload out first, so a committed file leaves nothing behind to delete.

use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Staging directory owned by one phase
#[derive(Debug, Clone)]
pub struct StagingArea {
    dir: PathBuf,
}

impl StagingArea {
    /// Use `dir` as staging, creating it if needed
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Remove files left behind by an interrupted run; returns the count
    pub fn sweep(&self) -> io::Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        if removed > 0 {
            debug!("Swept {} stale files from {}", removed, self.dir.display());
        }
        Ok(removed)
    }

    /// Guard for a payload named `name` in this area
    pub fn stage(&self, name: &str) -> StagedFile {
        StagedFile::new(self.dir.join(name))
    }
}

/// Scoped ownership of a staged payload and its derived files
#[derive(Debug)]
pub struct StagedFile {
    paths: Vec<PathBuf>,
}

impl StagedFile {
    pub fn new(path: PathBuf) -> Self {
        Self { paths: vec![path] }
    }

    /// Download target
    pub fn path(&self) -> &Path {
        &self.paths[0]
    }

    /// Take ownership of a derived file (e.g. transform output)
    pub fn track(&mut self, path: PathBuf) {
        if !self.paths.contains(&path) {
            self.paths.push(path);
        }
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        for path in &self.paths {
            match fs::remove_file(path) {
                Ok(()) => debug!("Released {}", path.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove staged file {}: {}", path.display(), e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_guard_removes_on_drop() {
        let dir = tempdir().unwrap();
        let area = StagingArea::open(dir.path().join("late")).unwrap();

        let mut staged = area.stage("a.tif");
        fs::write(staged.path(), b"payload").unwrap();
        let derived = area.dir().join("a.filtered.tif");
        fs::write(&derived, b"derived").unwrap();
        staged.track(derived.clone());

        let primary = staged.path().to_path_buf();
        drop(staged);
        assert!(!primary.exists());
        assert!(!derived.exists());
    }

    #[test]
    fn test_guard_tolerates_moved_file() {
        let dir = tempdir().unwrap();
        let area = StagingArea::open(dir.path()).unwrap();
        let staged = area.stage("a.tif");
        fs::write(staged.path(), b"payload").unwrap();

        let moved = dir.path().join("moved.tif");
        fs::rename(staged.path(), &moved).unwrap();
        drop(staged);
        assert!(moved.exists());
    }

    #[test]
    fn test_guard_released_on_early_return() {
        fn failing_step(area: &StagingArea) -> Result<(), String> {
            let staged = area.stage("b.tif");
            fs::write(staged.path(), b"payload").map_err(|e| e.to_string())?;
            Err("transform failed".into())
        }

        let dir = tempdir().unwrap();
        let area = StagingArea::open(dir.path()).unwrap();
        assert!(failing_step(&area).is_err());
        assert!(!dir.path().join("b.tif").exists());
    }

    #[test]
    fn test_sweep() {
        let dir = tempdir().unwrap();
        let area = StagingArea::open(dir.path()).unwrap();
        fs::write(dir.path().join("stale1.tif"), b"x").unwrap();
        fs::write(dir.path().join("stale2.tif"), b"x").unwrap();
        fs::create_dir(dir.path().join("keep")).unwrap();

        assert_eq!(area.sweep().unwrap(), 2);
        assert_eq!(area.sweep().unwrap(), 0);
        assert!(dir.path().join("keep").exists());
    }
}
