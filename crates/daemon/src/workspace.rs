//! Working and quarantine storage.
//!
//! Working storage holds at most one job's files at a time. Anything that
//! cannot be put back where it came from ends up in quarantine.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Prefix for originals relocated into working storage.
pub const WORKING_PREFIX: &str = "working_";

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Failed to create directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("Failed to move {from} to {to}: {source}")]
    Move {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },

    #[error("Refusing to overwrite existing file {0}")]
    Occupied(PathBuf),

    #[error("Failed to remove {path}: {source}")]
    Remove { path: PathBuf, source: io::Error },

    #[error("Failed to list working storage: {0}")]
    List(io::Error),
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Move a file, falling back to copy-then-delete when rename fails
/// (typically across filesystems). A failed copy leaves no partial target.
pub fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    if let Err(e) = fs::copy(from, to) {
        let _ = fs::remove_file(to);
        return Err(e);
    }
    fs::remove_file(from)
}

pub struct Workspace {
    working: PathBuf,
    quarantine: PathBuf,
}

impl Workspace {
    pub fn new(working: impl Into<PathBuf>, quarantine: impl Into<PathBuf>) -> Self {
        Self {
            working: working.into(),
            quarantine: quarantine.into(),
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working
    }

    pub fn quarantine_dir(&self) -> &Path {
        &self.quarantine
    }

    pub fn ensure_dirs(&self) -> Result<(), WorkspaceError> {
        for dir in [&self.working, &self.quarantine] {
            fs::create_dir_all(dir).map_err(|source| WorkspaceError::CreateDir {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }

    /// Where `original` lives while its job runs.
    pub fn working_path_for(&self, original: &Path) -> PathBuf {
        let name = original
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.working.join(format!("{}{}", WORKING_PREFIX, name))
    }

    /// Path for a transcode output inside working storage.
    pub fn output_path_for(&self, output_filename: &str) -> PathBuf {
        self.working.join(output_filename)
    }

    /// Take ownership of `original` by moving it into working storage.
    pub fn take(&self, original: &Path) -> Result<PathBuf, WorkspaceError> {
        let target = self.working_path_for(original);
        if target.exists() {
            return Err(WorkspaceError::Occupied(target));
        }
        move_file(original, &target).map_err(|source| WorkspaceError::Move {
            from: original.to_path_buf(),
            to: target.clone(),
            source,
        })?;
        Ok(target)
    }

    /// Put a working copy back at its original location.
    pub fn restore(&self, working_copy: &Path, original: &Path) -> Result<(), WorkspaceError> {
        if original.exists() {
            return Err(WorkspaceError::Occupied(original.to_path_buf()));
        }
        move_file(working_copy, original).map_err(|source| WorkspaceError::Move {
            from: working_copy.to_path_buf(),
            to: original.to_path_buf(),
            source,
        })
    }

    /// Move `path` into quarantine. A name collision gets a timestamp suffix.
    pub fn quarantine(&self, path: &Path) -> Result<PathBuf, WorkspaceError> {
        fs::create_dir_all(&self.quarantine).map_err(|source| WorkspaceError::CreateDir {
            path: self.quarantine.clone(),
            source,
        })?;

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());
        let mut target = self.quarantine.join(&name);
        if target.exists() {
            target = self.quarantine.join(format!("{}.{}", name, unix_now()));
        }

        move_file(path, &target).map_err(|source| WorkspaceError::Move {
            from: path.to_path_buf(),
            to: target.clone(),
            source,
        })?;
        Ok(target)
    }

    /// Delete a file from working storage once it is no longer needed.
    pub fn dispose(&self, path: &Path) -> Result<(), WorkspaceError> {
        fs::remove_file(path).map_err(|source| WorkspaceError::Remove {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Regular files currently in working storage.
    pub fn leftovers(&self) -> Result<Vec<PathBuf>, WorkspaceError> {
        if !self.working.exists() {
            return Ok(Vec::new());
        }
        let mut files: Vec<PathBuf> = fs::read_dir(&self.working)
            .map_err(WorkspaceError::List)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();
        files.sort();
        Ok(files)
    }

    /// Move every leftover to quarantine. Returns how many were moved.
    pub fn sweep_to_quarantine(&self) -> usize {
        let leftovers = match self.leftovers() {
            Ok(files) => files,
            Err(e) => {
                tracing::warn!("Could not inspect working storage: {}", e);
                return 0;
            }
        };

        let mut moved = 0;
        for path in leftovers {
            match self.quarantine(&path) {
                Ok(target) => {
                    tracing::warn!(
                        from = %path.display(),
                        to = %target.display(),
                        "Moved leftover to quarantine"
                    );
                    moved += 1;
                }
                Err(e) => tracing::warn!("Failed to quarantine leftover: {}", e),
            }
        }
        moved
    }
}
