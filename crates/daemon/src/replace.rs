//! Installing a finished transcode into the library.
//!
//! The output is staged next to its destination and renamed into place, so
//! the library never sees a partially written file.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Errors that can occur while installing an output or writing a backup.
#[derive(Debug, Error)]
pub enum ReplaceError {
    /// Something already occupies the destination path.
    #[error("Destination already exists: {0}")]
    DestinationExists(PathBuf),

    /// Failed to write the backup copy of the original.
    #[error("Failed to create backup: {0}")]
    BackupFailed(std::io::Error),

    /// Failed to stage or rename the output into the library.
    #[error("Failed to install output: {0}")]
    InstallFailed(std::io::Error),
}

/// Backup location for an original: `<name>.orig.<unix seconds>`.
///
/// ```
/// use std::path::Path;
/// use uhd_downscaler::replace::backup_path;
///
/// let backup = backup_path(Path::new("/media/movies/film.mkv"));
/// assert!(backup.to_string_lossy().starts_with("/media/movies/film.mkv.orig."));
/// ```
pub fn backup_path(original: &Path) -> PathBuf {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let mut backup = original.as_os_str().to_owned();
    backup.push(format!(".orig.{}", timestamp));
    PathBuf::from(backup)
}

fn staging_path(destination: &Path) -> PathBuf {
    let mut staged = destination.as_os_str().to_owned();
    staged.push(".partial");
    PathBuf::from(staged)
}

/// Copy the working copy of an original to its backup location beside
/// `original`. Returns the backup path.
pub fn create_backup(working_copy: &Path, original: &Path) -> Result<PathBuf, ReplaceError> {
    let backup = backup_path(original);
    if let Err(e) = fs::copy(working_copy, &backup) {
        let _ = fs::remove_file(&backup);
        return Err(ReplaceError::BackupFailed(e));
    }
    Ok(backup)
}

/// Move `output` to `destination`, refusing to overwrite anything.
///
/// A same-filesystem rename is used when possible. Otherwise the output is
/// copied to a staging file in the destination directory and renamed into
/// place. On failure the output stays where it was and no staging file is
/// left behind.
pub fn install_output(output: &Path, destination: &Path) -> Result<(), ReplaceError> {
    if destination.exists() {
        return Err(ReplaceError::DestinationExists(destination.to_path_buf()));
    }

    if fs::rename(output, destination).is_ok() {
        return Ok(());
    }

    let staged = staging_path(destination);
    let staged_install = fs::copy(output, &staged).and_then(|_| {
        if destination.exists() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("{} appeared during install", destination.display()),
            ));
        }
        fs::rename(&staged, destination)
    });
    if let Err(e) = staged_install {
        let _ = fs::remove_file(&staged);
        return Err(ReplaceError::InstallFailed(e));
    }

    if let Err(e) = fs::remove_file(output) {
        tracing::warn!(path = %output.display(), "Installed output but could not remove source: {}", e);
    }
    Ok(())
}
