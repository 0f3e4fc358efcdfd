//! Media types shared by the scanner, the store and the pipeline.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Which library (and therefore which catalog service) a file belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaKind {
    TvShow,
    Movie,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::TvShow => "tv_show",
            MediaKind::Movie => "movie",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "tv_show" => Some(MediaKind::TvShow),
            "movie" => Some(MediaKind::Movie),
            _ => None,
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attributes extracted by the prober that drive selection and bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MediaAttributes {
    pub duration_secs: f64,
    pub width: u32,
    pub height: u32,
    /// Codec of the first video stream, lowercase (e.g. "hevc")
    pub codec: String,
    /// Overall bitrate in bits per second
    pub bitrate: u64,
}

/// A file that passed every selection check during one scan pass.
#[derive(Debug, Clone, PartialEq)]
pub struct FileCandidate {
    pub path: PathBuf,
    /// Watched root the file was found under
    pub root: PathBuf,
    pub size_bytes: u64,
    /// Seconds since the Unix epoch
    pub mtime: f64,
    pub attributes: MediaAttributes,
    pub kind: MediaKind,
}

impl FileCandidate {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn source_dir(&self) -> &Path {
        self.path.parent().unwrap_or(Path::new("/"))
    }
}

/// Modification time as fractional seconds since the epoch.
pub fn mtime_secs(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
