//! Scanner module for discovering transcoding candidates in library directories.
//!
//! A scan pass walks every active library root, drops files that are not
//! eligible (wrong extension, too young, already in the ledger), analyses the
//! rest through the cache or the prober, and keeps the ones that need
//! downscaling.

use crate::config::Config;
use crate::media::{mtime_secs, FileCandidate, MediaAttributes, MediaKind};
use crate::probe::MediaProber;
use crate::store::CatalogStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Video file extensions supported by the scanner (case-insensitive matching).
pub const VIDEO_EXTENSIONS: &[&str] = &[".mkv", ".mp4", ".avi", ".mov", ".m4v"];

/// Filename fragments that indicate a source above 1080p.
pub const HIGH_RES_MARKERS: &[&str] = &["2160p", "2160", "4k", "uhd", "1440p", "1440", "2k"];

/// Codecs already in the target family.
pub const TARGET_CODECS: &[&str] = &["h264", "avc", "avc1"];

pub const TARGET_HEIGHT: u32 = 1080;

/// Checks if a file has a video extension (case-insensitive).
pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext_lower = format!(".{}", ext.to_lowercase());
            VIDEO_EXTENSIONS.contains(&ext_lower.as_str())
        })
        .unwrap_or(false)
}

pub fn has_high_res_marker(file_name: &str) -> bool {
    let lower = file_name.to_lowercase();
    HIGH_RES_MARKERS.iter().any(|m| lower.contains(m))
}

/// Whether the file has sat untouched for at least `min_age`.
/// A modification time in the future counts as brand new unless no minimum
/// age is configured.
pub fn is_old_enough(modified: SystemTime, now: SystemTime, min_age: Duration) -> bool {
    min_age.is_zero()
        || now
            .duration_since(modified)
            .map(|age| age >= min_age)
            .unwrap_or(false)
}

/// Necessity check: every condition must hold.
pub fn needs_transcoding(file_name: &str, attrs: &MediaAttributes, min_bitrate_bps: u64) -> bool {
    attrs.height > TARGET_HEIGHT
        && has_high_res_marker(file_name)
        && !TARGET_CODECS.contains(&attrs.codec.to_lowercase().as_str())
        && attrs.bitrate >= min_bitrate_bps
}

/// A watched directory and the library it feeds.
#[derive(Debug, Clone, PartialEq)]
pub struct LibraryRoot {
    pub path: PathBuf,
    pub kind: MediaKind,
}

impl LibraryRoot {
    /// Roots to scan, movies first, limited to libraries whose catalog is usable.
    pub fn from_config(config: &Config, active: &[MediaKind]) -> Vec<LibraryRoot> {
        [
            (&config.paths.movies, MediaKind::Movie),
            (&config.paths.tv, MediaKind::TvShow),
        ]
        .into_iter()
        .filter(|(path, kind)| !path.as_os_str().is_empty() && active.contains(kind))
        .map(|(path, kind)| LibraryRoot {
            path: path.clone(),
            kind,
        })
        .collect()
    }
}

/// Recursively lists video files under `root` in a stable order.
///
/// Hidden directories below the root are not descended.
pub fn walk_library(root: &Path) -> Vec<PathBuf> {
    use walkdir::WalkDir;

    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            if entry.file_type().is_dir() && entry.depth() > 0 {
                if let Some(name) = entry.file_name().to_str() {
                    return !name.starts_with('.');
                }
            }
            true
        });

    walker
        .filter_map(|e| e.ok())
        .filter(|e| !e.file_type().is_dir() && is_video_file(e.path()))
        .map(|e| e.into_path())
        .collect()
}

#[derive(Debug, Clone)]
pub struct ScanSettings {
    pub min_age: Duration,
    pub min_bitrate_bps: u64,
}

impl ScanSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            min_age: Duration::from_secs(config.scan.min_file_age_hours.saturating_mul(3600)),
            min_bitrate_bps: config.scan.min_bitrate_kbps.saturating_mul(1000),
        }
    }
}

pub struct Scanner {
    roots: Vec<LibraryRoot>,
    settings: ScanSettings,
    store: Arc<CatalogStore>,
    prober: Arc<dyn MediaProber>,
}

impl Scanner {
    pub fn new(
        roots: Vec<LibraryRoot>,
        settings: ScanSettings,
        store: Arc<CatalogStore>,
        prober: Arc<dyn MediaProber>,
    ) -> Self {
        Self {
            roots,
            settings,
            store,
            prober,
        }
    }

    pub fn roots(&self) -> &[LibraryRoot] {
        &self.roots
    }

    /// One full pass over every root. Order is traversal order, movies first.
    pub async fn scan(&self) -> Vec<FileCandidate> {
        let mut candidates = Vec::new();

        for root in &self.roots {
            if !root.path.is_dir() {
                tracing::warn!(root = %root.path.display(), "Library root does not exist, skipping");
                continue;
            }

            let walk_root = root.path.clone();
            let files = match tokio::task::spawn_blocking(move || walk_library(&walk_root)).await {
                Ok(files) => files,
                Err(e) => {
                    tracing::error!(root = %root.path.display(), "Library walk failed: {}", e);
                    continue;
                }
            };

            let before = candidates.len();
            for path in files {
                if let Some(candidate) = self.evaluate(root, path).await {
                    candidates.push(candidate);
                }
            }
            tracing::info!(
                root = %root.path.display(),
                kind = %root.kind,
                found = candidates.len() - before,
                "Library scan complete"
            );
        }

        candidates
    }

    async fn evaluate(&self, root: &LibraryRoot, path: PathBuf) -> Option<FileCandidate> {
        let metadata = match std::fs::metadata(&path) {
            Ok(m) if m.is_file() => m,
            Ok(_) => return None,
            Err(e) => {
                tracing::debug!(path = %path.display(), "Cannot stat file: {}", e);
                return None;
            }
        };

        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        if !is_old_enough(modified, SystemTime::now(), self.settings.min_age) {
            tracing::trace!(path = %path.display(), "Too recent");
            return None;
        }

        match self.store.is_processed(&path) {
            Ok(false) => {}
            Ok(true) => {
                tracing::trace!(path = %path.display(), "Already in ledger");
                return None;
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), "Ledger lookup failed: {}", e);
                return None;
            }
        }

        let size_bytes = metadata.len();
        let mtime = mtime_secs(modified);
        let (attributes, needed) = self.analyze(&path, size_bytes, mtime).await?;

        if !needed {
            tracing::debug!(
                path = %path.display(),
                height = attributes.height,
                codec = %attributes.codec,
                bitrate = attributes.bitrate,
                "Does not need transcoding"
            );
            return None;
        }

        Some(FileCandidate {
            path,
            root: root.path.clone(),
            size_bytes,
            mtime,
            attributes,
            kind: root.kind,
        })
    }

    /// Attributes from the cache if the triplet matches, otherwise probe and
    /// cache. The verdict is always recomputed against current settings.
    async fn analyze(&self, path: &Path, size: u64, mtime: f64) -> Option<(MediaAttributes, bool)> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        match self.store.get_cached_analysis(path, size, mtime) {
            Ok(Some(hit)) => {
                let needed =
                    needs_transcoding(&file_name, &hit.attributes, self.settings.min_bitrate_bps);
                if needed != hit.needs_transcoding {
                    tracing::debug!(
                        path = %path.display(),
                        cached = hit.needs_transcoding,
                        now = needed,
                        "Cached verdict changed under current settings"
                    );
                }
                return Some((hit.attributes, needed));
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(path = %path.display(), "Analysis cache lookup failed: {}", e),
        }

        let attributes = match self.prober.probe(path).await.and_then(|p| p.attributes()) {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!(path = %path.display(), "Probe failed, skipping: {}", e);
                return None;
            }
        };

        let needed = needs_transcoding(&file_name, &attributes, self.settings.min_bitrate_bps);

        if let Err(e) = self
            .store
            .cache_analysis(path, size, mtime, &attributes, needed)
        {
            tracing::warn!(path = %path.display(), "Failed to cache analysis: {}", e);
        }

        Some((attributes, needed))
    }
}
