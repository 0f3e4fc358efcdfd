//! Output file naming and catalog-relative paths.

use regex::Regex;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

/// Suffix appended to every transcoded file.
pub const OUTPUT_SUFFIX: &str = ".1080p.mp4";

fn quality_marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)[._\- ](?:2160p|1440p|1080p|720p|480p|4k|uhd)\b")
            .expect("quality marker pattern is a valid regex")
    })
}

/// Name of the transcoded file that replaces `original`.
///
/// Resolution markers are stripped from the stem before the 1080p suffix is
/// appended: `Film.2019.2160p.UHD.mkv` becomes `Film.2019.1080p.mp4`.
pub fn output_filename(original: &Path) -> String {
    let stem = original
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let cleaned = quality_marker().replace_all(&stem, "");
    let cleaned = cleaned.trim_end_matches(['.', '_', '-', ' ']);
    format!("{}{}", cleaned, OUTPUT_SUFFIX)
}

/// Path the catalog services know a file by: relative to the library root,
/// without the leading series or movie folder.
///
/// `/tv/Show/Season 01/ep.mkv` under `/tv` becomes `Season 01/ep.mkv`;
/// `/movies/Film (2019)/film.mkv` under `/movies` becomes `film.mkv`.
pub fn catalog_relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut components = relative.components().filter(|c| matches!(c, Component::Normal(_)));
    components.next()?;
    let rest: PathBuf = components.collect();
    if rest.as_os_str().is_empty() {
        // File sits directly in the library root.
        return relative.to_str().map(str::to_string);
    }
    rest.to_str().map(str::to_string)
}

/// Replace the final component of a catalog-relative path.
pub fn with_file_name(relative: &str, file_name: &str) -> String {
    match relative.rfind('/') {
        Some(idx) => format!("{}/{}", &relative[..idx], file_name),
        None => file_name.to_string(),
    }
}
