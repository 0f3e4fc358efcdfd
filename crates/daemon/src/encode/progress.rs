//! Line parser for ffmpeg's diagnostic stream.
//!
//! ffmpeg rewrites its status line with `\r`, so both `\r` and `\n` end a line.

use regex::Regex;
use std::collections::VecDeque;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Lines retained for failure reports.
pub const DIAGNOSTIC_CAPACITY: usize = 200;

/// Messages ffmpeg prints when a hardware session or device cannot be created.
const DEVICE_FAILURE_PATTERNS: &[&str] = &[
    "error initializing an internal mfx session",
    "error creating a mfx session",
    "failed to initialise vaapi connection",
    "no va display found",
    "device creation failed",
    "cannot load libcuda",
    "no capable devices found",
    "openencodesessionex failed",
    "hwaccel initialisation returned error",
];

const ERROR_KEYWORDS: &[&str] = &["error", "failed", "cannot", "invalid"];

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProgressUpdate {
    pub frame: Option<u64>,
    pub fps: Option<f64>,
    /// Position in `HH:MM:SS.xx`
    pub time: Option<String>,
    pub speed: Option<String>,
    pub bitrate: Option<String>,
}

impl ProgressUpdate {
    pub fn position_secs(&self) -> Option<f64> {
        self.time.as_deref().and_then(parse_timestamp)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Progress(ProgressUpdate),
    DeviceFailure(String),
    Error(String),
}

fn key_value() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\w+)=\s*(\S+)").expect("key=value pattern is a valid regex"))
}

/// `HH:MM:SS.xx` to seconds.
pub fn parse_timestamp(raw: &str) -> Option<f64> {
    let mut parts = raw.trim().splitn(3, ':');
    let h: f64 = parts.next()?.parse().ok()?;
    let m: f64 = parts.next()?.parse().ok()?;
    let s: f64 = parts.next()?.parse().ok()?;
    Some(h * 3600.0 + m * 60.0 + s)
}

/// Classify one diagnostic line. Lines that carry nothing of interest yield `None`.
pub fn parse_line(line: &str) -> Option<ProgressEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    if trimmed.starts_with("frame=") || (trimmed.contains("time=") && trimmed.contains("speed=")) {
        let mut update = ProgressUpdate::default();
        for cap in key_value().captures_iter(trimmed) {
            let value = cap[2].to_string();
            match &cap[1] {
                "frame" => update.frame = value.parse().ok(),
                "fps" => update.fps = value.parse().ok(),
                "time" => update.time = Some(value),
                "speed" => update.speed = Some(value),
                "bitrate" => update.bitrate = Some(value),
                _ => {}
            }
        }
        return Some(ProgressEvent::Progress(update));
    }

    let lower = trimmed.to_lowercase();
    if DEVICE_FAILURE_PATTERNS.iter().any(|p| lower.contains(p)) {
        return Some(ProgressEvent::DeviceFailure(trimmed.to_string()));
    }
    if ERROR_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return Some(ProgressEvent::Error(trimmed.to_string()));
    }
    None
}

/// Splits a byte stream into lines on `\r` or `\n`.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in bytes {
            if b == b'\r' || b == b'\n' {
                if !self.pending.is_empty() {
                    lines.push(String::from_utf8_lossy(&self.pending).into_owned());
                    self.pending.clear();
                }
            } else {
                self.pending.push(b);
            }
        }
        lines
    }

    /// Whatever is left after the stream closed.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            let line = String::from_utf8_lossy(&self.pending).into_owned();
            self.pending.clear();
            Some(line)
        }
    }
}

/// Per-invocation supervision state: throttled progress logging, a bounded
/// diagnostic ring and the first device failure seen.
#[derive(Debug)]
pub struct ProgressMonitor {
    label: String,
    duration_secs: f64,
    log_interval: Duration,
    last_logged: Option<Instant>,
    diagnostics: VecDeque<String>,
    device_failure: Option<String>,
}

impl ProgressMonitor {
    pub fn new(label: impl Into<String>, duration_secs: f64, log_interval: Duration) -> Self {
        Self {
            label: label.into(),
            duration_secs,
            log_interval,
            last_logged: None,
            diagnostics: VecDeque::with_capacity(DIAGNOSTIC_CAPACITY),
            device_failure: None,
        }
    }

    pub fn observe(&mut self, line: &str) {
        match parse_line(line) {
            Some(ProgressEvent::Progress(update)) => self.log_progress(&update),
            Some(ProgressEvent::DeviceFailure(msg)) => {
                tracing::warn!(profile = %self.label, "Hardware device failure: {}", msg);
                if self.device_failure.is_none() {
                    self.device_failure = Some(msg.clone());
                }
                self.retain(msg);
            }
            Some(ProgressEvent::Error(msg)) => {
                tracing::debug!(profile = %self.label, "ffmpeg: {}", msg);
                self.retain(msg);
            }
            None => {
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    self.retain(trimmed.to_string());
                }
            }
        }
    }

    fn retain(&mut self, line: String) {
        if self.diagnostics.len() == DIAGNOSTIC_CAPACITY {
            self.diagnostics.pop_front();
        }
        self.diagnostics.push_back(line);
    }

    fn log_progress(&mut self, update: &ProgressUpdate) {
        let percent = match update.position_secs() {
            Some(pos) if self.duration_secs > 0.0 => (pos / self.duration_secs * 100.0).min(100.0),
            _ => 0.0,
        };
        let due = self
            .last_logged
            .map_or(true, |at| at.elapsed() >= self.log_interval);

        if due {
            self.last_logged = Some(Instant::now());
            tracing::info!(
                profile = %self.label,
                percent = (percent * 10.0).round() / 10.0,
                frame = update.frame.unwrap_or(0),
                fps = update.fps.unwrap_or(0.0),
                speed = update.speed.as_deref().unwrap_or("?"),
                "Transcoding"
            );
        } else {
            tracing::debug!(
                profile = %self.label,
                time = update.time.as_deref().unwrap_or("?"),
                bitrate = update.bitrate.as_deref().unwrap_or("?"),
                "Transcoding"
            );
        }
    }

    pub fn device_failure(&self) -> Option<&str> {
        self.device_failure.as_deref()
    }

    pub fn diagnostics(&self) -> impl Iterator<Item = &str> {
        self.diagnostics.iter().map(String::as_str)
    }

    /// Last few retained lines joined for an error message.
    pub fn tail(&self, n: usize) -> String {
        let skip = self.diagnostics.len().saturating_sub(n);
        self.diagnostics
            .iter()
            .skip(skip)
            .cloned()
            .collect::<Vec<_>>()
            .join(" | ")
    }
}
