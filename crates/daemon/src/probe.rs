//! Probe module for reading stream and format metadata with ffprobe.
//!
//! Besides the basic attributes used for candidate selection, the probe
//! result carries what the encoder needs: HDR indicators, audio languages
//! and subtitle codecs.

use crate::media::MediaAttributes;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

/// Default limit for a single ffprobe invocation.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Subtitle codecs that can be converted to `mov_text`. Image-based formats
/// (PGS, VobSub, DVB) cannot be carried in MP4.
pub const TEXT_SUBTITLE_CODECS: &[&str] = &["subrip", "srt", "ass", "ssa", "mov_text", "webvtt", "text"];

const HDR_SIDE_DATA: &[&str] = &["mastering display metadata", "content light level metadata"];
const HDR_TRANSFERS: &[&str] = &["smpte2084", "arib-std-b67"];

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe exited unsuccessfully.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// Failed to parse ffprobe JSON output.
    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),

    /// The file has no video stream.
    #[error("No video stream found")]
    NoVideoStream,

    #[error("ffprobe timed out after {0:?}")]
    Timeout(Duration),

    /// IO error spawning ffprobe.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoStream {
    pub codec_name: String,
    pub width: u32,
    pub height: u32,
    pub pix_fmt: Option<String>,
    pub color_transfer: Option<String>,
    /// Bits per second, if the container reports it per stream
    pub bitrate: Option<u64>,
    pub side_data_types: Vec<String>,
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioStream {
    pub codec_name: String,
    pub language: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubtitleStream {
    pub codec_name: String,
    pub language: Option<String>,
}

impl SubtitleStream {
    pub fn is_text(&self) -> bool {
        TEXT_SUBTITLE_CODECS.contains(&self.codec_name.to_lowercase().as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FormatInfo {
    pub duration_secs: f64,
    /// Overall bits per second
    pub bitrate: Option<u64>,
    pub size_bytes: u64,
}

/// Result of probing a video file. Stream lists keep ffprobe's order, so a
/// position in a list is the per-type index ffmpeg's `-map 0:a:N` expects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeResult {
    pub video_streams: Vec<VideoStream>,
    pub audio_streams: Vec<AudioStream>,
    pub subtitle_streams: Vec<SubtitleStream>,
    pub format: FormatInfo,
}

impl ProbeResult {
    /// Selection attributes taken from the first video stream.
    pub fn attributes(&self) -> Result<MediaAttributes, ProbeError> {
        let video = self.video_streams.first().ok_or(ProbeError::NoVideoStream)?;
        Ok(MediaAttributes {
            duration_secs: self.format.duration_secs,
            width: video.width,
            height: video.height,
            codec: video.codec_name.to_lowercase(),
            bitrate: self.format.bitrate.or(video.bitrate).unwrap_or(0),
        })
    }

    /// True when any video stream is 10-bit or carries HDR or Dolby Vision metadata.
    pub fn is_hdr(&self) -> bool {
        self.video_streams.iter().any(|v| {
            let ten_bit = v.pix_fmt.as_deref().is_some_and(|f| f.contains("10"));
            let hdr_transfer = v
                .color_transfer
                .as_deref()
                .is_some_and(|t| HDR_TRANSFERS.contains(&t.to_lowercase().as_str()));
            let hdr_side_data = v.side_data_types.iter().any(|t| {
                let t = t.to_lowercase();
                HDR_SIDE_DATA.contains(&t.as_str()) || t.contains("dovi") || t.contains("dolby")
            });
            let dolby_tag = v.tags.iter().any(|(k, val)| {
                k.to_lowercase().contains("dolby") || val.to_lowercase().contains("dolby")
            });
            ten_bit || hdr_transfer || hdr_side_data || dolby_tag
        })
    }

    /// Per-type index of the audio track to keep: English if present, else the first.
    pub fn preferred_audio_index(&self) -> Option<usize> {
        if self.audio_streams.is_empty() {
            return None;
        }
        let english = self.audio_streams.iter().position(|a| {
            matches!(
                a.language.as_deref().map(str::to_lowercase).as_deref(),
                Some("eng" | "en" | "english")
            )
        });
        Some(english.unwrap_or(0))
    }

    /// Per-type indices of subtitle tracks that survive conversion to MP4.
    pub fn text_subtitle_indices(&self) -> Vec<usize> {
        self.subtitle_streams
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_text())
            .map(|(i, _)| i)
            .collect()
    }
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;
    use std::collections::HashMap;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub pix_fmt: Option<String>,
        pub color_transfer: Option<String>,
        pub bit_rate: Option<String>,
        pub side_data_list: Option<Vec<SideData>>,
        pub tags: Option<HashMap<String, String>>,
    }

    #[derive(Debug, Deserialize)]
    pub struct SideData {
        pub side_data_type: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
        pub bit_rate: Option<String>,
        pub size: Option<String>,
    }
}

fn language_tag(tags: &HashMap<String, String>) -> Option<String> {
    tags.get("language").cloned()
}

/// Parses ffprobe JSON output into a ProbeResult.
pub fn parse_ffprobe_output(json_str: &str) -> Result<ProbeResult, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let streams = ffprobe.streams.unwrap_or_default();
    let format = ffprobe.format.ok_or_else(|| {
        ProbeError::ParseError("Missing format information in ffprobe output".to_string())
    })?;

    let mut video_streams = Vec::new();
    let mut audio_streams = Vec::new();
    let mut subtitle_streams = Vec::new();

    for stream in streams {
        let codec_name = stream.codec_name.clone().unwrap_or_default();
        let tags = stream.tags.unwrap_or_default();

        match stream.codec_type.as_deref().unwrap_or("") {
            "video" => {
                video_streams.push(VideoStream {
                    codec_name,
                    width: stream.width.unwrap_or(0),
                    height: stream.height.unwrap_or(0),
                    pix_fmt: stream.pix_fmt,
                    color_transfer: stream.color_transfer,
                    bitrate: stream.bit_rate.and_then(|b| b.parse::<u64>().ok()),
                    side_data_types: stream
                        .side_data_list
                        .unwrap_or_default()
                        .into_iter()
                        .filter_map(|s| s.side_data_type)
                        .collect(),
                    tags,
                });
            }
            "audio" => audio_streams.push(AudioStream {
                codec_name,
                language: language_tag(&tags),
            }),
            "subtitle" => subtitle_streams.push(SubtitleStream {
                codec_name,
                language: language_tag(&tags),
            }),
            _ => {}
        }
    }

    Ok(ProbeResult {
        video_streams,
        audio_streams,
        subtitle_streams,
        format: FormatInfo {
            duration_secs: format
                .duration
                .and_then(|d| d.parse::<f64>().ok())
                .unwrap_or(0.0),
            bitrate: format.bit_rate.and_then(|b| b.parse::<u64>().ok()),
            size_bytes: format.size.and_then(|s| s.parse::<u64>().ok()).unwrap_or(0),
        },
    })
}

/// Source of media metadata.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaProber: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<ProbeResult, ProbeError>;
}

/// Runs `ffprobe -v quiet -print_format json -show_format -show_streams <path>`.
pub struct FfprobeProber {
    binary: PathBuf,
    timeout: Duration,
}

impl FfprobeProber {
    pub fn new() -> Self {
        Self::with_binary("ffprobe", PROBE_TIMEOUT)
    }

    pub fn with_binary(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }
}

impl Default for FfprobeProber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaProber for FfprobeProber {
    async fn probe(&self, path: &Path) -> Result<ProbeResult, ProbeError> {
        let child = Command::new(&self.binary)
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ])
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ProbeError::Timeout(self.timeout))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProbeError::FfprobeFailed(format!(
                "ffprobe exited with status {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        parse_ffprobe_output(&String::from_utf8_lossy(&output.stdout))
    }
}
