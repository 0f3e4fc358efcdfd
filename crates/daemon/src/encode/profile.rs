//! Encoder profiles and ffmpeg argument construction.
//!
//! Every profile produces 1080-line H.264 video with the aspect ratio kept,
//! AAC audio and `mov_text` subtitles in an MP4 container.

use crate::config::{HardwareAccel, TranscodeConfig};
use crate::probe::ProbeResult;
use std::ffi::OsString;
use std::path::Path;

/// Output height in lines; width follows the source aspect ratio.
const SCALE_FILTER: &str = "scale=-2:1080";

const VAAPI_DEVICE: &str = "/dev/dri/renderD128";

/// Quality and audio settings shared by all profiles.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeSettings {
    pub crf: u8,
    pub preset: String,
    pub audio_bitrate_kbps: u32,
}

impl EncodeSettings {
    pub fn from_config(config: &TranscodeConfig) -> Self {
        Self {
            crf: config.crf,
            preset: config.preset.clone(),
            audio_bitrate_kbps: config.audio_bitrate_kbps,
        }
    }
}

/// Which input streams end up in the output.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StreamSelection {
    /// Per-type audio index; `None` with `known == false` means "first, if any"
    pub audio: Option<usize>,
    pub subtitles: Vec<usize>,
    /// False when stream information could not be read
    pub known: bool,
}

impl StreamSelection {
    pub fn from_probe(probe: &ProbeResult) -> Self {
        Self {
            audio: probe.preferred_audio_index(),
            subtitles: probe.text_subtitle_indices(),
            known: true,
        }
    }

    /// First video and optional first audio, no subtitles.
    pub fn fallback() -> Self {
        Self::default()
    }

    fn map_args(&self) -> Vec<String> {
        let mut args = vec!["-map".to_string(), "0:v:0".to_string()];
        match (self.known, self.audio) {
            (true, Some(index)) => args.extend(["-map".to_string(), format!("0:a:{}", index)]),
            (true, None) => {}
            (false, _) => args.extend(["-map".to_string(), "0:a:0?".to_string()]),
        }
        for index in &self.subtitles {
            args.extend(["-map".to_string(), format!("0:s:{}", index)]);
        }
        args
    }
}

/// Encoder profile: a hardware encoder family or the software fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeProfile {
    Hardware(HardwareAccel),
    Software,
}

impl EncodeProfile {
    pub fn is_hardware(&self) -> bool {
        matches!(self, EncodeProfile::Hardware(_))
    }

    pub fn encoder_name(&self) -> &'static str {
        match self {
            EncodeProfile::Hardware(accel) => accel.encoder_name(),
            EncodeProfile::Software => "libx264",
        }
    }

    fn input_args(&self) -> Vec<String> {
        match self {
            EncodeProfile::Hardware(HardwareAccel::Qsv) => vec!["-hwaccel".into(), "qsv".into()],
            EncodeProfile::Hardware(HardwareAccel::Vaapi) => {
                vec!["-vaapi_device".into(), VAAPI_DEVICE.into()]
            }
            EncodeProfile::Hardware(HardwareAccel::Nvenc) => {
                vec!["-hwaccel".into(), "cuda".into()]
            }
            EncodeProfile::Software => Vec::new(),
        }
    }

    fn video_args(&self, settings: &EncodeSettings) -> Vec<String> {
        let crf = settings.crf.to_string();
        match self {
            EncodeProfile::Hardware(HardwareAccel::Qsv) => vec![
                "-vf".into(),
                format!("{},format=nv12", SCALE_FILTER),
                "-c:v".into(),
                "h264_qsv".into(),
                "-preset".into(),
                settings.preset.clone(),
                "-global_quality".into(),
                crf,
            ],
            EncodeProfile::Hardware(HardwareAccel::Vaapi) => vec![
                "-vf".into(),
                format!("{},format=nv12,hwupload", SCALE_FILTER),
                "-c:v".into(),
                "h264_vaapi".into(),
                "-qp".into(),
                crf,
            ],
            EncodeProfile::Hardware(HardwareAccel::Nvenc) => vec![
                "-vf".into(),
                format!("{},format=yuv420p", SCALE_FILTER),
                "-c:v".into(),
                "h264_nvenc".into(),
                "-preset".into(),
                settings.preset.clone(),
                "-cq".into(),
                crf,
            ],
            EncodeProfile::Software => vec![
                "-vf".into(),
                SCALE_FILTER.into(),
                "-c:v".into(),
                "libx264".into(),
                "-preset".into(),
                settings.preset.clone(),
                "-crf".into(),
                crf,
                "-pix_fmt".into(),
                "yuv420p".into(),
            ],
        }
    }

    /// Full ffmpeg argument list, excluding the binary itself.
    pub fn build_args(
        &self,
        input: &Path,
        output: &Path,
        settings: &EncodeSettings,
        streams: &StreamSelection,
    ) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["-hide_banner".into(), "-nostdin".into(), "-y".into()];
        args.extend(self.input_args().into_iter().map(OsString::from));
        args.push("-i".into());
        args.push(input.as_os_str().to_owned());

        args.extend(streams.map_args().into_iter().map(OsString::from));
        args.extend(self.video_args(settings).into_iter().map(OsString::from));

        args.extend(
            [
                "-c:a".to_string(),
                "aac".to_string(),
                "-b:a".to_string(),
                format!("{}k", settings.audio_bitrate_kbps),
            ]
            .into_iter()
            .map(OsString::from),
        );
        if !streams.subtitles.is_empty() {
            args.push("-c:s".into());
            args.push("mov_text".into());
        }
        args.push("-movflags".into());
        args.push("+faststart".into());
        args.push(output.as_os_str().to_owned());
        args
    }

    /// Arguments for a one-second synthetic encode through this profile,
    /// discarding the result. Used to check that a hardware encoder works.
    pub fn synthetic_test_args(&self, settings: &EncodeSettings) -> Vec<OsString> {
        let mut args: Vec<String> = vec!["-hide_banner".into(), "-nostdin".into()];
        args.extend(self.input_args());
        args.extend([
            "-f".into(),
            "lavfi".into(),
            "-i".into(),
            "testsrc2=duration=1:size=1920x1080:rate=25".into(),
        ]);
        args.extend(self.video_args(settings));
        args.extend(["-f".into(), "null".into(), "-".into()]);
        args.into_iter().map(OsString::from).collect()
    }
}

impl std::fmt::Display for EncodeProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodeProfile::Hardware(accel) => write!(f, "hardware ({})", accel.as_str()),
            EncodeProfile::Software => f.write_str("software"),
        }
    }
}
