//! Transcode executor: profile choice, supervised encoding and the single
//! hardware-to-software escalation.

pub mod ffmpeg;
pub mod profile;
pub mod progress;

pub use ffmpeg::{EncodeFailure, EncodeJob, EncoderRunner, FfmpegRunner};
pub use profile::{EncodeProfile, EncodeSettings, StreamSelection};

use crate::config::{HardwareAccel, TranscodeConfig, TranscodeStrategy};
use crate::probe::MediaProber;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Ordered profiles to attempt. Hardware, when present, is always followed
/// by exactly one software attempt.
pub fn plan_profiles(
    hardware: Option<HardwareAccel>,
    strategy: TranscodeStrategy,
    hdr: bool,
) -> Vec<EncodeProfile> {
    match hardware {
        Some(_) if hdr && strategy == TranscodeStrategy::HdrAware => vec![EncodeProfile::Software],
        Some(accel) => vec![EncodeProfile::Hardware(accel), EncodeProfile::Software],
        None => vec![EncodeProfile::Software],
    }
}

pub struct Transcoder {
    settings: EncodeSettings,
    strategy: TranscodeStrategy,
    /// Set only when hardware is enabled in config and the startup probe passed
    hardware: Option<HardwareAccel>,
    prober: Arc<dyn MediaProber>,
    runner: Arc<dyn EncoderRunner>,
}

impl Transcoder {
    pub fn new(
        config: &TranscodeConfig,
        hardware_usable: bool,
        prober: Arc<dyn MediaProber>,
        runner: Arc<dyn EncoderRunner>,
    ) -> Self {
        let hardware = (config.use_hardware_acceleration && hardware_usable)
            .then_some(config.hardware_accel);
        Self {
            settings: EncodeSettings::from_config(config),
            strategy: config.strategy,
            hardware,
            prober,
            runner,
        }
    }

    pub fn hardware(&self) -> Option<HardwareAccel> {
        self.hardware
    }

    /// Transcode `input` to `output`. True iff the final invocation exited
    /// cleanly and left a non-empty output.
    pub async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        original_for_detection: &Path,
        cancel: &CancellationToken,
    ) -> bool {
        self.run(input, output, original_for_detection, cancel)
            .await
            .is_ok()
    }

    /// Like [`Transcoder::transcode`], returning the profile that succeeded or
    /// the last failure.
    pub async fn run(
        &self,
        input: &Path,
        output: &Path,
        original_for_detection: &Path,
        cancel: &CancellationToken,
    ) -> Result<EncodeProfile, EncodeFailure> {
        if !input.is_file() {
            return Err(EncodeFailure::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("input {} does not exist", input.display()),
            )));
        }
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // The original usually sits in working storage by now; probe whichever exists.
        let detection_path = if original_for_detection.exists() {
            original_for_detection
        } else {
            input
        };
        let (hdr, streams, duration_secs) = match self.prober.probe(detection_path).await {
            Ok(probe) => (
                probe.is_hdr(),
                StreamSelection::from_probe(&probe),
                probe.format.duration_secs,
            ),
            Err(e) => {
                tracing::warn!(
                    path = %detection_path.display(),
                    "Stream detection failed, assuming SDR with default mapping: {}",
                    e
                );
                (false, StreamSelection::fallback(), 0.0)
            }
        };

        let profiles = plan_profiles(self.hardware, self.strategy, hdr);
        if hdr && profiles == [EncodeProfile::Software] && self.hardware.is_some() {
            tracing::info!(path = %input.display(), "HDR or 10-bit source, using software encoder");
        }

        let mut last_failure = None;
        for profile in profiles {
            let job = EncodeJob {
                profile,
                args: profile.build_args(input, output, &self.settings, &streams),
                output: output.to_path_buf(),
                duration_secs,
            };

            tracing::info!(
                input = %input.display(),
                profile = %profile,
                encoder = profile.encoder_name(),
                "Starting transcode"
            );

            match self.runner.run(&job, cancel).await {
                Ok(()) => {
                    tracing::info!(output = %output.display(), profile = %profile, "Transcode finished");
                    return Ok(profile);
                }
                Err(EncodeFailure::Cancelled) => {
                    remove_partial(output).await;
                    return Err(EncodeFailure::Cancelled);
                }
                Err(e) => {
                    tracing::warn!(profile = %profile, "Transcode attempt failed: {}", e);
                    remove_partial(output).await;
                    last_failure = Some(e);
                }
            }
        }

        Err(last_failure.unwrap_or(EncodeFailure::Terminated))
    }
}

async fn remove_partial(output: &Path) {
    if let Err(e) = tokio::fs::remove_file(output).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %output.display(), "Failed to remove partial output: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ffmpeg::MockEncoderRunner;
    use super::*;
    use crate::probe::{FormatInfo, MockMediaProber, ProbeError, ProbeResult, VideoStream};
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn probe_result(pix_fmt: &str) -> ProbeResult {
        ProbeResult {
            video_streams: vec![VideoStream {
                codec_name: "hevc".to_string(),
                width: 3840,
                height: 2160,
                pix_fmt: Some(pix_fmt.to_string()),
                color_transfer: None,
                bitrate: None,
                side_data_types: vec![],
                tags: HashMap::new(),
            }],
            audio_streams: vec![],
            subtitle_streams: vec![],
            format: FormatInfo {
                duration_secs: 60.0,
                bitrate: Some(8_000_000),
                size_bytes: 0,
            },
        }
    }

    fn prober_returning(pix_fmt: &'static str) -> MockMediaProber {
        let mut prober = MockMediaProber::new();
        prober
            .expect_probe()
            .returning(move |_| Ok(probe_result(pix_fmt)));
        prober
    }

    fn config(strategy: TranscodeStrategy) -> TranscodeConfig {
        TranscodeConfig {
            strategy,
            ..TranscodeConfig::default()
        }
    }

    struct Fixture {
        _dir: TempDir,
        input: std::path::PathBuf,
        output: std::path::PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("working_Film.2160p.mkv");
        std::fs::write(&input, b"source").unwrap();
        let output = dir.path().join("out").join("Film.1080p.mp4");
        Fixture {
            _dir: dir,
            input,
            output,
        }
    }

    #[test]
    fn test_plan_profiles() {
        let qsv = Some(HardwareAccel::Qsv);
        assert_eq!(
            plan_profiles(qsv, TranscodeStrategy::HdrAware, false),
            vec![EncodeProfile::Hardware(HardwareAccel::Qsv), EncodeProfile::Software]
        );
        assert_eq!(
            plan_profiles(qsv, TranscodeStrategy::HdrAware, true),
            vec![EncodeProfile::Software]
        );
        assert_eq!(
            plan_profiles(qsv, TranscodeStrategy::HardwareFirst, true),
            vec![EncodeProfile::Hardware(HardwareAccel::Qsv), EncodeProfile::Software]
        );
        assert_eq!(
            plan_profiles(None, TranscodeStrategy::HardwareFirst, false),
            vec![EncodeProfile::Software]
        );
    }

    #[test]
    fn test_hardware_requires_config_and_probe() {
        let runner: Arc<dyn EncoderRunner> = Arc::new(MockEncoderRunner::new());
        let prober: Arc<dyn MediaProber> = Arc::new(MockMediaProber::new());

        let t = Transcoder::new(&TranscodeConfig::default(), true, prober.clone(), runner.clone());
        assert_eq!(t.hardware(), Some(HardwareAccel::Qsv));

        let t = Transcoder::new(&TranscodeConfig::default(), false, prober.clone(), runner.clone());
        assert_eq!(t.hardware(), None);

        let disabled = TranscodeConfig {
            use_hardware_acceleration: false,
            ..TranscodeConfig::default()
        };
        let t = Transcoder::new(&disabled, true, prober, runner);
        assert_eq!(t.hardware(), None);
    }

    #[tokio::test]
    async fn test_hardware_failure_escalates_to_software_once() {
        let fx = fixture();
        let mut runner = MockEncoderRunner::new();
        let mut seq = mockall::Sequence::new();
        runner
            .expect_run()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|job, _| job.profile.is_hardware())
            .returning(|_, _| {
                Err(EncodeFailure::DeviceFailure(
                    "Error initializing an internal MFX session".to_string(),
                ))
            });
        runner
            .expect_run()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|job, _| job.profile == EncodeProfile::Software)
            .returning(|job, _| {
                std::fs::write(&job.output, b"encoded").unwrap();
                Ok(())
            });

        let transcoder = Transcoder::new(
            &config(TranscodeStrategy::HdrAware),
            true,
            Arc::new(prober_returning("yuv420p")),
            Arc::new(runner),
        );
        let result = transcoder
            .run(&fx.input, &fx.output, &fx.input, &CancellationToken::new())
            .await;
        assert_eq!(result.unwrap(), EncodeProfile::Software);
        assert!(fx.output.exists());
    }

    #[tokio::test]
    async fn test_hdr_source_goes_straight_to_software() {
        let fx = fixture();
        let mut runner = MockEncoderRunner::new();
        runner
            .expect_run()
            .times(1)
            .withf(|job, _| job.profile == EncodeProfile::Software)
            .returning(|job, _| {
                std::fs::write(&job.output, b"encoded").unwrap();
                Ok(())
            });

        let transcoder = Transcoder::new(
            &config(TranscodeStrategy::HdrAware),
            true,
            Arc::new(prober_returning("yuv420p10le")),
            Arc::new(runner),
        );
        assert!(
            transcoder
                .transcode(&fx.input, &fx.output, &fx.input, &CancellationToken::new())
                .await
        );
    }

    #[tokio::test]
    async fn test_both_attempts_failing_is_failure() {
        let fx = fixture();
        let mut runner = MockEncoderRunner::new();
        runner.expect_run().times(2).returning(|_, _| {
            Err(EncodeFailure::Exit {
                code: 1,
                detail: "boom".to_string(),
            })
        });

        let transcoder = Transcoder::new(
            &config(TranscodeStrategy::HdrAware),
            true,
            Arc::new(prober_returning("yuv420p")),
            Arc::new(runner),
        );
        let result = transcoder
            .run(&fx.input, &fx.output, &fx.input, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(EncodeFailure::Exit { code: 1, .. })));
        assert!(!fx.output.exists());
    }

    #[tokio::test]
    async fn test_cancellation_is_not_escalated() {
        let fx = fixture();
        let mut runner = MockEncoderRunner::new();
        runner
            .expect_run()
            .times(1)
            .returning(|_, _| Err(EncodeFailure::Cancelled));

        let transcoder = Transcoder::new(
            &config(TranscodeStrategy::HdrAware),
            true,
            Arc::new(prober_returning("yuv420p")),
            Arc::new(runner),
        );
        let result = transcoder
            .run(&fx.input, &fx.output, &fx.input, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(EncodeFailure::Cancelled)));
    }

    #[tokio::test]
    async fn test_probe_failure_assumes_sdr_and_default_mapping() {
        let fx = fixture();
        let mut prober = MockMediaProber::new();
        prober
            .expect_probe()
            .returning(|_| Err(ProbeError::FfprobeFailed("unreadable".to_string())));

        let mut runner = MockEncoderRunner::new();
        runner
            .expect_run()
            .times(1)
            .withf(|job, _| {
                job.profile.is_hardware() && job.args.iter().any(|a| a.to_str() == Some("0:a:0?"))
            })
            .returning(|job, _| {
                std::fs::write(&job.output, b"encoded").unwrap();
                Ok(())
            });

        let transcoder = Transcoder::new(
            &config(TranscodeStrategy::HdrAware),
            true,
            Arc::new(prober),
            Arc::new(runner),
        );
        let missing_original = fx.input.with_file_name("Film.2160p.mkv");
        assert!(
            transcoder
                .transcode(&fx.input, &fx.output, &missing_original, &CancellationToken::new())
                .await
        );
    }

    #[tokio::test]
    async fn test_missing_input_fails_without_encoding() {
        let fx = fixture();
        let transcoder = Transcoder::new(
            &config(TranscodeStrategy::HdrAware),
            true,
            Arc::new(MockMediaProber::new()),
            Arc::new(MockEncoderRunner::new()),
        );
        let missing = fx.input.with_file_name("nope.mkv");
        assert!(
            !transcoder
                .transcode(&missing, &fx.output, &missing, &CancellationToken::new())
                .await
        );
    }
}
