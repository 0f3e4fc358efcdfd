//! Supervised ffmpeg execution.
//!
//! The encoder's stderr is consumed while it runs; the process is killed on
//! timeout or operator interrupt.

use super::profile::EncodeProfile;
use super::progress::{LineSplitter, ProgressMonitor};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Number of retained diagnostic lines quoted in an exit-status failure.
const FAILURE_TAIL_LINES: usize = 5;

/// Why an encoder invocation did not produce a usable output.
#[derive(Debug, Error)]
pub enum EncodeFailure {
    #[error("Encoder could not be started: {0}")]
    EncoderUnavailable(String),

    #[error("Hardware device failure: {0}")]
    DeviceFailure(String),

    #[error("Encoder timed out after {0:?}")]
    Timeout(Duration),

    #[error("Encoder exited with code {code}: {detail}")]
    Exit { code: i32, detail: String },

    #[error("Encoder was terminated by signal")]
    Terminated,

    #[error("Encoder produced no output at {0}")]
    MissingOutput(PathBuf),

    #[error("Encoding cancelled by operator")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One encoder invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeJob {
    pub profile: EncodeProfile,
    pub args: Vec<OsString>,
    pub output: PathBuf,
    /// Source duration for progress percentages; 0 when unknown
    pub duration_secs: f64,
}

/// Runs an encode job to completion.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EncoderRunner: Send + Sync {
    async fn run(&self, job: &EncodeJob, cancel: &CancellationToken) -> Result<(), EncodeFailure>;
}

pub struct FfmpegRunner {
    binary: PathBuf,
    timeout: Duration,
    log_interval: Duration,
}

impl FfmpegRunner {
    pub fn new(timeout: Duration, log_interval: Duration) -> Self {
        Self::with_binary("ffmpeg", timeout, log_interval)
    }

    pub fn with_binary(binary: impl Into<PathBuf>, timeout: Duration, log_interval: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
            log_interval,
        }
    }
}

#[async_trait]
impl EncoderRunner for FfmpegRunner {
    async fn run(&self, job: &EncodeJob, cancel: &CancellationToken) -> Result<(), EncodeFailure> {
        let mut child = Command::new(&self.binary)
            .args(&job.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                EncodeFailure::EncoderUnavailable(format!("{}: {}", self.binary.display(), e))
            })?;

        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| EncodeFailure::EncoderUnavailable("stderr not captured".to_string()))?;

        let mut monitor =
            ProgressMonitor::new(job.profile.to_string(), job.duration_secs, self.log_interval);
        let mut splitter = LineSplitter::default();
        let mut buf = [0u8; 4096];
        let mut stderr_open = true;

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        let status = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    return Err(EncodeFailure::Cancelled);
                }
                _ = &mut deadline => {
                    tracing::error!(profile = %job.profile, "Encoder exceeded {:?}, killing", self.timeout);
                    let _ = child.kill().await;
                    return Err(EncodeFailure::Timeout(self.timeout));
                }
                read = stderr.read(&mut buf), if stderr_open => match read {
                    Ok(0) | Err(_) => {
                        stderr_open = false;
                        if let Some(line) = splitter.finish() {
                            monitor.observe(&line);
                        }
                    }
                    Ok(n) => {
                        for line in splitter.push(&buf[..n]) {
                            monitor.observe(&line);
                        }
                    }
                },
                status = child.wait(), if !stderr_open => break status?,
            }
        };

        if !status.success() {
            if let Some(line) = monitor.device_failure() {
                return Err(EncodeFailure::DeviceFailure(line.to_string()));
            }
            return Err(match status.code() {
                Some(code) => EncodeFailure::Exit {
                    code,
                    detail: monitor.tail(FAILURE_TAIL_LINES),
                },
                None => EncodeFailure::Terminated,
            });
        }

        match tokio::fs::metadata(&job.output).await {
            Ok(m) if m.len() > 0 => Ok(()),
            _ => Err(EncodeFailure::MissingOutput(job.output.clone())),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn job(output: PathBuf, script: &str) -> EncodeJob {
        EncodeJob {
            profile: EncodeProfile::Software,
            args: vec!["-c".into(), script.into()],
            output,
            duration_secs: 10.0,
        }
    }

    fn sh_runner(timeout: Duration) -> FfmpegRunner {
        FfmpegRunner::with_binary("/bin/sh", timeout, Duration::from_secs(30))
    }

    #[tokio::test]
    async fn test_success_requires_non_empty_output() {
        let temp_dir = TempDir::new().unwrap();
        let output = temp_dir.path().join("out.mp4");
        let script = format!(
            "printf 'frame=1 time=00:00:01.00 speed=1x\\r' >&2; printf data > '{}'",
            output.display()
        );
        let result = sh_runner(Duration::from_secs(10))
            .run(&job(output.clone(), &script), &CancellationToken::new())
            .await;
        assert!(result.is_ok(), "{:?}", result);
    }

    #[tokio::test]
    async fn test_zero_exit_without_output_fails() {
        let temp_dir = TempDir::new().unwrap();
        let output = temp_dir.path().join("out.mp4");
        let result = sh_runner(Duration::from_secs(10))
            .run(&job(output, "exit 0"), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(EncodeFailure::MissingOutput(_))));
    }

    #[tokio::test]
    async fn test_exit_code_and_device_failure() {
        let temp_dir = TempDir::new().unwrap();
        let output = temp_dir.path().join("out.mp4");

        let result = sh_runner(Duration::from_secs(10))
            .run(
                &job(output.clone(), "echo 'Conversion failed!' >&2; exit 3"),
                &CancellationToken::new(),
            )
            .await;
        match result {
            Err(EncodeFailure::Exit { code, detail }) => {
                assert_eq!(code, 3);
                assert!(detail.contains("Conversion failed!"));
            }
            other => panic!("expected exit failure, got {:?}", other),
        }

        let result = sh_runner(Duration::from_secs(10))
            .run(
                &job(
                    output,
                    "echo 'Error initializing an internal MFX session: -9' >&2; exit 1",
                ),
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(EncodeFailure::DeviceFailure(_))));
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let temp_dir = TempDir::new().unwrap();
        let output = temp_dir.path().join("out.mp4");
        let result = sh_runner(Duration::from_millis(200))
            .run(&job(output, "exec sleep 30"), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(EncodeFailure::Timeout(_))));
    }

    #[tokio::test]
    async fn test_cancellation_kills_process() {
        let temp_dir = TempDir::new().unwrap();
        let output = temp_dir.path().join("out.mp4");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let result = sh_runner(Duration::from_secs(30))
            .run(&job(output, "exec sleep 30"), &cancel)
            .await;
        assert!(matches!(result, Err(EncodeFailure::Cancelled)));
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let runner = FfmpegRunner::with_binary(
            "/nonexistent/ffmpeg",
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let result = runner
            .run(&job(PathBuf::from("/tmp/x.mp4"), ""), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(EncodeFailure::EncoderUnavailable(_))));
    }
}
