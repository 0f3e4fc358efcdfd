//! Daemon startup and main loop.

use crate::catalog::CatalogServices;
use crate::config::{Config, ConfigError};
use crate::encode::{FfmpegRunner, Transcoder};
use crate::media::{FileCandidate, MediaKind};
use crate::pipeline::Orchestrator;
use crate::probe::{FfprobeProber, MediaProber};
use crate::scan::{LibraryRoot, ScanSettings, Scanner};
use crate::schedule::ProcessingWindow;
use crate::startup::{
    check_tools, connect_catalogs, probe_hardware, warn_if_working_not_empty, StartupError,
};
use crate::store::{CatalogStore, StoreError};
use crate::workspace::{Workspace, WorkspaceError};
use chrono::Local;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Workspace error: {0}")]
    Workspace(#[from] WorkspaceError),
}

/// Outcome of one scan-and-process pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub candidates: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Open the ledger as is. Used by the CLI commands.
pub fn open_store(config: &Config) -> Result<Arc<CatalogStore>, DaemonError> {
    Ok(Arc::new(CatalogStore::open(&config.paths.database)?))
}

/// Open the ledger for a daemon start, clearing it first when configured to.
fn open_daemon_store(config: &Config) -> Result<Arc<CatalogStore>, DaemonError> {
    let store = open_store(config)?;
    if config.debug.clear_database_on_start {
        store.clear_all()?;
        tracing::warn!(path = %config.paths.database.display(), "Cleared database on start");
    }
    Ok(store)
}

/// Scanner over the libraries of `active` kinds, probing with ffprobe.
pub fn build_scanner(
    config: &Config,
    store: Arc<CatalogStore>,
    prober: Arc<dyn MediaProber>,
    active: &[MediaKind],
) -> Scanner {
    Scanner::new(
        LibraryRoot::from_config(config, active),
        ScanSettings::from_config(config),
        store,
        prober,
    )
}

/// One scanner pass without processing anything. Services are not
/// contacted; every enabled library is listed.
pub async fn dry_run_scan(config: &Config) -> Result<Vec<FileCandidate>, DaemonError> {
    let store = open_store(config)?;
    let mut active = Vec::new();
    if config.radarr.enabled {
        active.push(MediaKind::Movie);
    }
    if config.sonarr.enabled {
        active.push(MediaKind::TvShow);
    }
    let prober: Arc<dyn MediaProber> = Arc::new(FfprobeProber::new());
    Ok(build_scanner(config, store, prober, &active).scan().await)
}

pub struct Daemon {
    config: Arc<Config>,
    scanner: Scanner,
    orchestrator: Orchestrator,
    window: ProcessingWindow,
    cancel: CancellationToken,
    /// Files whose job failed during this run; never retried before restart.
    failed: Mutex<HashSet<PathBuf>>,
}

impl Daemon {
    /// Full startup sequence:
    /// 1. ffmpeg and ffprobe are runnable
    /// 2. open (and optionally clear) the store
    /// 3. prepare working, completed and quarantine storage
    /// 4. probe the hardware encoder
    /// 5. connect catalog services, dropping unreachable ones
    pub async fn new(config: Arc<Config>, cancel: CancellationToken) -> Result<Self, DaemonError> {
        check_tools().await?;

        let store = open_daemon_store(&config)?;

        let workspace = Workspace::new(&config.paths.working, &config.paths.failed);
        workspace.ensure_dirs()?;
        std::fs::create_dir_all(&config.paths.completed).map_err(StartupError::from)?;
        warn_if_working_not_empty(&workspace);

        let hardware_usable = if config.transcode.use_hardware_acceleration {
            probe_hardware("ffmpeg", config.transcode.hardware_accel, &config.transcode).await
        } else {
            false
        };

        let catalogs = connect_catalogs(CatalogServices::from_config(&config)).await?;

        let prober: Arc<dyn MediaProber> = Arc::new(FfprobeProber::new());
        let runner = Arc::new(FfmpegRunner::new(
            Duration::from_secs(config.transcode.timeout_minutes.saturating_mul(60)),
            Duration::from_secs(config.transcode.progress_log_interval_secs),
        ));

        let scanner = build_scanner(&config, store.clone(), prober.clone(), &catalogs.active_kinds());
        let transcoder = Transcoder::new(&config.transcode, hardware_usable, prober, runner);
        let orchestrator = Orchestrator::new(
            workspace,
            transcoder,
            catalogs,
            store,
            config.library.clone(),
        );

        tracing::info!(
            hardware = ?transcoder_label(&config, hardware_usable),
            window = %ProcessingWindow::from_config(&config.schedule),
            debug = config.debug.debug_mode,
            "Daemon initialised"
        );

        Ok(Self::from_parts(config, scanner, orchestrator, cancel))
    }

    /// Assemble a daemon from already-built components, skipping startup checks.
    pub fn from_parts(
        config: Arc<Config>,
        scanner: Scanner,
        orchestrator: Orchestrator,
        cancel: CancellationToken,
    ) -> Self {
        let window = ProcessingWindow::from_config(&config.schedule);
        Self {
            config,
            scanner,
            orchestrator,
            window,
            cancel,
            failed: Mutex::new(HashSet::new()),
        }
    }

    /// Scan once and process candidates sequentially. Debug mode stops after
    /// the first candidate.
    pub async fn run_pass(&self) -> PassSummary {
        let mut candidates = self.scanner.scan().await;
        {
            let failed = self.failed_paths();
            candidates.retain(|c| {
                let keep = !failed.contains(&c.path);
                if !keep {
                    tracing::debug!(path = %c.path.display(), "Failed earlier in this run, skipping");
                }
                keep
            });
        }
        let mut summary = PassSummary {
            candidates: candidates.len(),
            ..PassSummary::default()
        };
        tracing::info!(count = candidates.len(), "Scan found candidates");

        for candidate in candidates {
            if self.cancel.is_cancelled() {
                break;
            }
            let path = candidate.path.clone();
            match self.orchestrator.process(candidate, &self.cancel).await {
                Ok(_) => summary.completed += 1,
                Err(_) => {
                    summary.failed += 1;
                    self.failed_paths().insert(path);
                }
            }
            if self.config.debug.debug_mode {
                break;
            }
        }

        tracing::info!(
            completed = summary.completed,
            failed = summary.failed,
            "Processing pass finished"
        );
        summary
    }

    /// Main loop. Returns after cancellation, or after one pass in debug mode.
    pub async fn run(self) -> Result<(), DaemonError> {
        let sleep_interval = Duration::from_secs(self.config.schedule.sleep_interval_secs);
        let debug_mode = self.config.debug.debug_mode;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let now = Local::now().time();
            if self.window.should_process(now, debug_mode) {
                self.run_pass().await;
                if debug_mode {
                    tracing::info!("Debug mode: single pass complete, exiting");
                    break;
                }
            } else {
                tracing::debug!(window = %self.window, "Outside processing window");
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(sleep_interval) => {}
            }
        }

        self.shutdown();
        Ok(())
    }

    fn failed_paths(&self) -> std::sync::MutexGuard<'_, HashSet<PathBuf>> {
        self.failed.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn shutdown(&self) {
        tracing::info!("Shutting down");
        let moved = self.orchestrator.workspace().sweep_to_quarantine();
        if moved > 0 {
            tracing::warn!(count = moved, "Moved leftovers from working storage to quarantine");
        }
    }
}

fn transcoder_label(config: &Config, hardware_usable: bool) -> Option<&'static str> {
    (config.transcode.use_hardware_acceleration && hardware_usable)
        .then(|| config.transcode.hardware_accel.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogError, CatalogService, CatalogUpdate, MockCatalogService};
    use crate::encode::ffmpeg::MockEncoderRunner;
    use crate::probe::{FormatInfo, MockMediaProber, ProbeResult, VideoStream};
    use crate::store::{ProcessStatus, ProcessedRecord};
    use std::collections::HashMap;
    use std::fs;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn uhd_probe() -> ProbeResult {
        ProbeResult {
            video_streams: vec![VideoStream {
                codec_name: "hevc".to_string(),
                width: 3840,
                height: 2160,
                pix_fmt: Some("yuv420p".to_string()),
                color_transfer: None,
                bitrate: None,
                side_data_types: vec![],
                tags: HashMap::new(),
            }],
            audio_streams: vec![],
            subtitle_streams: vec![],
            format: FormatInfo {
                duration_secs: 7200.0,
                bitrate: Some(8_000_000),
                size_bytes: 0,
            },
        }
    }

    fn config(root: &Path, debug_mode: bool) -> Config {
        let mut config = Config::default();
        config.paths.movies = root.join("movies");
        config.paths.tv = PathBuf::new();
        config.paths.working = root.join("temp/working");
        config.paths.completed = root.join("temp/completed");
        config.paths.failed = root.join("temp/failed");
        config.paths.database = root.join("db/transcoding.db");
        config.scan.min_file_age_hours = 0;
        config.transcode.use_hardware_acceleration = false;
        config.debug.debug_mode = debug_mode;
        config.sonarr.enabled = false;
        config.radarr.api_key = "key".to_string();
        config
    }

    fn daemon(
        config: Config,
        runner: MockEncoderRunner,
        service: MockCatalogService,
        cancel: CancellationToken,
    ) -> (Daemon, Arc<CatalogStore>) {
        let config = Arc::new(config);
        let store = Arc::new(CatalogStore::open_in_memory().unwrap());
        let mut prober = MockMediaProber::new();
        prober.expect_probe().returning(|_| Ok(uhd_probe()));
        let prober: Arc<dyn MediaProber> = Arc::new(prober);

        let workspace = Workspace::new(&config.paths.working, &config.paths.failed);
        workspace.ensure_dirs().unwrap();
        let service: Arc<dyn CatalogService> = Arc::new(service);
        let catalogs = CatalogServices::new(vec![service]);

        let scanner = build_scanner(&config, store.clone(), prober.clone(), &catalogs.active_kinds());
        let transcoder = Transcoder::new(&config.transcode, false, prober, Arc::new(runner));
        let orchestrator = Orchestrator::new(
            workspace,
            transcoder,
            catalogs,
            store.clone(),
            config.library.clone(),
        );
        (
            Daemon::from_parts(config, scanner, orchestrator, cancel),
            store,
        )
    }

    fn movie_service(updates: usize) -> MockCatalogService {
        let mut service = MockCatalogService::new();
        service.expect_kind().return_const(MediaKind::Movie);
        service.expect_name().return_const("radarr");
        service
            .expect_update_file_path()
            .times(updates)
            .returning(|_, _| {
                Ok(CatalogUpdate {
                    file_id: 1,
                    parent_id: Some(3),
                })
            });
        service.expect_rescan().returning(|_| Ok(()));
        service
    }

    fn encoding_runner(times: usize) -> MockEncoderRunner {
        let mut runner = MockEncoderRunner::new();
        runner.expect_run().times(times).returning(|job, _| {
            fs::write(&job.output, b"1080p").unwrap();
            Ok(())
        });
        runner
    }

    fn add_movie(root: &Path, folder: &str, file: &str) -> PathBuf {
        let dir = root.join("movies").join(folder);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(file);
        fs::write(&path, vec![0u8; 4096]).unwrap();
        path
    }

    #[tokio::test]
    async fn test_end_to_end_pass_replaces_uhd_movie() {
        let temp_dir = TempDir::new().unwrap();
        let original = add_movie(temp_dir.path(), "Film (2019)", "Film.2019.4K.HEVC.mkv");
        add_movie(temp_dir.path(), "Small (2020)", "Small.2020.1080p.mkv");

        let (daemon, store) = daemon(
            config(temp_dir.path(), false),
            encoding_runner(1),
            movie_service(1),
            CancellationToken::new(),
        );
        let summary = daemon.run_pass().await;

        assert_eq!(
            summary,
            PassSummary {
                candidates: 1,
                completed: 1,
                failed: 0
            }
        );
        assert!(!original.exists());
        let output = original.with_file_name("Film.2019.HEVC.1080p.mp4");
        assert_eq!(fs::read(&output).unwrap(), b"1080p");

        let record = store.get_record(&original).unwrap().unwrap();
        assert_eq!(record.status, ProcessStatus::Completed);
        assert_eq!(record.original_size, 4096);
        assert_eq!(record.output_size, Some(5));
    }

    #[tokio::test]
    async fn test_debug_mode_processes_first_candidate_then_exits() {
        let temp_dir = TempDir::new().unwrap();
        let first = add_movie(temp_dir.path(), "A (2019)", "A.2019.2160p.mkv");
        let second = add_movie(temp_dir.path(), "B (2019)", "B.2019.2160p.mkv");

        let (daemon, store) = daemon(
            config(temp_dir.path(), true),
            encoding_runner(1),
            movie_service(1),
            CancellationToken::new(),
        );
        daemon.run().await.unwrap();

        assert!(store.is_processed(&first).unwrap());
        assert!(!store.is_processed(&second).unwrap());
        assert!(second.exists());
    }

    #[tokio::test]
    async fn test_cancelled_daemon_sweeps_working_storage() {
        let temp_dir = TempDir::new().unwrap();
        let config = config(temp_dir.path(), false);
        let working = config.paths.working.clone();
        let failed = config.paths.failed.clone();
        let cancel = CancellationToken::new();

        let (daemon, _store) = daemon(
            config,
            MockEncoderRunner::new(),
            movie_service(0),
            cancel.clone(),
        );
        fs::write(working.join("working_leftover.mkv"), b"x").unwrap();

        cancel.cancel();
        daemon.run().await.unwrap();

        assert_eq!(fs::read_dir(&working).unwrap().count(), 0);
        assert!(failed.join("working_leftover.mkv").exists());
    }

    fn completed_record(path: &Path) -> ProcessedRecord {
        ProcessedRecord {
            file_path: path.to_string_lossy().into_owned(),
            output_filename: Some("Done.1080p.mp4".to_string()),
            original_size: 1,
            output_size: Some(1),
            attributes: Default::default(),
            kind: MediaKind::Movie,
            processing_secs: 1.0,
            status: ProcessStatus::Completed,
            error_message: None,
            processed_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_daemon_store_clears_when_configured() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = config(temp_dir.path(), false);
        {
            let store = open_store(&config).unwrap();
            store
                .cache_analysis(Path::new("/x.mkv"), 1, 1.0, &Default::default(), false)
                .unwrap();
        }
        config.debug.clear_database_on_start = true;
        let store = open_daemon_store(&config).unwrap();
        assert_eq!(store.stats().unwrap().cached_analyses, 0);
    }

    #[tokio::test]
    async fn test_cli_paths_never_clear_the_ledger() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = config(temp_dir.path(), false);
        fs::create_dir_all(&config.paths.movies).unwrap();
        open_store(&config)
            .unwrap()
            .mark_processed(&completed_record(Path::new("/movies/Done.2160p.mkv")))
            .unwrap();

        config.debug.clear_database_on_start = true;
        assert!(dry_run_scan(&config).await.unwrap().is_empty());
        assert_eq!(open_store(&config).unwrap().stats().unwrap().total_records, 1);
    }

    #[tokio::test]
    async fn test_failed_file_is_not_retried_in_the_same_run() {
        let temp_dir = TempDir::new().unwrap();
        let original = add_movie(temp_dir.path(), "Film (2019)", "Film.2019.2160p.mkv");

        let mut service = MockCatalogService::new();
        service.expect_kind().return_const(MediaKind::Movie);
        service.expect_name().return_const("radarr");
        service
            .expect_update_file_path()
            .times(1)
            .returning(|old, _| Err(CatalogError::NotFound(old.to_string())));
        service.expect_rescan().never();

        let (daemon, store) = daemon(
            config(temp_dir.path(), false),
            encoding_runner(1),
            service,
            CancellationToken::new(),
        );

        let first = daemon.run_pass().await;
        assert_eq!(
            first,
            PassSummary {
                candidates: 1,
                completed: 0,
                failed: 1
            }
        );
        let second = daemon.run_pass().await;
        assert_eq!(second, PassSummary::default());

        assert!(original.exists());
        assert!(!store.is_processed(&original).unwrap());
    }
}
