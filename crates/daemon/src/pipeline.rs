//! Per-file lifecycle: take the original, transcode, install, sync the
//! catalog, record. Any failure unwinds what was done so far.

use crate::catalog::{CatalogError, CatalogServices};
use crate::config::LibraryConfig;
use crate::encode::{EncodeFailure, Transcoder};
use crate::media::{FileCandidate, MediaKind};
use crate::naming::{catalog_relative_path, output_filename, with_file_name};
use crate::replace::{create_backup, install_output, ReplaceError};
use crate::store::{CatalogStore, ProcessStatus, ProcessedRecord};
use crate::workspace::{Workspace, WorkspaceError};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("Workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("Transcode failed: {0}")]
    Transcode(#[from] EncodeFailure),

    #[error("Install failed: {0}")]
    Replace(#[from] ReplaceError),

    #[error("Catalog update failed: {0}")]
    Catalog(#[from] CatalogError),

    #[error("No active catalog service for {0}")]
    NoCatalog(MediaKind),

    #[error("Cannot derive catalog path for {0}")]
    RelativePath(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Discovered,
    /// Original moved into working storage
    Working,
    /// Output written to working storage
    Transcoded,
    /// Output installed in the library
    Replaced,
    CatalogSynced,
    Recorded,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Discovered => "discovered",
            JobState::Working => "working",
            JobState::Transcoded => "transcoded",
            JobState::Replaced => "replaced",
            JobState::CatalogSynced => "catalog_synced",
            JobState::Recorded => "recorded",
            JobState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One processing attempt. Lives only for the duration of [`Orchestrator::process`].
#[derive(Debug)]
pub struct Job {
    pub candidate: FileCandidate,
    pub state: JobState,
    pub output_filename: String,
    /// Original while it sits in working storage
    pub working_copy: Option<PathBuf>,
    /// Transcode output while it sits in working storage
    pub output: Option<PathBuf>,
    /// Output once installed in the library
    pub installed: Option<PathBuf>,
    /// Backup copy of the original written beside it
    pub backup: Option<PathBuf>,
    started: Instant,
}

impl Job {
    pub fn new(candidate: FileCandidate) -> Self {
        let output_filename = output_filename(&candidate.path);
        Self {
            candidate,
            state: JobState::Discovered,
            output_filename,
            working_copy: None,
            output: None,
            installed: None,
            backup: None,
            started: Instant::now(),
        }
    }

    pub fn destination(&self) -> PathBuf {
        self.candidate.source_dir().join(&self.output_filename)
    }

    fn elapsed_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    fn transition(&mut self, next: JobState) {
        tracing::debug!(
            path = %self.candidate.path.display(),
            from = %self.state,
            to = %next,
            "Job state change"
        );
        self.state = next;
    }
}

pub struct Orchestrator {
    workspace: Workspace,
    transcoder: Transcoder,
    catalogs: CatalogServices,
    store: Arc<CatalogStore>,
    policy: LibraryConfig,
}

impl Orchestrator {
    pub fn new(
        workspace: Workspace,
        transcoder: Transcoder,
        catalogs: CatalogServices,
        store: Arc<CatalogStore>,
        policy: LibraryConfig,
    ) -> Self {
        Self {
            workspace,
            transcoder,
            catalogs,
            store,
            policy,
        }
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Run one candidate through the whole lifecycle. On error every
    /// completed step has been reversed as far as possible.
    pub async fn process(
        &self,
        candidate: FileCandidate,
        cancel: &CancellationToken,
    ) -> Result<ProcessedRecord, JobError> {
        let mut job = Job::new(candidate);
        tracing::info!(
            path = %job.candidate.path.display(),
            kind = %job.candidate.kind,
            output = %job.output_filename,
            "Processing file"
        );

        match self.advance(&mut job, cancel).await {
            Ok(record) => Ok(record),
            Err(e) => {
                self.fail(&mut job, &e);
                Err(e)
            }
        }
    }

    async fn advance(
        &self,
        job: &mut Job,
        cancel: &CancellationToken,
    ) -> Result<ProcessedRecord, JobError> {
        let kind = job.candidate.kind;
        let service = self.catalogs.for_kind(kind).ok_or(JobError::NoCatalog(kind))?;
        let old_relative = catalog_relative_path(&job.candidate.root, &job.candidate.path)
            .ok_or_else(|| JobError::RelativePath(job.candidate.path.clone()))?;
        let new_relative = with_file_name(&old_relative, &job.output_filename);

        let working_copy = self.workspace.take(&job.candidate.path)?;
        job.working_copy = Some(working_copy.clone());
        job.transition(JobState::Working);

        let output = self.workspace.output_path_for(&job.output_filename);
        let profile = self
            .transcoder
            .run(&working_copy, &output, &job.candidate.path, cancel)
            .await?;
        job.output = Some(output.clone());
        job.transition(JobState::Transcoded);
        tracing::info!(path = %job.candidate.path.display(), profile = %profile, "Transcoded");

        if self.policy.create_backups {
            let backup = create_backup(&working_copy, &job.candidate.path)?;
            tracing::info!(backup = %backup.display(), "Backup written");
            job.backup = Some(backup);
        }
        let destination = job.destination();
        install_output(&output, &destination)?;
        job.output = None;
        job.installed = Some(destination.clone());
        job.transition(JobState::Replaced);

        let update = service.update_file_path(&old_relative, &new_relative).await?;
        job.transition(JobState::CatalogSynced);
        if let Some(parent_id) = update.parent_id {
            if let Err(e) = service.rescan(parent_id).await {
                tracing::warn!(service = service.name(), parent_id, "Rescan request failed: {}", e);
            }
        }

        if let Err(e) = self.workspace.dispose(&working_copy) {
            tracing::warn!("Could not delete working original: {}", e);
        } else {
            job.working_copy = None;
        }

        let output_size = std::fs::metadata(&destination).map(|m| m.len()).ok();
        let record = ProcessedRecord {
            file_path: job.candidate.path.to_string_lossy().into_owned(),
            output_filename: Some(job.output_filename.clone()),
            original_size: job.candidate.size_bytes,
            output_size,
            attributes: job.candidate.attributes.clone(),
            kind,
            processing_secs: job.elapsed_secs(),
            status: ProcessStatus::Completed,
            error_message: None,
            processed_at: Utc::now(),
        };
        if let Err(e) = self.store.mark_processed(&record) {
            tracing::error!(path = %record.file_path, "Failed to write completed record: {}", e);
        }
        job.transition(JobState::Recorded);

        tracing::info!(
            path = %job.candidate.path.display(),
            original_size = record.original_size,
            output_size = record.output_size.unwrap_or(0),
            secs = record.processing_secs.round(),
            "Replaced with 1080p version"
        );
        Ok(record)
    }

    /// Reverse whatever `job` did, then quarantine what could not be put back.
    fn fail(&self, job: &mut Job, error: &JobError) {
        tracing::error!(
            path = %job.candidate.path.display(),
            state = %job.state,
            "Job failed: {}",
            error
        );

        if let Some(installed) = job.installed.take() {
            match self.workspace.quarantine(&installed) {
                Ok(moved) => tracing::warn!(
                    to = %moved.display(),
                    "Removed installed output from library"
                ),
                Err(e) => {
                    tracing::error!("Could not remove installed output: {}", e);
                    job.installed = Some(installed);
                }
            }
        }

        if let Some(working_copy) = job.working_copy.take() {
            if job.installed.is_some() {
                // Output is stuck in the library; the original goes to quarantine.
                job.working_copy = Some(working_copy);
            } else {
                match self.workspace.restore(&working_copy, &job.candidate.path) {
                    Ok(()) => {
                        tracing::info!(path = %job.candidate.path.display(), "Original restored");
                        self.discard_backup(job);
                    }
                    Err(e) => {
                        tracing::error!("Could not restore original: {}", e);
                        job.working_copy = Some(working_copy);
                    }
                }
            }
        }

        for leftover in [job.output.take(), job.working_copy.take()].into_iter().flatten() {
            if leftover.exists() {
                self.quarantine_logged(&leftover);
            }
        }

        job.transition(JobState::Failed);

        if self.policy.record_failures {
            let record = ProcessedRecord {
                file_path: job.candidate.path.to_string_lossy().into_owned(),
                output_filename: None,
                original_size: job.candidate.size_bytes,
                output_size: None,
                attributes: job.candidate.attributes.clone(),
                kind: job.candidate.kind,
                processing_secs: job.elapsed_secs(),
                status: ProcessStatus::Failed,
                error_message: Some(error.to_string()),
                processed_at: Utc::now(),
            };
            if let Err(e) = self.store.mark_processed(&record) {
                tracing::error!(path = %record.file_path, "Failed to write failure record: {}", e);
            }
        }
    }

    /// Only called once the original is back in place.
    fn discard_backup(&self, job: &mut Job) {
        if let Some(backup) = job.backup.take() {
            if let Err(e) = std::fs::remove_file(&backup) {
                tracing::warn!(backup = %backup.display(), "Could not delete backup: {}", e);
                job.backup = Some(backup);
            }
        }
    }

    fn quarantine_logged(&self, path: &Path) {
        match self.workspace.quarantine(path) {
            Ok(moved) => tracing::warn!(from = %path.display(), to = %moved.display(), "Quarantined"),
            Err(e) => tracing::error!(path = %path.display(), "Quarantine failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogService, CatalogUpdate, MockCatalogService};
    use crate::config::TranscodeConfig;
    use crate::encode::ffmpeg::MockEncoderRunner;
    use crate::media::MediaAttributes;
    use crate::probe::{FormatInfo, MockMediaProber, ProbeResult, VideoStream};
    use std::collections::HashMap;
    use std::fs;
    use tempfile::TempDir;

    const ORIGINAL_BYTES: &[u8] = b"a very large uhd original file";
    const ENCODED_BYTES: &[u8] = b"small";

    struct Fixture {
        _dir: TempDir,
        movies: PathBuf,
        original: PathBuf,
        workspace_root: PathBuf,
        store: Arc<CatalogStore>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let movies = dir.path().join("movies");
            let film_dir = movies.join("Film (2019)");
            fs::create_dir_all(&film_dir).unwrap();
            let original = film_dir.join("Film.2019.2160p.mkv");
            fs::write(&original, ORIGINAL_BYTES).unwrap();
            let workspace_root = dir.path().join("temp");
            Self {
                movies,
                original,
                workspace_root,
                store: Arc::new(CatalogStore::open_in_memory().unwrap()),
                _dir: dir,
            }
        }

        fn workspace(&self) -> Workspace {
            let ws = Workspace::new(
                self.workspace_root.join("working"),
                self.workspace_root.join("failed"),
            );
            ws.ensure_dirs().unwrap();
            ws
        }

        fn candidate(&self) -> FileCandidate {
            FileCandidate {
                path: self.original.clone(),
                root: self.movies.clone(),
                size_bytes: ORIGINAL_BYTES.len() as u64,
                mtime: 0.0,
                attributes: MediaAttributes {
                    duration_secs: 7200.0,
                    width: 3840,
                    height: 2160,
                    codec: "hevc".to_string(),
                    bitrate: 8_000_000,
                },
                kind: MediaKind::Movie,
            }
        }

        fn destination(&self) -> PathBuf {
            self.original.with_file_name("Film.2019.1080p.mp4")
        }

        fn quarantined(&self) -> Vec<String> {
            let mut names: Vec<String> = fs::read_dir(self.workspace_root.join("failed"))
                .unwrap()
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect();
            names.sort();
            names
        }

        fn working_is_empty(&self) -> bool {
            fs::read_dir(self.workspace_root.join("working")).unwrap().count() == 0
        }
    }

    fn prober() -> MockMediaProber {
        let mut prober = MockMediaProber::new();
        prober.expect_probe().returning(|_| {
            Ok(ProbeResult {
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
                    size_bytes: ORIGINAL_BYTES.len() as u64,
                },
            })
        });
        prober
    }

    fn succeeding_runner() -> MockEncoderRunner {
        let mut runner = MockEncoderRunner::new();
        runner.expect_run().times(1).returning(|job, _| {
            fs::write(&job.output, ENCODED_BYTES).unwrap();
            Ok(())
        });
        runner
    }

    fn failing_runner() -> MockEncoderRunner {
        let mut runner = MockEncoderRunner::new();
        runner.expect_run().returning(|_, _| {
            Err(EncodeFailure::Exit {
                code: 1,
                detail: "Conversion failed!".to_string(),
            })
        });
        runner
    }

    fn transcoder(runner: MockEncoderRunner) -> Transcoder {
        let config = TranscodeConfig {
            use_hardware_acceleration: false,
            ..TranscodeConfig::default()
        };
        Transcoder::new(&config, false, Arc::new(prober()), Arc::new(runner))
    }

    fn catalog(service: MockCatalogService) -> CatalogServices {
        let service: Arc<dyn CatalogService> = Arc::new(service);
        CatalogServices::new(vec![service])
    }

    fn movie_service() -> MockCatalogService {
        let mut service = MockCatalogService::new();
        service.expect_kind().return_const(MediaKind::Movie);
        service.expect_name().return_const("radarr");
        service
    }

    fn orchestrator(
        fx: &Fixture,
        runner: MockEncoderRunner,
        service: MockCatalogService,
        policy: LibraryConfig,
    ) -> Orchestrator {
        Orchestrator::new(
            fx.workspace(),
            transcoder(runner),
            catalog(service),
            fx.store.clone(),
            policy,
        )
    }

    #[tokio::test]
    async fn test_successful_job_replaces_and_records() {
        let fx = Fixture::new();
        let mut service = movie_service();
        service
            .expect_update_file_path()
            .withf(|old, new| old == "Film.2019.2160p.mkv" && new == "Film.2019.1080p.mp4")
            .times(1)
            .returning(|_, _| {
                Ok(CatalogUpdate {
                    file_id: 11,
                    parent_id: Some(5),
                })
            });
        service
            .expect_rescan()
            .withf(|id| *id == 5)
            .times(1)
            .returning(|_| Ok(()));

        let orchestrator =
            orchestrator(&fx, succeeding_runner(), service, LibraryConfig::default());
        let record = orchestrator
            .process(fx.candidate(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(!fx.original.exists());
        assert_eq!(fs::read(fx.destination()).unwrap(), ENCODED_BYTES);
        assert!(fx.working_is_empty());

        assert_eq!(record.status, ProcessStatus::Completed);
        assert_eq!(record.original_size, ORIGINAL_BYTES.len() as u64);
        assert_eq!(record.output_size, Some(ENCODED_BYTES.len() as u64));
        assert_eq!(record.output_filename.as_deref(), Some("Film.2019.1080p.mp4"));

        let stored = fx.store.get_record(&fx.original).unwrap().unwrap();
        assert_eq!(stored.status, ProcessStatus::Completed);
        assert_eq!(stored.output_size, Some(ENCODED_BYTES.len() as u64));
        assert_eq!(fx.store.stats().unwrap().total_records, 1);
    }

    #[tokio::test]
    async fn test_rescan_failure_does_not_fail_job() {
        let fx = Fixture::new();
        let mut service = movie_service();
        service.expect_update_file_path().returning(|_, _| {
            Ok(CatalogUpdate {
                file_id: 1,
                parent_id: Some(2),
            })
        });
        service.expect_rescan().returning(|_| {
            Err(CatalogError::Status {
                status: 500,
                body: String::new(),
            })
        });

        let orchestrator =
            orchestrator(&fx, succeeding_runner(), service, LibraryConfig::default());
        assert!(orchestrator
            .process(fx.candidate(), &CancellationToken::new())
            .await
            .is_ok());
        assert!(fx.store.is_processed(&fx.original).unwrap());
    }

    #[tokio::test]
    async fn test_transcode_failure_restores_original_without_record() {
        let fx = Fixture::new();
        let orchestrator = orchestrator(
            &fx,
            failing_runner(),
            movie_service(),
            LibraryConfig::default(),
        );

        let result = orchestrator
            .process(fx.candidate(), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(JobError::Transcode(_))));

        assert_eq!(fs::read(&fx.original).unwrap(), ORIGINAL_BYTES);
        assert!(!fx.destination().exists());
        assert!(fx.working_is_empty());
        assert!(!fx.store.is_processed(&fx.original).unwrap());
    }

    #[tokio::test]
    async fn test_catalog_failure_reverses_replacement() {
        let fx = Fixture::new();
        let mut service = movie_service();
        service
            .expect_update_file_path()
            .returning(|old, _| Err(CatalogError::NotFound(old.to_string())));
        service.expect_rescan().never();

        let orchestrator =
            orchestrator(&fx, succeeding_runner(), service, LibraryConfig::default());
        let result = orchestrator
            .process(fx.candidate(), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(JobError::Catalog(_))));

        assert_eq!(fs::read(&fx.original).unwrap(), ORIGINAL_BYTES);
        assert!(!fx.destination().exists());
        assert!(fx.working_is_empty());
        assert_eq!(fx.quarantined(), vec!["Film.2019.1080p.mp4".to_string()]);
        assert!(!fx.store.is_processed(&fx.original).unwrap());
    }

    #[tokio::test]
    async fn test_occupied_destination_restores_and_quarantines_output() {
        let fx = Fixture::new();
        fs::write(fx.destination(), b"someone else's file").unwrap();

        let orchestrator = orchestrator(
            &fx,
            succeeding_runner(),
            movie_service(),
            LibraryConfig::default(),
        );
        let result = orchestrator
            .process(fx.candidate(), &CancellationToken::new())
            .await;
        assert!(matches!(
            result,
            Err(JobError::Replace(ReplaceError::DestinationExists(_)))
        ));

        assert_eq!(fs::read(&fx.original).unwrap(), ORIGINAL_BYTES);
        assert_eq!(fs::read(fx.destination()).unwrap(), b"someone else's file");
        assert_eq!(fx.quarantined(), vec!["Film.2019.1080p.mp4".to_string()]);
        assert!(fx.working_is_empty());
    }

    #[tokio::test]
    async fn test_failure_record_written_when_enabled() {
        let fx = Fixture::new();
        let policy = LibraryConfig {
            record_failures: true,
            ..LibraryConfig::default()
        };
        let orchestrator = orchestrator(&fx, failing_runner(), movie_service(), policy);

        assert!(orchestrator
            .process(fx.candidate(), &CancellationToken::new())
            .await
            .is_err());

        let record = fx.store.get_record(&fx.original).unwrap().unwrap();
        assert_eq!(record.status, ProcessStatus::Failed);
        assert!(record
            .error_message
            .unwrap()
            .contains("Conversion failed!"));
    }

    #[tokio::test]
    async fn test_backup_written_when_enabled() {
        let fx = Fixture::new();
        let mut service = movie_service();
        service.expect_update_file_path().returning(|_, _| {
            Ok(CatalogUpdate {
                file_id: 1,
                parent_id: None,
            })
        });
        service.expect_rescan().never();

        let policy = LibraryConfig {
            create_backups: true,
            ..LibraryConfig::default()
        };
        let orchestrator = orchestrator(&fx, succeeding_runner(), service, policy);
        orchestrator
            .process(fx.candidate(), &CancellationToken::new())
            .await
            .unwrap();

        let backups: Vec<PathBuf> = fs::read_dir(fx.original.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.to_string_lossy().contains(".orig."))
            .collect();
        assert_eq!(backups.len(), 1);
        assert_eq!(fs::read(&backups[0]).unwrap(), ORIGINAL_BYTES);
    }

    #[tokio::test]
    async fn test_backup_removed_when_job_rolls_back() {
        let fx = Fixture::new();
        let mut service = movie_service();
        service
            .expect_update_file_path()
            .returning(|old, _| Err(CatalogError::NotFound(old.to_string())));
        service.expect_rescan().never();

        let policy = LibraryConfig {
            create_backups: true,
            ..LibraryConfig::default()
        };
        let orchestrator = orchestrator(&fx, succeeding_runner(), service, policy);
        assert!(orchestrator
            .process(fx.candidate(), &CancellationToken::new())
            .await
            .is_err());

        assert_eq!(fs::read(&fx.original).unwrap(), ORIGINAL_BYTES);
        let mut left: Vec<String> = fs::read_dir(fx.original.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        assert_eq!(left, vec!["Film.2019.2160p.mkv".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_catalog_fails_before_touching_files() {
        let fx = Fixture::new();
        let mut service = MockCatalogService::new();
        service.expect_kind().return_const(MediaKind::TvShow);
        service.expect_name().return_const("sonarr");

        let orchestrator = Orchestrator::new(
            fx.workspace(),
            transcoder(MockEncoderRunner::new()),
            catalog(service),
            fx.store.clone(),
            LibraryConfig::default(),
        );
        let result = orchestrator
            .process(fx.candidate(), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(JobError::NoCatalog(MediaKind::Movie))));
        assert_eq!(fs::read(&fx.original).unwrap(), ORIGINAL_BYTES);
    }

    #[test]
    fn test_job_destination_is_beside_original() {
        let fx = Fixture::new();
        let job = Job::new(fx.candidate());
        assert_eq!(job.state, JobState::Discovered);
        assert_eq!(job.destination(), fx.destination());
    }
}
