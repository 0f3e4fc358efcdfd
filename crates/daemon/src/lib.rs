//! UHD Downscaler
//!
//! Background service that finds high-resolution videos in the movie and TV
//! libraries, transcodes them to 1080p H.264 MP4, swaps them in place and
//! keeps the catalog services in step.

pub mod catalog;
pub mod daemon;
pub mod encode;
pub mod media;
pub mod naming;
pub mod pipeline;
pub mod probe;
pub mod replace;
pub mod scan;
pub mod schedule;
pub mod startup;
pub mod store;
pub mod workspace;

pub use uhd_downscaler_config as config;
pub use uhd_downscaler_config::Config;
pub use catalog::{ArrClient, ArrFlavor, CatalogError, CatalogService, CatalogServices};
pub use daemon::{dry_run_scan, open_store, Daemon, DaemonError, PassSummary};
pub use encode::{plan_profiles, EncodeFailure, EncodeProfile, FfmpegRunner, Transcoder};
pub use media::{FileCandidate, MediaAttributes, MediaKind};
pub use pipeline::{Job, JobError, JobState, Orchestrator};
pub use probe::{FfprobeProber, MediaProber, ProbeError, ProbeResult};
pub use scan::{LibraryRoot, ScanSettings, Scanner};
pub use schedule::ProcessingWindow;
pub use startup::StartupError;
pub use store::{CatalogStore, DailyStats, ProcessStatus, ProcessedRecord, StoreError, StoreStats};
pub use workspace::{Workspace, WorkspaceError};
