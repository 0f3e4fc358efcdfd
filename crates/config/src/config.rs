//! Core configuration structures and loading logic

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const DEFAULT_SONARR_URL: &str = "http://sonarr:8989";
const DEFAULT_RADARR_URL: &str = "http://radarr:7878";

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Values parsed but violate a constraint
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// `HH:MM` wall-clock times in TOML
mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub const FORMAT: &str = "%H:%M";

    pub fn serialize<S: Serializer>(time: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&time.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveTime::parse_from_str(raw.trim(), FORMAT).map_err(serde::de::Error::custom)
    }
}

/// Parse an `HH:MM` string the same way the TOML loader does.
pub fn parse_hhmm(raw: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(raw.trim(), hhmm::FORMAT).ok()
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

/// Filesystem locations. An empty library path disables that library.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathsConfig {
    #[serde(default = "default_movies_path")]
    pub movies: PathBuf,
    #[serde(default = "default_tv_path")]
    pub tv: PathBuf,
    /// Exclusive-use staging area for the file currently being processed
    #[serde(default = "default_working_path")]
    pub working: PathBuf,
    /// Reserved; created at startup but not written to
    #[serde(default = "default_completed_path")]
    pub completed: PathBuf,
    /// Quarantine for leftovers of failed attempts
    #[serde(default = "default_failed_path")]
    pub failed: PathBuf,
    #[serde(default = "default_database_path")]
    pub database: PathBuf,
}

fn default_movies_path() -> PathBuf {
    PathBuf::from("/data/movies")
}

fn default_tv_path() -> PathBuf {
    PathBuf::from("/data/tv")
}

fn default_working_path() -> PathBuf {
    PathBuf::from("/data/temp/working")
}

fn default_completed_path() -> PathBuf {
    PathBuf::from("/data/temp/completed")
}

fn default_failed_path() -> PathBuf {
    PathBuf::from("/data/temp/failed")
}

fn default_database_path() -> PathBuf {
    PathBuf::from("/data/database/transcoding.db")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            movies: default_movies_path(),
            tv: default_tv_path(),
            working: default_working_path(),
            completed: default_completed_path(),
            failed: default_failed_path(),
            database: default_database_path(),
        }
    }
}

/// Candidate selection thresholds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanConfig {
    /// Files younger than this are still being written or seeded
    #[serde(default = "default_min_file_age_hours")]
    pub min_file_age_hours: u64,
    /// Files below this bitrate are not worth re-encoding
    #[serde(default = "default_min_bitrate_kbps")]
    pub min_bitrate_kbps: u64,
}

fn default_min_file_age_hours() -> u64 {
    24
}

fn default_min_bitrate_kbps() -> u64 {
    500
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            min_file_age_hours: default_min_file_age_hours(),
            min_bitrate_kbps: default_min_bitrate_kbps(),
        }
    }
}

/// Daily processing window and poll interval
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleConfig {
    #[serde(default = "default_start_time", with = "hhmm")]
    pub start_time: NaiveTime,
    #[serde(default = "default_end_time", with = "hhmm")]
    pub end_time: NaiveTime,
    #[serde(default = "default_sleep_interval_secs")]
    pub sleep_interval_secs: u64,
}

fn default_start_time() -> NaiveTime {
    NaiveTime::from_hms_opt(2, 0, 0).unwrap_or(NaiveTime::MIN)
}

fn default_end_time() -> NaiveTime {
    NaiveTime::from_hms_opt(10, 0, 0).unwrap_or(NaiveTime::MIN)
}

fn default_sleep_interval_secs() -> u64 {
    300
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            start_time: default_start_time(),
            end_time: default_end_time(),
            sleep_interval_secs: default_sleep_interval_secs(),
        }
    }
}

/// Hardware encoder family
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HardwareAccel {
    Qsv,
    Vaapi,
    Nvenc,
}

impl HardwareAccel {
    pub fn as_str(&self) -> &'static str {
        match self {
            HardwareAccel::Qsv => "qsv",
            HardwareAccel::Vaapi => "vaapi",
            HardwareAccel::Nvenc => "nvenc",
        }
    }

    /// Name of the H.264 encoder ffmpeg exposes for this family
    pub fn encoder_name(&self) -> &'static str {
        match self {
            HardwareAccel::Qsv => "h264_qsv",
            HardwareAccel::Vaapi => "h264_vaapi",
            HardwareAccel::Nvenc => "h264_nvenc",
        }
    }
}

impl FromStr for HardwareAccel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "qsv" => Ok(HardwareAccel::Qsv),
            "vaapi" => Ok(HardwareAccel::Vaapi),
            "nvenc" | "cuda" => Ok(HardwareAccel::Nvenc),
            other => Err(ConfigError::Invalid(format!(
                "unknown hardware accelerator '{}'",
                other
            ))),
        }
    }
}

/// How the encoder profile is chosen for a file
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TranscodeStrategy {
    /// HDR and 10-bit sources go straight to software
    HdrAware,
    /// Always try hardware first
    HardwareFirst,
}

impl FromStr for TranscodeStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "hdr_aware" | "hdr-aware" => Ok(TranscodeStrategy::HdrAware),
            "hardware_first" | "hardware-first" => Ok(TranscodeStrategy::HardwareFirst),
            other => Err(ConfigError::Invalid(format!(
                "unknown transcode strategy '{}'",
                other
            ))),
        }
    }
}

/// Encoder settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscodeConfig {
    /// Quality factor, 0-51
    #[serde(default = "default_crf")]
    pub crf: u8,
    #[serde(default = "default_audio_bitrate_kbps")]
    pub audio_bitrate_kbps: u32,
    #[serde(default = "default_preset")]
    pub preset: String,
    #[serde(default = "default_true")]
    pub use_hardware_acceleration: bool,
    #[serde(default = "default_hardware_accel")]
    pub hardware_accel: HardwareAccel,
    #[serde(default = "default_strategy")]
    pub strategy: TranscodeStrategy,
    /// Wall-clock limit for one encoder invocation
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u64,
    #[serde(default = "default_progress_log_interval_secs")]
    pub progress_log_interval_secs: u64,
}

fn default_crf() -> u8 {
    23
}

fn default_audio_bitrate_kbps() -> u32 {
    128
}

fn default_preset() -> String {
    "medium".to_string()
}

fn default_true() -> bool {
    true
}

fn default_hardware_accel() -> HardwareAccel {
    HardwareAccel::Qsv
}

fn default_strategy() -> TranscodeStrategy {
    TranscodeStrategy::HdrAware
}

fn default_timeout_minutes() -> u64 {
    30
}

fn default_progress_log_interval_secs() -> u64 {
    30
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            crf: default_crf(),
            audio_bitrate_kbps: default_audio_bitrate_kbps(),
            preset: default_preset(),
            use_hardware_acceleration: true,
            hardware_accel: default_hardware_accel(),
            strategy: default_strategy(),
            timeout_minutes: default_timeout_minutes(),
            progress_log_interval_secs: default_progress_log_interval_secs(),
        }
    }
}

/// Library mutation policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct LibraryConfig {
    /// Keep `<original>.orig.<ts>` next to the replaced file
    #[serde(default)]
    pub create_backups: bool,
    /// Write a `failed` ledger row when a job fails; failed paths are then skipped until cleared
    #[serde(default)]
    pub record_failures: bool,
}

/// Connection settings for one catalog service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Falls back to the service's conventional URL when empty
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub api_key: String,
}

impl ServiceConfig {
    fn with_url(url: &str) -> Self {
        Self {
            enabled: true,
            url: url.to_string(),
            api_key: String::new(),
        }
    }
}

fn default_sonarr() -> ServiceConfig {
    ServiceConfig::with_url(DEFAULT_SONARR_URL)
}

fn default_radarr() -> ServiceConfig {
    ServiceConfig::with_url(DEFAULT_RADARR_URL)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DebugConfig {
    /// Ignore the window and process a single candidate, then exit
    #[serde(default)]
    pub debug_mode: bool,
    #[serde(default)]
    pub clear_database_on_start: bool,
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub transcode: TranscodeConfig,
    #[serde(default)]
    pub library: LibraryConfig,
    #[serde(default = "default_sonarr")]
    pub sonarr: ServiceConfig,
    #[serde(default = "default_radarr")]
    pub radarr: ServiceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub debug: DebugConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            scan: ScanConfig::default(),
            schedule: ScheduleConfig::default(),
            transcode: TranscodeConfig::default(),
            library: LibraryConfig::default(),
            sonarr: default_sonarr(),
            radarr: default_radarr(),
            logging: LoggingConfig::default(),
            debug: DebugConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(content)?;
        config.fill_service_urls();
        Ok(config)
    }

    fn fill_service_urls(&mut self) {
        if self.sonarr.url.trim().is_empty() {
            self.sonarr.url = DEFAULT_SONARR_URL.to_string();
        }
        if self.radarr.url.trim().is_empty() {
            self.radarr.url = DEFAULT_RADARR_URL.to_string();
        }
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Unparseable values are ignored and the existing value is kept.
    pub fn apply_env_overrides(&mut self) {
        override_path("MOVIES_PATH", &mut self.paths.movies);
        override_path("TV_PATH", &mut self.paths.tv);
        override_path("WORKING_PATH", &mut self.paths.working);
        override_path("COMPLETED_PATH", &mut self.paths.completed);
        override_path("FAILED_PATH", &mut self.paths.failed);
        override_path("DATABASE_PATH", &mut self.paths.database);

        override_parsed("MIN_FILE_AGE_HOURS", &mut self.scan.min_file_age_hours);
        override_parsed("MIN_BITRATE_KBPS", &mut self.scan.min_bitrate_kbps);

        override_parsed("SLEEP_INTERVAL", &mut self.schedule.sleep_interval_secs);
        if let Some(t) = env::var("START_TIME").ok().and_then(|v| parse_hhmm(&v)) {
            self.schedule.start_time = t;
        }
        if let Some(t) = env::var("END_TIME").ok().and_then(|v| parse_hhmm(&v)) {
            self.schedule.end_time = t;
        }

        override_parsed("CRF_QUALITY", &mut self.transcode.crf);
        override_parsed("AUDIO_BITRATE", &mut self.transcode.audio_bitrate_kbps);
        if let Ok(val) = env::var("FFMPEG_PRESET") {
            if !val.trim().is_empty() {
                self.transcode.preset = val.trim().to_string();
            }
        }
        override_bool("USE_HWACCEL", &mut self.transcode.use_hardware_acceleration);
        override_parsed("HARDWARE_ACCEL", &mut self.transcode.hardware_accel);
        override_parsed("TRANSCODE_STRATEGY", &mut self.transcode.strategy);
        override_parsed(
            "TRANSCODE_TIMEOUT_MINUTES",
            &mut self.transcode.timeout_minutes,
        );

        override_bool("CREATE_BACKUPS", &mut self.library.create_backups);
        override_bool("RECORD_FAILURES", &mut self.library.record_failures);

        override_service("SONARR", &mut self.sonarr);
        override_service("RADARR", &mut self.radarr);

        if let Ok(val) = env::var("LOG_LEVEL") {
            if !val.trim().is_empty() {
                self.logging.level = val.trim().to_lowercase();
            }
        }

        override_bool("DEBUG_MODE", &mut self.debug.debug_mode);
        override_bool(
            "CLEAR_DATABASE_ON_START",
            &mut self.debug.clear_database_on_start,
        );
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Resolve the effective configuration for a run.
    ///
    /// Without a file the defaults are used. Environment overrides are applied
    /// in both cases and the result is validated.
    pub fn resolve(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::load(path)?,
            None => {
                let mut config = Self::default();
                config.apply_env_overrides();
                config
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.paths.movies.as_os_str().is_empty() && self.paths.tv.as_os_str().is_empty() {
            problems.push("at least one of paths.movies or paths.tv must be set".to_string());
        }
        if self.sonarr.enabled && self.sonarr.api_key.trim().is_empty() {
            problems.push("sonarr is enabled but sonarr.api_key is empty".to_string());
        }
        if self.radarr.enabled && self.radarr.api_key.trim().is_empty() {
            problems.push("radarr is enabled but radarr.api_key is empty".to_string());
        }
        if self.schedule.start_time == self.schedule.end_time {
            problems.push("schedule.start_time and schedule.end_time must differ".to_string());
        }
        if self.transcode.crf > 51 {
            problems.push(format!(
                "transcode.crf must be between 0 and 51, got {}",
                self.transcode.crf
            ));
        }
        if !(64..=320).contains(&self.transcode.audio_bitrate_kbps) {
            problems.push(format!(
                "transcode.audio_bitrate_kbps must be between 64 and 320, got {}",
                self.transcode.audio_bitrate_kbps
            ));
        }
        if self.transcode.timeout_minutes == 0 {
            problems.push("transcode.timeout_minutes must be positive".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems.join("; ")))
        }
    }
}

fn override_path(var: &str, target: &mut PathBuf) {
    if let Ok(val) = env::var(var) {
        *target = PathBuf::from(val.trim());
    }
}

fn override_parsed<T: FromStr>(var: &str, target: &mut T) {
    if let Some(parsed) = env::var(var).ok().and_then(|v| v.trim().parse::<T>().ok()) {
        *target = parsed;
    }
}

fn override_bool(var: &str, target: &mut bool) {
    if let Some(parsed) = env::var(var).ok().and_then(|v| parse_bool(&v)) {
        *target = parsed;
    }
}

fn override_service(prefix: &str, service: &mut ServiceConfig) {
    override_bool(&format!("{}_ENABLED", prefix), &mut service.enabled);
    if let Ok(val) = env::var(format!("{}_URL", prefix)) {
        if !val.trim().is_empty() {
            service.url = val.trim().to_string();
        }
    }
    if let Ok(val) = env::var(format!("{}_API_KEY", prefix)) {
        service.api_key = val.trim().to_string();
    }
}
