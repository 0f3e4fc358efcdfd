//! Catalog store: the processed-file ledger and the analysis cache.
//!
//! The ledger is the only source of truth for whether a path has already been
//! handled. Every write is committed before the call returns.

pub mod migrations;

use crate::media::{MediaAttributes, MediaKind};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

pub use migrations::MigrationError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),

    #[error("Failed to create database directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store connection lock poisoned")]
    Poisoned,

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

/// Outcome recorded for a processed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Completed,
    Failed,
}

impl ProcessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::Completed => "completed",
            ProcessStatus::Failed => "failed",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "completed" => Some(ProcessStatus::Completed),
            "failed" => Some(ProcessStatus::Failed),
            _ => None,
        }
    }
}

/// One ledger row.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedRecord {
    pub file_path: String,
    pub output_filename: Option<String>,
    pub original_size: u64,
    pub output_size: Option<u64>,
    pub attributes: MediaAttributes,
    pub kind: MediaKind,
    pub processing_secs: f64,
    pub status: ProcessStatus,
    pub error_message: Option<String>,
    pub processed_at: DateTime<Utc>,
}

/// A cache hit: the attributes and the verdict computed when they were probed.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedAnalysis {
    pub attributes: MediaAttributes,
    pub needs_transcoding: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreStats {
    pub total_records: u64,
    pub completed: u64,
    pub failed: u64,
    pub cached_analyses: u64,
    /// Original minus output size, summed over completed records
    pub bytes_saved: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DailyStats {
    /// `YYYY-MM-DD` in UTC
    pub date: String,
    pub files_processed: u64,
    pub completed: u64,
    pub bytes_saved: i64,
    pub total_processing_secs: f64,
    pub avg_processing_secs: f64,
}

impl DailyStats {
    pub fn success_rate(&self) -> f64 {
        if self.files_processed == 0 {
            0.0
        } else {
            self.completed as f64 / self.files_processed as f64 * 100.0
        }
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// SQLite-backed ledger and cache.
pub struct CatalogStore {
    conn: Mutex<Connection>,
}

impl CatalogStore {
    /// Open (creating if needed) the store file and apply migrations.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        migrations::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// True if any record exists for the path, whatever its status.
    pub fn is_processed(&self, path: &Path) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM processed_files WHERE file_path = ?1",
                [path_key(path)],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Insert or replace the record for `record.file_path`.
    pub fn mark_processed(&self, record: &ProcessedRecord) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO processed_files (
                file_path, output_filename, original_size, output_size,
                duration_secs, width, height, codec, bitrate, media_kind,
                processing_secs, status, error_message, processed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                record.file_path,
                record.output_filename,
                record.original_size as i64,
                record.output_size.map(|s| s as i64),
                record.attributes.duration_secs,
                record.attributes.width,
                record.attributes.height,
                record.attributes.codec,
                record.attributes.bitrate as i64,
                record.kind.as_str(),
                record.processing_secs,
                record.status.as_str(),
                record.error_message,
                timestamp(record.processed_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_record(&self, path: &Path) -> Result<Option<ProcessedRecord>, StoreError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT file_path, output_filename, original_size, output_size,
                        duration_secs, width, height, codec, bitrate, media_kind,
                        processing_secs, status, error_message, processed_at
                 FROM processed_files WHERE file_path = ?1",
                [path_key(path)],
                RawRecord::from_row,
            )
            .optional()?;
        row.map(RawRecord::into_record).transpose()
    }

    /// Cached analysis for the exact (path, size, mtime) triplet, if any.
    pub fn get_cached_analysis(
        &self,
        path: &Path,
        size: u64,
        mtime: f64,
    ) -> Result<Option<CachedAnalysis>, StoreError> {
        let conn = self.conn()?;
        let hit = conn
            .query_row(
                "SELECT duration_secs, width, height, codec, bitrate, needs_transcoding
                 FROM file_analysis_cache
                 WHERE file_path = ?1 AND file_size = ?2 AND file_mtime = ?3",
                params![path_key(path), size as i64, mtime],
                |row| {
                    Ok(CachedAnalysis {
                        attributes: MediaAttributes {
                            duration_secs: row.get(0)?,
                            width: row.get(1)?,
                            height: row.get(2)?,
                            codec: row.get(3)?,
                            bitrate: row.get::<_, i64>(4)?.max(0) as u64,
                        },
                        needs_transcoding: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(hit)
    }

    /// Store a fresh analysis, replacing any earlier one for the path.
    pub fn cache_analysis(
        &self,
        path: &Path,
        size: u64,
        mtime: f64,
        attributes: &MediaAttributes,
        needs_transcoding: bool,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO file_analysis_cache (
                file_path, file_size, file_mtime, duration_secs, width, height,
                codec, bitrate, needs_transcoding, analyzed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                path_key(path),
                size as i64,
                mtime,
                attributes.duration_secs,
                attributes.width,
                attributes.height,
                attributes.codec,
                attributes.bitrate as i64,
                needs_transcoding,
                timestamp(Utc::now()),
            ],
        )?;
        Ok(())
    }

    /// Delete every non-completed record so those files are retried.
    pub fn clear_failed_records(&self) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        Ok(conn.execute(
            "DELETE FROM processed_files WHERE status != 'completed'",
            [],
        )?)
    }

    /// Truncate both the ledger and the cache.
    pub fn clear_all(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute_batch(
            "BEGIN;
             DELETE FROM processed_files;
             DELETE FROM file_analysis_cache;
             COMMIT;",
        )?;
        Ok(())
    }

    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let conn = self.conn()?;
        let (total, completed, failed, saved) = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'completed'
                        THEN original_size - COALESCE(output_size, original_size)
                        ELSE 0 END), 0)
             FROM processed_files",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            },
        )?;
        let cached: i64 =
            conn.query_row("SELECT COUNT(*) FROM file_analysis_cache", [], |row| row.get(0))?;

        Ok(StoreStats {
            total_records: total.max(0) as u64,
            completed: completed.max(0) as u64,
            failed: failed.max(0) as u64,
            cached_analyses: cached.max(0) as u64,
            bytes_saved: saved,
        })
    }

    /// Per-day activity over the last `days` days, newest first.
    pub fn daily_stats(&self, days: u32) -> Result<Vec<DailyStats>, StoreError> {
        let cutoff = timestamp(Utc::now() - Duration::days(i64::from(days)));
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT substr(processed_at, 1, 10) AS day,
                    COUNT(*),
                    SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END),
                    COALESCE(SUM(CASE WHEN status = 'completed'
                        THEN original_size - COALESCE(output_size, original_size)
                        ELSE 0 END), 0),
                    COALESCE(SUM(processing_secs), 0),
                    COALESCE(AVG(processing_secs), 0)
             FROM processed_files
             WHERE processed_at >= ?1
             GROUP BY day
             ORDER BY day DESC",
        )?;
        let rows = stmt.query_map([cutoff], |row| {
            Ok(DailyStats {
                date: row.get(0)?,
                files_processed: row.get::<_, i64>(1)?.max(0) as u64,
                completed: row.get::<_, i64>(2)?.max(0) as u64,
                bytes_saved: row.get(3)?,
                total_processing_secs: row.get(4)?,
                avg_processing_secs: row.get(5)?,
            })
        })?;
        let days = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(days)
    }

    /// Delete ledger rows older than `days` days. Returns rows removed.
    pub fn prune_records_older_than(&self, days: u32) -> Result<usize, StoreError> {
        let cutoff = timestamp(Utc::now() - Duration::days(i64::from(days)));
        let conn = self.conn()?;
        Ok(conn.execute(
            "DELETE FROM processed_files WHERE processed_at < ?1",
            [cutoff],
        )?)
    }
}

/// Row image before enum and timestamp columns are validated.
struct RawRecord {
    file_path: String,
    output_filename: Option<String>,
    original_size: i64,
    output_size: Option<i64>,
    attributes: MediaAttributes,
    kind: String,
    processing_secs: f64,
    status: String,
    error_message: Option<String>,
    processed_at: String,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            file_path: row.get(0)?,
            output_filename: row.get(1)?,
            original_size: row.get(2)?,
            output_size: row.get(3)?,
            attributes: MediaAttributes {
                duration_secs: row.get(4)?,
                width: row.get(5)?,
                height: row.get(6)?,
                codec: row.get(7)?,
                bitrate: row.get::<_, i64>(8)?.max(0) as u64,
            },
            kind: row.get(9)?,
            processing_secs: row.get(10)?,
            status: row.get(11)?,
            error_message: row.get(12)?,
            processed_at: row.get(13)?,
        })
    }

    fn into_record(self) -> Result<ProcessedRecord, StoreError> {
        let kind = MediaKind::parse(&self.kind)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown media kind '{}'", self.kind)))?;
        let status = ProcessStatus::parse(&self.status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown status '{}'", self.status)))?;
        let processed_at = DateTime::parse_from_rfc3339(&self.processed_at)
            .map_err(|e| StoreError::Corrupt(format!("bad timestamp: {}", e)))?
            .with_timezone(&Utc);

        Ok(ProcessedRecord {
            file_path: self.file_path,
            output_filename: self.output_filename,
            original_size: self.original_size.max(0) as u64,
            output_size: self.output_size.map(|s| s.max(0) as u64),
            attributes: self.attributes,
            kind,
            processing_secs: self.processing_secs,
            status,
            error_message: self.error_message,
            processed_at,
        })
    }
}
