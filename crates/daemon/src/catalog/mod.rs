//! External media catalogs that must learn about every replaced file.

pub mod client;

pub use client::{ArrClient, ArrFlavor};

use crate::config::Config;
use crate::media::MediaKind;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("No file record with relative path {0:?}")]
    NotFound(String),

    #[error("Malformed file record: {0}")]
    InvalidRecord(String),
}

/// Identifiers touched by a successful path update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogUpdate {
    pub file_id: i64,
    /// Series or movie that owns the file, when the record names one
    pub parent_id: Option<i64>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CatalogService: Send + Sync {
    fn kind(&self) -> MediaKind;

    fn name(&self) -> &'static str;

    /// Reachability and credential check.
    async fn check_status(&self) -> Result<(), CatalogError>;

    /// Point the file record at `old_relative` to `new_relative`.
    async fn update_file_path(
        &self,
        old_relative: &str,
        new_relative: &str,
    ) -> Result<CatalogUpdate, CatalogError>;

    /// Ask the catalog to rescan the owning series or movie.
    async fn rescan(&self, parent_id: i64) -> Result<(), CatalogError>;
}

/// The active catalog services, at most one per media kind.
#[derive(Clone, Default)]
pub struct CatalogServices {
    services: Vec<Arc<dyn CatalogService>>,
}

impl CatalogServices {
    pub fn new(services: Vec<Arc<dyn CatalogService>>) -> Self {
        Self { services }
    }

    /// Clients for every service enabled in config.
    pub fn from_config(config: &Config) -> Self {
        let mut services: Vec<Arc<dyn CatalogService>> = Vec::new();
        if config.sonarr.enabled {
            services.push(Arc::new(ArrClient::new(ArrFlavor::Series, &config.sonarr)));
        }
        if config.radarr.enabled {
            services.push(Arc::new(ArrClient::new(ArrFlavor::Movies, &config.radarr)));
        }
        Self { services }
    }

    pub fn for_kind(&self, kind: MediaKind) -> Option<&Arc<dyn CatalogService>> {
        self.services.iter().find(|s| s.kind() == kind)
    }

    pub fn active_kinds(&self) -> Vec<MediaKind> {
        self.services.iter().map(|s| s.kind()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Check every service and keep only those that answer. Failures are
    /// logged at error.
    pub async fn retain_reachable(self) -> Self {
        let mut reachable = Vec::with_capacity(self.services.len());
        for service in self.services {
            match service.check_status().await {
                Ok(()) => {
                    tracing::info!(service = service.name(), "Catalog service reachable");
                    reachable.push(service);
                }
                Err(e) => tracing::error!(
                    service = service.name(),
                    "Catalog service unreachable, disabling: {}",
                    e
                ),
            }
        }
        Self {
            services: reachable,
        }
    }
}
