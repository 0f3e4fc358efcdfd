//! REST client shared by the series and movie catalogs.

use super::{CatalogError, CatalogService, CatalogUpdate};
use crate::config::ServiceConfig;
use crate::media::MediaKind;
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Timeout applied to every catalog request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The two catalog dialects differ only in endpoint, parent id field and
/// rescan command shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrFlavor {
    Series,
    Movies,
}

impl ArrFlavor {
    pub fn for_kind(kind: MediaKind) -> Self {
        match kind {
            MediaKind::TvShow => ArrFlavor::Series,
            MediaKind::Movie => ArrFlavor::Movies,
        }
    }

    pub fn kind(&self) -> MediaKind {
        match self {
            ArrFlavor::Series => MediaKind::TvShow,
            ArrFlavor::Movies => MediaKind::Movie,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ArrFlavor::Series => "sonarr",
            ArrFlavor::Movies => "radarr",
        }
    }

    fn file_endpoint(&self) -> &'static str {
        match self {
            ArrFlavor::Series => "/episodefile",
            ArrFlavor::Movies => "/moviefile",
        }
    }

    fn parent_field(&self) -> &'static str {
        match self {
            ArrFlavor::Series => "seriesId",
            ArrFlavor::Movies => "movieId",
        }
    }

    fn rescan_command(&self, parent_id: i64) -> RescanCommand {
        match self {
            ArrFlavor::Series => RescanCommand {
                name: "RescanSeries",
                series_id: Some(parent_id),
                movie_ids: None,
            },
            ArrFlavor::Movies => RescanCommand {
                name: "RescanMovie",
                series_id: None,
                movie_ids: Some(vec![parent_id]),
            },
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RescanCommand {
    name: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    series_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    movie_ids: Option<Vec<i64>>,
}

/// File record as the catalog returns it. Only `id` and `relativePath` are
/// interpreted; everything else is carried through untouched on write.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileRecord {
    id: i64,
    relative_path: String,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

impl FileRecord {
    fn parent_id(&self, field: &str) -> Option<i64> {
        self.rest.get(field).and_then(Value::as_i64)
    }
}

pub struct ArrClient {
    flavor: ArrFlavor,
    client: Client,
    base_url: String,
    api_key: String,
}

impl ArrClient {
    pub fn new(flavor: ArrFlavor, config: &ServiceConfig) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Failed to build HTTP client with timeout: {}", e);
                Client::new()
            });

        Self {
            flavor,
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v3{}", self.base_url, path)
    }

    async fn check(response: Response) -> Result<Response, CatalogError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(CatalogError::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn decode<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, CatalogError> {
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| CatalogError::InvalidRecord(e.to_string()))
    }

    async fn find_file(&self, relative_path: &str) -> Result<FileRecord, CatalogError> {
        let response = self
            .client
            .get(self.url(self.flavor.file_endpoint()))
            .query(&[("relativePath", relative_path)])
            .header("X-Api-Key", &self.api_key)
            .send()
            .await?;
        let records: Vec<FileRecord> = Self::decode(Self::check(response).await?).await?;

        // The catalog may treat the query as a filter hint; only an exact match counts.
        records
            .into_iter()
            .find(|r| r.relative_path == relative_path)
            .ok_or_else(|| CatalogError::NotFound(relative_path.to_string()))
    }

    async fn get_file(&self, id: i64) -> Result<FileRecord, CatalogError> {
        let response = self
            .client
            .get(self.url(&format!("{}/{}", self.flavor.file_endpoint(), id)))
            .header("X-Api-Key", &self.api_key)
            .send()
            .await?;
        Self::decode(Self::check(response).await?).await
    }

    async fn put_file(&self, record: &FileRecord) -> Result<(), CatalogError> {
        let response = self
            .client
            .put(self.url(&format!("{}/{}", self.flavor.file_endpoint(), record.id)))
            .header("X-Api-Key", &self.api_key)
            .json(record)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}

#[async_trait]
impl CatalogService for ArrClient {
    fn kind(&self) -> MediaKind {
        self.flavor.kind()
    }

    fn name(&self) -> &'static str {
        self.flavor.name()
    }

    async fn check_status(&self) -> Result<(), CatalogError> {
        let response = self
            .client
            .get(self.url("/system/status"))
            .header("X-Api-Key", &self.api_key)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn update_file_path(
        &self,
        old_relative: &str,
        new_relative: &str,
    ) -> Result<CatalogUpdate, CatalogError> {
        let found = self.find_file(old_relative).await?;
        let mut record = self.get_file(found.id).await?;
        record.relative_path = new_relative.to_string();
        self.put_file(&record).await?;

        tracing::info!(
            service = self.name(),
            file_id = record.id,
            path = new_relative,
            "Updated catalog file path"
        );
        Ok(CatalogUpdate {
            file_id: record.id,
            parent_id: record.parent_id(self.flavor.parent_field()),
        })
    }

    async fn rescan(&self, parent_id: i64) -> Result<(), CatalogError> {
        let response = self
            .client
            .post(self.url("/command"))
            .header("X-Api-Key", &self.api_key)
            .json(&self.flavor.rescan_command(parent_id))
            .send()
            .await?;
        Self::check(response).await?;
        tracing::info!(service = self.name(), parent_id, "Triggered library rescan");
        Ok(())
    }
}
