/*
 * Manifests
 *
 * Lists of downloadable models and datasets. Only the fields a download
 * needs are read; anything else in the JSON is ignored.
 */
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::downloads::DownloadRequest;

pub const DEFAULT_MIME: &str = "application/octet-stream";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("清單格式錯誤: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("清單請求失敗: {0}")]
    Request(#[from] reqwest::Error),
    #[error("清單請求失敗: HTTP {0}")]
    HttpStatus(u16),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub url: String,
    /// Expected byte length, 0 when unknown
    #[serde(default)]
    pub size: u64,
    #[serde(default = "default_mime")]
    pub mime: String,
}

fn default_mime() -> String {
    DEFAULT_MIME.to_string()
}

impl ManifestEntry {
    /// File name for the download: the entry name, or the last URL path
    /// segment when the manifest has none.
    pub fn file_name(&self) -> String {
        if !self.name.is_empty() {
            return self.name.clone();
        }
        self.url
            .split(['?', '#'])
            .next()
            .and_then(|path| path.rsplit('/').find(|segment| !segment.is_empty()))
            .unwrap_or(self.id.as_str())
            .to_string()
    }

    pub fn to_request(&self) -> DownloadRequest {
        DownloadRequest::new(&self.id, &self.url, self.file_name(), &self.mime)
            .with_expected_size(self.size)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Manifest {
    pub entries: Vec<ManifestEntry>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawManifest {
    List(Vec<ManifestEntry>),
    Wrapped {
        #[serde(alias = "models", alias = "datasets")]
        entries: Vec<ManifestEntry>,
    },
}

impl Manifest {
    /// Accepts a bare array or an object holding `entries`, `models` or
    /// `datasets`.
    pub fn from_json(text: &str) -> Result<Self, ManifestError> {
        let entries = match serde_json::from_str::<RawManifest>(text)? {
            RawManifest::List(entries) => entries,
            RawManifest::Wrapped { entries } => entries,
        };
        Ok(Self { entries })
    }

    pub async fn fetch(client: &Client, url: &str) -> Result<Self, ManifestError> {
        tracing::info!("[Manifest] 讀取清單: {}", url);
        let response = client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(ManifestError::HttpStatus(response.status().as_u16()));
        }
        let text = response.text().await?;
        let manifest = Self::from_json(&text)?;
        tracing::info!("[Manifest] {} 個項目", manifest.entries.len());
        Ok(manifest)
    }

    pub fn find(&self, id: &str) -> Option<&ManifestEntry> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
