//! Catalog lookups that turn a `(song, artist)` pair into canonical metadata.

pub mod spotify;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use spotify::SpotifyCatalog;

/// Canonical metadata for a track. Every field may be empty when the
/// catalog knows nothing about the song.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackMetadata {
    pub album_name: Option<String>,
    pub album_image: Option<String>,
    pub release_date: Option<String>,
    pub catalog_id: Option<String>,
    #[serde(default)]
    pub genres: Vec<String>,
}

impl TrackMetadata {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("API error: {0}")]
    Api(String),
    #[error("Serde error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Authorization failed: {0}")]
    Auth(String),
}

#[async_trait]
pub trait MetadataResolver: Send + Sync {
    /// Look up a track. `Ok(None)` means the catalog had no result.
    async fn search(&self, song: &str, artist: &str) -> Result<Option<TrackMetadata>, CatalogError>;
}

/// Resolver used when no catalog credentials are configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCatalog;

#[async_trait]
impl MetadataResolver for NoCatalog {
    async fn search(&self, _song: &str, _artist: &str) -> Result<Option<TrackMetadata>, CatalogError> {
        Ok(None)
    }
}
