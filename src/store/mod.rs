//! Persistence of accepted songs and recent searches.
//!
//! The protocol core writes through the narrow `ResultSink` contract and
//! never depends on a write having landed.

pub mod database;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::catalog::TrackMetadata;
use crate::protocol::{ResolvedSong, UserHandle};

pub use database::SongStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Serde error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

/// An accepted song as stored for a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedSong {
    pub song: String,
    pub artist: String,
    pub verse: Option<String>,
    #[serde(flatten)]
    pub metadata: TrackMetadata,
    /// RFC 3339 acceptance time.
    pub timestamp: String,
}

impl SavedSong {
    pub fn from_resolved(resolved: &ResolvedSong) -> Self {
        Self {
            song: resolved.song.clone(),
            artist: resolved.artist.clone(),
            verse: resolved.verse.clone(),
            metadata: resolved.metadata.clone(),
            timestamp: now_rfc3339(),
        }
    }
}

/// A successful identification, recorded whether or not it was accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentEntry {
    pub song: String,
    pub artist: String,
    pub timestamp: String,
}

impl RecentEntry {
    pub fn new(song: impl Into<String>, artist: impl Into<String>) -> Self {
        Self {
            song: song.into(),
            artist: artist.into(),
            timestamp: now_rfc3339(),
        }
    }
}

pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn append_accepted(&self, user: &UserHandle, song: &SavedSong) -> Result<(), StoreError>;
    async fn append_recent(&self, user: &UserHandle, entry: &RecentEntry) -> Result<(), StoreError>;
    /// Remove a saved song matching `song` and `artist` (case-insensitive).
    async fn remove(&self, user: &UserHandle, song: &str, artist: &str) -> Result<(), StoreError>;
}
