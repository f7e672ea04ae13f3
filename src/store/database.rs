//! SQLite-backed song store.
//!
//! Holds two per-user lists: songs the user accepted and the most recent
//! successful identifications. Writes are idempotent under duplicate
//! delivery, so callers can fire them without coordinating retries.
//!
//! # Schema
//!
//! - **saved_songs**: one row per `(user, song, artist)`, case-insensitive.
//!   A duplicate accept keeps the original row.
//! - **recent_searches**: one row per `(user, song, artist)`. A repeat
//!   refreshes the timestamp so the entry moves back to the top.

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::time::Duration;

use crate::catalog::TrackMetadata;
use crate::protocol::UserHandle;
use crate::store::{RecentEntry, ResultSink, SavedSong, StoreError};

// ============================================================================
// Schema
// ============================================================================

const CREATE_SAVED: &str = r#"
CREATE TABLE IF NOT EXISTS saved_songs (
    user_handle  TEXT NOT NULL,
    song         TEXT NOT NULL,
    artist       TEXT NOT NULL,
    verse        TEXT,
    album_name   TEXT,
    album_image  TEXT,
    release_date TEXT,
    catalog_id   TEXT,
    genres       TEXT NOT NULL DEFAULT '[]',
    saved_at     TEXT NOT NULL,
    UNIQUE (user_handle, song, artist) ON CONFLICT IGNORE
)
"#;

const CREATE_RECENT: &str = r#"
CREATE TABLE IF NOT EXISTS recent_searches (
    user_handle TEXT NOT NULL,
    song        TEXT NOT NULL,
    artist      TEXT NOT NULL,
    searched_at TEXT NOT NULL,
    PRIMARY KEY (user_handle, song, artist)
)
"#;

type SavedRow = (
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
    String,
);

// ============================================================================
// Store
// ============================================================================

#[derive(Clone)]
pub struct SongStore {
    pool: SqlitePool,
}

impl SongStore {
    /// Opens (creating if needed) the database file at `path`.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Database(sqlx::Error::Io(e)))?;
        }
        let url = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&url)
            .await?;
        tracing::info!(path = %path.display(), "Opened song store");
        Self::with_pool(pool).await
    }

    /// Private in-memory store, used by tests and `--database :memory:`.
    pub async fn in_memory() -> Result<Self, StoreError> {
        // Each connection to `sqlite::memory:` is its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::query(CREATE_SAVED).execute(&pool).await?;
        sqlx::query(CREATE_RECENT).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Saved songs for `user`, newest first.
    pub async fn list_saved(&self, user: &UserHandle) -> Result<Vec<SavedSong>, StoreError> {
        let rows: Vec<SavedRow> = sqlx::query_as(
            "SELECT song, artist, verse, album_name, album_image, release_date, catalog_id, genres, saved_at \
             FROM saved_songs WHERE user_handle = ? ORDER BY saved_at DESC, rowid DESC",
        )
        .bind(user.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut songs = Vec::with_capacity(rows.len());
        for (song, artist, verse, album_name, album_image, release_date, catalog_id, genres, saved_at) in rows {
            songs.push(SavedSong {
                song,
                artist,
                verse,
                metadata: TrackMetadata {
                    album_name,
                    album_image,
                    release_date,
                    catalog_id,
                    genres: serde_json::from_str(&genres)?,
                },
                timestamp: saved_at,
            });
        }
        Ok(songs)
    }

    /// Recent searches for `user`, newest first, at most `limit`.
    pub async fn list_recent(&self, user: &UserHandle, limit: u32) -> Result<Vec<RecentEntry>, StoreError> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT song, artist, searched_at FROM recent_searches \
             WHERE user_handle = ? ORDER BY searched_at DESC LIMIT ?",
        )
        .bind(user.as_str())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(song, artist, timestamp)| RecentEntry { song, artist, timestamp })
            .collect())
    }
}

// ============================================================================
// ResultSink
// ============================================================================

#[async_trait]
impl ResultSink for SongStore {
    async fn append_accepted(&self, user: &UserHandle, song: &SavedSong) -> Result<(), StoreError> {
        let genres = serde_json::to_string(&song.metadata.genres)?;
        let existing: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM saved_songs WHERE user_handle = ? AND lower(song) = lower(?) AND lower(artist) = lower(?)",
        )
        .bind(user.as_str())
        .bind(&song.song)
        .bind(&song.artist)
        .fetch_optional(&self.pool)
        .await?;
        if existing.is_some() {
            tracing::debug!(song = %song.song, artist = %song.artist, "Song already saved");
            return Ok(());
        }

        sqlx::query(
            "INSERT INTO saved_songs \
             (user_handle, song, artist, verse, album_name, album_image, release_date, catalog_id, genres, saved_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(user.as_str())
        .bind(&song.song)
        .bind(&song.artist)
        .bind(&song.verse)
        .bind(&song.metadata.album_name)
        .bind(&song.metadata.album_image)
        .bind(&song.metadata.release_date)
        .bind(&song.metadata.catalog_id)
        .bind(genres)
        .bind(&song.timestamp)
        .execute(&self.pool)
        .await?;
        tracing::info!(user = %user, song = %song.song, artist = %song.artist, "Saved song");
        Ok(())
    }

    async fn append_recent(&self, user: &UserHandle, entry: &RecentEntry) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO recent_searches (user_handle, song, artist, searched_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT (user_handle, song, artist) DO UPDATE SET searched_at = excluded.searched_at",
        )
        .bind(user.as_str())
        .bind(&entry.song)
        .bind(&entry.artist)
        .bind(&entry.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove(&self, user: &UserHandle, song: &str, artist: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            "DELETE FROM saved_songs WHERE user_handle = ? AND lower(song) = lower(?) AND lower(artist) = lower(?)",
        )
        .bind(user.as_str())
        .bind(song.trim())
        .bind(artist.trim())
        .execute(&self.pool)
        .await?;
        tracing::info!(user = %user, song, artist, removed = result.rows_affected(), "Removed saved song");
        Ok(())
    }
}
