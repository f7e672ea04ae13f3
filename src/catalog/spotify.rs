use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::catalog::{CatalogError, MetadataResolver, TrackMetadata};
use crate::http::http_client;

const TOKEN_URL: &str = "https://accounts.spotify.com/api/token";
const API_URL: &str = "https://api.spotify.com/v1";

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<u64>,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Spotify Web API catalog using the client-credentials flow.
///
/// The access token is cached until shortly before it expires and dropped
/// whenever the API answers 401.
pub struct SpotifyCatalog {
    client_id: String,
    client_secret: String,
    token: Mutex<Option<CachedToken>>,
}

impl SpotifyCatalog {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            token: Mutex::new(None),
        }
    }

    async fn access_token(&self) -> Result<String, CatalogError> {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref()
            && token.expires_at > Instant::now()
        {
            return Ok(token.value.clone());
        }

        let resp = http_client()
            .post(TOKEN_URL)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(CatalogError::Auth(format!("spotify token: HTTP {}", resp.status())));
        }
        let body: TokenResponse = resp.json().await?;
        let Some(value) = body.access_token.filter(|t| !t.is_empty()) else {
            return Err(CatalogError::Auth("spotify token: no access_token".to_string()));
        };
        // Refresh a minute early so a token never expires mid-request.
        let lifetime = body.expires_in.unwrap_or(3600).saturating_sub(60);
        *guard = Some(CachedToken {
            value: value.clone(),
            expires_at: Instant::now() + Duration::from_secs(lifetime),
        });
        Ok(value)
    }

    async fn get_json(&self, url: &str) -> Result<Value, CatalogError> {
        let token = self.access_token().await?;
        let resp = http_client().get(url).bearer_auth(token).send().await?;
        if resp.status().as_u16() == 401 {
            *self.token.lock().await = None;
            return Err(CatalogError::Auth("spotify: token rejected".to_string()));
        }
        if !resp.status().is_success() {
            return Err(CatalogError::Api(format!("spotify: HTTP {}", resp.status())));
        }
        Ok(resp.json().await?)
    }

    /// Genres hang off the artist, not the track. Failures only cost the genres.
    async fn artist_genres(&self, artist_id: &str) -> Vec<String> {
        let url = format!("{}/artists/{}", API_URL, urlencoding::encode(artist_id));
        match self.get_json(&url).await {
            Ok(json) => string_array(&json, "/genres"),
            Err(e) => {
                tracing::debug!(artist_id, error = %e, "Artist genre lookup failed");
                Vec::new()
            }
        }
    }
}

/// Build the track search URL for a `track:<song> artist:<artist>` query.
fn build_search_url(song: &str, artist: &str) -> String {
    let query = format!("track:{} artist:{}", song.trim(), artist.trim());
    format!(
        "{}/search?q={}&type=track&limit=1",
        API_URL,
        urlencoding::encode(&query)
    )
}

fn string_array(json: &Value, pointer: &str) -> Vec<String> {
    json.pointer(pointer)
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn string_at(json: &Value, pointer: &str) -> Option<String> {
    json.pointer(pointer)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Extract metadata from the first search hit, plus the artist id used for
/// the genre lookup.
fn track_from_search(json: &Value) -> Option<(TrackMetadata, Option<String>)> {
    let track = json.pointer("/tracks/items/0")?;
    let metadata = TrackMetadata {
        album_name: string_at(track, "/album/name"),
        album_image: string_at(track, "/album/images/0/url"),
        release_date: string_at(track, "/album/release_date"),
        catalog_id: string_at(track, "/id"),
        genres: Vec::new(),
    };
    Some((metadata, string_at(track, "/artists/0/id")))
}

#[async_trait]
impl MetadataResolver for SpotifyCatalog {
    async fn search(&self, song: &str, artist: &str) -> Result<Option<TrackMetadata>, CatalogError> {
        let json = self.get_json(&build_search_url(song, artist)).await?;
        let Some((mut metadata, artist_id)) = track_from_search(&json) else {
            tracing::debug!(song, artist, "Spotify search returned no tracks");
            return Ok(None);
        };
        if let Some(id) = artist_id {
            metadata.genres = self.artist_genres(&id).await;
        }
        Ok(Some(metadata))
    }
}
